//! `ksp gpg encrypt|decrypt`: bulk transform a flat `key=value` file in place.
//!
//! Encrypted values are stored as base64 of the gpg output so the file stays
//! line-oriented. Lines are split at the first `=`, blank lines are skipped,
//! and key order is preserved.

use std::path::Path;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::info;

use crate::cli::GpgCommand;
use crate::injector::cipher::{Cipher, GpgCli};
use crate::kubeconfig::lifecycle::write_replace;

type Entries = Vec<(String, String)>;

/// Execute a `gpg` subcommand. Blocking.
///
/// # Errors
///
/// Fails on unreadable or malformed input, any cipher failure, or if the
/// result cannot be written back. The file is left untouched on failure.
pub fn run(command: GpgCommand) -> Result<()> {
    match command {
        GpgCommand::Encrypt(args) => {
            let cipher = GpgCli::new(args.gpg_binary).context("creating gpg cipher failed")?;
            let entries = read_file(&args.file)?;
            let encrypted = encrypt_entries(&cipher, &args.keys, entries)?;
            write_file(&args.file, &encrypted)?;
            info!(file = %args.file.display(), entries = encrypted.len(), "file encrypted");
        }
        GpgCommand::Decrypt(args) => {
            let cipher = GpgCli::new(args.gpg_binary).context("creating gpg cipher failed")?;
            let entries = read_file(&args.file)?;
            let decrypted = decrypt_entries(&cipher, entries)?;
            write_file(&args.file, &decrypted)?;
            info!(file = %args.file.display(), entries = decrypted.len(), "file decrypted");
        }
    }
    Ok(())
}

pub fn encrypt_entries(cipher: &dyn Cipher, recipients: &[String], entries: Entries) -> Result<Entries> {
    entries
        .into_iter()
        .map(|(key, value)| {
            let ciphertext = cipher
                .encrypt(recipients, value.as_bytes())
                .with_context(|| format!("encrypting key {key} failed"))?;
            Ok((key, STANDARD.encode(ciphertext)))
        })
        .collect()
}

pub fn decrypt_entries(cipher: &dyn Cipher, entries: Entries) -> Result<Entries> {
    entries
        .into_iter()
        .map(|(key, value)| {
            let ciphertext = STANDARD
                .decode(value.trim())
                .with_context(|| format!("decoding key {key} failed"))?;
            let plaintext = cipher
                .decrypt(&ciphertext)
                .with_context(|| format!("decrypting key {key} failed"))?;
            let plaintext = String::from_utf8(plaintext)
                .with_context(|| format!("decrypted value of key {key} is not UTF-8"))?;
            if plaintext.contains('\n') {
                anyhow::bail!("decrypted value of key {key} spans several lines");
            }
            Ok((key, plaintext))
        })
        .collect()
}

fn parse(text: &str) -> Result<Entries> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            let (key, value) = line
                .split_once('=')
                .with_context(|| format!("invalid input at line {}: expected key=value", index + 1))?;
            if key.is_empty() {
                anyhow::bail!("invalid input at line {}: empty key", index + 1);
            }
            Ok((key.to_owned(), value.to_owned()))
        })
        .collect()
}

fn render(entries: &[(String, String)]) -> String {
    entries
        .iter()
        .map(|(key, value)| format!("{key}={value}\n"))
        .collect()
}

fn read_file(path: &Path) -> Result<Entries> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {} failed", path.display()))?;
    parse(&text)
}

fn write_file(path: &Path, entries: &[(String, String)]) -> Result<()> {
    write_replace(path, render(entries).as_bytes())
        .with_context(|| format!("replacing {} failed", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injector::cipher::CipherError;

    /// Reversible stand-in for gpg: reverses the bytes and tags them with the
    /// first recipient.
    struct Reverse;

    impl Cipher for Reverse {
        fn encrypt(&self, recipients: &[String], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
            let first = recipients.first().ok_or(CipherError::NoRecipients)?;
            let mut out = format!("{first}:").into_bytes();
            out.extend(plaintext.iter().rev());
            Ok(out)
        }

        fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
            let at = ciphertext
                .iter()
                .position(|b| *b == b':')
                .ok_or_else(|| std::io::Error::other("not a ciphertext"))?;
            Ok(ciphertext[at + 1..].iter().rev().copied().collect())
        }
    }

    #[test]
    fn parse_splits_at_first_equals_and_skips_blank_lines() {
        let entries = parse("A=1\n\nB=x=y\nC=\n").unwrap();
        assert_eq!(
            entries,
            [
                ("A".to_owned(), "1".to_owned()),
                ("B".to_owned(), "x=y".to_owned()),
                ("C".to_owned(), String::new()),
            ]
        );
    }

    #[test]
    fn parse_reports_line_numbers() {
        let err = parse("A=1\nbroken\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
        assert!(parse("=value\n").is_err());
    }

    #[test]
    fn file_round_trip_restores_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.env");
        let original = "DB_PASSWORD=hunter2\nAPI_TOKEN=abc=def\n";
        std::fs::write(&path, original).unwrap();

        let keys = vec!["ops@example.com".to_owned()];
        let encrypted = encrypt_entries(&Reverse, &keys, read_file(&path).unwrap()).unwrap();
        write_file(&path, &encrypted).unwrap();

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(!on_disk.contains("hunter2"));
        assert!(on_disk.starts_with("DB_PASSWORD="));

        let decrypted = decrypt_entries(&Reverse, read_file(&path).unwrap()).unwrap();
        write_file(&path, &decrypted).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
    }

    #[cfg(unix)]
    #[test]
    fn rewrite_keeps_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.env");
        std::fs::write(&path, "K=v\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        let keys = vec!["ops@example.com".to_owned()];
        let encrypted = encrypt_entries(&Reverse, &keys, read_file(&path).unwrap()).unwrap();
        write_file(&path, &encrypted).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn decrypt_rejects_non_base64() {
        let entries = vec![("K".to_owned(), "***".to_owned())];
        let err = decrypt_entries(&Reverse, entries).unwrap_err();
        assert!(err.to_string().contains("decoding key K"));
    }

    #[test]
    fn encrypt_failure_names_the_key() {
        let entries = vec![("K".to_owned(), "v".to_owned())];
        let err = encrypt_entries(&Reverse, &[], entries).unwrap_err();
        assert!(err.to_string().contains("encrypting key K"));
    }
}
