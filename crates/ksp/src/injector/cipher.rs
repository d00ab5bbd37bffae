//! The encryption backend behind the `gpg` injector and the batch commands.
//!
//! [`Cipher`] is the seam: production code shells out to the local `gpg`
//! binary through [`GpgCli`], tests substitute a mock.

use std::io::{self, Write};
use std::process::{Command, ExitStatus, Stdio};

use thiserror::Error;
use tracing::debug;

/// Errors produced by a [`Cipher`].
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("{binary:?} is not a usable gpg binary: {source}")]
    Unavailable {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("no recipients configured")]
    NoRecipients,

    #[error("gpg i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("gpg exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },
}

/// `Encrypt(recipients, plaintext)` and `Decrypt(ciphertext)`.
#[cfg_attr(test, mockall::automock)]
pub trait Cipher: Send + Sync {
    /// Encrypt `plaintext` so that any of `recipients` can decrypt it.
    fn encrypt(&self, recipients: &[String], plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Decrypt `ciphertext` with whatever secret key the backend holds.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// [`Cipher`] backed by the `gpg` command-line tool.
///
/// Every call is a blocking subprocess round trip; async callers go through
/// `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct GpgCli {
    binary: String,
}

impl GpgCli {
    /// Wrap `binary` after checking that `binary --version` runs.
    ///
    /// # Errors
    ///
    /// [`CipherError::Unavailable`] if the binary cannot be executed or exits
    /// unsuccessfully.
    pub fn new(binary: impl Into<String>) -> Result<Self, CipherError> {
        let binary = binary.into();
        let unavailable = |source| CipherError::Unavailable {
            binary: binary.clone(),
            source,
        };

        let output = Command::new(&binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(unavailable)?;
        if !output.status.success() {
            return Err(unavailable(io::Error::other(format!(
                "--version exited with {}",
                output.status
            ))));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        debug!(
            binary = %binary,
            version = version.lines().next().unwrap_or_default(),
            "gpg binary found"
        );
        Ok(Self { binary })
    }

    fn run(&self, args: &[&str], input: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut child = Command::new(&self.binary)
            .args(["--batch", "--yes", "--quiet", "--no-tty"])
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("gpg stdin was not captured"))?;

        // gpg may block writing stdout before it has read all of stdin, so the
        // input is fed from a second thread.
        let (written, output) = std::thread::scope(|scope| {
            let writer = scope.spawn(move || stdin.write_all(input));
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("gpg stdin writer panicked")));
            (written, output)
        });

        let output = output?;
        if !output.status.success() {
            return Err(CipherError::Failed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        written?;

        Ok(output.stdout)
    }
}

impl Cipher for GpgCli {
    fn encrypt(&self, recipients: &[String], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if recipients.is_empty() {
            return Err(CipherError::NoRecipients);
        }

        let mut args = vec!["--trust-model", "always", "--encrypt"];
        for recipient in recipients {
            args.push("--recipient");
            args.push(recipient);
        }
        self.run(&args, plaintext)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.run(&["--decrypt"], ciphertext)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::{Mutex, MutexGuard};

    // A fork from a parallel test while a script is still open for writing
    // makes exec fail with ETXTBSY.
    static SERIAL: Mutex<()> = Mutex::new(());

    fn serial() -> MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write an executable shell script standing in for gpg.
    fn fake_gpg(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("gpg");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let _guard = serial();
        assert!(matches!(
            GpgCli::new("/nonexistent/gpg"),
            Err(CipherError::Unavailable { .. })
        ));
    }

    #[test]
    fn pipes_input_through_the_binary() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let gpg = GpgCli::new(fake_gpg(&dir, "cat")).unwrap();

        let out = gpg.encrypt(&["alice@example.com".into()], b"hunter2").unwrap();
        assert_eq!(out, b"hunter2");
        assert_eq!(gpg.decrypt(b"opaque").unwrap(), b"opaque");
    }

    #[test]
    fn passes_every_recipient() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let gpg = GpgCli::new(fake_gpg(&dir, r#"cat >/dev/null; echo "$@""#)).unwrap();

        let out = gpg
            .encrypt(&["a@x".into(), "b@x".into()], b"v")
            .unwrap();
        let args = String::from_utf8(out).unwrap();
        assert!(args.contains("--encrypt --recipient a@x --recipient b@x"));
        assert!(args.starts_with("--batch"));
    }

    #[test]
    fn non_zero_exit_reports_stderr() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let script = r#"case "$1" in --version) exit 0;; esac; echo "no public key" >&2; exit 2"#;
        let gpg = GpgCli::new(fake_gpg(&dir, script)).unwrap();

        match gpg.encrypt(&["nobody@x".into()], b"v") {
            Err(CipherError::Failed { stderr, .. }) => assert_eq!(stderr, "no public key"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn encrypt_without_recipients_is_refused() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let gpg = GpgCli::new(fake_gpg(&dir, "cat")).unwrap();
        assert!(matches!(
            gpg.encrypt(&[], b"v"),
            Err(CipherError::NoRecipients)
        ));
    }
}
