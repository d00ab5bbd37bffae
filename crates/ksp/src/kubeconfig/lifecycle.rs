//! Backup, rewrite, and restore of the kubeconfig, as a typestate machine.
//!
//! ```text
//! KubeConfigFile<Loaded> ──rewrite()──► KubeConfigFile<Rewritten> ──restore()──► KubeConfigFile<Restored>
//! ```
//!
//! # Invariants
//!
//! - `<path>.ksp.bak` holds the original bytes for as long as the file at
//!   `<path>` points at the proxy.
//! - The backup is deleted only after the restored file has been read back
//!   and compared byte-for-byte with the original.
//! - Every write goes to a temp file in the same directory followed by a
//!   rename, so a crash never leaves a half-written kubeconfig.

use std::ffi::OsString;
use std::io::Write as _;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_yaml::Value;
use tempfile::NamedTempFile;
use tracing::{info, warn};

use super::{clusters, path_segment, KubeconfigError, NamedCluster};

/// Suffix appended to the kubeconfig path for the backup file.
pub const BACKUP_SUFFIX: &str = ".ksp.bak";

/// Parsed from disk, nothing written yet.
#[derive(Debug)]
pub struct Loaded;

/// Backup persisted, proxy-facing document written over the original path.
#[derive(Debug)]
pub struct Rewritten;

/// Original bytes written back and verified, backup removed.
#[derive(Debug)]
pub struct Restored;

/// A kubeconfig file moving through the proxy lifecycle.
#[derive(Debug)]
pub struct KubeConfigFile<S> {
    path: PathBuf,
    backup_path: PathBuf,
    original: Vec<u8>,
    document: Value,
    _state: PhantomData<S>,
}

impl<S> KubeConfigFile<S> {
    /// Path of the kubeconfig.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the `.ksp.bak` sibling.
    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    fn into_state<T>(self) -> KubeConfigFile<T> {
        KubeConfigFile {
            path: self.path,
            backup_path: self.backup_path,
            original: self.original,
            document: self.document,
            _state: PhantomData,
        }
    }
}

impl KubeConfigFile<Loaded> {
    /// Read and parse the kubeconfig at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed, or if a backup from an
    /// earlier run is still present. Backing up the current file in that
    /// case would overwrite the only copy of the real configuration.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, KubeconfigError> {
        let path = path.into();
        let backup_path = backup_path_for(&path);

        if backup_path.exists() {
            return Err(KubeconfigError::StaleBackup {
                path,
                backup: backup_path,
            });
        }

        let original = std::fs::read(&path).map_err(|source| KubeconfigError::Read {
            path: path.clone(),
            source,
        })?;
        let document: Value =
            serde_yaml::from_slice(&original).map_err(|source| KubeconfigError::Parse {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            backup_path,
            original,
            document,
            _state: PhantomData,
        })
    }

    /// Typed view of the `clusters` collection.
    pub fn clusters(&self) -> Result<Vec<NamedCluster>, KubeconfigError> {
        clusters(&self.document)
    }

    /// Directory relative `certificate-authority` paths are resolved against.
    pub fn base_dir(&self) -> &Path {
        parent_dir(&self.path)
    }

    /// The document clients should see while the proxy runs.
    ///
    /// Every cluster's `server` becomes `https://localhost:<port>/<name>` and
    /// its trust anchor becomes `cert_pem`. Options that would conflict with
    /// the new anchor are dropped.
    pub fn proxy_document(&self, port: u16, cert_pem: &str) -> Result<Value, KubeconfigError> {
        // Validates the shape before mutating a copy.
        self.clusters()?;

        let mut document = self.document.clone();
        let ca_data = STANDARD.encode(cert_pem.as_bytes());

        let Some(Value::Sequence(entries)) = document.get_mut("clusters") else {
            return Err(KubeconfigError::NoClusters);
        };
        for (index, entry) in entries.iter_mut().enumerate() {
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| KubeconfigError::MalformedCluster {
                    index,
                    reason: "missing name".into(),
                })?;
            let Some(Value::Mapping(cluster)) = entry.get_mut("cluster") else {
                return Err(KubeconfigError::MalformedCluster {
                    index,
                    reason: "missing cluster".into(),
                });
            };

            cluster.insert(
                "server".into(),
                format!("https://localhost:{port}/{}", path_segment(&name)).into(),
            );
            cluster.insert("certificate-authority-data".into(), ca_data.clone().into());
            cluster.remove("certificate-authority");
            cluster.remove("insecure-skip-tls-verify");
            cluster.remove("tls-server-name");
        }

        Ok(document)
    }

    /// Persist the backup, then point the kubeconfig at the proxy.
    ///
    /// # Errors
    ///
    /// Fails if either write fails. If the backup was written but the
    /// kubeconfig could not be replaced, the backup is removed again since
    /// the original is still in place.
    pub fn rewrite(
        self,
        port: u16,
        cert_pem: &str,
    ) -> Result<KubeConfigFile<Rewritten>, KubeconfigError> {
        let proxy = serde_yaml::to_string(&self.proxy_document(port, cert_pem)?)
            .map_err(KubeconfigError::Serialize)?;

        write_new(&self.backup_path, &self.original)?;

        if let Err(e) = write_replace(&self.path, proxy.as_bytes()) {
            if let Err(cleanup) = std::fs::remove_file(&self.backup_path) {
                warn!(backup = %self.backup_path.display(), error = %cleanup, "removing unused backup failed");
            }
            return Err(e);
        }

        info!(
            path = %self.path.display(),
            backup = %self.backup_path.display(),
            "kubeconfig rewritten to point at the proxy"
        );
        Ok(self.into_state())
    }
}

impl KubeConfigFile<Rewritten> {
    /// Write the original bytes back and drop the backup once verified.
    ///
    /// # Errors
    ///
    /// Fails if the write or the verification read fails, or if the file on
    /// disk does not match the original. The backup is kept in every error
    /// case and remains the operator's recovery path.
    pub fn restore(self) -> Result<KubeConfigFile<Restored>, KubeconfigError> {
        write_replace(&self.path, &self.original)?;

        let on_disk = std::fs::read(&self.path).map_err(|source| KubeconfigError::Read {
            path: self.path.clone(),
            source,
        })?;
        if on_disk != self.original {
            return Err(KubeconfigError::RestoreMismatch { path: self.path });
        }

        std::fs::remove_file(&self.backup_path).map_err(|source| KubeconfigError::Write {
            path: self.backup_path.clone(),
            source,
        })?;

        info!(path = %self.path.display(), "kubeconfig restored");
        Ok(self.into_state())
    }
}

/// `<path>.ksp.bak`.
pub fn backup_path_for(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn staged(path: &Path, contents: &[u8]) -> Result<NamedTempFile, KubeconfigError> {
    let write_err = |source| KubeconfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = NamedTempFile::new_in(parent_dir(path)).map_err(write_err)?;
    tmp.write_all(contents).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;

    if let Ok(meta) = std::fs::metadata(path) {
        tmp.as_file()
            .set_permissions(meta.permissions())
            .map_err(write_err)?;
    }
    Ok(tmp)
}

/// Atomically replace `path` with `contents`, keeping its permissions.
pub(crate) fn write_replace(path: &Path, contents: &[u8]) -> Result<(), KubeconfigError> {
    staged(path, contents)?
        .persist(path)
        .map_err(|e| KubeconfigError::Write {
            path: path.to_path_buf(),
            source: e.error,
        })?;
    Ok(())
}

/// Atomically create `path`, failing if it already exists.
fn write_new(path: &Path, contents: &[u8]) -> Result<(), KubeconfigError> {
    staged(path, contents)?
        .persist_noclobber(path)
        .map_err(|e| KubeconfigError::Write {
            path: path.to_path_buf(),
            source: e.error,
        })?;
    Ok(())
}
