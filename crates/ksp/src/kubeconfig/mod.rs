//! Kubeconfig handling.
//!
//! The file is treated as an opaque YAML document. Only the `clusters`
//! collection is read ([`NamedCluster`]) and, during the lifecycle in
//! [`lifecycle`], rewritten. Users, contexts, and everything else stay
//! byte-for-byte what the caller wrote.

pub mod lifecycle;

pub use lifecycle::KubeConfigFile;

use std::borrow::Cow;
use std::io;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use thiserror::Error;

/// Errors produced while reading, rewriting, or restoring the kubeconfig.
#[derive(Debug, Error)]
pub enum KubeconfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("serialising kubeconfig: {0}")]
    Serialize(#[source] serde_yaml::Error),

    #[error(
        "backup {backup} already exists, so a previous proxy did not shut down cleanly; \
         restore it with `mv {backup} {path}` or delete it, then start again"
    )]
    StaleBackup { path: PathBuf, backup: PathBuf },

    #[error("kubeconfig defines no clusters")]
    NoClusters,

    #[error("cluster entry {index} is malformed: {reason}")]
    MalformedCluster { index: usize, reason: String },

    #[error("cluster {cluster}: invalid certificate authority: {reason}")]
    CertificateAuthority { cluster: String, reason: String },

    #[error("restored {path} does not match the original; backup kept")]
    RestoreMismatch { path: PathBuf },
}

/// A `clusters[]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

/// Connection details of one cluster.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    pub server: String,

    /// Base64 of the PEM CA bundle.
    #[serde(default)]
    pub certificate_authority_data: Option<String>,

    /// Path to a PEM CA bundle, relative to the kubeconfig's directory.
    #[serde(default)]
    pub certificate_authority: Option<PathBuf>,

    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

impl NamedCluster {
    /// PEM bytes of the cluster's CA bundle, if it declares one.
    ///
    /// Inline `certificate-authority-data` wins over a `certificate-authority`
    /// file, matching kubectl.
    pub fn ca_pem(&self, base_dir: &Path) -> Result<Option<Vec<u8>>, KubeconfigError> {
        if let Some(data) = &self.cluster.certificate_authority_data {
            let pem = STANDARD
                .decode(data.trim())
                .map_err(|e| self.ca_error(format!("certificate-authority-data: {e}")))?;
            return Ok(Some(pem));
        }

        if let Some(file) = &self.cluster.certificate_authority {
            let path = base_dir.join(file);
            let pem = std::fs::read(&path)
                .map_err(|e| self.ca_error(format!("{}: {e}", path.display())))?;
            return Ok(Some(pem));
        }

        Ok(None)
    }

    fn ca_error(&self, reason: String) -> KubeconfigError {
        KubeconfigError::CertificateAuthority {
            cluster: self.name.clone(),
            reason,
        }
    }
}

/// Bytes kept verbatim in a URL path besides ASCII alphanumerics. This is
/// the set client-go leaves alone when it serialises a request path, so the
/// escaped name is exactly what kubectl sends back.
const PATH_SAFE: &[u8] = b"-._~$&+,/:;=@";

/// The cluster name as it appears in the proxy `server` URL.
///
/// Cluster names are free-form (EKS uses ARNs with `:` and `/`). Only bytes
/// outside [`PATH_SAFE`] are percent-encoded; an ARN stays readable and may
/// span several path segments.
pub fn path_segment(cluster_name: &str) -> Cow<'_, str> {
    let safe = |b: u8| b.is_ascii_alphanumeric() || PATH_SAFE.contains(&b);
    if cluster_name.bytes().all(safe) {
        return Cow::Borrowed(cluster_name);
    }

    let mut escaped = String::with_capacity(cluster_name.len() * 3);
    for b in cluster_name.bytes() {
        if safe(b) {
            escaped.push(char::from(b));
        } else {
            escaped.push_str(&format!("%{b:02X}"));
        }
    }
    Cow::Owned(escaped)
}

/// Extract the typed `clusters` collection from a parsed document.
pub fn clusters(document: &serde_yaml::Value) -> Result<Vec<NamedCluster>, KubeconfigError> {
    let entries = match document.get("clusters") {
        Some(serde_yaml::Value::Sequence(entries)) if !entries.is_empty() => entries,
        _ => return Err(KubeconfigError::NoClusters),
    };

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            serde_yaml::from_value(entry.clone()).map_err(|e| KubeconfigError::MalformedCluster {
                index,
                reason: e.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: prod
  cluster:
    server: https://10.0.0.1:6443
    certificate-authority-data: LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0tCg==
- name: dev
  cluster:
    server: https://dev.example.com
    certificate-authority: ca/dev.pem
users: []
contexts: []
"#;

    #[test]
    fn reads_clusters() {
        let doc: serde_yaml::Value = serde_yaml::from_str(DOC).unwrap();
        let clusters = clusters(&doc).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].name, "prod");
        assert_eq!(clusters[0].cluster.server, "https://10.0.0.1:6443");
        assert_eq!(
            clusters[1].cluster.certificate_authority.as_deref(),
            Some(Path::new("ca/dev.pem"))
        );
    }

    #[test]
    fn inline_ca_data_is_base64_decoded() {
        let doc: serde_yaml::Value = serde_yaml::from_str(DOC).unwrap();
        let prod = &clusters(&doc).unwrap()[0];
        let pem = prod.ca_pem(Path::new("/nonexistent")).unwrap().unwrap();
        assert!(pem.starts_with(b"-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn ca_file_is_resolved_against_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("ca")).unwrap();
        std::fs::write(dir.path().join("ca/dev.pem"), b"pem bytes").unwrap();

        let doc: serde_yaml::Value = serde_yaml::from_str(DOC).unwrap();
        let dev = &clusters(&doc).unwrap()[1];
        assert_eq!(dev.ca_pem(dir.path()).unwrap().unwrap(), b"pem bytes");
    }

    #[test]
    fn missing_ca_file_is_an_error() {
        let doc: serde_yaml::Value = serde_yaml::from_str(DOC).unwrap();
        let dev = &clusters(&doc).unwrap()[1];
        assert!(matches!(
            dev.ca_pem(Path::new("/nonexistent")),
            Err(KubeconfigError::CertificateAuthority { .. })
        ));
    }

    #[test]
    fn no_clusters_is_an_error() {
        let doc: serde_yaml::Value = serde_yaml::from_str("clusters: []").unwrap();
        assert!(matches!(clusters(&doc), Err(KubeconfigError::NoClusters)));
    }

    #[test]
    fn cluster_without_server_is_malformed() {
        let doc: serde_yaml::Value =
            serde_yaml::from_str("clusters:\n- name: x\n  cluster: {}\n").unwrap();
        assert!(matches!(
            clusters(&doc),
            Err(KubeconfigError::MalformedCluster { index: 0, .. })
        ));
    }

    #[test]
    fn path_segment_keeps_names_readable() {
        assert_eq!(path_segment("kind-dev"), "kind-dev");
        assert_eq!(
            path_segment("arn:aws:eks:eu-west-1:1:cluster/prod"),
            "arn:aws:eks:eu-west-1:1:cluster/prod"
        );
        assert_eq!(path_segment("admin@prod"), "admin@prod");
    }

    #[test]
    fn path_segment_escapes_what_a_url_path_cannot_hold() {
        assert_eq!(path_segment("my cluster"), "my%20cluster");
        assert_eq!(path_segment("a?b#c%d"), "a%3Fb%23c%25d");
        assert_eq!(path_segment("prod-é"), "prod-%C3%A9");
    }
}
