//! TLS listener setup using rustls and the certificate minted at startup.
//!
//! The certificate and key come from [`crate::ca::generate`] and only ever live
//! in memory. This module turns them into a `rustls::ServerConfig`.

use anyhow::{Context, Result};
use rustls::ServerConfig;
use std::sync::Arc;

/// Build a [`rustls::ServerConfig`] from PEM-encoded certificate and private key bytes.
///
/// ALPN advertises `h2` and `http/1.1`. Upgrade requests (`kubectl exec`) come
/// in over HTTP/1.1.
///
/// # Errors
///
/// Returns an error if the certificate or key cannot be parsed, or if rustls
/// rejects the configuration.
pub fn build_server_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse TLS certificate chain")?;
    if certs.is_empty() {
        anyhow::bail!("no certificate found in PEM data");
    }

    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_pem))
        .context("failed to read TLS private key")?
        .context("no private key found in PEM data")?;

    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .context("failed to select TLS protocol versions")?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("failed to build rustls ServerConfig")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
