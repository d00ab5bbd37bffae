//! Self-signed certificate authority for local TLS termination.
//!
//! One certificate is generated per process start. It is served by the TLS
//! listener and written into the rewritten kubeconfig as the trust anchor
//! for every cluster, so it has to work as both a server leaf and a CA.
//! Nothing is persisted to disk.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use rand::rngs::OsRng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType, PKCS_RSA_SHA256,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

/// RSA modulus size of the generated key.
pub const RSA_BITS: usize = 4096;

/// How long the generated certificate stays valid.
pub const VALIDITY: Duration = Duration::days(2 * 365);

/// Subject common name and DNS SAN of the certificate.
pub const COMMON_NAME: &str = "localhost";

/// Errors produced while generating the proxy certificate.
#[derive(Debug, Error)]
pub enum CaError {
    #[error("generating rsa key failed: {0}")]
    KeyGeneration(#[from] rsa::Error),

    #[error("pem encoding rsa key failed: {0}")]
    KeyEncoding(#[from] rsa::pkcs8::Error),

    #[error("generating cert failed: {0}")]
    Certificate(#[from] rcgen::Error),
}

/// PEM-encoded certificate and private key plus their validity window.
#[derive(Clone)]
pub struct ProxyCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

impl fmt::Debug for ProxyCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCertificate")
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("key_pem", &"[REDACTED]")
            .finish()
    }
}

/// Generate a fresh self-signed certificate for `localhost`.
///
/// # Errors
///
/// Fails only if the entropy source or an encoder fails. Callers treat this
/// as fatal: the proxy cannot serve TLS without a certificate.
pub fn generate() -> Result<ProxyCertificate, CaError> {
    generate_with_bits(RSA_BITS)
}

/// A 2048-bit certificate shared by every test that needs one; key
/// generation is slow in debug builds.
#[cfg(test)]
pub(crate) fn generate_for_tests() -> ProxyCertificate {
    static CERT: std::sync::OnceLock<ProxyCertificate> = std::sync::OnceLock::new();
    CERT.get_or_init(|| generate_with_bits(2048).expect("test certificate"))
        .clone()
}

fn generate_with_bits(bits: usize) -> Result<ProxyCertificate, CaError> {
    let private_key = RsaPrivateKey::new(&mut OsRng, bits)?;
    let key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?;
    let key_pair = KeyPair::from_pem_and_sign_algo(&key_pem, &PKCS_RSA_SHA256)?;

    let mut params = CertificateParams::new(vec![COMMON_NAME.to_owned()])?;
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, COMMON_NAME);
    params.distinguished_name = dn;

    // Doubles as the trust anchor handed to clients.
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let not_before = OffsetDateTime::now_utc();
    let not_after = not_before + VALIDITY;
    params.not_before = not_before;
    params.not_after = not_after;

    let cert = params.self_signed(&key_pair)?;

    Ok(ProxyCertificate {
        cert_pem: cert.pem(),
        key_pem: key_pem.as_str().to_owned(),
        not_before,
        not_after,
    })
}
