//! The `gpg` injector: encrypts every data value for the configured recipients.

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{ByteString, Secret};
use tracing::debug;

use super::cipher::Cipher;
use super::{Injector, InjectorError};

/// Marker value, `ksp/inject: gpg`.
pub const NAME: &str = "gpg";

pub struct GpgInjector {
    cipher: Arc<dyn Cipher>,
    recipients: Vec<String>,
}

impl GpgInjector {
    pub fn new(cipher: Arc<dyn Cipher>, recipients: Vec<String>) -> Self {
        Self { cipher, recipients }
    }
}

impl Injector for GpgInjector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn inject(&self, mut secret: Secret) -> Result<Secret, InjectorError> {
        if !secret.is_marked_for(NAME) {
            return Ok(secret);
        }
        if secret.data.is_none() && secret.string_data.is_none() {
            return Ok(secret);
        }

        // stringData would reach the backend in plaintext, so it is folded
        // into data (winning on conflicts, as the API server does).
        let mut data: BTreeMap<String, ByteString> = secret.data.take().unwrap_or_default();
        for (key, value) in secret.string_data.take().unwrap_or_default() {
            data.insert(key, ByteString(value.into_bytes()));
        }

        for (key, value) in &mut data {
            let ciphertext = self
                .cipher
                .encrypt(&self.recipients, &value.0)
                .map_err(|source| InjectorError::Entry {
                    injector: NAME,
                    key: key.clone(),
                    source,
                })?;
            *value = ByteString(ciphertext);
        }

        debug!(
            namespace = secret.metadata.namespace.as_deref().unwrap_or_default(),
            name = secret.metadata.name.as_deref().unwrap_or_default(),
            entries = data.len(),
            "secret encrypted"
        );
        secret.data = Some(data);
        Ok(secret)
    }
}
