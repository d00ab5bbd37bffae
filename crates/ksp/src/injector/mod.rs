//! Injector pipeline: annotation-gated transformations of secret data.
//!
//! The pipeline is built once at startup from the enabled `--injector-*`
//! flags and shared by every route. It is synchronous; the
//! handlers run it on the blocking pool.

pub mod cipher;
pub mod gpg;

use std::sync::Arc;

use common::Secret;
use thiserror::Error;
use tracing::debug;

use crate::config::ProxyConfig;
use cipher::{CipherError, GpgCli};
use gpg::GpgInjector;

/// Errors produced by an [`Injector`].
#[derive(Debug, Error)]
pub enum InjectorError {
    #[error("{injector}: transforming entry {key:?} failed: {source}")]
    Entry {
        injector: &'static str,
        key: String,
        #[source]
        source: CipherError,
    },
}

/// A transformation applied to secrets carrying a matching marker.
///
/// Implementations must return the secret unchanged when
/// [`Secret::is_marked_for`] does not match [`Injector::name`].
pub trait Injector: Send + Sync {
    /// Marker value this injector answers to.
    fn name(&self) -> &'static str;

    /// Transform `secret`. On error nothing of the partial result escapes.
    fn inject(&self, secret: Secret) -> Result<Secret, InjectorError>;
}

/// Ordered, possibly empty list of injectors.
#[derive(Clone, Default)]
pub struct Pipeline {
    injectors: Arc<[Arc<dyn Injector>]>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.injectors.iter().map(|i| i.name()))
            .finish()
    }
}

impl Pipeline {
    pub fn new(injectors: Vec<Arc<dyn Injector>>) -> Self {
        Self {
            injectors: injectors.into(),
        }
    }

    /// Build the pipeline the configuration asks for.
    ///
    /// # Errors
    ///
    /// Fails if an enabled injector's backend is unusable, e.g. the gpg
    /// binary cannot be executed.
    pub fn from_config(cfg: &ProxyConfig) -> Result<Self, CipherError> {
        let mut injectors: Vec<Arc<dyn Injector>> = Vec::new();
        if cfg.injector_gpg {
            let cli = GpgCli::new(cfg.gpg_binary.clone())?;
            injectors.push(Arc::new(GpgInjector::new(
                Arc::new(cli),
                cfg.gpg_keys.clone(),
            )));
        }
        Ok(Self::new(injectors))
    }

    /// Names of the registered injectors, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.injectors.iter().map(|i| i.name()).collect()
    }

    /// Thread `secret` through every injector, stopping at the first error.
    pub fn run(&self, secret: Secret) -> Result<Secret, InjectorError> {
        if let Some(marker) = secret.inject_marker() {
            if !self.injectors.iter().any(|i| i.name() == marker) {
                debug!(marker, "no injector registered for marker, passing through");
            }
        }

        self.injectors
            .iter()
            .try_fold(secret, |secret, injector| injector.inject(secret))
    }
}
