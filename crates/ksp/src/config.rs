//! Configuration loading and validation for the proxy.
//!
//! Values are layered: built-in defaults, then `KSP_PROXY_*` environment
//! variables, then explicit command-line flags. The process exits with a
//! clear error message if the result is invalid.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::ProxyArgs;

/// Prefix of every proxy environment variable, e.g. `KSP_PROXY_PORT`.
pub const ENV_PREFIX: &str = "KSP_PROXY";

/// Validated proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Port the TLS listener binds on localhost.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Kubeconfig that is rewritten while the proxy runs.
    #[serde(default = "default_kubeconfig")]
    pub config: PathBuf,

    /// Log every request; raises the log level to `debug`.
    #[serde(default)]
    pub verbose: bool,

    /// Register the gpg injector.
    #[serde(default)]
    pub injector_gpg: bool,

    /// Recipients the gpg injector encrypts for. Required with `injector_gpg`.
    #[serde(default)]
    pub gpg_keys: Vec<String>,

    /// gpg executable, looked up on `PATH` unless absolute.
    #[serde(default = "default_gpg_binary")]
    pub gpg_binary: String,

    /// Seconds in-flight connections may take to finish after a signal.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_port() -> u16 {
    8000
}
fn default_kubeconfig() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".kube").join("config"))
        .unwrap_or_default()
}
fn default_gpg_binary() -> String {
    "gpg".into()
}
fn default_drain_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".into()
}

impl ProxyConfig {
    /// Load and validate configuration from the environment and `args`.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or validation fails.
    pub fn load(args: &ProxyArgs) -> Result<Self> {
        Self::load_from(environment(), args)
    }

    fn load_from(env: config::Environment, args: &ProxyArgs) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(env)
            .set_override_option("port", args.port.map(i64::from))?
            .set_override_option(
                "config",
                args.config
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
            )?
            .set_override_option("verbose", args.verbose.then_some(true))?
            .set_override_option("injector_gpg", args.injector_gpg.then_some(true))?
            .set_override_option(
                "gpg_keys",
                (!args.gpg_keys.is_empty()).then(|| args.gpg_keys.clone()),
            )?
            .set_override_option("gpg_binary", args.gpg_binary.clone())?
            .set_override_option(
                "drain_timeout_secs",
                args.drain_timeout_secs
                    .map(|s| i64::try_from(s).unwrap_or(i64::MAX)),
            )?
            .build()
            .context("failed to build proxy configuration")?;

        let c: ProxyConfig = cfg
            .try_deserialize()
            .context("failed to deserialise proxy configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("KSP_PROXY_PORT must be a non-zero port");
        }
        if self.config.as_os_str().is_empty() {
            anyhow::bail!("KSP_PROXY_CONFIG is required when HOME is not set");
        }
        if self.injector_gpg {
            if self.gpg_keys.iter().all(|k| k.trim().is_empty()) {
                anyhow::bail!("KSP_PROXY_GPG_KEYS is required when the gpg injector is enabled");
            }
            if self.gpg_binary.trim().is_empty() {
                anyhow::bail!("KSP_PROXY_GPG_BINARY must not be empty");
            }
        }
        if self.drain_timeout_secs == 0 {
            anyhow::bail!("KSP_PROXY_DRAIN_TIMEOUT_SECS must be > 0");
        }
        Ok(())
    }

    /// Level handed to the tracing subscriber.
    pub fn effective_log_level(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.log_level
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("gpg_keys")
}
