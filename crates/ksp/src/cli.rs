//! CLI argument parsing with clap.
//!
//! `proxy` flags are optional here: unset flags fall through to
//! `KSP_PROXY_*` variables and then to defaults in [`crate::config`].

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// ksp - Kubernetes secret proxy
#[derive(Parser, Debug)]
#[command(name = "ksp")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the intercepting proxy in front of every kubeconfig cluster
    #[command(alias = "p")]
    Proxy(ProxyArgs),

    /// Encrypt or decrypt a key=value file with gpg
    #[command(alias = "g", subcommand)]
    Gpg(GpgCommand),
}

#[derive(Args, Debug, Default, Clone)]
pub struct ProxyArgs {
    /// Port the TLS listener binds on localhost [env: KSP_PROXY_PORT] [default: 8000]
    #[arg(long)]
    pub port: Option<u16>,

    /// Kubeconfig to rewrite [env: KSP_PROXY_CONFIG] [default: ~/.kube/config]
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log every request and raise the log level to debug [env: KSP_PROXY_VERBOSE]
    #[arg(long)]
    pub verbose: bool,

    /// Enable the gpg injector [env: KSP_PROXY_INJECTOR_GPG]
    #[arg(long)]
    pub injector_gpg: bool,

    /// Recipients the gpg injector encrypts for [env: KSP_PROXY_GPG_KEYS]
    #[arg(long, value_delimiter = ',')]
    pub gpg_keys: Vec<String>,

    /// gpg executable [env: KSP_PROXY_GPG_BINARY] [default: gpg]
    #[arg(long)]
    pub gpg_binary: Option<String>,

    /// Seconds in-flight connections get to finish after a signal
    /// [env: KSP_PROXY_DRAIN_TIMEOUT_SECS] [default: 10]
    #[arg(long)]
    pub drain_timeout_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum GpgCommand {
    /// Encrypt every value of a key=value file in place
    #[command(alias = "e")]
    Encrypt(EncryptArgs),

    /// Decrypt every value of a key=value file in place
    #[command(alias = "d")]
    Decrypt(DecryptArgs),
}

#[derive(Args, Debug)]
pub struct EncryptArgs {
    /// Recipients to encrypt for
    #[arg(long, env = "KSP_GPG_KEYS", value_delimiter = ',', required = true)]
    pub keys: Vec<String>,

    /// File to encrypt
    #[arg(long)]
    pub file: PathBuf,

    /// gpg executable
    #[arg(long, default_value = "gpg")]
    pub gpg_binary: String,
}

#[derive(Args, Debug)]
pub struct DecryptArgs {
    /// File to decrypt
    #[arg(long)]
    pub file: PathBuf,

    /// gpg executable
    #[arg(long, default_value = "gpg")]
    pub gpg_binary: String,
}
