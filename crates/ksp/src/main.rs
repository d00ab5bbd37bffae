//! `ksp` - Kubernetes secret proxy entry point.
//!
//! `ksp proxy` startup sequence:
//! 1. Resolve [`ProxyConfig`] from flags, `KSP_PROXY_*` variables and defaults.
//! 2. Initialise structured logging.
//! 3. Load the kubeconfig and build the injector pipeline.
//! 4. Generate the proxy certificate and the TLS server config.
//! 5. Build one backend route per cluster and the Axum router.
//! 6. Install the signal handlers, rewrite the kubeconfig to point at the
//!    proxy, then bind.
//! 7. Serve until SIGINT/SIGTERM, restore the kubeconfig, drain.
//!
//! `ksp gpg` runs the batch file encrypt/decrypt and exits.

mod batch;
mod ca;
mod cli;
mod config;
mod injector;
mod kubeconfig;
mod patch;
mod server;
mod telemetry;
mod upstream;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cli::{Cli, Command, ProxyArgs};
use config::ProxyConfig;
use injector::Pipeline;
use kubeconfig::KubeConfigFile;
use server::listener::ProxyServer;

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Proxy(args) => run_proxy(args).await,
        Command::Gpg(command) => {
            telemetry::init("info")?;
            tokio::task::spawn_blocking(move || batch::run(command))
                .await
                .context("batch task panicked")?
        }
    }
}

async fn run_proxy(args: ProxyArgs) -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = ProxyConfig::load(&args).map_err(|e| {
        // Logging is not up yet; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(cfg.effective_log_level())?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cfg.port,
        config = %cfg.config.display(),
        "ksp starting"
    );

    // -----------------------------------------------------------------------
    // 3. Kubeconfig and injectors
    // -----------------------------------------------------------------------
    let kubeconfig = KubeConfigFile::load(&cfg.config)?;
    let clusters = kubeconfig.clusters()?;

    let pipeline = Pipeline::from_config(&cfg).context("initialising injectors failed")?;
    if pipeline.names().is_empty() {
        warn!("no injectors enabled; secrets are forwarded unchanged");
    } else {
        info!(injectors = ?pipeline.names(), "injectors enabled");
    }

    // -----------------------------------------------------------------------
    // 4. Certificate and TLS
    // -----------------------------------------------------------------------
    let cert = ca::generate().context("generating proxy certificate failed")?;
    let tls = server::tls::build_server_config(cert.cert_pem.as_bytes(), cert.key_pem.as_bytes())?;
    info!(not_after = %cert.not_after, "proxy certificate generated");

    // -----------------------------------------------------------------------
    // 5. Routes
    // -----------------------------------------------------------------------
    let routes = upstream::build_routes(&clusters, kubeconfig.base_dir())?;
    let router = server::router::build(&routes, pipeline, cfg.verbose);

    // -----------------------------------------------------------------------
    // 6. Signals, rewrite, then bind
    // -----------------------------------------------------------------------
    let signal = server::ShutdownSignal::install().context("installing signal handlers failed")?;
    let rewritten = kubeconfig.rewrite(cfg.port, &cert.cert_pem)?;

    let proxy = match ProxyServer::bind(cfg.port, tls, router).await {
        Ok(proxy) => proxy,
        Err(e) => {
            if let Err(restore) = rewritten.restore() {
                error!(error = %restore, "restoring kubeconfig after bind failure failed");
            }
            return Err(e);
        }
    };

    // -----------------------------------------------------------------------
    // 7. Serve until signalled
    // -----------------------------------------------------------------------
    let shutdown = CancellationToken::new();
    let mut serving = tokio::spawn(proxy.serve(shutdown.clone(), cfg.drain_timeout()));

    let early_exit = tokio::select! {
        signal = signal.recv() => {
            match signal {
                Ok(name) => info!(signal = name, "shutdown requested"),
                Err(e) => error!(error = %e, "signal handler failed; shutting down"),
            }
            None
        }
        res = &mut serving => Some(res),
    };

    shutdown.cancel();
    let backup = rewritten.backup_path().to_path_buf();
    let restored = rewritten.restore();
    if let Err(e) = &restored {
        error!(
            error = %e,
            backup = %backup.display(),
            "restoring kubeconfig failed; the backup was kept for manual recovery"
        );
    }

    match early_exit {
        Some(res) => res.context("server task panicked")??,
        None => serving.await.context("server task panicked")??,
    }
    let restored = restored?;

    info!(config = %restored.path().display(), "ksp stopped");
    Ok(())
}
