//! Axum HTTPS server, routing, and interception handlers.
//!
//! # Responsibilities
//! - Build and bind the TLS listener (rustls + the generated certificate).
//! - Mount one router per cluster with the secret interceptors wired in.
//! - Drain connections on shutdown.

pub mod handlers;
pub mod listener;
pub mod middleware;
pub mod router;
pub mod state;
pub mod tls;

use anyhow::Result;

/// SIGINT/SIGTERM handlers, registered up front so a signal that arrives
/// while startup is still running is not lost.
pub struct ShutdownSignal {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    /// Register the handlers. Must run inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if a handler cannot be installed.
    pub fn install() -> Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Resolve once SIGINT or SIGTERM arrives, naming the signal.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting for Ctrl-C fails (non-unix only).
    pub async fn recv(mut self) -> Result<&'static str> {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => Ok("SIGINT"),
                _ = self.terminate.recv() => Ok("SIGTERM"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            Ok("SIGINT")
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_sent_before_waiting_is_delivered() {
        let signal = ShutdownSignal::install().unwrap();

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let name = tokio::time::timeout(Duration::from_secs(5), signal.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, "SIGTERM");
    }
}
