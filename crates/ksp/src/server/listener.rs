//! TLS accept loop and connection draining.
//!
//! For each incoming TCP connection the server:
//! 1. Completes the rustls handshake.
//! 2. Serves HTTP/1.1 (with upgrades) or HTTP/2, chosen by ALPN.
//! 3. On shutdown, stops accepting and asks every open connection to finish
//!    gracefully, bounded by the drain timeout.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// A bound, not yet serving, TLS listener.
pub struct ProxyServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
}

impl ProxyServer {
    /// Bind `127.0.0.1:<port>`. Port `0` picks a free port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is in use or otherwise unbindable.
    pub async fn bind(port: u16, tls: Arc<ServerConfig>, router: Router) -> Result<Self> {
        let addr: SocketAddr = (Ipv4Addr::LOCALHOST, port).into();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            router,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires, then drain.
    ///
    /// # Errors
    ///
    /// Only fails if the listener address cannot be read; per-connection
    /// errors are logged and never end the loop.
    pub async fn serve(self, shutdown: CancellationToken, drain: Duration) -> Result<()> {
        info!(addr = %self.local_addr()?, "listening");
        let tracker = TaskTracker::new();

        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((tcp, peer_addr)) => {
                    debug!(%peer_addr, "accepted TCP connection");
                    let acceptor = self.acceptor.clone();
                    let router = self.router.clone();
                    let shutdown = shutdown.clone();
                    tracker.spawn(async move {
                        if let Err(e) = serve_connection(tcp, acceptor, router, shutdown).await {
                            debug!(%peer_addr, error = %e, "connection error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept error"),
            }
        }

        drop(self.listener);
        tracker.close();
        info!(connections = tracker.len(), "draining connections");

        if tokio::time::timeout(drain, tracker.wait()).await.is_err() {
            warn!(
                remaining = tracker.len(),
                timeout_secs = drain.as_secs(),
                "drain timeout elapsed, dropping connections"
            );
        } else {
            info!("all connections drained");
        }
        Ok(())
    }
}

async fn serve_connection(
    tcp: TcpStream,
    acceptor: TlsAcceptor,
    router: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let tls = acceptor.accept(tcp).await.context("TLS handshake failed")?;

    let builder = Builder::new(TokioExecutor::new());
    let conn =
        builder.serve_connection_with_upgrades(TokioIo::new(tls), TowerToHyperService::new(router));
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => res.map_err(|e| anyhow::anyhow!(e))?,
        () = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await.map_err(|e| anyhow::anyhow!(e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    fn tls() -> Arc<ServerConfig> {
        let cert = crate::ca::generate_for_tests();
        crate::server::tls::build_server_config(cert.cert_pem.as_bytes(), cert.key_pem.as_bytes())
            .unwrap()
    }

    #[tokio::test]
    async fn port_zero_binds_an_ephemeral_port() {
        let server = ProxyServer::bind(0, tls(), Router::new()).await.unwrap();
        let addr = server.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn occupied_port_fails_to_bind() {
        let first = ProxyServer::bind(0, tls(), Router::new()).await.unwrap();
        let port = first.local_addr().unwrap().port();
        assert!(ProxyServer::bind(port, tls(), Router::new()).await.is_err());
    }

    #[tokio::test]
    async fn cancel_stops_an_idle_server() {
        let router = Router::new().route("/version", get(|| async { "v1.30.0" }));
        let server = ProxyServer::bind(0, tls(), router).await.unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(shutdown.clone(), Duration::from_secs(5)));
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn stuck_connections_are_dropped_after_the_drain_timeout() {
        let server = ProxyServer::bind(0, tls(), Router::new()).await.unwrap();
        let addr = server.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(shutdown.clone(), Duration::from_millis(100)));

        // Never sends a ClientHello, so the handshake never completes.
        let _idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("drain was not bounded")
            .unwrap()
            .unwrap();
    }
}
