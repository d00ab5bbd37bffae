//! Outbound side of the proxy: one [`BackendRoute`] per kubeconfig cluster.
//!
//! Each route owns a dedicated HTTP client whose rustls config trusts the
//! platform's root store plus that cluster's own CA bundle, and nothing else.
//! Routes are built once at startup and never change afterwards.
//!
//! ```text
//! client ──TLS──► ksp /<cluster>/api/... ──BackendRoute::forward──► https://<server>/api/...
//! ```

use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{
    HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONNECTION, HOST, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use axum::http::uri::{Authority, Scheme};
use axum::http::{HeaderMap, Method, StatusCode, Uri, Version};
use axum::response::Response;
use common::ProxyError;
use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::kubeconfig::{path_segment, KubeconfigError, NamedCluster};

/// Upper bound on each direct secret read made by the patch path.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection-scoped headers that must not cross the proxy (RFC 9110 §7.6.1).
const HOP_BY_HOP: [HeaderName; 7] = [
    CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
];

type HttpsClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Errors that prevent a route from being built. All of them are fatal.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("cluster {cluster}: invalid server url {server:?}: {reason}")]
    InvalidUrl {
        cluster: String,
        server: String,
        reason: String,
    },

    #[error("cluster {cluster}: defined more than once")]
    Duplicate { cluster: String },

    #[error("a cluster with an empty name cannot be mounted")]
    EmptyName,

    #[error("invalid trust bundle: {0}")]
    TrustBundle(String),

    #[error("building client tls config: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Kubeconfig(#[from] KubeconfigError),
}

/// A backend cluster and the transport used to reach it.
pub struct BackendRoute {
    name: String,
    scheme: Scheme,
    authority: Authority,
    base_path: String,
    client: HttpsClient,
}

impl std::fmt::Debug for BackendRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRoute")
            .field("name", &self.name)
            .field("upstream", &self.upstream())
            .finish()
    }
}

impl BackendRoute {
    /// Build a route for `name` forwarding to `server`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidUrl`] unless `server` is an absolute
    /// `http`/`https` URL, and [`RouteError::TrustBundle`] if `ca_pem` holds no
    /// usable certificate.
    pub fn new(name: &str, server: &str, ca_pem: Option<&[u8]>) -> Result<Self, RouteError> {
        let invalid = |reason: String| RouteError::InvalidUrl {
            cluster: name.to_owned(),
            server: server.to_owned(),
            reason,
        };

        let uri: Uri = server.parse().map_err(|e| invalid(format!("{e}")))?;
        let scheme = match uri.scheme() {
            Some(s) if *s == Scheme::HTTPS || *s == Scheme::HTTP => s.clone(),
            _ => return Err(invalid("scheme must be http or https".into())),
        };
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| invalid("missing host".into()))?;
        if uri.query().is_some() {
            return Err(invalid("query strings are not allowed".into()));
        }
        let base_path = uri.path().trim_end_matches('/').to_owned();

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(client_tls_config(ca_pem)?)
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            name: name.to_owned(),
            scheme,
            authority,
            base_path,
            client,
        })
    }

    /// Cluster name as it appears in the kubeconfig.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Router prefix this cluster is mounted under.
    pub fn prefix(&self) -> String {
        format!("/{}", path_segment(&self.name))
    }

    /// Upstream base URL, for logging.
    pub fn upstream(&self) -> String {
        format!("{}://{}{}", self.scheme, self.authority, self.base_path)
    }

    /// Join the upstream base with the (already prefix-stripped) request target.
    pub fn upstream_uri(&self, target: &Uri) -> Result<Uri, ProxyError> {
        let path_and_query = target.path_and_query().map_or("/", |pq| pq.as_str());
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(format!("{}{}", self.base_path, path_and_query))
            .build()
            .map_err(|e| ProxyError::Internal(format!("building upstream uri: {e}")))
    }

    /// Relay a request to the backend and hand back its response untouched.
    ///
    /// Protocol upgrades (`exec`, `attach`, `port-forward`) are spliced: once
    /// the backend answers `101 Switching Protocols`, both upgraded
    /// connections are joined by a bidirectional copy.
    pub async fn forward(&self, mut req: Request) -> Result<Response, ProxyError> {
        let uri = self.upstream_uri(req.uri())?;
        let upgrading = is_upgrade(req.headers());
        let client_upgrade = upgrading.then(|| hyper::upgrade::on(&mut req));

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers, upgrading);
        parts.headers.remove(HOST);

        let mut resp = self
            .client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| ProxyError::Upstream(format!("{}: {e}", self.name)))?;

        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut resp);
                tokio::spawn(splice(client_upgrade, upstream_upgrade));
            }
        } else {
            strip_hop_by_hop(resp.headers_mut(), false);
        }

        Ok(resp.map(Body::new))
    }

    /// Read a secret straight from the backend.
    ///
    /// The caller's credentials (`Authorization` and impersonation headers)
    /// are reused so the read is authorised exactly like the write it serves.
    ///
    /// # Errors
    ///
    /// Any transport failure, timeout, non-2xx status, or non-JSON body is a
    /// [`ProxyError::SecretGet`].
    pub async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
        caller: &HeaderMap,
    ) -> Result<serde_json::Value, ProxyError> {
        let target: Uri = format!(
            "/api/v1/namespaces/{}/secrets/{}",
            urlencoding::encode(namespace),
            urlencoding::encode(name)
        )
        .parse()
        .map_err(|e| ProxyError::Internal(format!("building secret path: {e}")))?;

        let mut req = Request::builder()
            .method(Method::GET)
            .uri(self.upstream_uri(&target)?)
            .header(ACCEPT, "application/json")
            .body(Body::empty())
            .map_err(|e| ProxyError::Internal(format!("building secret request: {e}")))?;
        copy_credentials(caller, req.headers_mut());

        let resp = tokio::time::timeout(FETCH_TIMEOUT, self.client.request(req))
            .await
            .map_err(|_| ProxyError::SecretGet(format!("{namespace}/{name}: timed out")))?
            .map_err(|e| ProxyError::SecretGet(format!("{namespace}/{name}: {e}")))?;

        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ProxyError::SecretGet(format!("{namespace}/{name}: reading body: {e}")))?
            .to_bytes();

        if !status.is_success() {
            return Err(ProxyError::SecretGet(format!(
                "{namespace}/{name}: backend answered {status}"
            )));
        }

        serde_json::from_slice(&body)
            .map_err(|e| ProxyError::SecretGet(format!("{namespace}/{name}: invalid document: {e}")))
    }
}

/// Build one route per kubeconfig cluster.
///
/// # Errors
///
/// Any invalid cluster aborts the whole build: a partially wired router could
/// forward plaintext secrets for the cluster that failed.
pub fn build_routes(
    clusters: &[NamedCluster],
    base_dir: &std::path::Path,
) -> Result<Vec<Arc<BackendRoute>>, RouteError> {
    let mut routes: Vec<Arc<BackendRoute>> = Vec::with_capacity(clusters.len());

    for cluster in clusters {
        if cluster.name.is_empty() {
            return Err(RouteError::EmptyName);
        }
        if routes.iter().any(|r| r.name == cluster.name) {
            return Err(RouteError::Duplicate {
                cluster: cluster.name.clone(),
            });
        }
        if cluster.cluster.insecure_skip_tls_verify {
            warn!(
                cluster = %cluster.name,
                "insecure-skip-tls-verify is ignored; the backend certificate is verified"
            );
        }

        let ca_pem = cluster.ca_pem(base_dir)?;
        let route = BackendRoute::new(&cluster.name, &cluster.cluster.server, ca_pem.as_deref())?;
        info!(cluster = %route.name, prefix = %route.prefix(), upstream = %route.upstream(), "route built");
        routes.push(Arc::new(route));
    }

    Ok(routes)
}

/// rustls client config trusting the platform's roots plus `ca_pem`.
///
/// An unreadable platform store leaves only `ca_pem` trusted.
pub fn client_tls_config(ca_pem: Option<&[u8]>) -> Result<ClientConfig, RouteError> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    if let Some(first) = native.errors.first() {
        warn!(errors = native.errors.len(), error = %first, "loading platform trust store failed");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!(added, ignored, "platform roots loaded");

    if let Some(pem) = ca_pem {
        let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RouteError::TrustBundle(e.to_string()))?;
        if certs.is_empty() {
            return Err(RouteError::TrustBundle(
                "no PEM certificates found in CA data".into(),
            ));
        }
        for cert in certs {
            roots
                .add(cert)
                .map_err(|e| RouteError::TrustBundle(e.to_string()))?;
        }
    }

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(config)
}

fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
        && headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        if !(keep_upgrade && name == UPGRADE) {
            headers.remove(name);
        }
    }

    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(TRANSFER_ENCODING);

    if keep_upgrade {
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    } else {
        headers.remove(UPGRADE);
    }
}

fn copy_credentials(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if name == AUTHORIZATION || name.as_str().starts_with("impersonate-") {
            to.append(name.clone(), value.clone());
        }
    }
}

async fn splice(client: OnUpgrade, upstream: OnUpgrade) {
    match tokio::try_join!(client, upstream) {
        Ok((client, upstream)) => {
            let mut client = TokioIo::new(client);
            let mut upstream = TokioIo::new(upstream);
            match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                Ok((sent, received)) => debug!(sent, received, "upgraded connection closed"),
                Err(e) => debug!(error = %e, "upgraded connection aborted"),
            }
        }
        Err(e) => warn!(error = %e, "protocol upgrade failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_or_foreign_urls() {
        assert!(matches!(
            BackendRoute::new("c", "/just/a/path", None),
            Err(RouteError::InvalidUrl { .. })
        ));
        assert!(matches!(
            BackendRoute::new("c", "ftp://example.com", None),
            Err(RouteError::InvalidUrl { .. })
        ));
        assert!(matches!(
            BackendRoute::new("c", "not a url", None),
            Err(RouteError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn rejects_garbage_ca_data() {
        assert!(matches!(
            BackendRoute::new("c", "https://example.com", Some(b"not a pem")),
            Err(RouteError::TrustBundle(_))
        ));
    }

    #[test]
    fn unreadable_platform_store_still_trusts_cluster_ca() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("SSL_CERT_FILE", dir.path().join("missing.pem"));
        let cert = crate::ca::generate().unwrap();

        let with_ca = client_tls_config(Some(cert.cert_pem.as_bytes()));
        let without_ca = client_tls_config(None);
        std::env::remove_var("SSL_CERT_FILE");

        assert!(with_ca.is_ok());
        assert!(without_ca.is_ok());
    }

    #[test]
    fn joins_base_path_and_target() {
        let route = BackendRoute::new("c", "https://rancher.example.com/k8s/clusters/c-1/", None)
            .unwrap();
        let target: Uri = "/api/v1/namespaces?limit=5".parse().unwrap();
        assert_eq!(
            route.upstream_uri(&target).unwrap().to_string(),
            "https://rancher.example.com/k8s/clusters/c-1/api/v1/namespaces?limit=5"
        );
    }

    #[test]
    fn root_target_maps_to_upstream_root() {
        let route = BackendRoute::new("c", "https://10.0.0.1:6443", None).unwrap();
        let target: Uri = "/".parse().unwrap();
        assert_eq!(
            route.upstream_uri(&target).unwrap().to_string(),
            "https://10.0.0.1:6443/"
        );
    }

    #[test]
    fn prefix_is_the_encoded_cluster_name() {
        let route = BackendRoute::new("kind-dev", "https://127.0.0.1:6443", None).unwrap();
        assert_eq!(route.prefix(), "/kind-dev");
    }

    #[test]
    fn duplicate_clusters_are_rejected() {
        let doc: serde_yaml::Value = serde_yaml::from_str(
            "clusters:\n- {name: a, cluster: {server: 'https://a'}}\n- {name: a, cluster: {server: 'https://b'}}\n",
        )
        .unwrap();
        let clusters = crate::kubeconfig::clusters(&doc).unwrap();
        assert!(matches!(
            build_routes(&clusters, std::path::Path::new(".")),
            Err(RouteError::Duplicate { .. })
        ));
    }

    #[test]
    fn empty_cluster_name_is_rejected() {
        let doc: serde_yaml::Value =
            serde_yaml::from_str("clusters:\n- {name: '', cluster: {server: 'https://a'}}\n").unwrap();
        let clusters = crate::kubeconfig::clusters(&doc).unwrap();
        assert!(matches!(
            build_routes(&clusters, std::path::Path::new(".")),
            Err(RouteError::EmptyName)
        ));
    }

    #[test]
    fn strips_hop_by_hop_headers() {
        let mut h = HeaderMap::new();
        h.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        h.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        h.insert("x-private", HeaderValue::from_static("1"));
        h.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        h.insert(AUTHORIZATION, HeaderValue::from_static("Bearer t"));

        strip_hop_by_hop(&mut h, false);

        assert!(h.get(CONNECTION).is_none());
        assert!(h.get("keep-alive").is_none());
        assert!(h.get("x-private").is_none());
        assert!(h.get(TRANSFER_ENCODING).is_none());
        assert_eq!(h[AUTHORIZATION], "Bearer t");
    }

    #[test]
    fn upgrade_headers_survive_when_upgrading() {
        let mut h = HeaderMap::new();
        h.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        h.insert(UPGRADE, HeaderValue::from_static("SPDY/3.1"));
        assert!(is_upgrade(&h));

        strip_hop_by_hop(&mut h, true);

        assert_eq!(h[CONNECTION], "upgrade");
        assert_eq!(h[UPGRADE], "SPDY/3.1");
    }

    #[test]
    fn copies_only_credentials() {
        let mut from = HeaderMap::new();
        from.insert(AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        from.insert("impersonate-user", HeaderValue::from_static("alice"));
        from.insert("content-type", HeaderValue::from_static("application/json"));

        let mut to = HeaderMap::new();
        copy_credentials(&from, &mut to);

        assert_eq!(to.len(), 2);
        assert_eq!(to["impersonate-user"], "alice");
    }
}
