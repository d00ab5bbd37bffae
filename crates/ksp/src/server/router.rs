//! Axum router construction.
//!
//! Every cluster gets its own sub-router. Cluster names are mounted verbatim
//! and may contain `:` or span several segments (EKS ARNs), which Axum's path
//! syntax cannot express, so the top-level router resolves the mount itself
//! and strips the prefix before any cluster handler sees the request.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::Uri,
    response::{IntoResponse, Response},
    routing::{patch, post},
    Router,
};
use common::ProxyError;
use tower::ServiceExt;
use tracing::debug;

use super::handlers::{self, ApiError};
use super::{middleware, state::RouteState};
use crate::injector::Pipeline;
use crate::upstream::BackendRoute;

/// Secret collection path, relative to a cluster prefix.
pub const SECRETS_PATH: &str = "/api/v1/namespaces/:namespace/secrets";

/// Single secret path, relative to a cluster prefix.
pub const SECRET_PATH: &str = "/api/v1/namespaces/:namespace/secrets/:name";

/// Build the application [`Router`] for all clusters.
pub fn build(routes: &[Arc<BackendRoute>], pipeline: Pipeline, verbose: bool) -> Router {
    let mut mounts = HashMap::with_capacity(routes.len());

    for backend in routes {
        let state = RouteState::new(backend.clone(), pipeline.clone());
        let cluster = Router::new()
            .route(
                SECRETS_PATH,
                post(handlers::create).fallback(handlers::forward),
            )
            .route(
                SECRET_PATH,
                patch(handlers::patch).fallback(handlers::forward),
            )
            .fallback(handlers::forward)
            .with_state(state);

        debug!(cluster = backend.name(), prefix = %backend.prefix(), "mounting cluster");
        mounts.insert(format!("/{}", backend.name()), cluster);
    }

    let app = Router::new()
        .fallback(dispatch)
        .with_state(Mounts(Arc::new(mounts)));
    if verbose {
        app.layer(middleware::trace_layer())
    } else {
        app
    }
}

/// Cluster routers keyed by their decoded mount path, `/<cluster name>`.
#[derive(Clone)]
struct Mounts(Arc<HashMap<String, Router>>);

impl Mounts {
    /// The longest mount `path` starts with, ending on a segment boundary,
    /// and the byte offset where the cluster-relative path begins.
    fn resolve(&self, path: &str) -> Option<(&Router, usize)> {
        let mut ends: Vec<usize> = path
            .match_indices('/')
            .map(|(at, _)| at)
            .filter(|at| *at > 0)
            .collect();
        ends.push(path.len());

        ends.into_iter().rev().find_map(|end| {
            let mount = urlencoding::decode(&path[..end]).ok()?;
            self.0.get(mount.as_ref()).map(|router| (router, end))
        })
    }
}

async fn dispatch(State(mounts): State<Mounts>, mut req: Request) -> Response {
    let Some((router, end)) = mounts.resolve(req.uri().path()) else {
        return handlers::not_found().await.into_response();
    };
    let router = router.clone();

    match strip_prefix(req.uri(), end) {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => return ApiError(e).into_response(),
    }
    router
        .oneshot(req)
        .await
        .unwrap_or_else(|never| match never {})
}

/// `uri` with the first `end` bytes of its path removed.
fn strip_prefix(uri: &Uri, end: usize) -> Result<Uri, ProxyError> {
    let rest = match &uri.path()[end..] {
        "" => "/",
        rest => rest,
    };
    let path_and_query = match uri.query() {
        Some(query) => format!("{rest}?{query}"),
        None => rest.to_owned(),
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        path_and_query
            .parse()
            .map_err(|e| ProxyError::Internal(format!("stripping cluster prefix: {e}")))?,
    );
    Uri::from_parts(parts).map_err(|e| ProxyError::Internal(format!("stripping cluster prefix: {e}")))
}
