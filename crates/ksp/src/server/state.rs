//! Per-cluster state injected into every Axum handler.

use std::sync::Arc;

use crate::injector::Pipeline;
use crate::upstream::BackendRoute;

/// State of one mounted cluster.
///
/// Both fields are `Arc`-backed, so Axum's per-request clone is cheap.
#[derive(Clone, Debug)]
pub struct RouteState {
    /// Backend this router forwards to.
    pub backend: Arc<BackendRoute>,
    /// Injectors shared by every cluster.
    pub pipeline: Pipeline,
}

impl RouteState {
    pub fn new(backend: Arc<BackendRoute>, pipeline: Pipeline) -> Self {
        Self { backend, pipeline }
    }
}
