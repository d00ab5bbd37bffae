//! Axum middleware layers applied to the router.
//!
//! There is no request timeout layer: watches and `exec` sessions are
//! long-lived by nature.

use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Largest secret or patch body the interceptors will buffer.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Request logging enabled by `--verbose`.
///
/// Spans carry method, URI, and version only. Headers are never recorded
/// because they hold bearer tokens.
pub fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
}
