//! Axum request handlers: the two secret interceptors and pass-through.

use axum::{
    body::{to_bytes, Body},
    extract::{Path, Request, State},
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use common::{ProxyError, Secret, Status};
use tracing::{debug, warn};

use super::middleware::MAX_BODY_BYTES;
use super::state::RouteState;
use crate::injector::Pipeline;
use crate::patch::{self, PatchKind, MERGE_PATCH_CONTENT_TYPE};

/// [`ProxyError`] rendered as a Kubernetes `Status` response.
#[derive(Debug)]
pub struct ApiError(pub ProxyError);

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        warn!(status = status.as_u16(), error = %self.0, "request rejected");
        (status, Json(Status::from(&self.0))).into_response()
    }
}

/// `POST /{cluster}/api/v1/namespaces/{namespace}/secrets`: encrypt, then create.
///
/// A body that does not decode as a secret is rejected with 400 and never
/// reaches the backend. When no injector changes the secret the original
/// bytes are forwarded untouched.
pub async fn create(
    State(state): State<RouteState>,
    Path(namespace): Path<String>,
    req: Request,
) -> Result<Response, ApiError> {
    let (mut parts, body) = req.into_parts();
    let bytes = read_body(body).await?;

    let secret: Secret = serde_json::from_slice(&bytes)
        .map_err(|e| ProxyError::SecretDecode(e.to_string()))?;
    let injected = run_pipeline(&state.pipeline, secret.clone()).await?;

    let body = if injected == secret {
        bytes
    } else {
        debug!(cluster = state.backend.name(), %namespace, "create body rewritten");
        Bytes::from(
            serde_json::to_vec(&injected).map_err(|e| ProxyError::SecretEncode(e.to_string()))?,
        )
    };

    set_content_length(&mut parts.headers, body.len());
    Ok(state
        .backend
        .forward(Request::from_parts(parts, Body::from(body)))
        .await?)
}

/// `PATCH /{cluster}/api/v1/namespaces/{namespace}/secrets/{name}`.
///
/// The incoming patch is applied to the stored secret, the merged result goes
/// through the pipeline, and a fresh merge patch against the backend's
/// current state replaces the request body. Any failure aborts before
/// forwarding.
pub async fn patch(
    State(state): State<RouteState>,
    Path((namespace, name)): Path<(String, String)>,
    req: Request,
) -> Result<Response, ApiError> {
    let (mut parts, body) = req.into_parts();

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let kind = PatchKind::from_content_type(content_type)
        .ok_or_else(|| ProxyError::UnsupportedPatchType(content_type.to_owned()))?;

    let bytes = read_body(body).await?;
    let incoming =
        patch::decode(kind, &bytes).map_err(|e| ProxyError::PatchDecode(e.to_string()))?;

    let stored_doc = state
        .backend
        .get_secret(&namespace, &name, &parts.headers)
        .await?;
    let origin_doc =
        patch::apply(&stored_doc, &incoming, kind).map_err(|e| ProxyError::PatchApply {
            strategy: kind.strategy(),
            message: e.to_string(),
        })?;

    // Stored state that does not decode counts as a failed fetch.
    let stored: Secret = serde_json::from_value(stored_doc)
        .map_err(|e| ProxyError::SecretGet(format!("{namespace}/{name}: {e}")))?;
    let origin: Secret = serde_json::from_value(origin_doc)
        .map_err(|e| ProxyError::SecretDecode(e.to_string()))?;

    let mut injected = run_pipeline(&state.pipeline, origin.clone()).await?;
    if injected == origin {
        set_content_length(&mut parts.headers, bytes.len());
        return Ok(state
            .backend
            .forward(Request::from_parts(parts, Body::from(bytes)))
            .await?);
    }
    keep_stored_values(&mut injected, &origin, &stored);

    let latest = state
        .backend
        .get_secret(&namespace, &name, &parts.headers)
        .await?;
    let target =
        serde_json::to_value(&injected).map_err(|e| ProxyError::SecretEncode(e.to_string()))?;
    let outgoing = patch::create(&latest, &target).map_err(|e| ProxyError::PatchCreate {
        strategy: PatchKind::Merge.strategy(),
        message: e.to_string(),
    })?;
    let body =
        serde_json::to_vec(&outgoing).map_err(|e| ProxyError::SecretEncode(e.to_string()))?;

    debug!(
        cluster = state.backend.name(),
        %namespace,
        %name,
        incoming = kind.strategy(),
        "patch re-derived"
    );
    parts
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static(MERGE_PATCH_CONTENT_TYPE));
    set_content_length(&mut parts.headers, body.len());
    Ok(state
        .backend
        .forward(Request::from_parts(parts, Body::from(body)))
        .await?)
}

/// Everything else under a cluster prefix: relayed as is.
pub async fn forward(State(state): State<RouteState>, req: Request) -> Result<Response, ApiError> {
    Ok(state.backend.forward(req).await?)
}

/// Catch-all 404 for paths outside every cluster prefix.
pub async fn not_found() -> impl IntoResponse {
    let status = Status::failure(404, "NotFound", "ksp: not found: no cluster is mounted at this path");
    (StatusCode::NOT_FOUND, Json(status))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn read_body(body: Body) -> Result<Bytes, ProxyError> {
    to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ProxyError::BodyRead(e.to_string()))
}

/// Run the pipeline on the blocking pool; injectors may shell out.
async fn run_pipeline(pipeline: &Pipeline, secret: Secret) -> Result<Secret, ProxyError> {
    let pipeline = pipeline.clone();
    tokio::task::spawn_blocking(move || pipeline.run(secret))
        .await
        .map_err(|e| ProxyError::Internal(format!("injector task failed: {e}")))?
        .map_err(|e| ProxyError::Injector(e.to_string()))
}

/// Put back stored values for data entries the patch left alone.
///
/// Only applies when the stored secret already carried the same marker: its
/// values are then already transformed and must not be transformed twice.
/// Entries supplied through `stringData` always count as changed.
fn keep_stored_values(injected: &mut Secret, origin: &Secret, stored: &Secret) {
    let Some(marker) = origin.inject_marker() else {
        return;
    };
    if stored.inject_marker() != Some(marker) {
        return;
    }
    let (Some(data), Some(origin_data), Some(stored_data)) = (
        injected.data.as_mut(),
        origin.data.as_ref(),
        stored.data.as_ref(),
    ) else {
        return;
    };

    for (key, value) in data.iter_mut() {
        if origin
            .string_data
            .as_ref()
            .is_some_and(|sd| sd.contains_key(key))
        {
            continue;
        }
        if let (Some(before), Some(kept)) = (origin_data.get(key), stored_data.get(key)) {
            if before == kept {
                *value = kept.clone();
            }
        }
    }
}

fn set_content_length(headers: &mut HeaderMap, len: usize) {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
}
