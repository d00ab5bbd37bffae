//! Patch engine: apply incoming partial updates and derive outgoing ones.
//!
//! Everything here is pure `serde_json::Value` manipulation with no I/O, so
//! the patch interceptor can call it from any context.

mod json_patch;
mod merge;
mod strategic;

use serde_json::Value;
use thiserror::Error;

/// Content type of every patch ksp derives and forwards.
pub const MERGE_PATCH_CONTENT_TYPE: &str = "application/merge-patch+json";

/// Errors produced while decoding, applying, or creating a patch.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("{0} must be a JSON object")]
    NotAnObject(&'static str),

    #[error("malformed patch document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid patch: {0}")]
    Invalid(String),

    #[error("path {0} does not exist")]
    PathNotFound(String),

    #[error("test operation failed at {0}")]
    TestFailed(String),
}

/// The three patch flavours the Kubernetes API accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// RFC 7386 JSON merge patch.
    Merge,
    /// Kubernetes strategic merge patch.
    StrategicMerge,
    /// RFC 6902 JSON patch.
    Json,
}

impl PatchKind {
    /// Map a request `Content-Type` to a patch kind. Parameters such as
    /// `; charset=utf-8` are ignored.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type.split(';').next().unwrap_or_default().trim();
        if essence.eq_ignore_ascii_case(MERGE_PATCH_CONTENT_TYPE) {
            Some(Self::Merge)
        } else if essence.eq_ignore_ascii_case("application/strategic-merge-patch+json") {
            Some(Self::StrategicMerge)
        } else if essence.eq_ignore_ascii_case("application/json-patch+json") {
            Some(Self::Json)
        } else {
            None
        }
    }

    /// Short name used in error messages.
    pub fn strategy(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::StrategicMerge => "strategic merge",
            Self::Json => "json",
        }
    }
}

/// Parse a patch body and check it has the shape its kind requires.
///
/// # Errors
///
/// [`PatchError::Malformed`] for invalid JSON, [`PatchError::NotAnObject`] for
/// a merge patch that is not an object, and [`PatchError::Invalid`] for a JSON
/// patch that is not a list of operations.
pub fn decode(kind: PatchKind, body: &[u8]) -> Result<Value, PatchError> {
    let patch: Value = serde_json::from_slice(body)?;
    match kind {
        PatchKind::Merge | PatchKind::StrategicMerge if !patch.is_object() => {
            Err(PatchError::NotAnObject("merge patch"))
        }
        PatchKind::Json => {
            json_patch::operations(&patch)?;
            Ok(patch)
        }
        _ => Ok(patch),
    }
}

/// Apply `patch` to `base`.
///
/// # Errors
///
/// Fails when the patch is ill-formed for its kind or, for JSON patches, when
/// an operation targets a missing path or a `test` does not hold.
pub fn apply(base: &Value, patch: &Value, kind: PatchKind) -> Result<Value, PatchError> {
    match kind {
        PatchKind::Merge => {
            if !patch.is_object() {
                return Err(PatchError::NotAnObject("merge patch"));
            }
            Ok(merge::apply(base, patch))
        }
        PatchKind::StrategicMerge => strategic::apply(base, patch),
        PatchKind::Json => json_patch::apply(base, patch),
    }
}

/// Compute the minimal merge patch that turns `from` into `to`.
///
/// # Errors
///
/// Both documents must be JSON objects.
pub fn create(from: &Value, to: &Value) -> Result<Value, PatchError> {
    merge::create(from, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_types() {
        assert_eq!(
            PatchKind::from_content_type("application/merge-patch+json"),
            Some(PatchKind::Merge)
        );
        assert_eq!(
            PatchKind::from_content_type("application/strategic-merge-patch+json; charset=utf-8"),
            Some(PatchKind::StrategicMerge)
        );
        assert_eq!(
            PatchKind::from_content_type("application/json-patch+json"),
            Some(PatchKind::Json)
        );
        assert_eq!(PatchKind::from_content_type("application/apply-patch+yaml"), None);
        assert_eq!(PatchKind::from_content_type("application/json"), None);
    }

    #[test]
    fn decode_rejects_wrong_shapes() {
        assert!(matches!(
            decode(PatchKind::Merge, b"{not json"),
            Err(PatchError::Malformed(_))
        ));
        assert!(matches!(
            decode(PatchKind::StrategicMerge, b"[1, 2]"),
            Err(PatchError::NotAnObject(_))
        ));
        assert!(matches!(
            decode(PatchKind::Json, br#"{"op": "add"}"#),
            Err(PatchError::Invalid(_))
        ));
        assert!(decode(PatchKind::Json, br#"[{"op": "remove", "path": "/data/a"}]"#).is_ok());
    }

    #[test]
    fn apply_dispatches_on_kind() {
        let base = json!({"data": {"a": "1", "b": "2"}});
        let merged = apply(&base, &json!({"data": {"a": null}}), PatchKind::Merge).unwrap();
        assert_eq!(merged, json!({"data": {"b": "2"}}));

        let patched = apply(
            &base,
            &json!([{"op": "replace", "path": "/data/b", "value": "3"}]),
            PatchKind::Json,
        )
        .unwrap();
        assert_eq!(patched, json!({"data": {"a": "1", "b": "3"}}));
    }
}
