//! Response bodies the proxy writes itself.
//!
//! Errors are rendered as Kubernetes `Status` objects so that clients which
//! believe they are talking to the API server print them as usual.

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// A `v1.Status` failure body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Always `"Status"`.
    pub kind: String,
    /// Always `"v1"`.
    pub api_version: String,
    /// Always empty.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Always `"Failure"` for bodies produced by the proxy.
    pub status: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
    /// Short machine-readable reason (e.g. `"BadRequest"`).
    pub reason: String,
    /// HTTP status code, repeated in the body.
    pub code: u16,
}

impl Status {
    /// Construct a failure [`Status`].
    pub fn failure(code: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: "Status".into(),
            api_version: "v1".into(),
            metadata: serde_json::Map::new(),
            status: "Failure".into(),
            message: message.into(),
            reason: reason.into(),
            code,
        }
    }
}

impl From<&ProxyError> for Status {
    fn from(err: &ProxyError) -> Self {
        Status::failure(err.http_status(), err.reason(), err.client_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_serialises_like_the_api_server() {
        let s = Status::failure(400, "BadRequest", "ksp: bad request: invalid secret");
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["kind"], "Status");
        assert_eq!(v["apiVersion"], "v1");
        assert_eq!(v["status"], "Failure");
        assert_eq!(v["code"], 400);
        assert!(v["metadata"].as_object().unwrap().is_empty());
    }

    #[test]
    fn from_proxy_error() {
        let s = Status::from(&ProxyError::SecretGet("connection refused".into()));
        assert_eq!(s.code, 424);
        assert_eq!(s.reason, "FailedDependency");
        assert_eq!(s.message, "ksp: failed dependency: getting secret failed");
    }
}
