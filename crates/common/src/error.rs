//! Error taxonomy for the intercepted secret write paths.

use thiserror::Error;

/// Error raised while intercepting a secret create or patch request.
///
/// Every variant aborts the request before anything is forwarded to the
/// backend. Variants map to HTTP status codes returned to callers:
/// - [`ProxyError::SecretDecode`], [`ProxyError::PatchDecode`] → 400
/// - [`ProxyError::UnsupportedPatchType`] → 415
/// - [`ProxyError::SecretGet`], [`ProxyError::Injector`] → 424
/// - [`ProxyError::Upstream`] → 502
/// - everything else → 500
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The request body could not be read.
    #[error("reading body failed: {0}")]
    BodyRead(String),

    /// The request body is not a valid secret document.
    #[error("decoding secret failed: {0}")]
    SecretDecode(String),

    /// The patch body is not valid for its declared patch type.
    #[error("decoding patch failed: {0}")]
    PatchDecode(String),

    /// The patch content type is not one the proxy can re-derive.
    #[error("unsupported patch type: {0}")]
    UnsupportedPatchType(String),

    /// A secret could not be serialised after transformation.
    #[error("encoding secret failed: {0}")]
    SecretEncode(String),

    /// Reading the current secret from the backend failed.
    #[error("getting secret failed: {0}")]
    SecretGet(String),

    /// The incoming patch could not be applied to the stored secret.
    #[error("applying {strategy} patch of v1.Secret failed: {message}")]
    PatchApply {
        /// Patch strategy that was applied (e.g. `strategic merge`).
        strategy: &'static str,
        /// Underlying failure.
        message: String,
    },

    /// Computing the outgoing patch between two snapshots failed.
    #[error("creating {strategy} patch of v1.Secret failed: {message}")]
    PatchCreate {
        /// Patch strategy that was computed (e.g. `merge`).
        strategy: &'static str,
        /// Underlying failure.
        message: String,
    },

    /// A secret injector failed to transform the secret.
    #[error("injecting secret failed: {0}")]
    Injector(String),

    /// The backend could not be reached while forwarding.
    #[error("forwarding to backend failed: {0}")]
    Upstream(String),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ProxyError::SecretDecode(_) | ProxyError::PatchDecode(_) => 400,
            ProxyError::UnsupportedPatchType(_) => 415,
            ProxyError::SecretGet(_) | ProxyError::Injector(_) => 424,
            ProxyError::Upstream(_) => 502,
            ProxyError::BodyRead(_)
            | ProxyError::SecretEncode(_)
            | ProxyError::PatchApply { .. }
            | ProxyError::PatchCreate { .. }
            | ProxyError::Internal(_) => 500,
        }
    }

    /// Machine-readable reason, in the style of Kubernetes `Status.reason`.
    pub fn reason(&self) -> &'static str {
        match self.http_status() {
            400 => "BadRequest",
            415 => "UnsupportedMediaType",
            424 => "FailedDependency",
            502 => "BadGateway",
            _ => "InternalError",
        }
    }

    /// Message safe to return to callers. Never carries secret material.
    pub fn client_message(&self) -> &'static str {
        match self {
            ProxyError::BodyRead(_) => "ksp: internal server error: reading request body failed",
            ProxyError::SecretDecode(_) => "ksp: bad request: invalid secret",
            ProxyError::PatchDecode(_) => "ksp: bad request: invalid patch",
            ProxyError::UnsupportedPatchType(_) => "ksp: unsupported media type: unknown patch type",
            ProxyError::SecretEncode(_) => "ksp: internal server error: encoding secret failed",
            ProxyError::SecretGet(_) => "ksp: failed dependency: getting secret failed",
            ProxyError::PatchApply { .. } => "ksp: internal server error: applying patch failed",
            ProxyError::PatchCreate { .. } => "ksp: internal server error: creating patch failed",
            ProxyError::Injector(_) => "ksp: failed dependency: secret injector failed",
            ProxyError::Upstream(_) => "ksp: bad gateway: backend unreachable",
            ProxyError::Internal(_) => "ksp: unknown internal server error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_codes() {
        assert_eq!(ProxyError::BodyRead("x".into()).http_status(), 500);
        assert_eq!(ProxyError::SecretDecode("x".into()).http_status(), 400);
        assert_eq!(ProxyError::PatchDecode("x".into()).http_status(), 400);
        assert_eq!(
            ProxyError::UnsupportedPatchType("x".into()).http_status(),
            415
        );
        assert_eq!(ProxyError::SecretEncode("x".into()).http_status(), 500);
        assert_eq!(ProxyError::SecretGet("x".into()).http_status(), 424);
        assert_eq!(ProxyError::Injector("x".into()).http_status(), 424);
        assert_eq!(ProxyError::Upstream("x".into()).http_status(), 502);
        assert_eq!(
            ProxyError::PatchApply {
                strategy: "strategic-merge",
                message: "x".into()
            }
            .http_status(),
            500
        );
    }

    #[test]
    fn display_names_strategy_and_type() {
        let e = ProxyError::PatchCreate {
            strategy: "two-way-merge",
            message: "boom".into(),
        };
        assert_eq!(
            e.to_string(),
            "creating two-way-merge patch of v1.Secret failed: boom"
        );
    }

    #[test]
    fn client_message_hides_details() {
        let e = ProxyError::Injector("gpg: no public key for alice@example.com".into());
        assert!(!e.client_message().contains("alice"));
        assert_eq!(e.reason(), "FailedDependency");
    }
}
