//! Error taxonomy for the node.
//!
//! Mirrors the teacher's domain-grouped `thiserror` enum: each variant knows
//! its own wire status and, for signature failures, a finer-grained reason
//! that callers and tests can match on without widening the HTTP status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Sub-kind of a rejected [`SignedAction`] or node envelope (spec §4.3, §4.6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureFailure {
    HandleMismatch,
    StaleTimestamp,
    ReplayedNonce,
    KeyChanged,
    BadSignature,
    UnknownSigner,
}

impl SignatureFailure {
    pub fn code(&self) -> &'static str {
        match self {
            SignatureFailure::HandleMismatch => "HANDLE_MISMATCH",
            SignatureFailure::StaleTimestamp => "STALE_TIMESTAMP",
            SignatureFailure::ReplayedNonce => "REPLAYED_NONCE",
            SignatureFailure::KeyChanged => "KEY_CHANGED",
            SignatureFailure::BadSignature => "INVALID_SIGNATURE",
            SignatureFailure::UnknownSigner => "UNKNOWN_USER",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("signature check failed: {0:?}")]
    InvalidSignature(SignatureFailure),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited")]
    RateLimited,

    #[error("endpoint gone")]
    Gone,

    #[error("upstream node unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl NodeError {
    pub fn wire_status(&self) -> StatusCode {
        match self {
            NodeError::Validation(_) => StatusCode::BAD_REQUEST,
            NodeError::AuthRequired => StatusCode::UNAUTHORIZED,
            NodeError::InvalidSignature(_) => StatusCode::FORBIDDEN,
            NodeError::Forbidden(_) => StatusCode::FORBIDDEN,
            NodeError::NotFound(_) => StatusCode::NOT_FOUND,
            NodeError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            NodeError::Gone => StatusCode::GONE,
            NodeError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            NodeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            NodeError::Validation(_) => "VALIDATION",
            NodeError::AuthRequired => "AUTH_REQUIRED",
            NodeError::InvalidSignature(reason) => reason.code(),
            NodeError::Forbidden(_) => "FORBIDDEN",
            NodeError::NotFound(_) => "NOT_FOUND",
            NodeError::RateLimited => "RATE_LIMITED",
            NodeError::Gone => "GONE",
            NodeError::UpstreamUnreachable(_) => "UPSTREAM_UNREACHABLE",
            NodeError::Internal(_) => "INTERNAL",
        }
    }
}

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        if self.wire_status().is_server_error() {
            tracing::warn!(error = %self, code = self.code(), "request failed");
        }
        let body = json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        (self.wire_status(), axum::Json(body)).into_response()
    }
}

impl From<sqlx::Error> for NodeError {
    fn from(err: sqlx::Error) -> Self {
        NodeError::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(err: reqwest::Error) -> Self {
        NodeError::UpstreamUnreachable(err.to_string())
    }
}

pub type NodeResult<T> = Result<T, NodeError>;
