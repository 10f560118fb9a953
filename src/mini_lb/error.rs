use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

/// Which side of a prefill/decode pair a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Prefill,
    Decode,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Prefill => write!(f, "prefill"),
            Leg::Decode => write!(f, "decode"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MiniLbError {
    /// Startup misconfiguration. Fatal, the balancer refuses to start.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The request body has a shape the bootstrap injector cannot handle.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    /// A required backend leg faulted or did not complete.
    #[error("{leg} server unavailable: {message}")]
    BackendUnavailable { leg: Leg, message: String },
    /// A proxied backend answered with a non-success status that is surfaced verbatim.
    #[error("{message}")]
    BackendStatus { status: StatusCode, message: String },
}

impl MiniLbError {
    pub fn unavailable(leg: Leg, message: impl fmt::Display) -> Self {
        MiniLbError::BackendUnavailable {
            leg,
            message: message.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            MiniLbError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MiniLbError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            MiniLbError::BackendUnavailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            MiniLbError::BackendStatus { status, .. } => *status,
        }
    }

    /// `{"error": {"message": ...}}`, shared by JSON error responses and the SSE error event.
    pub fn to_json(&self) -> Value {
        json!({ "error": { "message": self.to_string() } })
    }
}

impl IntoResponse for MiniLbError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_json())).into_response()
    }
}

pub type Result<T> = std::result::Result<T, MiniLbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            MiniLbError::MalformedRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            MiniLbError::unavailable(Leg::Prefill, "boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let upstream = MiniLbError::BackendStatus {
            status: StatusCode::NOT_FOUND,
            message: "Prefill server error: Status 404".into(),
        };
        assert_eq!(upstream.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_body_names_leg() {
        let err = MiniLbError::unavailable(Leg::Decode, "connection refused");
        let body = err.to_json();
        assert_eq!(
            body["error"]["message"],
            "decode server unavailable: connection refused"
        );
    }
}
