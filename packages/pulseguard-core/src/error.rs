//! Centralized error types for the Pulseguard core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the Pulseguard server.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum PulseguardError {
    /// Requested episode does not exist.
    #[error("Episode not found: {0}")]
    EpisodeNotFound(String),

    /// Requested device has no live connection or no buffered data.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Requested alert does not exist or is no longer active.
    #[error("Alert not found: {0}")]
    AlertNotFound(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A socket message arrived from the wrong role for that message type.
    #[error("Not permitted for this role: {0}")]
    WrongRole(String),

    /// The model-inference collaborator failed or is unavailable.
    #[error("Inference failed: {0}")]
    Inference(String),

    /// The conversational-agent stream failed to connect or dropped.
    #[error("Agent stream error: {0}")]
    AgentStream(String),

    /// A dead-man action conflicts with another pending action.
    #[error("Conflicting pending action: {0}")]
    ConflictingPendingAction(String),

    /// Server configuration error (missing required settings).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PulseguardError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EpisodeNotFound(_) => "episode_not_found",
            Self::DeviceNotFound(_) => "device_not_found",
            Self::AlertNotFound(_) => "alert_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::WrongRole(_) => "wrong_role",
            Self::Inference(_) => "inference_failed",
            Self::AgentStream(_) => "agent_stream_error",
            Self::ConflictingPendingAction(_) => "conflicting_pending_action",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::EpisodeNotFound(_) | Self::DeviceNotFound(_) | Self::AlertNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::WrongRole(_) => StatusCode::FORBIDDEN,
            Self::ConflictingPendingAction(_) => StatusCode::CONFLICT,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ErrorCode for PulseguardError {
    fn code(&self) -> &'static str {
        PulseguardError::code(self)
    }
}

/// Convenient Result alias for application-wide operations.
pub type PulseguardResult<T> = Result<T, PulseguardError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for PulseguardError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_action_maps_to_conflict() {
        let err = PulseguardError::ConflictingPendingAction("start_call".into());
        assert_eq!(err.code(), "conflicting_pending_action");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn not_found_variants_map_to_404() {
        assert_eq!(
            PulseguardError::EpisodeNotFound("e1".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PulseguardError::DeviceNotFound("d1".into()).status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
