//! Error types for the Berth API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use berth_container::ContainerError;
use serde::Serialize;
use thiserror::Error;

/// Result type alias for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors that can occur while serving an API request.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request, rejected before any manager call.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The container manager failed. Passed through without inspection.
    #[error(transparent)]
    Manager(#[from] ContainerError),

    /// The connection cannot be taken over for a raw stream.
    #[error("connection not hijackable: {0}")]
    HijackUnsupported(String),

    /// The server is shutting down and the call was interrupted.
    #[error("request cancelled: server shutting down")]
    Cancelled,

    /// Server error.
    #[error("Server error: {0}")]
    Server(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidParameter(_) => StatusCode::BAD_REQUEST,
            Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Self::Manager(_) | Self::HijackUnsupported(_) | Self::Server(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Docker-style error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            message: self.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_errors_are_server_errors_regardless_of_kind() {
        let not_found = ApiError::from(ContainerError::not_found("web"));
        assert_eq!(not_found.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(not_found.to_string(), "container not found: web");

        let conflict = ApiError::from(ContainerError::AlreadyExists("web".into()));
        assert_eq!(conflict.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            ApiError::InvalidParameter("t".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Cancelled.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::HijackUnsupported("no upgrade".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
