//! API error envelope.
//!
//! Every failure a caller can see has the shape
//! `{error: <KIND>, message: <string>, details: <object>}` with the HTTP
//! status derived from the taxonomy code. Unexpected infrastructure
//! errors collapse to a plain 500 `internal_error`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use neverdown_common::{AgentFailure, ErrorCode};
use neverdown_store::StoreError;
use serde_json::json;

/// A failure ready to leave the API boundary.
#[derive(Debug)]
pub enum ApiError {
    /// Typed domain failure
    Failure(AgentFailure),
    /// Unexpected infrastructure error; detail stays in the logs
    Internal(String),
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Failure(AgentFailure::new(code, message))
    }
}

impl From<AgentFailure> for ApiError {
    fn from(failure: AgentFailure) -> Self {
        Self::Failure(failure)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err.as_not_found() {
            Some(failure) => Self::Failure(failure),
            None => Self::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Failure(failure) => {
                let status = StatusCode::from_u16(failure.code.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let body = json!({
                    "error": failure.code.as_str(),
                    "message": failure.message,
                    "details": failure.details,
                });
                (status, Json(body)).into_response()
            }
            Self::Internal(detail) => {
                tracing::error!("Internal error: {detail}");
                let body = json!({
                    "error": "internal_error",
                    "message": "an unexpected error occurred",
                    "details": {},
                });
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_statuses() {
        let error = ApiError::new(ErrorCode::IncidentNotFound, "incident x not found");
        assert_eq!(error.into_response().status(), StatusCode::NOT_FOUND);

        let error = ApiError::new(ErrorCode::InvalidStateTransition, "nope");
        assert_eq!(error.into_response().status(), StatusCode::BAD_REQUEST);

        let error = ApiError::new(ErrorCode::UnauthorizedRepo, "not allowed");
        assert_eq!(error.into_response().status(), StatusCode::UNAUTHORIZED);

        let error = ApiError::Internal("db gone".to_string());
        assert_eq!(
            error.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
