//! API error handling.
//!
//! Provides consistent error responses for the API.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::Error;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    /// Human-readable error message
    pub error: String,
    /// Error code for programmatic handling
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "WORKER_CAPACITY", message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "PROXY_ERROR", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            error: self.message,
            code: self.code,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::ExtractionFailed { message, attempts } => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "EXTRACTION_FAILED", message)
                    .with_details(serde_json::json!({ "attempts": attempts }))
            }
            Error::Validation(msg) => ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
            Error::Configuration(msg) => ApiError::bad_request(msg),
            Error::NotFound { entity_type, id } => {
                ApiError::not_found(format!("{entity_type} with id '{id}' not found"))
            }
            Error::ContentNotFound(msg) => ApiError::not_found(msg),
            ref e @ Error::WorkerCapacity { .. } => ApiError::too_many_requests(e.to_string()),
            Error::Cancelled => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "CANCELLED",
                "Request cancelled",
            ),
            Error::Proxy(e) if e.is_client_error() => ApiError::bad_request(e.to_string()),
            Error::Proxy(e) => {
                tracing::warn!(error = %e, "Proxy upstream failure");
                ApiError::bad_gateway(e.to_string())
            }
            _ => {
                tracing::error!(error = %err, "Unexpected error");
                ApiError::internal("An unexpected error occurred")
            }
        }
    }
}

impl From<crate::proxy::ProxyError> for ApiError {
    fn from(err: crate::proxy::ProxyError) -> Self {
        Error::Proxy(err).into()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyError;

    #[test]
    fn test_extraction_failure_maps_to_503_with_attempts() {
        let err: ApiError = Error::extraction_failed(
            "All 2 provider(s) failed",
            vec!["a: timed out".to_string(), "b: rate limited".to_string()],
        )
        .into();

        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code, "EXTRACTION_FAILED");
        assert_eq!(err.details.unwrap()["attempts"][1], "b: rate limited");
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::validation("bad id"), StatusCode::BAD_REQUEST),
            (Error::not_found("Worker", "1"), StatusCode::NOT_FOUND),
            (
                Error::WorkerCapacity {
                    worker_type: "extraction".to_string(),
                    max: 1,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (Error::Cancelled, StatusCode::SERVICE_UNAVAILABLE),
            (
                Error::Proxy(ProxyError::Upstream {
                    status: 500,
                    url: "https://cdn.example.com/a".to_string(),
                }),
                StatusCode::BAD_GATEWAY,
            ),
            (
                Error::Proxy(ProxyError::Forbidden("localhost".to_string())),
                StatusCode::BAD_REQUEST,
            ),
            (Error::Other("boom".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.status, status, "code {}", api.code);
        }
    }

    #[test]
    fn test_body_shape() {
        let body = ApiErrorResponse {
            error: "nope".to_string(),
            code: "BAD_REQUEST".to_string(),
            details: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"], "nope");
        assert!(json.get("details").is_none());
    }
}
