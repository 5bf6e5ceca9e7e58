//! The uniform wire error for every Merx HTTP surface.
//!
//! One translator maps domain error kinds to statuses; handlers never pick
//! status codes themselves. The body shape is contractual:
//!
//! ```json
//! {
//!   "timestamp": "2025-01-01T00:00:00Z",
//!   "status": 409,
//!   "error": "Conflict",
//!   "message": "Insufficient stock for product …",
//!   "path": "/api/v1/orders",
//!   "errorCode": "INSUFFICIENT_STOCK",
//!   "details": { … },
//!   "validationErrors": [{ "field": "quantity", "message": "must be positive" }]
//! }
//! ```

use axum::Json;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use merx_core::error::{Classify, ErrorKind};
use serde::Serialize;
use std::fmt;

/// A field-level validation failure.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    /// The offending field.
    pub field: String,
    /// What was wrong with it.
    pub message: String,
}

/// Application error carried through handlers into the uniform wire body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    code: String,
    path: Option<String>,
    details: Option<serde_json::Value>,
    validation_errors: Vec<ValidationError>,
    retry_after: Option<u64>,
    /// Internal error for logging, never exposed to the client.
    source: Option<anyhow::Error>,
}

impl ApiError {
    /// Create a new error with explicit status and code.
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: code.into(),
            path: None,
            details: None,
            validation_errors: Vec::new(),
            retry_after: None,
            source: None,
        }
    }

    /// Translate any classified domain error into its wire form.
    ///
    /// This is the single domain→HTTP mapping of the platform.
    #[must_use]
    pub fn from_classified<E: Classify + fmt::Display>(err: &E) -> Self {
        let status = match err.kind() {
            ErrorKind::DomainRejection => match err.code() {
                "PRODUCT_NOT_FOUND" | "ORDER_NOT_FOUND" | "RESERVATION_NOT_FOUND" => {
                    StatusCode::NOT_FOUND
                }
                "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
                _ => StatusCode::CONFLICT,
            },
            ErrorKind::TransientInfra => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::AuthFailure => StatusCode::UNAUTHORIZED,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string(), err.code())
    }

    /// Attach the request path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attach structured detail for the client.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach per-field validation errors.
    #[must_use]
    pub fn with_validation_errors(mut self, errors: Vec<ValidationError>) -> Self {
        self.validation_errors = errors;
        self
    }

    /// Attach the internal cause for server-side logging.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// Create a 400 Bad Request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, "BAD_REQUEST")
    }

    /// Create a 400 with per-field validation errors.
    #[must_use]
    pub fn validation(errors: Vec<ValidationError>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "Request validation failed",
            "VALIDATION_ERROR",
        )
        .with_validation_errors(errors)
    }

    /// Create a 401 Unauthorized error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message, "UNAUTHORIZED")
    }

    /// Create a 403 Forbidden error.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message, "FORBIDDEN")
    }

    /// Create a 404 Not Found error.
    #[must_use]
    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            format!("{resource} with id {id} not found"),
            "NOT_FOUND",
        )
    }

    /// Create a 409 Conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message, code)
    }

    /// Create a 429 Too Many Requests error with a retry-after hint, in
    /// both the body and the `X-Rate-Limit-Retry-After` header.
    #[must_use]
    pub fn too_many_requests(retry_after_secs: u64) -> Self {
        let mut err = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded",
            "RATE_LIMITED",
        )
        .with_details(serde_json::json!({ "retryAfter": retry_after_secs }));
        err.retry_after = Some(retry_after_secs);
        err
    }

    /// Create a 500 Internal Server Error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message,
            "INTERNAL_SERVER_ERROR",
        )
    }

    /// Create a 503 Service Unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            message,
            "SERVICE_UNAVAILABLE",
        )
    }

    /// Create a 504 Gateway Timeout error.
    #[must_use]
    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, message, "TIMEOUT")
    }

    /// The HTTP status this error maps to.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// The stable error code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// The contractual JSON error body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    timestamp: String,
    status: u16,
    error: String,
    message: String,
    path: String,
    error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    validation_errors: Vec<ValidationError>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            if let Some(source) = &self.source {
                tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    error = %source,
                    "Internal server error"
                );
            } else {
                tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    "Internal server error"
                );
            }
        }

        let body = ErrorBody {
            timestamp: Utc::now().to_rfc3339(),
            status: self.status.as_u16(),
            error: self
                .status
                .canonical_reason()
                .unwrap_or("Unknown")
                .to_string(),
            message: self.message,
            path: self.path.unwrap_or_default(),
            error_code: self.code,
            details: self.details,
            validation_errors: self.validation_errors,
        };

        let mut response = (self.status, Json(body)).into_response();
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response
                    .headers_mut()
                    .insert("X-Rate-Limit-Retry-After", value);
            }
        }
        response
    }
}

/// Convert `anyhow::Error` to a 500 `ApiError`.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal("An internal error occurred").with_source(err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Error, Debug)]
    #[error("Insufficient stock")]
    struct FakeRejection;

    impl Classify for FakeRejection {
        fn kind(&self) -> ErrorKind {
            ErrorKind::DomainRejection
        }
        fn code(&self) -> &'static str {
            "INSUFFICIENT_STOCK"
        }
    }

    #[test]
    fn classified_domain_rejection_maps_to_conflict() {
        let err = ApiError::from_classified(&FakeRejection);
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "INSUFFICIENT_STOCK");
    }

    #[tokio::test]
    async fn body_carries_contractual_fields() {
        let response = ApiError::bad_request("Invalid quantity")
            .with_path("/api/v1/orders")
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], 400);
        assert_eq!(json["errorCode"], "BAD_REQUEST");
        assert_eq!(json["path"], "/api/v1/orders");
        assert!(json.get("timestamp").is_some());
        assert!(json.get("validationErrors").is_none());
    }

    #[tokio::test]
    async fn rate_limited_carries_retry_after_header() {
        let response = ApiError::too_many_requests(1).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("X-Rate-Limit-Retry-After").unwrap(),
            "1"
        );
    }

    #[test]
    fn display_includes_code() {
        let err = ApiError::not_found("Order", "o-1");
        assert_eq!(err.to_string(), "[NOT_FOUND] Order with id o-1 not found");
    }
}
