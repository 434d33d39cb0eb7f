//! Client-facing error taxonomy.
//!
//! Every variant maps to one HTTP status and one stable machine-readable
//! `code`.  Dependency failures that have no fallback are reported with a
//! generic message; the detail only goes to tracing.

use axum::http::StatusCode;

use crate::rate_limit::RateLimitDecision;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Request body exceeds limit of {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("Unsupported content type '{0}', expected application/json")]
    UnsupportedMediaType(String),
    #[error("Invalid JSON body: {0}")]
    InvalidJson(String),
    #[error("Missing or empty required field(s): {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("Message too long ({actual} characters > limit {limit})")]
    MessageTooLong { actual: usize, limit: usize },
    #[error("Invalid value for field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("Vendor not found")]
    VendorNotFound,
    #[error("Rate limit exceeded, retry after {retry_after_secs} seconds")]
    RateLimited {
        decision: RateLimitDecision,
        limit: u32,
        retry_after_secs: u64,
    },
    #[error("Not found")]
    NotFound,
    #[error("Service temporarily unavailable")]
    Unavailable,
    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::InvalidJson(_)
            | ApiError::MissingFields(_)
            | ApiError::MessageTooLong { .. }
            | ApiError::InvalidField { .. } => StatusCode::BAD_REQUEST,
            ApiError::VendorNotFound | ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            ApiError::UnsupportedMediaType(_) => "UNSUPPORTED_MEDIA_TYPE",
            ApiError::InvalidJson(_) => "INVALID_JSON",
            ApiError::MissingFields(_) => "MISSING_FIELDS",
            ApiError::MessageTooLong { .. } => "MESSAGE_TOO_LONG",
            ApiError::InvalidField { .. } => "INVALID_FIELD",
            ApiError::VendorNotFound => "VENDOR_NOT_FOUND",
            ApiError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            ApiError::NotFound => "NOT_FOUND",
            ApiError::Unavailable => "SERVICE_UNAVAILABLE",
            ApiError::Internal => "INTERNAL_ERROR",
        }
    }
}
