//! Security and CORS response headers plus the canonical response
//! envelopes.  Every response the pipeline emits goes through
//! [`SecurityHeaders`], including preflights, `/metrics` and panic
//! fallbacks.  The one exception is axum's own 405 for a wrong method on a
//! known route, which never reaches a handler.

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue};
use axum::http::{Response as HttpResponse, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::ApiError;

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; img-src 'self' data: https:; connect-src 'self' https:; frame-ancestors 'none'";
const ALLOW_HEADERS: &str = "authorization, x-client-info, apikey, content-type";
const ALLOW_METHODS: &str = "POST, OPTIONS";
const PREFLIGHT_MAX_AGE_SECS: &str = "86400";

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_TIMESTAMP: HeaderName = HeaderName::from_static("x-timestamp");

const FIXED: [(HeaderName, &str); 7] = [
    (header::CONTENT_SECURITY_POLICY, CONTENT_SECURITY_POLICY),
    (header::X_FRAME_OPTIONS, "DENY"),
    (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
    (
        header::STRICT_TRANSPORT_SECURITY,
        "max-age=31536000; includeSubDomains",
    ),
    (header::REFERRER_POLICY, "strict-origin-when-cross-origin"),
    (
        HeaderName::from_static("permissions-policy"),
        "camera=(), microphone=(), geolocation=()",
    ),
    (header::X_XSS_PROTECTION, "1; mode=block"),
];

/// Canonical error envelope: `{error: {message, code, timestamp, requestId}, success: false}`.
#[derive(Debug, Serialize, Clone)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
    pub success: bool,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub message: String,
    pub code: &'static str,
    pub timestamp: String,
    pub request_id: String,
}

/// Builds secure responses.  Holds the configured CORS origin; everything
/// else is fixed.
#[derive(Clone, Debug)]
pub struct SecurityHeaders {
    allow_origin: HeaderValue,
}

impl SecurityHeaders {
    pub fn new(allowed_origin: &str) -> Result<Self, InvalidHeaderValue> {
        Ok(Self {
            allow_origin: HeaderValue::from_str(allowed_origin)?,
        })
    }

    pub fn apply_cors(&self, headers: &mut HeaderMap) {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            self.allow_origin.clone(),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOW_HEADERS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        );
    }

    /// Stamp the full security header set, CORS headers, request id and
    /// timestamp onto `headers`.
    pub fn apply(&self, headers: &mut HeaderMap, request_id: &str) {
        for (name, value) in FIXED.iter() {
            headers.insert(name.clone(), HeaderValue::from_static(value));
        }
        self.apply_cors(headers);
        if let Ok(id) = HeaderValue::from_str(request_id) {
            headers.insert(X_REQUEST_ID, id);
        }
        if let Ok(ts) = HeaderValue::from_str(&chrono::Utc::now().to_rfc3339()) {
            headers.insert(X_TIMESTAMP, ts);
        }
    }

    pub fn json<T: Serialize>(&self, status: StatusCode, payload: &T, request_id: &str) -> Response {
        let mut resp = (status, Json(payload)).into_response();
        self.apply(resp.headers_mut(), request_id);
        resp
    }

    pub fn error(&self, err: &ApiError, request_id: &str) -> Response {
        let envelope = error_envelope(err, request_id);
        let mut resp = self.json(err.status(), &envelope, request_id);
        if let ApiError::RateLimited {
            decision,
            limit,
            retry_after_secs,
        } = err
        {
            let headers = resp.headers_mut();
            insert_rate_limit_headers(headers, decision, *limit);
            headers.insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
        }
        resp
    }

    /// CORS preflight: 200, no body, CORS headers with a long max-age.
    pub fn preflight(&self) -> Response {
        let mut resp = StatusCode::OK.into_response();
        let headers = resp.headers_mut();
        self.apply_cors(headers);
        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static(PREFLIGHT_MAX_AGE_SECS),
        );
        resp
    }

    /// Response used when a handler panics.  Must not panic itself.
    pub fn panic_response(&self) -> HttpResponse<Body> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.error(&ApiError::Internal, &request_id)
    }
}

pub fn error_envelope(err: &ApiError, request_id: &str) -> ErrorEnvelope {
    ErrorEnvelope {
        error: ErrorDetail {
            message: err.to_string(),
            code: err.code(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            request_id: request_id.to_string(),
        },
        success: false,
    }
}

pub fn insert_rate_limit_headers(
    headers: &mut HeaderMap,
    decision: &crate::rate_limit::RateLimitDecision,
    limit: u32,
) {
    headers.insert(
        HeaderName::from_static("x-rate-limit-limit"),
        HeaderValue::from(limit),
    );
    headers.insert(
        HeaderName::from_static("x-rate-limit-remaining"),
        HeaderValue::from(decision.remaining_requests),
    );
    headers.insert(
        HeaderName::from_static("x-rate-limit-reset"),
        HeaderValue::from(decision.reset_unix_secs()),
    );
}
