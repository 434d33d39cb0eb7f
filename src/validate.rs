//! Request guards and input sanitization.
//!
//! The guards run in a fixed order before any downstream work: byte
//! ceiling, content type, JSON parse, required fields, message length.
//! Sanitization runs only after validation has passed and before the value
//! reaches a prompt, a log row or a stored record.

use axum::http::{header, HeaderMap};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::ApiError;

static SCRIPT_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());

/// Size limits applied to inbound bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    pub max_body_bytes: usize,
    pub max_message_chars: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 50 * 1024,
            max_message_chars: 1000,
        }
    }
}

/// Reject early on a declared `Content-Length` above the ceiling.
pub fn check_declared_length(headers: &HeaderMap, limits: &RequestLimits) -> Result<(), ApiError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok());
    match declared {
        Some(len) if len > limits.max_body_bytes => Err(ApiError::PayloadTooLarge {
            limit: limits.max_body_bytes,
        }),
        _ => Ok(()),
    }
}

pub fn check_body_len(len: usize, limits: &RequestLimits) -> Result<(), ApiError> {
    if len > limits.max_body_bytes {
        return Err(ApiError::PayloadTooLarge {
            limit: limits.max_body_bytes,
        });
    }
    Ok(())
}

/// Only `application/json` (with optional parameters) is accepted.
pub fn check_content_type(headers: &HeaderMap) -> Result<(), ApiError> {
    let raw = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let mime = raw.split(';').next().unwrap_or("").trim();
    if mime.eq_ignore_ascii_case("application/json") {
        Ok(())
    } else {
        Err(ApiError::UnsupportedMediaType(if raw.is_empty() {
            "none".to_string()
        } else {
            mime.to_string()
        }))
    }
}

/// Parse the body into a JSON object.
pub fn parse_object(body: &[u8]) -> Result<Value, ApiError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| ApiError::InvalidJson(e.to_string()))?;
    if !value.is_object() {
        return Err(ApiError::InvalidJson("body must be a JSON object".into()));
    }
    Ok(value)
}

/// Every path (dot separated for nested objects) must hold a non-blank
/// string.  All missing paths are reported together.
pub fn require_fields(value: &Value, paths: &[&'static str]) -> Result<(), ApiError> {
    let missing: Vec<&'static str> = paths
        .iter()
        .copied()
        .filter(|path| {
            let found = path
                .split('.')
                .try_fold(value, |node, key| node.get(key));
            !matches!(found, Some(Value::String(s)) if !s.trim().is_empty())
        })
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ApiError::MissingFields(missing))
    }
}

/// Length check on the raw message, counted in characters.
pub fn check_message_length(message: &str, limits: &RequestLimits) -> Result<(), ApiError> {
    let actual = message.chars().count();
    if actual > limits.max_message_chars {
        return Err(ApiError::MessageTooLong {
            actual,
            limit: limits.max_message_chars,
        });
    }
    Ok(())
}

/// Strip script blocks (with their content), then any other markup, then
/// surrounding whitespace.
pub fn sanitize_text(input: &str) -> String {
    if memchr::memchr(b'<', input.as_bytes()).is_none() {
        return input.trim().to_string();
    }
    let without_scripts = SCRIPT_BLOCK_RE.replace_all(input, "");
    let without_tags = TAG_RE.replace_all(&without_scripts, "");
    without_tags.trim().to_string()
}

/// Apply [`sanitize_text`] to every string in the document, recursing into
/// arrays and objects.  Object keys are left alone.
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_text(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, sanitize_value(v)))
                .collect(),
        ),
        other => other,
    }
}
