//! Error types for the plainpaper library.
//!
//! Errors are split by failure domain:
//!
//! * [`ApiError`]: **request-fatal**. The request cannot be served (bad
//!   image, expired session, rate limit, upstream model failure). Every
//!   variant maps to an HTTP status and a stable machine-readable code so the
//!   client can pick localized, actionable copy.
//!
//! * [`ModelError`]: the provider call or its output was unusable. Always
//!   surfaced to callers as [`ApiError::UpstreamModel`] after being counted.
//!
//! * [`StoreError`]: the capture store or a remote counter failed.
//!
//! * [`NdjsonError`]: one line of an NDJSON stream could not be decoded.
//!
//! * [`ClientError`]: a call made through [`crate::client::PlainpaperClient`]
//!   failed, either in transport or with a structured error body.
//!
//! The sanitizer and post-processing pipeline have no error type: they
//! degrade to fallback text instead of failing a request.

use thiserror::Error;

/// All request-fatal errors returned by the service layer.
#[derive(Debug, Error)]
pub enum ApiError {
    // ── Validation errors ─────────────────────────────────────────────────
    /// Payload is not a usable image (bad data URL, unknown format,
    /// declared/sniffed mismatch, or too small to be real).
    #[error("Invalid image: {detail}")]
    ImageInvalid { detail: String },

    /// Decoded payload exceeds the configured maximum.
    #[error("Image is too large: {size} bytes (limit {limit})")]
    ImageTooLarge { size: usize, limit: usize },

    /// Request body is not the JSON the route expects.
    #[error("Invalid request body: {detail}")]
    InvalidBody { detail: String },

    /// A required request field is absent or empty.
    #[error("Missing field '{field}'")]
    MissingField { field: &'static str },

    /// Question text length is outside the accepted range.
    #[error("Question must be between {min} and {max} characters")]
    InvalidQuestion { min: usize, max: usize },

    /// Context text is longer than accepted.
    #[error("Context must be at most {max} characters")]
    InvalidContext { max: usize },

    // ── Auth / origin errors ──────────────────────────────────────────────
    /// Request origin is not allowed.
    #[error("Origin not allowed")]
    OriginForbidden,

    /// Session token missing, malformed, badly signed or expired.
    #[error("{message}")]
    Unauthorized { message: String },

    // ── Throttling / capacity ─────────────────────────────────────────────
    /// Fixed-window rate limit exhausted. Caller should back off.
    #[error("Too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The in-memory capture store is at capacity.
    #[error("The service is busy right now, please try again in a few minutes")]
    StoreFull,

    /// Capture id unknown or already expired.
    #[error("Session expired, take another photo")]
    CaptureNotFound,

    // ── Upstream ──────────────────────────────────────────────────────────
    /// The model provider failed or returned unusable output.
    #[error("Upstream model error: {0}")]
    UpstreamModel(#[from] ModelError),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status code for this error category.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::ImageInvalid { .. }
            | ApiError::InvalidBody { .. }
            | ApiError::MissingField { .. }
            | ApiError::InvalidQuestion { .. }
            | ApiError::InvalidContext { .. } => 400,
            ApiError::ImageTooLarge { .. } => 413,
            ApiError::OriginForbidden => 403,
            ApiError::Unauthorized { .. } => 401,
            ApiError::RateLimited { .. } => 429,
            ApiError::StoreFull => 409,
            ApiError::CaptureNotFound => 404,
            ApiError::UpstreamModel(_) => 502,
            ApiError::Internal(_) => 500,
        }
    }

    /// Stable code the client maps to localized copy.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::ImageInvalid { .. } => "IMAGE_INVALID",
            ApiError::ImageTooLarge { .. } => "IMAGE_TOO_LARGE",
            ApiError::InvalidBody { .. } => "INVALID_BODY",
            ApiError::MissingField { .. } => "MISSING_FIELD",
            ApiError::InvalidQuestion { .. } => "INVALID_QUESTION",
            ApiError::InvalidContext { .. } => "INVALID_CONTEXT",
            ApiError::OriginForbidden => "ORIGIN_FORBIDDEN",
            ApiError::Unauthorized { .. } => "UNAUTHORIZED",
            ApiError::RateLimited { .. } => "RATE_LIMITED",
            ApiError::StoreFull => "STORE_FULL",
            ApiError::CaptureNotFound => "CAPTURE_NOT_FOUND",
            ApiError::UpstreamModel(_) => "UPSTREAM_MODEL_ERROR",
            ApiError::Internal(_) => "INTERNAL",
        }
    }

    /// Seconds the caller should wait before retrying, when known.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ApiError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Structured JSON body: `{"ok":false,"error":...,"code":...}`.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "ok": false,
            "error": self.to_string(),
            "code": self.code(),
        })
    }

    pub(crate) fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::Unauthorized {
            message: message.into(),
        }
    }
}

/// Failures of the model provider or of its output.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// Provider is not configured (missing API key, unknown provider name).
    #[error("provider '{provider}' is not configured: {hint}")]
    NotConfigured { provider: String, hint: String },

    /// Provider call failed after all retries.
    #[error("provider call failed after {retries} retries: {detail}")]
    Provider { retries: u32, detail: String },

    /// Model output contained no JSON object.
    #[error("no JSON object found in model output")]
    NoJson,

    /// Model output contained a JSON-looking span that failed to parse.
    #[error("model output is not valid JSON: {0}")]
    InvalidJson(String),

    /// Model returned an empty text answer.
    #[error("model returned an empty answer")]
    EmptyAnswer,
}

/// Capture store and remote counter failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Capacity guard tripped (memory-backed mode only).
    #[error("capture store is full ({count} entries, {bytes} bytes)")]
    Full { count: usize, bytes: usize },

    /// Remote backend unreachable or returned an error.
    #[error("store backend error: {0}")]
    Backend(String),

    /// Stored entry could not be encoded or decoded.
    #[error("store codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Full { .. } => ApiError::StoreFull,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// A single NDJSON line that could not be turned into an event.
#[derive(Debug, Error)]
pub enum NdjsonError {
    /// Line `line` (1-indexed) is not valid JSON for the expected event type.
    #[error("invalid NDJSON at line {line}: {source}")]
    InvalidLine {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Underlying byte stream failed.
    #[error("stream transport error: {0}")]
    Transport(String),
}

/// Failure of a call made through [`crate::client::PlainpaperClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a structured error body.
    #[error("{status} {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl ClientError {
    /// HTTP status for [`ClientError::Api`].
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Why a session token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("session token missing")]
    Missing,

    /// Not `<payload>.<signature>`, bad base64, or bad payload JSON.
    #[error("session token malformed")]
    Malformed,

    #[error("session token signature invalid")]
    BadSignature,

    #[error("session token expired")]
    Expired,
}

/// Invalid [`crate::config::ServiceConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_carries_retry_hint() {
        let e = ApiError::RateLimited {
            retry_after_secs: 42,
        };
        assert_eq!(e.status(), 429);
        assert_eq!(e.retry_after_secs(), Some(42));
        assert!(e.to_string().contains("42s"));
    }

    #[test]
    fn model_error_maps_to_bad_gateway() {
        let e: ApiError = ModelError::NoJson.into();
        assert_eq!(e.status(), 502);
        assert_eq!(e.code(), "UPSTREAM_MODEL_ERROR");
    }

    #[test]
    fn store_full_is_distinct_from_validation() {
        let e: ApiError = StoreError::Full {
            count: 80,
            bytes: 10,
        }
        .into();
        assert_eq!(e.code(), "STORE_FULL");
        assert_ne!(e.status(), ApiError::ImageInvalid { detail: "x".into() }.status());
    }

    #[test]
    fn body_is_structured() {
        let body = ApiError::unauthorized("session expired").to_body();
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "session expired");
        assert_eq!(body["code"], "UNAUTHORIZED");
    }

    #[test]
    fn too_large_reports_limit() {
        let e = ApiError::ImageTooLarge {
            size: 9_000_000,
            limit: 8_388_608,
        };
        assert_eq!(e.status(), 413);
        assert!(e.to_string().contains("8388608"));
    }
}
