//! Error taxonomy for the identity gateway.
//!
//! Every failure surfaced to a caller carries a stable [`ErrorCode`]. Leaf
//! errors wrap their underlying cause; transports map codes to HTTP statuses.
//! Handlers never leak internal details: the wire envelope is always
//! `{"error": "<code>"}`.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error codes with a fixed HTTP mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed request (bad email, scopes, redirect URI).
    BadRequest,
    /// Well-formed request that fails semantic validation.
    Validation,
    /// Missing or invalid credentials.
    Unauthorized,
    /// Authenticated but not permitted.
    Forbidden,
    /// Entity does not exist.
    NotFound,
    /// State conflict (e.g. duplicate grant).
    Conflict,
    /// No active consent for the requested purpose.
    MissingConsent,
    /// Consent exists but is revoked or expired.
    InvalidConsent,
    /// Rate limit or lockout denial.
    RateLimited,
    /// Unexpected internal failure.
    Internal,
    /// Downstream dependency unavailable.
    Unavailable,
    /// OAuth: structurally invalid token request.
    InvalidRequest,
    /// OAuth: code unknown, consumed, expired, or mismatched.
    InvalidGrant,
    /// OAuth: unknown client.
    InvalidClient,
}

impl ErrorCode {
    /// Wire representation used in the error envelope.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Validation => "validation",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::MissingConsent => "missing_consent",
            Self::InvalidConsent => "invalid_consent",
            Self::RateLimited => "rate_limited",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
            Self::InvalidRequest => "invalid_request",
            Self::InvalidGrant => "invalid_grant",
            Self::InvalidClient => "invalid_client",
        }
    }

    /// HTTP status for this code.
    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            Self::BadRequest | Self::InvalidRequest | Self::InvalidGrant => StatusCode::BAD_REQUEST,
            Self::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unauthorized | Self::InvalidClient => StatusCode::UNAUTHORIZED,
            Self::Forbidden | Self::MissingConsent | Self::InvalidConsent => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate-limit metadata attached to 429 responses.
///
/// Rendered as the `Retry-After` header plus the `RateLimit-*` triplet.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    /// Configured limit for the window.
    pub limit: u32,
    /// Requests remaining in the current window.
    pub remaining: u32,
    /// Seconds until the window resets.
    pub reset_secs: u64,
    /// Seconds the client should wait before retrying.
    pub retry_after_secs: u64,
}

/// Gateway error: a taxonomy code, an operator-facing message, and an
/// optional underlying cause. The message is logged, never sent on the wire.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Error {
    code: ErrorCode,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    rate_limit: Option<RateLimitInfo>,
}

impl Error {
    /// Create an error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            rate_limit: None,
        }
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach rate-limit metadata (rendered as response headers).
    #[must_use]
    pub fn with_rate_limit(mut self, info: RateLimitInfo) -> Self {
        self.rate_limit = Some(info);
        self
    }

    /// The taxonomy code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The operator-facing message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Rate-limit metadata, if any.
    #[must_use]
    pub fn rate_limit(&self) -> Option<&RateLimitInfo> {
        self.rate_limit.as_ref()
    }

    /// `bad_request` shorthand.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// `validation` shorthand.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    /// `unauthorized` shorthand.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// `forbidden` shorthand.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    /// `not_found` shorthand.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// `conflict` shorthand.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    /// `missing_consent` shorthand.
    pub fn missing_consent(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MissingConsent, message)
    }

    /// `rate_limited` shorthand.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RateLimited, message)
    }

    /// `internal` shorthand.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// `unavailable` shorthand.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    /// `invalid_grant` shorthand. The message is intentionally generic on the
    /// wire; the detail only reaches logs.
    pub fn invalid_grant(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidGrant, message)
    }

    /// `invalid_client` shorthand.
    pub fn invalid_client(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidClient, message)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.code.status();

        if status.is_server_error() {
            tracing::error!(code = %self.code, message = %self.message, "request failed");
        } else {
            tracing::debug!(code = %self.code, message = %self.message, "request rejected");
        }

        let body = Json(json!({ "error": self.code.as_str() }));
        let mut response = (status, body).into_response();

        if let Some(info) = self.rate_limit {
            let headers = response.headers_mut();
            let put = |headers: &mut axum::http::HeaderMap, name: &'static str, value: String| {
                if let Ok(v) = header::HeaderValue::from_str(&value) {
                    headers.insert(name, v);
                }
            };
            put(headers, "retry-after", info.retry_after_secs.to_string());
            put(headers, "ratelimit-limit", info.limit.to_string());
            put(headers, "ratelimit-remaining", info.remaining.to_string());
            put(headers, "ratelimit-reset", info.reset_secs.to_string());
        }

        response
    }
}
