//! Request authentication helpers.
//!
//! Bearer tokens resolve through the OIDC token store; admin requests carry
//! `X-Admin-Token`, compared in constant time so the check leaks no timing
//! signal about prefix matches.

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};
use crate::oidc::AccessToken;

use super::AppState;

/// Extract the bearer token from `Authorization: Bearer <token>`.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    (!token.is_empty()).then(|| token.to_string())
}

/// Resolve the request's bearer token to an access token.
///
/// # Errors
///
/// Returns a generic `unauthorized` for missing, unknown, expired, and
/// revoked tokens alike (no enumeration signal).
pub async fn require_bearer(state: &AppState, headers: &HeaderMap) -> Result<AccessToken> {
    let bearer =
        bearer_token(headers).ok_or_else(|| Error::unauthorized("missing bearer token"))?;
    state
        .flow
        .authenticate(&bearer)
        .await
        .ok_or_else(|| Error::unauthorized("bearer token rejected"))
}

/// Verify the `X-Admin-Token` header in constant time.
///
/// # Errors
///
/// Returns `unauthorized` when admin access is disabled or the token does
/// not match.
pub fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let expected = state
        .admin_token
        .as_deref()
        .ok_or_else(|| Error::unauthorized("admin surface disabled"))?;
    let presented = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::unauthorized("admin token required"))?;

    let matches: bool = presented
        .as_bytes()
        .ct_eq(expected.as_bytes())
        .into();
    if matches {
        Ok(())
    } else {
        Err(Error::unauthorized("admin token rejected"))
    }
}

/// Best-effort client IP: first `X-Forwarded-For` hop, else `unknown`.
#[must_use]
pub fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Correlation id: `X-Request-Id` when present, else a fresh UUID.
#[must_use]
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn bearer_extraction_requires_scheme() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, "Basic dXNlcjpwYXNz".parse().unwrap());
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, "Bearer ".parse().unwrap());
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, "Bearer vgw_abc".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("vgw_abc"));
    }

    #[test]
    fn client_ip_takes_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), "unknown");

        headers.insert("x-forwarded-for", "1.2.3.4, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers), "1.2.3.4");
    }

    #[test]
    fn request_id_falls_back_to_uuid() {
        let mut headers = HeaderMap::new();
        let generated = request_id(&headers);
        assert!(uuid::Uuid::parse_str(&generated).is_ok());

        headers.insert("x-request-id", "req-42".parse().unwrap());
        assert_eq!(request_id(&headers), "req-42");
    }
}
