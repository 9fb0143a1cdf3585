//! Access tokens and id-token signing.
//!
//! Access tokens are opaque bearer values (`vgw_<base64url>`, 256 bits of
//! entropy) indexed by value for O(1) validation and by session for O(1)
//! sibling revocation. The `vgw_` prefix keeps tokens greppable and
//! detectable by secret scanners. A background reaper evicts expired tokens.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Error, Result};

/// An issued bearer token.
#[derive(Debug, Clone)]
pub struct AccessToken {
    /// Opaque bearer value.
    pub token: String,
    /// Token owner.
    pub user_id: Uuid,
    /// Originating session.
    pub session_id: Uuid,
    /// Client the token was minted for.
    pub client_id: String,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Issuance instant.
    pub issued_at: DateTime<Utc>,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Whether the token has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Token persistence.
#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    /// Store a newly minted token.
    async fn insert_token(&self, token: AccessToken);

    /// Look a token up by bearer value. Expired and revoked tokens are
    /// `None`.
    async fn get_token(&self, bearer: &str, now: DateTime<Utc>) -> Option<AccessToken>;

    /// Revoke every token minted for a session. Returns tokens removed.
    async fn revoke_for_session(&self, session_id: Uuid) -> usize;

    /// Revoke every token belonging to a user. Returns tokens removed.
    async fn revoke_for_user(&self, user_id: Uuid) -> usize;

    /// Drop expired tokens. Returns tokens removed.
    async fn reap_expired(&self, now: DateTime<Utc>) -> usize;
}

/// In-memory token store on two `DashMap` indices.
#[derive(Default)]
pub struct InMemoryTokenStore {
    by_bearer: DashMap<String, AccessToken>,
    by_session: DashMap<Uuid, Vec<String>>,
}

impl InMemoryTokenStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Generate an opaque bearer token: `vgw_` + 32 random bytes, base64url.
#[must_use]
pub fn generate_bearer() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "vgw_{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    )
}

/// Generate a single-use authorization code: 32 random bytes, base64url
/// (>= 128 bits of entropy as required, with margin).
#[must_use]
pub fn generate_code() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn insert_token(&self, token: AccessToken) {
        self.by_session
            .entry(token.session_id)
            .or_default()
            .push(token.token.clone());
        self.by_bearer.insert(token.token.clone(), token);
    }

    async fn get_token(&self, bearer: &str, now: DateTime<Utc>) -> Option<AccessToken> {
        let token = self.by_bearer.get(bearer)?.clone();
        if token.is_expired(now) {
            // Lazy eviction on access.
            self.by_bearer.remove(bearer);
            debug!(session = %token.session_id, "lazy-evicted expired access token");
            return None;
        }
        Some(token)
    }

    async fn revoke_for_session(&self, session_id: Uuid) -> usize {
        let Some((_, bearers)) = self.by_session.remove(&session_id) else {
            return 0;
        };
        let mut removed = 0;
        for bearer in bearers {
            if self.by_bearer.remove(&bearer).is_some() {
                removed += 1;
            }
        }
        removed
    }

    async fn revoke_for_user(&self, user_id: Uuid) -> usize {
        let bearers: Vec<String> = self
            .by_bearer
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.key().clone())
            .collect();
        let mut removed = 0;
        for bearer in bearers {
            if let Some((_, token)) = self.by_bearer.remove(&bearer) {
                if let Some(mut session_tokens) = self.by_session.get_mut(&token.session_id) {
                    session_tokens.retain(|b| b != &bearer);
                }
                removed += 1;
            }
        }
        removed
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<(String, Uuid)> = self
            .by_bearer
            .iter()
            .filter(|e| e.is_expired(now))
            .map(|e| (e.key().clone(), e.session_id))
            .collect();
        let count = expired.len();
        for (bearer, session_id) in expired {
            self.by_bearer.remove(&bearer);
            if let Some(mut session_tokens) = self.by_session.get_mut(&session_id) {
                session_tokens.retain(|b| b != &bearer);
            }
        }
        count
    }
}

/// Spawn a background task reaping expired tokens every `interval`.
pub fn spawn_reaper(
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired(clock.now()).await;
                    if reaped > 0 {
                        debug!(count = reaped, "reaped expired access tokens");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("token reaper shutting down");
                    break;
                }
            }
        }
    });
}

/// Claims carried by the signed id token.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdTokenClaims {
    /// Issuer URL.
    pub iss: String,
    /// Subject: the user id.
    pub sub: String,
    /// Audience: the client id.
    pub aud: String,
    /// User email.
    pub email: String,
    /// Issued-at (Unix seconds).
    pub iat: i64,
    /// Expiry (Unix seconds).
    pub exp: i64,
}

/// Sign an id token with HS256.
///
/// # Errors
///
/// Returns `internal` when encoding fails.
pub fn sign_id_token(claims: &IdTokenClaims, secret: &str) -> Result<String> {
    jsonwebtoken::encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| Error::internal("id token signing failed").with_source(e))
}

/// Decode and verify an id token. Used by tests and token introspection.
///
/// # Errors
///
/// Returns `unauthorized` on signature or expiry failure.
pub fn verify_id_token(token: &str, secret: &str, audience: &str) -> Result<IdTokenClaims> {
    let mut validation = Validation::default();
    validation.set_audience(&[audience]);
    jsonwebtoken::decode::<IdTokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| Error::unauthorized("id token rejected").with_source(e))
}
