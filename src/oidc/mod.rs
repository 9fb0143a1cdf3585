//! OIDC authorization-code flow engine.
//!
//! Session lifecycle: `pending -> consented -> exchanged`, with `revoked`
//! reachable from anywhere and terminal. Codes are single-use
//! and consumed atomically; a replayed code fails with `invalid_grant` *and*
//! revokes every access token minted for the session. All token-endpoint
//! failures are wire-indistinguishable to prevent field probing.

pub mod token;

pub use token::{AccessToken, InMemoryTokenStore, TokenStore};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{ComplianceAuditor, ComplianceEvent, OpsTracker, SecurityAuditor, SecurityEvent, Severity};
use crate::clock::Clock;
use crate::config::OidcConfig;
use crate::error::{Error, Result};
use crate::model::{validate_email, Session, SessionStatus, User};
use crate::store::{CodeConsumeError, SessionStore, StagedWrite, TxScope, TxStore, UserStore};

/// Request to `authorize`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeRequest {
    /// End-user email (identity is email-keyed).
    pub email: String,
    /// Requesting client.
    pub client_id: String,
    /// Requested scopes (normalised: trimmed, deduplicated).
    pub scopes: Vec<String>,
    /// Redirect URI bound to the session.
    pub redirect_uri: String,
    /// Opaque CSRF state echoed back.
    pub state: String,
}

/// Response from `authorize`.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeResponse {
    /// Single-use authorization code.
    pub code: String,
    /// Echoed state.
    pub state: String,
    /// Echoed redirect URI.
    pub redirect_uri: String,
    /// Session identifier, used by the consent step.
    pub session_id: Uuid,
}

/// Request to `exchange_token`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenRequest {
    /// The authorization code.
    pub code: String,
    /// Must match the session's redirect URI.
    pub redirect_uri: String,
    /// Must match the session's client.
    pub client_id: String,
}

/// Response from `exchange_token`.
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    /// Opaque bearer access token.
    pub access_token: String,
    /// Signed id token (HS256 JWT).
    pub id_token: String,
    /// Always `Bearer`.
    pub token_type: String,
    /// Access-token lifetime in seconds.
    pub expires_in: u64,
}

/// Response from `userinfo`.
#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    /// Subject: the user id.
    pub sub: String,
    /// Email.
    pub email: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
}

/// Normalise requested scopes: trim, drop empties, dedupe preserving order.
///
/// # Errors
///
/// Returns `bad_request` when no scopes remain or `openid` is absent.
pub fn normalize_scopes(scopes: &[String]) -> Result<Vec<String>> {
    let mut normalized: Vec<String> = Vec::new();
    for scope in scopes {
        let trimmed = scope.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !normalized.iter().any(|s| s == trimmed) {
            normalized.push(trimmed.to_string());
        }
    }
    if normalized.is_empty() {
        return Err(Error::bad_request("no usable scopes requested"));
    }
    if !normalized.iter().any(|s| s == "openid") {
        return Err(Error::bad_request("openid scope is required"));
    }
    Ok(normalized)
}

/// The flow engine.
pub struct OidcFlow {
    users: Arc<dyn UserStore>,
    sessions: Arc<dyn SessionStore>,
    tokens: Arc<dyn TokenStore>,
    tx: Arc<dyn TxStore>,
    auditor: Arc<ComplianceAuditor>,
    security: Arc<SecurityAuditor>,
    ops: Arc<OpsTracker>,
    clock: Arc<dyn Clock>,
    config: OidcConfig,
}

impl OidcFlow {
    /// Create the flow engine.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OidcConfig,
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionStore>,
        tokens: Arc<dyn TokenStore>,
        tx: Arc<dyn TxStore>,
        auditor: Arc<ComplianceAuditor>,
        security: Arc<SecurityAuditor>,
        ops: Arc<OpsTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            users,
            sessions,
            tokens,
            tx,
            auditor,
            security,
            ops,
            clock,
            config,
        }
    }

    fn validate_client(&self, client_id: &str, redirect_uri: &str) -> Result<()> {
        let client = self
            .config
            .clients
            .iter()
            .find(|c| c.client_id == client_id)
            .ok_or_else(|| Error::forbidden(format!("unknown client: {client_id}")))?;
        if !redirect_uri.starts_with("https://") && !redirect_uri.starts_with("http://") {
            return Err(Error::bad_request("redirect_uri must be an absolute URL"));
        }
        if !client.redirect_uris.is_empty()
            && !client.redirect_uris.iter().any(|u| u == redirect_uri)
        {
            return Err(Error::bad_request("redirect_uri not registered for client"));
        }
        Ok(())
    }

    /// Find the user by email or create them, compliance-audited.
    async fn find_or_create_user(&self, email: &str, request_id: &str) -> Result<User> {
        if let Some(user) = self.users.find_user_by_email(email).await {
            return Ok(user);
        }

        let now = self.clock.now();
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            first_name: String::new(),
            last_name: String::new(),
            verified: false,
            created_at: now,
        };

        let tx = TxScope::new();
        tx.stage(StagedWrite::InsertUser(user.clone()));
        self.auditor.emit(
            &tx,
            ComplianceEvent {
                user_id: user.id,
                subject: "user".to_string(),
                action: "user_created".to_string(),
                email: user.email.clone(),
                request_id: request_id.to_string(),
                actor_id: "system".to_string(),
                ..ComplianceEvent::default()
            },
        )?;

        match self.tx.commit(tx).await {
            Ok(()) => {
                info!(user = %user.id, "user created on first authorization");
                Ok(user)
            }
            // Lost a concurrent creation race: the other writer's row wins.
            Err(_) => self
                .users
                .find_user_by_email(email)
                .await
                .ok_or_else(|| Error::internal("user vanished after create conflict")),
        }
    }

    /// Start an authorization-code session.
    ///
    /// # Errors
    ///
    /// `bad_request` on invalid email/scopes/redirect, `forbidden` on unknown
    /// client.
    pub async fn authorize(
        &self,
        request: AuthorizeRequest,
        request_id: &str,
    ) -> Result<AuthorizeResponse> {
        validate_email(&request.email)?;
        let scopes = normalize_scopes(&request.scopes)?;
        self.validate_client(&request.client_id, &request.redirect_uri)?;

        let user = self.find_or_create_user(&request.email, request_id).await?;

        let now = self.clock.now();
        let code_ttl = chrono::Duration::from_std(self.config.code_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let session = Session {
            id: Uuid::new_v4(),
            user_id: user.id,
            client_id: request.client_id,
            requested_scopes: scopes,
            redirect_uri: request.redirect_uri.clone(),
            state: request.state.clone(),
            code: token::generate_code(),
            code_consumed: false,
            expires_at: now + code_ttl,
            status: SessionStatus::Pending,
        };
        let response = AuthorizeResponse {
            code: session.code.clone(),
            state: session.state.clone(),
            redirect_uri: session.redirect_uri.clone(),
            session_id: session.id,
        };
        debug!(session = %session.id, user = %user.id, "authorization session created");
        self.sessions.insert_session(session).await;

        self.ops.emit("session", "authorization_requested", request_id).await;
        Ok(response)
    }

    /// Record the user's consent decision for a session.
    ///
    /// Idempotent for the same decision; a denied session is revoked
    /// (terminal).
    ///
    /// # Errors
    ///
    /// `not_found` for unknown sessions, `conflict` for decisions that would
    /// move an exchanged or revoked session.
    pub async fn record_consent(&self, session_id: Uuid, approved: bool) -> Result<SessionStatus> {
        let session = self
            .sessions
            .get_session(session_id)
            .await
            .ok_or_else(|| Error::not_found("session not found"))?;

        let target = if approved {
            SessionStatus::Consented
        } else {
            SessionStatus::Revoked
        };

        match (session.status, target) {
            // Idempotent repeats of the same decision.
            (SessionStatus::Consented, SessionStatus::Consented)
            | (SessionStatus::Revoked, SessionStatus::Revoked) => Ok(session.status),
            (SessionStatus::Pending, _) | (SessionStatus::Consented, SessionStatus::Revoked) => {
                self.sessions.set_session_status(session_id, target).await?;
                debug!(session = %session_id, status = target.as_str(), "consent recorded");
                Ok(target)
            }
            _ => Err(Error::conflict(format!(
                "session is {}, consent can no longer change",
                session.status.as_str()
            ))),
        }
    }

    /// Exchange a code for tokens. Atomic: concurrent exchanges of one code
    /// observe at most one success.
    ///
    /// # Errors
    ///
    /// Every failure is `invalid_grant`; a detected replay additionally
    /// revokes the session's access tokens.
    pub async fn exchange_token(
        &self,
        request: TokenRequest,
        request_id: &str,
        ip: &str,
    ) -> Result<TokenResponse> {
        let now = self.clock.now();
        let session = match self
            .sessions
            .consume_code(&request.code, &request.redirect_uri, &request.client_id, now)
            .await
        {
            Ok(session) => session,
            Err(CodeConsumeError::Reused { session_id }) => {
                let revoked = self.tokens.revoke_for_session(session_id).await;
                warn!(session = %session_id, revoked, "authorization code replay detected");
                self.security.emit(SecurityEvent {
                    timestamp: now,
                    subject: "session".to_string(),
                    action: "token_reuse_detected".to_string(),
                    reason: format!("code replayed, {revoked} sibling token(s) revoked"),
                    ip: ip.to_string(),
                    request_id: request_id.to_string(),
                    severity: Severity::Critical,
                });
                return Err(Error::invalid_grant("authorization code already consumed"));
            }
            Err(CodeConsumeError::Invalid) => {
                return Err(Error::invalid_grant("authorization code rejected"));
            }
        };

        let user = self
            .users
            .get_user(session.user_id)
            .await
            .ok_or_else(|| Error::invalid_grant("session user no longer exists"))?;

        let token_ttl = chrono::Duration::from_std(self.config.token_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let access = AccessToken {
            token: token::generate_bearer(),
            user_id: user.id,
            session_id: session.id,
            client_id: session.client_id.clone(),
            scopes: session.requested_scopes.clone(),
            issued_at: now,
            expires_at: now + token_ttl,
        };
        let id_token = token::sign_id_token(
            &token::IdTokenClaims {
                iss: self.config.issuer.clone(),
                sub: user.id.to_string(),
                aud: session.client_id.clone(),
                email: user.email.clone(),
                iat: now.timestamp(),
                exp: (now + token_ttl).timestamp(),
            },
            &self.config.signing_secret,
        )?;

        let bearer = access.token.clone();
        self.tokens.insert_token(access).await;
        info!(session = %session.id, user = %user.id, "code exchanged for tokens");
        self.ops.emit("session", "token_issued", request_id).await;

        Ok(TokenResponse {
            access_token: bearer,
            id_token,
            token_type: "Bearer".to_string(),
            expires_in: self.config.token_ttl.as_secs(),
        })
    }

    /// Resolve a bearer token to the authenticated token record.
    pub async fn authenticate(&self, bearer: &str) -> Option<AccessToken> {
        self.tokens.get_token(bearer, self.clock.now()).await
    }

    /// Bearer-token profile lookup.
    ///
    /// # Errors
    ///
    /// `unauthorized` on unknown, expired, or revoked tokens.
    pub async fn userinfo(&self, bearer: &str) -> Result<UserInfo> {
        let token = self
            .authenticate(bearer)
            .await
            .ok_or_else(|| Error::unauthorized("bearer token rejected"))?;
        let user = self
            .users
            .get_user(token.user_id)
            .await
            .ok_or_else(|| Error::unauthorized("bearer token rejected"))?;
        Ok(UserInfo {
            sub: user.id.to_string(),
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
        })
    }

    /// Delete a user and revoke their tokens. Compliance-audited fail-closed.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown users.
    pub async fn delete_user(&self, user_id: Uuid, actor_id: &str, request_id: &str) -> Result<()> {
        let user = self
            .users
            .get_user(user_id)
            .await
            .ok_or_else(|| Error::not_found("user not found"))?;

        let tx = TxScope::new();
        tx.stage(StagedWrite::DeleteUser(user_id));
        self.auditor.emit(
            &tx,
            ComplianceEvent {
                user_id,
                subject: "user".to_string(),
                action: "user_deleted".to_string(),
                email: user.email,
                request_id: request_id.to_string(),
                actor_id: actor_id.to_string(),
                ..ComplianceEvent::default()
            },
        )?;
        self.tx.commit(tx).await?;

        let revoked = self.tokens.revoke_for_user(user_id).await;
        info!(user = %user_id, revoked, "user deleted");
        Ok(())
    }
}
