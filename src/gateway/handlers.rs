//! Endpoint handlers.
//!
//! Wire contract: failures serialize as the stable envelope
//! `{"error": "<code>"}` with the taxonomy's HTTP status; 429 responses
//! carry `Retry-After` and the `RateLimit-*` triplet. Token-endpoint
//! failures are uniformly `invalid_grant`; authentication failures are
//! generic to prevent user enumeration.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use decision_core::{CredentialEvidence, DecisionInput, DecisionKind, IdentityEvidence, SanctionsEvidence};

use crate::audit::{hash_subject_id, ComplianceEvent};
use crate::config::ProviderType;
use crate::consent::{ConsentFilter, ConsentStatus};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::model::Purpose;
use crate::oidc::{AuthorizeRequest, TokenRequest};
use crate::ratelimit::{LimitClass, RateLimitDecision};
use crate::store::TxScope;

use super::auth::{client_ip, require_admin, require_bearer, request_id};
use super::AppState;

fn deny(state: &AppState, decision: &RateLimitDecision) -> Error {
    let now = state.clock.now();
    let mut info = decision.header_info(now);
    if info.retry_after_secs == 0 {
        info.retry_after_secs = 1;
    }
    Error::rate_limited("request rate exceeded").with_rate_limit(info)
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "metrics": state.metrics.snapshot(),
    }))
}

/// `POST /auth/authorize` (public)
pub async fn authorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AuthorizeRequest>,
) -> Result<Json<serde_json::Value>> {
    let ip = client_ip(&headers);
    let rid = request_id(&headers);

    let gate = state.limiter.check_ip(&ip, LimitClass::Auth).await;
    if !gate.allowed {
        return Err(deny(&state, &gate));
    }

    let response = state.flow.authorize(body, &rid).await?;
    Ok(Json(json!({
        "code": response.code,
        "state": response.state,
        "redirect_uri": response.redirect_uri,
        "session_id": response.session_id,
    })))
}

/// Wire body for `POST /auth/token`.
#[derive(Debug, Deserialize)]
pub struct TokenBody {
    /// OAuth grant type; only `authorization_code` is supported.
    #[serde(default)]
    grant_type: Option<String>,
    code: String,
    redirect_uri: String,
    client_id: String,
    /// Identifier used for lockout accounting (falls back to `client_id`).
    #[serde(default)]
    identifier: Option<String>,
}

/// `POST /auth/token` (public)
pub async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TokenBody>,
) -> Result<Json<crate::oidc::TokenResponse>> {
    if body
        .grant_type
        .as_deref()
        .is_some_and(|g| g != "authorization_code")
    {
        return Err(Error::new(
            crate::error::ErrorCode::InvalidRequest,
            "unsupported grant_type",
        ));
    }

    let ip = client_ip(&headers);
    let rid = request_id(&headers);
    let identifier = body.identifier.clone().unwrap_or_else(|| body.client_id.clone());

    let gate = state.lockout.check(&identifier, &ip).await;
    if !gate.allowed {
        return Err(deny(&state, &gate));
    }

    let request = TokenRequest {
        code: body.code,
        redirect_uri: body.redirect_uri,
        client_id: body.client_id,
    };
    match state.flow.exchange_token(request, &rid, &ip).await {
        Ok(response) => {
            state.lockout.clear(&identifier, &ip).await;
            Ok(Json(response))
        }
        Err(err) => {
            state.lockout.record_failure(&identifier, &ip, &rid).await;
            Err(err)
        }
    }
}

/// `GET /auth/userinfo` (bearer)
pub async fn userinfo(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<crate::oidc::UserInfo>> {
    let bearer = super::auth::bearer_token(&headers)
        .ok_or_else(|| Error::unauthorized("missing bearer token"))?;
    let info = state.flow.userinfo(&bearer).await?;
    Ok(Json(info))
}

/// Wire body for `POST /auth/consent`.
#[derive(Debug, Deserialize)]
pub struct ConsentBody {
    /// Session consent decision (authorization flow).
    #[serde(default)]
    session_id: Option<Uuid>,
    /// Approve or deny the session (defaults to approve).
    #[serde(default)]
    approved: Option<bool>,
    /// Purpose grants (bearer flow).
    #[serde(default)]
    purposes: Vec<String>,
    /// Grant TTL in seconds; omitted means no expiry.
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

/// `POST /auth/consent`
///
/// Two shapes share the route: `{session_id, approved}` records the consent
/// decision for a pending authorization session (no token exists yet, the
/// session id is the capability); `{purposes, ttl_seconds}` with a bearer
/// token grants purpose-bound consent.
pub async fn consent_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ConsentBody>,
) -> Result<StatusCode> {
    let rid = request_id(&headers);

    if let Some(session_id) = body.session_id {
        state
            .flow
            .record_consent(session_id, body.approved.unwrap_or(true))
            .await?;
        return Ok(StatusCode::NO_CONTENT);
    }

    if body.purposes.is_empty() {
        return Err(Error::bad_request("session_id or purposes required"));
    }
    let token = require_bearer(&state, &headers).await?;
    let purposes = body
        .purposes
        .iter()
        .map(|p| Purpose::parse(p))
        .collect::<Result<Vec<_>>>()?;
    let ttl = body.ttl_seconds.map(std::time::Duration::from_secs);
    state
        .consent
        .grant(token.user_id, &purposes, ttl, &rid)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Wire body for `POST /auth/consent/revoke`.
#[derive(Debug, Deserialize)]
pub struct ConsentRevokeBody {
    purpose: String,
}

/// `POST /auth/consent/revoke` (bearer)
pub async fn consent_revoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ConsentRevokeBody>,
) -> Result<StatusCode> {
    let rid = request_id(&headers);
    let token = require_bearer(&state, &headers).await?;
    let purpose = Purpose::parse(&body.purpose)?;
    state.consent.revoke(token.user_id, purpose, &rid).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Query parameters for `GET /auth/consent`.
#[derive(Debug, Deserialize)]
pub struct ConsentListQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    purpose: Option<String>,
}

/// One consent record as listed on the wire.
#[derive(Debug, Serialize)]
pub struct ConsentView {
    purpose: &'static str,
    status: &'static str,
    granted_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    revoked_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// `GET /auth/consent?status=&purpose=` (bearer)
pub async fn consent_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ConsentListQuery>,
) -> Result<Json<serde_json::Value>> {
    let token = require_bearer(&state, &headers).await?;

    let filter = ConsentFilter {
        status: query.status.as_deref().map(ConsentStatus::parse).transpose()?,
        purpose: query.purpose.as_deref().map(Purpose::parse).transpose()?,
    };
    let records = state.consent.list(token.user_id, filter).await;
    let consents: Vec<ConsentView> = records
        .iter()
        .map(|record| ConsentView {
            purpose: record.purpose.as_str(),
            status: match state.consent.status_of(record) {
                ConsentStatus::Active => "active",
                ConsentStatus::Revoked => "revoked",
                ConsentStatus::Expired => "expired",
            },
            granted_at: record.granted_at,
            expires_at: record.expires_at,
            revoked_at: record.revoked_at,
        })
        .collect();
    Ok(Json(json!({ "consents": consents })))
}

/// A credential presented with a decision request.
#[derive(Debug, Deserialize)]
pub struct CredentialBody {
    credential_type: String,
}

/// Wire body for `POST /decision/evaluate`.
#[derive(Debug, Deserialize)]
pub struct DecisionBody {
    /// Decision to evaluate (`age_verification`, `sanctions_screening`).
    decision: String,
    national_id: String,
    #[serde(default)]
    credential: Option<CredentialBody>,
}

/// `POST /decision/evaluate` (bearer)
///
/// The canonical gated flow: bearer -> combined user+IP rate check -> consent
/// for `decision_evaluation` -> evidence gathering -> pure evaluation ->
/// fail-closed compliance event -> response.
pub async fn evaluate_decision(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DecisionBody>,
) -> Result<Json<serde_json::Value>> {
    let ip = client_ip(&headers);
    let rid = request_id(&headers);
    let token = require_bearer(&state, &headers).await?;

    let gate = state
        .limiter
        .check_both_limits(&ip, token.user_id, LimitClass::Api)
        .await;
    if !gate.allowed {
        return Err(deny(&state, &gate));
    }

    state
        .consent
        .require(token.user_id, Purpose::DecisionEvaluation)
        .await?;

    let kind = DecisionKind::parse(&body.decision)
        .ok_or_else(|| Error::bad_request(format!("unknown decision: {:?}", body.decision)))?;
    let types: &[ProviderType] = match kind {
        DecisionKind::AgeVerification => &[ProviderType::Citizen, ProviderType::Sanctions],
        DecisionKind::SanctionsScreening => &[ProviderType::Sanctions],
    };

    let bundle = state.orchestrator.gather(&body.national_id, types).await?;
    let input = DecisionInput {
        identity: bundle.citizen().map(|record| IdentityEvidence {
            valid: record.valid,
            date_of_birth: record.date_of_birth,
        }),
        sanctions: bundle.sanctions().map(|record| SanctionsEvidence {
            listed: record.listed,
        }),
        credential: body.credential.map(|c| CredentialEvidence {
            credential_type: c.credential_type,
        }),
    };

    let result = decision_core::evaluate(kind, &input, state.clock.now());
    Metrics::incr(&state.metrics.decisions_evaluated);

    // The decision is only reportable if its audit row commits.
    let tx = TxScope::new();
    state.auditor.emit(
        &tx,
        ComplianceEvent {
            user_id: token.user_id,
            subject: kind.as_str().to_string(),
            action: "decision_evaluated".to_string(),
            purpose: Some(Purpose::DecisionEvaluation),
            requesting_party: token.client_id.clone(),
            decision: result.status.as_str().to_string(),
            reason: result.reason.clone(),
            subject_id_hash: hash_subject_id(&body.national_id),
            request_id: rid,
            actor_id: token.user_id.to_string(),
            ..ComplianceEvent::default()
        },
    )?;
    state.tx.commit(tx).await?;

    Ok(Json(json!({
        "status": result.status.as_str(),
        "reason": result.reason,
        "conditions": result.conditions,
        "evidence": result.evidence,
        "evaluated_at": result.evaluated_at.to_rfc3339(),
    })))
}

/// `DELETE /admin/auth/users/{id}` (header `X-Admin-Token`)
pub async fn delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    let ip = client_ip(&headers);
    let rid = request_id(&headers);

    let gate = state.limiter.check_ip(&ip, LimitClass::Admin).await;
    if !gate.allowed {
        return Err(deny(&state, &gate));
    }

    require_admin(&state, &headers)?;
    state.flow.delete_user(id, "admin", &rid).await?;
    Ok(StatusCode::NO_CONTENT)
}
