//! Domain types owned by the gateway.
//!
//! Identifiers are opaque UUIDs. National IDs are validated strings of at
//! most 20 characters. PII lives only in [`CitizenRecord`]; the minimised
//! form strips it while preserving the validity verdict.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static regex"));

static NATIONAL_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9-]{1,20}$").expect("static regex"));

/// Validate an email address shape.
///
/// # Errors
///
/// Returns `bad_request` when the value is not email-shaped.
pub fn validate_email(email: &str) -> Result<()> {
    if EMAIL_RE.is_match(email) {
        Ok(())
    } else {
        Err(Error::bad_request(format!("invalid email: {email:?}")))
    }
}

/// Validate a national identifier (non-empty, <= 20 chars, alphanumeric/dash).
///
/// # Errors
///
/// Returns `bad_request` when the value is out of shape.
pub fn validate_national_id(national_id: &str) -> Result<()> {
    if NATIONAL_ID_RE.is_match(national_id) {
        Ok(())
    } else {
        Err(Error::bad_request("invalid national id"))
    }
}

/// An end user, created on first successful authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Opaque user identifier.
    pub id: Uuid,
    /// Unique email address (first-party trust; identity is email-keyed).
    pub email: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Whether the identity has been verified against a registry.
    pub verified: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of an authorization session.
///
/// `pending -> consented -> exchanged`; any state can move to `revoked`,
/// which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created by `authorize`, awaiting the consent decision.
    Pending,
    /// User approved; the code may be exchanged.
    Consented,
    /// Code consumed; tokens issued.
    Exchanged,
    /// Terminal. Denied consent or administrative revocation.
    Revoked,
}

impl SessionStatus {
    /// Wire label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Consented => "consented",
            Self::Exchanged => "exchanged",
            Self::Revoked => "revoked",
        }
    }
}

/// An authorization-code session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Requesting client.
    pub client_id: String,
    /// Normalised requested scopes.
    pub requested_scopes: Vec<String>,
    /// Redirect URI bound at authorize time.
    pub redirect_uri: String,
    /// Opaque CSRF state echoed back to the client.
    pub state: String,
    /// Single-use authorization code (>= 128-bit entropy).
    pub code: String,
    /// Set exactly once, atomically, on token exchange.
    pub code_consumed: bool,
    /// Code expiry.
    pub expires_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: SessionStatus,
}

/// A labeled processing reason that consent is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    /// Signing in to a relying party.
    Login,
    /// Looking the subject up in external registries.
    RegistryCheck,
    /// Issuing a verifiable credential.
    VcIssuance,
    /// Evaluating a rule-based decision.
    DecisionEvaluation,
    /// Biometric comparison.
    BiometricVerification,
}

impl Purpose {
    /// Wire label (snake_case).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::RegistryCheck => "registry_check",
            Self::VcIssuance => "vc_issuance",
            Self::DecisionEvaluation => "decision_evaluation",
            Self::BiometricVerification => "biometric_verification",
        }
    }

    /// Parse the wire label.
    ///
    /// # Errors
    ///
    /// Returns `bad_request` for unknown labels.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "login" => Ok(Self::Login),
            "registry_check" => Ok(Self::RegistryCheck),
            "vc_issuance" => Ok(Self::VcIssuance),
            "decision_evaluation" => Ok(Self::DecisionEvaluation),
            "biometric_verification" => Ok(Self::BiometricVerification),
            other => Err(Error::bad_request(format!("unknown purpose: {other:?}"))),
        }
    }
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A purpose-bound consent grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRecord {
    /// Record identifier.
    pub id: Uuid,
    /// Granting user.
    pub user_id: Uuid,
    /// Bound purpose.
    pub purpose: Purpose,
    /// Grant timestamp.
    pub granted_at: DateTime<Utc>,
    /// Expiry; `None` means no expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Revocation timestamp, if revoked.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ConsentRecord {
    /// A record is active iff it is not revoked and not expired at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.map_or(true, |exp| now < exp)
    }
}

/// A citizen registry record. PII-bearing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitizenRecord {
    /// National identifier the lookup was keyed by.
    pub national_id: String,
    /// Full legal name.
    pub full_name: String,
    /// Date of birth.
    pub date_of_birth: Option<NaiveDate>,
    /// Registered address.
    pub address: String,
    /// Whether the registry considers the record valid.
    pub valid: bool,
    /// Provider that produced this record.
    pub source: String,
    /// When the registry was consulted.
    pub checked_at: DateTime<Utc>,
}

impl CitizenRecord {
    /// PII-minimised form: empty PII fields, `valid` preserved.
    ///
    /// The transformation is idempotent and cannot be undone; a minimised
    /// record never regains PII.
    #[must_use]
    pub fn minimized(&self) -> Self {
        Self {
            national_id: self.national_id.clone(),
            full_name: String::new(),
            date_of_birth: None,
            address: String::new(),
            valid: self.valid,
            source: self.source.clone(),
            checked_at: self.checked_at,
        }
    }

    /// Whether PII has been stripped.
    #[must_use]
    pub fn is_minimized(&self) -> bool {
        self.full_name.is_empty() && self.date_of_birth.is_none() && self.address.is_empty()
    }
}

/// A sanctions screening record. Non-PII.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanctionsRecord {
    /// National identifier the lookup was keyed by.
    pub national_id: String,
    /// Whether the subject appears on a sanctions list.
    pub listed: bool,
    /// Provider that produced this record.
    pub source: String,
    /// When the list was consulted.
    pub checked_at: DateTime<Utc>,
    /// Which list the subject appears on, when listed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_type: Option<String>,
    /// Listing reason, when disclosed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Auth-lockout state for a composite `identifier + ip` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthLockout {
    /// Composite key `auth:<identifier>:<ip>`.
    pub key: String,
    /// Consecutive failures within the current window.
    pub failure_count: u32,
    /// Failures over the trailing 24 hours.
    pub daily_failures: u32,
    /// Timestamp of the most recent failure.
    pub last_failure_at: DateTime<Utc>,
    /// Hard lock expiry; `Some` means the key is hard-locked.
    pub locked_until: Option<DateTime<Utc>>,
    /// Whether a CAPTCHA is required before further attempts.
    pub requires_captcha: bool,
}

impl AuthLockout {
    /// Fresh state for a key, stamped at `now`.
    #[must_use]
    pub fn new(key: String, now: DateTime<Utc>) -> Self {
        Self {
            key,
            failure_count: 0,
            daily_failures: 0,
            last_failure_at: now,
            locked_until: None,
            requires_captcha: false,
        }
    }

    /// Whether the key is hard-locked at `now`.
    #[must_use]
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}
