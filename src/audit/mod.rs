//! Categorised, tamper-evident audit trail.
//!
//! Events come in three shapes with three delivery guarantees:
//!
//! | Category | Publisher | Guarantee |
//! |---|---|---|
//! | compliance | [`ComplianceAuditor`] | synchronous, fail-closed, co-committed |
//! | security | [`SecurityAuditor`] | buffered, bounded memory, drop-oldest |
//! | ops | [`OpsTracker`] | sampled, fire-and-forget, circuit-broken |
//!
//! All three converge on the transactional outbox, drained by
//! [`OutboxWorker`] into a downstream stream and materialised idempotently
//! into per-category tables.

mod outbox;
mod publisher;
mod ring;

pub use outbox::{MaterializedAuditLog, OutboxJanitor, OutboxWorker, StreamPublisher};
pub use publisher::{ComplianceAuditor, OpsTracker, SecurityAuditWorker, SecurityAuditor};
pub use ring::RingBuffer;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::model::Purpose;
use crate::store::OutboxEntry;

/// Audit category. Always derived from the action, never trusted from input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    /// Regulatory trail. Loss is unacceptable.
    Compliance,
    /// Attack-surface telemetry. Bounded loss acceptable.
    Security,
    /// Operational breadcrumbs. Sampled.
    Ops,
}

impl AuditCategory {
    /// Wire label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compliance => "compliance",
            Self::Security => "security",
            Self::Ops => "ops",
        }
    }
}

/// Fixed action -> category table. Unknown actions default to ops.
#[must_use]
pub fn category_for_action(action: &str) -> AuditCategory {
    match action {
        "user_created" | "user_deleted" | "consent_granted" | "consent_revoked"
        | "decision_evaluated" => AuditCategory::Compliance,
        "auth_failure" | "auth_lockout_triggered" | "token_reuse_detected"
        | "rate_limit_exceeded" | "admin_access_denied" | "captcha_required" => {
            AuditCategory::Security
        }
        _ => AuditCategory::Ops,
    }
}

/// SHA-256 hex digest of a subject identifier, so compliance rows never carry
/// the raw national id.
#[must_use]
pub fn hash_subject_id(subject_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(subject_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Security event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Routine observation.
    Info,
    /// Suspicious but not blocking.
    Warning,
    /// Active attack signal.
    Critical,
}

impl Severity {
    /// Wire label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Regulatory audit record, co-committed with the business write.
#[derive(Debug, Clone, Default)]
pub struct ComplianceEvent {
    /// Stamped by the auditor at emit time.
    pub timestamp: Option<DateTime<Utc>>,
    /// Affected user. Required.
    pub user_id: Uuid,
    /// What the event is about (e.g. `"consent"`).
    pub subject: String,
    /// Action from the fixed table. Required.
    pub action: String,
    /// Bound purpose, when applicable.
    pub purpose: Option<Purpose>,
    /// Party on whose behalf the action ran.
    pub requesting_party: String,
    /// Decision outcome, for decision events.
    pub decision: String,
    /// Decision reason, for decision events.
    pub reason: String,
    /// Hash of the subject identifier (never the raw id).
    pub subject_id_hash: String,
    /// User email, for account lifecycle events.
    pub email: String,
    /// Correlation id from the inbound request.
    pub request_id: String,
    /// Acting principal (admin id or `"system"`).
    pub actor_id: String,
}

/// Security telemetry record.
#[derive(Debug, Clone)]
pub struct SecurityEvent {
    /// Stamped at emit time.
    pub timestamp: DateTime<Utc>,
    /// What the event is about.
    pub subject: String,
    /// Action from the fixed table.
    pub action: String,
    /// Why it fired.
    pub reason: String,
    /// Observed client IP.
    pub ip: String,
    /// Correlation id.
    pub request_id: String,
    /// Severity.
    pub severity: Severity,
}

/// Operational breadcrumb.
#[derive(Debug, Clone)]
pub struct OpsEvent {
    /// Stamped at emit time.
    pub timestamp: DateTime<Utc>,
    /// What the event is about.
    pub subject: String,
    /// Action label.
    pub action: String,
    /// Correlation id.
    pub request_id: String,
}

/// Wire payload persisted in the outbox and consumed downstream.
///
/// Field names are a contract with the stream consumer; do not rename.
/// Absent fields serialize as empty strings, `Timestamp` is RFC3339 with
/// nanoseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxPayload {
    /// Event id (also the idempotency key downstream).
    #[serde(rename = "ID")]
    pub id: Uuid,
    /// Derived category label.
    #[serde(rename = "Category")]
    pub category: String,
    /// RFC3339Nano timestamp.
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    /// Affected user id, when known.
    #[serde(rename = "UserID")]
    pub user_id: String,
    /// Event subject.
    #[serde(rename = "Subject")]
    pub subject: String,
    /// Action label.
    #[serde(rename = "Action")]
    pub action: String,
    /// Bound purpose label.
    #[serde(rename = "Purpose")]
    pub purpose: String,
    /// Party on whose behalf the action ran.
    #[serde(rename = "RequestingParty")]
    pub requesting_party: String,
    /// Decision outcome.
    #[serde(rename = "Decision")]
    pub decision: String,
    /// Reason string.
    #[serde(rename = "Reason")]
    pub reason: String,
    /// User email.
    #[serde(rename = "Email")]
    pub email: String,
    /// Correlation id.
    #[serde(rename = "RequestID")]
    pub request_id: String,
    /// Acting principal.
    #[serde(rename = "ActorID")]
    pub actor_id: String,
}

impl OutboxPayload {
    /// Build the payload for a compliance event stamped at `timestamp`.
    #[must_use]
    pub fn from_compliance(event: &ComplianceEvent, id: Uuid, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            category: category_for_action(&event.action).as_str().to_string(),
            timestamp: rfc3339_nanos(timestamp),
            user_id: event.user_id.to_string(),
            subject: event.subject.clone(),
            action: event.action.clone(),
            purpose: event.purpose.map(|p| p.as_str().to_string()).unwrap_or_default(),
            requesting_party: event.requesting_party.clone(),
            decision: event.decision.clone(),
            reason: event.reason.clone(),
            email: event.email.clone(),
            request_id: event.request_id.clone(),
            actor_id: event.actor_id.clone(),
        }
    }

    /// Build the payload for a security event.
    #[must_use]
    pub fn from_security(event: &SecurityEvent, id: Uuid) -> Self {
        Self {
            id,
            category: category_for_action(&event.action).as_str().to_string(),
            timestamp: rfc3339_nanos(event.timestamp),
            user_id: String::new(),
            subject: event.subject.clone(),
            action: event.action.clone(),
            purpose: String::new(),
            requesting_party: String::new(),
            decision: String::new(),
            reason: event.reason.clone(),
            email: String::new(),
            request_id: event.request_id.clone(),
            actor_id: String::new(),
        }
    }

    /// Build the payload for an ops event.
    #[must_use]
    pub fn from_ops(event: &OpsEvent, id: Uuid) -> Self {
        Self {
            id,
            category: category_for_action(&event.action).as_str().to_string(),
            timestamp: rfc3339_nanos(event.timestamp),
            user_id: String::new(),
            subject: event.subject.clone(),
            action: event.action.clone(),
            purpose: String::new(),
            requesting_party: String::new(),
            decision: String::new(),
            reason: String::new(),
            email: String::new(),
            request_id: event.request_id.clone(),
            actor_id: String::new(),
        }
    }

    /// Wrap this payload in an outbox row created at `created_at`.
    #[must_use]
    pub fn into_entry(self, created_at: DateTime<Utc>) -> OutboxEntry {
        let payload = serde_json::to_vec(&self).unwrap_or_default();
        OutboxEntry {
            id: self.id,
            aggregate_type: "audit_event".to_string(),
            aggregate_id: if self.user_id.is_empty() {
                self.subject.clone()
            } else {
                self.user_id.clone()
            },
            event_type: self.action,
            payload,
            created_at,
            processed_at: None,
        }
    }
}

fn rfc3339_nanos(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_table_is_fixed() {
        for action in [
            "user_created",
            "user_deleted",
            "consent_granted",
            "consent_revoked",
            "decision_evaluated",
        ] {
            assert_eq!(category_for_action(action), AuditCategory::Compliance, "{action}");
        }
        for action in ["auth_failure", "auth_lockout_triggered", "token_reuse_detected"] {
            assert_eq!(category_for_action(action), AuditCategory::Security, "{action}");
        }
        // Unknown actions default to ops.
        assert_eq!(category_for_action("cache_warmed"), AuditCategory::Ops);
        assert_eq!(category_for_action(""), AuditCategory::Ops);
    }

    #[test]
    fn payload_field_names_are_the_consumer_contract() {
        let event = ComplianceEvent {
            user_id: Uuid::new_v4(),
            subject: "consent".into(),
            action: "consent_granted".into(),
            purpose: Some(Purpose::Login),
            ..ComplianceEvent::default()
        };
        let payload = OutboxPayload::from_compliance(&event, Uuid::new_v4(), Utc::now());
        let json: serde_json::Value = serde_json::to_value(&payload).unwrap();
        let object = json.as_object().unwrap();

        for field in [
            "ID", "Category", "Timestamp", "UserID", "Subject", "Action", "Purpose",
            "RequestingParty", "Decision", "Reason", "Email", "RequestID", "ActorID",
        ] {
            assert!(object.contains_key(field), "missing field {field}");
        }
        assert_eq!(object.len(), 13, "no extra fields");
        assert_eq!(object["Category"], "compliance");
        assert_eq!(object["Purpose"], "login");
    }

    #[test]
    fn timestamps_are_rfc3339_with_nanos() {
        let event = OpsEvent {
            timestamp: Utc::now(),
            subject: "session".into(),
            action: "token_issued".into(),
            request_id: "req-1".into(),
        };
        let payload = OutboxPayload::from_ops(&event, Uuid::new_v4());
        // Parseable back and nanosecond-precise.
        let parsed = DateTime::parse_from_rfc3339(&payload.timestamp).unwrap();
        assert_eq!(parsed.with_timezone(&Utc), event.timestamp);
        assert!(payload.timestamp.contains('.'), "fractional seconds present");
    }

    #[test]
    fn payload_round_trips_through_entry_bytes() {
        let event = SecurityEvent {
            timestamp: Utc::now(),
            subject: "auth".into(),
            action: "auth_lockout_triggered".into(),
            reason: "failure threshold".into(),
            ip: "1.2.3.4".into(),
            request_id: "req-9".into(),
            severity: Severity::Warning,
        };
        let payload = OutboxPayload::from_security(&event, Uuid::new_v4());
        let entry = payload.clone().into_entry(Utc::now());

        let decoded: OutboxPayload = serde_json::from_slice(&entry.payload).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(entry.event_type, "auth_lockout_triggered");
        assert_eq!(decoded.category, "security");
    }

    #[test]
    fn subject_hash_is_stable_and_hex() {
        let a = hash_subject_id("S123");
        let b = hash_subject_id("S123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, hash_subject_id("S124"));
    }
}
