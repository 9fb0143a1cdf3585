//! Purpose-bound consent.
//!
//! Grants and revocations are compliance-audited fail-closed: the consent row
//! and its audit outbox row commit in the same scope, and an audit failure
//! aborts the whole operation. `require` is the read side every
//! purpose-gated operation calls first.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::audit::{ComplianceAuditor, ComplianceEvent};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::{ConsentRecord, Purpose};
use crate::store::{ConsentStore, StagedWrite, TxScope, TxStore};

/// Consent record lifecycle state, derived at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentStatus {
    /// Not revoked, not expired.
    Active,
    /// Explicitly revoked.
    Revoked,
    /// Past its expiry.
    Expired,
}

impl ConsentStatus {
    /// Classify a record at `now`.
    #[must_use]
    pub fn of(record: &ConsentRecord, now: DateTime<Utc>) -> Self {
        if record.revoked_at.is_some() {
            Self::Revoked
        } else if record.expires_at.is_some_and(|exp| now >= exp) {
            Self::Expired
        } else {
            Self::Active
        }
    }

    /// Parse the wire label.
    ///
    /// # Errors
    ///
    /// Returns `bad_request` for unknown labels.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "revoked" => Ok(Self::Revoked),
            "expired" => Ok(Self::Expired),
            other => Err(Error::bad_request(format!("unknown consent status: {other:?}"))),
        }
    }
}

/// Filter for [`ConsentService::list`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsentFilter {
    /// Keep only records in this state.
    pub status: Option<ConsentStatus>,
    /// Keep only records for this purpose.
    pub purpose: Option<Purpose>,
}

/// The consent service.
pub struct ConsentService {
    consents: Arc<dyn ConsentStore>,
    tx: Arc<dyn TxStore>,
    auditor: Arc<ComplianceAuditor>,
    clock: Arc<dyn Clock>,
}

impl ConsentService {
    /// Create a consent service.
    #[must_use]
    pub fn new(
        consents: Arc<dyn ConsentStore>,
        tx: Arc<dyn TxStore>,
        auditor: Arc<ComplianceAuditor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            consents,
            tx,
            auditor,
            clock,
        }
    }

    /// Grant consent for each purpose, expiring after `ttl` (no expiry when
    /// `None`).
    ///
    /// # Errors
    ///
    /// Fail-closed: a compliance audit failure aborts the grant.
    pub async fn grant(
        &self,
        user_id: Uuid,
        purposes: &[Purpose],
        ttl: Option<Duration>,
        request_id: &str,
    ) -> Result<Vec<ConsentRecord>> {
        if purposes.is_empty() {
            return Err(Error::bad_request("at least one purpose is required"));
        }

        let now = self.clock.now();
        let expires_at = match ttl {
            Some(ttl) => Some(
                now + chrono::Duration::from_std(ttl)
                    .map_err(|e| Error::bad_request("consent ttl out of range").with_source(e))?,
            ),
            None => None,
        };

        let tx = TxScope::new();
        let mut records = Vec::with_capacity(purposes.len());
        for &purpose in purposes {
            let record = ConsentRecord {
                id: Uuid::new_v4(),
                user_id,
                purpose,
                granted_at: now,
                expires_at,
                revoked_at: None,
            };
            tx.stage(StagedWrite::InsertConsent(record.clone()));
            self.auditor.emit(
                &tx,
                ComplianceEvent {
                    user_id,
                    subject: "consent".to_string(),
                    action: "consent_granted".to_string(),
                    purpose: Some(purpose),
                    request_id: request_id.to_string(),
                    actor_id: user_id.to_string(),
                    ..ComplianceEvent::default()
                },
            )?;
            records.push(record);
        }

        self.tx.commit(tx).await?;
        debug!(%user_id, purposes = purposes.len(), "consent granted");
        Ok(records)
    }

    /// Revoke consent for a purpose. Subsequent [`require`](Self::require)
    /// calls fail.
    ///
    /// # Errors
    ///
    /// Returns `not_found` when no active record exists for the purpose.
    /// Fail-closed on audit failure.
    pub async fn revoke(&self, user_id: Uuid, purpose: Purpose, request_id: &str) -> Result<()> {
        let now = self.clock.now();
        let has_active = self
            .consents
            .list_consents(user_id)
            .await
            .iter()
            .any(|r| r.purpose == purpose && r.is_active(now));
        if !has_active {
            return Err(Error::not_found(format!(
                "no active consent for purpose {purpose}"
            )));
        }

        let tx = TxScope::new();
        tx.stage(StagedWrite::RevokeConsent {
            user_id,
            purpose,
            at: now,
        });
        self.auditor.emit(
            &tx,
            ComplianceEvent {
                user_id,
                subject: "consent".to_string(),
                action: "consent_revoked".to_string(),
                purpose: Some(purpose),
                request_id: request_id.to_string(),
                actor_id: user_id.to_string(),
                ..ComplianceEvent::default()
            },
        )?;
        self.tx.commit(tx).await?;
        debug!(%user_id, %purpose, "consent revoked");
        Ok(())
    }

    /// Check that the user has active consent for a purpose at the current
    /// instant.
    ///
    /// # Errors
    ///
    /// Returns `missing_consent` when no purpose-matched record is active.
    pub async fn require(&self, user_id: Uuid, purpose: Purpose) -> Result<()> {
        let now = self.clock.now();
        let ok = self
            .consents
            .list_consents(user_id)
            .await
            .iter()
            .any(|r| r.purpose == purpose && r.is_active(now));
        if ok {
            Ok(())
        } else {
            Err(Error::missing_consent(format!(
                "no active consent for purpose {purpose}"
            )))
        }
    }

    /// List a user's consent records, optionally filtered.
    pub async fn list(&self, user_id: Uuid, filter: ConsentFilter) -> Vec<ConsentRecord> {
        let now = self.clock.now();
        self.consents
            .list_consents(user_id)
            .await
            .into_iter()
            .filter(|r| filter.purpose.map_or(true, |p| r.purpose == p))
            .filter(|r| filter.status.map_or(true, |s| ConsentStatus::of(r, now) == s))
            .collect()
    }

    /// Status label of a record at the current instant.
    #[must_use]
    pub fn status_of(&self, record: &ConsentRecord) -> ConsentStatus {
        ConsentStatus::of(record, self.clock.now())
    }
}
