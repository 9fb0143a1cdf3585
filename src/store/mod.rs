//! Persistence capability traits.
//!
//! The core never talks to a database driver directly: each aggregate gets a
//! small `async_trait` capability, and operations that must co-commit
//! business rows with compliance outbox entries thread a [`TxScope`] through
//! the call. [`MemoryStore`] implements every trait for tests and single-node
//! deployments; `migrations/` documents the Postgres layout the traits assume.

mod memory;

pub use memory::MemoryStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{AuthLockout, CitizenRecord, ConsentRecord, Purpose, SanctionsRecord, Session, SessionStatus, User};

/// A persistent queue row co-committed with business data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    /// Row identifier.
    pub id: Uuid,
    /// Aggregate type the event belongs to (e.g. `"audit_event"`).
    pub aggregate_type: String,
    /// Aggregate identifier for per-aggregate ordering.
    pub aggregate_id: String,
    /// Event type (the audit action).
    pub event_type: String,
    /// Serialized payload bytes (JSON).
    pub payload: Vec<u8>,
    /// Insertion timestamp; the worker drains in this order.
    pub created_at: DateTime<Utc>,
    /// Set exactly once when the worker has published the row.
    pub processed_at: Option<DateTime<Utc>>,
}

/// A write staged inside a [`TxScope`], applied atomically on commit.
#[derive(Debug, Clone)]
pub enum StagedWrite {
    /// Insert a new user (fails the commit on duplicate email).
    InsertUser(User),
    /// Delete a user and their consent records.
    DeleteUser(Uuid),
    /// Insert a consent record.
    InsertConsent(ConsentRecord),
    /// Stamp `revoked_at` on active records for the purpose.
    RevokeConsent {
        /// Granting user.
        user_id: Uuid,
        /// Purpose to revoke.
        purpose: Purpose,
        /// Revocation instant.
        at: DateTime<Utc>,
    },
    /// Append an outbox row.
    AppendOutbox(OutboxEntry),
}

/// Ambient transaction handle threaded through an operation scope.
///
/// Writes staged here become visible only when the scope is committed via
/// [`TxStore::commit`]. Dropping the scope without committing discards
/// everything, including compliance outbox entries, which is exactly the
/// fail-closed contract: an aborted business operation leaves no audit row.
#[derive(Debug, Default)]
pub struct TxScope {
    writes: Mutex<Vec<StagedWrite>>,
}

impl TxScope {
    /// Create an empty scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a write.
    pub fn stage(&self, write: StagedWrite) {
        self.writes.lock().push(write);
    }

    /// Number of staged writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.lock().len()
    }

    /// Whether nothing has been staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.lock().is_empty()
    }

    /// Consume the scope, yielding the staged writes in order.
    #[must_use]
    pub fn into_writes(self) -> Vec<StagedWrite> {
        self.writes.into_inner()
    }
}

/// Atomic application of a staged scope.
#[async_trait]
pub trait TxStore: Send + Sync + 'static {
    /// Apply every staged write atomically, or none of them.
    ///
    /// # Errors
    ///
    /// Returns `conflict` when a staged insert violates a uniqueness
    /// constraint; no write is applied in that case.
    async fn commit(&self, tx: TxScope) -> Result<()>;
}

/// User persistence.
#[async_trait]
pub trait UserStore: Send + Sync + 'static {
    /// Look a user up by id.
    async fn get_user(&self, id: Uuid) -> Option<User>;

    /// Look a user up by email.
    async fn find_user_by_email(&self, email: &str) -> Option<User>;
}

/// Outcome of a failed code consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeConsumeError {
    /// The code was already consumed. Carries the session so the caller can
    /// revoke sibling tokens. On the wire this is indistinguishable from any
    /// other failure.
    Reused {
        /// Session whose code was replayed.
        session_id: Uuid,
    },
    /// Unknown code, wrong state, expiry, or a field mismatch.
    Invalid,
}

/// Session persistence.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Insert a new session.
    async fn insert_session(&self, session: Session);

    /// Look a session up by id.
    async fn get_session(&self, id: Uuid) -> Option<Session>;

    /// Transition a session's status. Revoked is terminal.
    async fn set_session_status(&self, id: Uuid, status: SessionStatus) -> Result<()>;

    /// Atomically consume an authorization code.
    ///
    /// Verifies, under one lock: the session is `consented`, the code is
    /// unconsumed and unexpired at `now`, and `redirect_uri`/`client_id`
    /// match. On success the session becomes `exchanged` with
    /// `code_consumed = true`. Concurrent calls with the same code observe at
    /// most one success.
    async fn consume_code(
        &self,
        code: &str,
        redirect_uri: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<Session, CodeConsumeError>;
}

/// Consent persistence. Mutations go through [`TxScope`]; reads are direct.
#[async_trait]
pub trait ConsentStore: Send + Sync + 'static {
    /// All consent records for a user, newest first.
    async fn list_consents(&self, user_id: Uuid) -> Vec<ConsentRecord>;
}

/// Auth-lockout persistence with atomic read-modify-write per key.
#[async_trait]
pub trait LockoutStore: Send + Sync + 'static {
    /// Current state for a key.
    async fn get_lockout(&self, key: &str) -> Option<AuthLockout>;

    /// Atomically mutate the state for `key`, creating it from `default`
    /// when absent. The closure runs under the key's lock; the updated state
    /// is persisted before the call returns.
    async fn mutate_lockout(
        &self,
        key: &str,
        default: AuthLockout,
        update: &(dyn for<'r> Fn(&'r mut AuthLockout) + Send + Sync),
    ) -> AuthLockout;

    /// Drop all state for a key (successful login).
    async fn clear_lockout(&self, key: &str);
}

/// Outcome of a sliding-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether the request was admitted (and recorded).
    pub allowed: bool,
    /// Requests observed in the window, including this one when admitted.
    pub count: u32,
    /// When the oldest in-window request leaves the window.
    pub reset_at: DateTime<Utc>,
}

/// Sliding-window counter persistence.
#[async_trait]
pub trait RateWindowStore: Send + Sync + 'static {
    /// Check `key` against `limit` over `window`, recording the hit when
    /// admitted. Atomic per key.
    async fn check_and_record(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> WindowOutcome;
}

/// Transactional outbox persistence.
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    /// Append a row outside any business transaction (security/ops path).
    ///
    /// # Errors
    ///
    /// Returns `unavailable` when the store cannot accept writes.
    async fn append_outbox(&self, entry: OutboxEntry) -> Result<()>;

    /// Claim up to `limit` unprocessed rows in `created_at` order.
    ///
    /// Claimed rows are invisible to concurrent claimers until released or
    /// processed (`FOR UPDATE SKIP LOCKED` semantics).
    async fn claim_batch(&self, limit: usize) -> Vec<OutboxEntry>;

    /// Mark a claimed row processed. Returns `false` if it was already
    /// processed; `processed_at` is only ever set once.
    async fn mark_processed(&self, id: Uuid, at: DateTime<Utc>) -> bool;

    /// Release a claim after a failed publish so the row can be retried.
    async fn release_claim(&self, id: Uuid);

    /// Delete processed rows older than `cutoff`. Returns rows removed.
    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> usize;

    /// Fetch a row by id.
    async fn get_outbox_entry(&self, id: Uuid) -> Option<OutboxEntry>;
}

/// Citizen evidence cache. Rows are keyed by `(national_id, regulated)` so a
/// minimised row can never satisfy a full-record read or vice versa.
#[async_trait]
pub trait CitizenCacheStore: Send + Sync + 'static {
    /// Read-through lookup; entries older than `ttl` behave as a miss.
    async fn get_citizen(
        &self,
        national_id: &str,
        regulated: bool,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Option<CitizenRecord>;

    /// Upsert (last-write-wins).
    ///
    /// # Errors
    ///
    /// Returns `unavailable` when the cache cannot accept writes; callers
    /// treat this as best-effort.
    async fn put_citizen(&self, record: CitizenRecord, regulated: bool) -> Result<()>;
}

/// Sanctions evidence cache, keyed by national id.
#[async_trait]
pub trait SanctionsCacheStore: Send + Sync + 'static {
    /// Read-through lookup; entries older than `ttl` behave as a miss.
    async fn get_sanctions(
        &self,
        national_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Option<SanctionsRecord>;

    /// Upsert (last-write-wins).
    ///
    /// # Errors
    ///
    /// Returns `unavailable` when the cache cannot accept writes.
    async fn put_sanctions(&self, record: SanctionsRecord) -> Result<()>;
}
