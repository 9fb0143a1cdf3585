//! In-memory store.
//!
//! Backs every persistence trait with `DashMap`/mutex state. Atomicity
//! guarantees mirror what the SQL deployment gets from row locks: DashMap
//! shard locks serialise per-key mutations, and a single commit lock
//! serialises transaction application.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{AuthLockout, CitizenRecord, ConsentRecord, SanctionsRecord, Session, SessionStatus, User};

use super::{
    CitizenCacheStore, CodeConsumeError, ConsentStore, LockoutStore, OutboxEntry, OutboxStore,
    RateWindowStore, SanctionsCacheStore, SessionStore, StagedWrite, TxScope, TxStore, UserStore,
    WindowOutcome,
};

#[derive(Default)]
struct OutboxState {
    rows: Vec<OutboxEntry>,
    claimed: HashSet<Uuid>,
}

/// In-memory implementation of every store capability.
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<Uuid, User>,
    emails: DashMap<String, Uuid>,
    sessions: DashMap<Uuid, Session>,
    codes: DashMap<String, Uuid>,
    consents: DashMap<Uuid, Vec<ConsentRecord>>,
    lockouts: DashMap<String, AuthLockout>,
    windows: DashMap<String, VecDeque<DateTime<Utc>>>,
    outbox: Mutex<OutboxState>,
    citizen_cache: DashMap<(String, bool), CitizenRecord>,
    sanctions_cache: DashMap<String, SanctionsRecord>,
    commit_lock: Mutex<()>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&self, write: StagedWrite) {
        match write {
            StagedWrite::InsertUser(user) => {
                self.emails.insert(user.email.clone(), user.id);
                self.users.insert(user.id, user);
            }
            StagedWrite::DeleteUser(id) => {
                if let Some((_, user)) = self.users.remove(&id) {
                    self.emails.remove(&user.email);
                }
                self.consents.remove(&id);
                // Orphaned sessions become unusable rather than dangling.
                for mut entry in self.sessions.iter_mut() {
                    if entry.user_id == id {
                        entry.status = SessionStatus::Revoked;
                    }
                }
            }
            StagedWrite::InsertConsent(record) => {
                self.consents.entry(record.user_id).or_default().insert(0, record);
            }
            StagedWrite::RevokeConsent { user_id, purpose, at } => {
                if let Some(mut records) = self.consents.get_mut(&user_id) {
                    for record in records.iter_mut() {
                        if record.purpose == purpose && record.revoked_at.is_none() {
                            record.revoked_at = Some(at);
                        }
                    }
                }
            }
            StagedWrite::AppendOutbox(entry) => {
                self.outbox.lock().rows.push(entry);
            }
        }
    }
}

#[async_trait]
impl TxStore for MemoryStore {
    async fn commit(&self, tx: TxScope) -> Result<()> {
        let writes = tx.into_writes();
        let _guard = self.commit_lock.lock();

        // Validate before applying anything.
        for write in &writes {
            if let StagedWrite::InsertUser(user) = write {
                if self.emails.contains_key(&user.email) {
                    return Err(Error::conflict(format!(
                        "email already registered: {}",
                        user.email
                    )));
                }
            }
        }

        for write in writes {
            self.apply(write);
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get_user(&self, id: Uuid) -> Option<User> {
        self.users.get(&id).map(|u| u.clone())
    }

    async fn find_user_by_email(&self, email: &str) -> Option<User> {
        let id = *self.emails.get(email)?;
        self.users.get(&id).map(|u| u.clone())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: Session) {
        self.codes.insert(session.code.clone(), session.id);
        self.sessions.insert(session.id, session);
    }

    async fn get_session(&self, id: Uuid) -> Option<Session> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    async fn set_session_status(&self, id: Uuid, status: SessionStatus) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("session not found"))?;
        if session.status == SessionStatus::Revoked && status != SessionStatus::Revoked {
            return Err(Error::conflict("session is revoked"));
        }
        session.status = status;
        Ok(())
    }

    async fn consume_code(
        &self,
        code: &str,
        redirect_uri: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<Session, CodeConsumeError> {
        let session_id = match self.codes.get(code) {
            Some(id) => *id,
            None => return Err(CodeConsumeError::Invalid),
        };

        // The shard lock held by `get_mut` makes check-and-set atomic:
        // concurrent exchanges of the same code serialise here and at most
        // one observes an unconsumed code.
        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(CodeConsumeError::Invalid)?;

        if session.code_consumed {
            return Err(CodeConsumeError::Reused { session_id });
        }
        if session.status != SessionStatus::Consented
            || session.expires_at <= now
            || session.redirect_uri != redirect_uri
            || session.client_id != client_id
        {
            return Err(CodeConsumeError::Invalid);
        }

        session.code_consumed = true;
        session.status = SessionStatus::Exchanged;
        Ok(session.clone())
    }
}

#[async_trait]
impl ConsentStore for MemoryStore {
    async fn list_consents(&self, user_id: Uuid) -> Vec<ConsentRecord> {
        self.consents
            .get(&user_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LockoutStore for MemoryStore {
    async fn get_lockout(&self, key: &str) -> Option<AuthLockout> {
        self.lockouts.get(key).map(|l| l.clone())
    }

    async fn mutate_lockout(
        &self,
        key: &str,
        default: AuthLockout,
        update: &(dyn for<'r> Fn(&'r mut AuthLockout) + Send + Sync),
    ) -> AuthLockout {
        let mut entry = self.lockouts.entry(key.to_string()).or_insert(default);
        update(entry.value_mut());
        entry.value().clone()
    }

    async fn clear_lockout(&self, key: &str) {
        self.lockouts.remove(key);
    }
}

#[async_trait]
impl RateWindowStore for MemoryStore {
    async fn check_and_record(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> WindowOutcome {
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut hits = self.windows.entry(key.to_string()).or_default();

        let horizon = now - window;
        while hits.front().is_some_and(|t| *t <= horizon) {
            hits.pop_front();
        }

        let count = u32::try_from(hits.len()).unwrap_or(u32::MAX);
        if count < limit {
            hits.push_back(now);
            let reset_at = hits.front().map_or(now + window, |oldest| *oldest + window);
            WindowOutcome {
                allowed: true,
                count: count + 1,
                reset_at,
            }
        } else {
            let reset_at = hits.front().map_or(now + window, |oldest| *oldest + window);
            WindowOutcome {
                allowed: false,
                count,
                reset_at,
            }
        }
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn append_outbox(&self, entry: OutboxEntry) -> Result<()> {
        self.outbox.lock().rows.push(entry);
        Ok(())
    }

    async fn claim_batch(&self, limit: usize) -> Vec<OutboxEntry> {
        let mut state = self.outbox.lock();
        let mut indices: Vec<usize> = state
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.processed_at.is_none() && !state.claimed.contains(&row.id))
            .map(|(i, _)| i)
            .collect();
        indices.sort_by_key(|&i| state.rows[i].created_at);
        indices.truncate(limit);

        let batch: Vec<OutboxEntry> = indices.iter().map(|&i| state.rows[i].clone()).collect();
        for row in &batch {
            state.claimed.insert(row.id);
        }
        batch
    }

    async fn mark_processed(&self, id: Uuid, at: DateTime<Utc>) -> bool {
        let mut state = self.outbox.lock();
        state.claimed.remove(&id);
        match state.rows.iter_mut().find(|row| row.id == id) {
            Some(row) if row.processed_at.is_none() => {
                row.processed_at = Some(at);
                true
            }
            _ => false,
        }
    }

    async fn release_claim(&self, id: Uuid) {
        self.outbox.lock().claimed.remove(&id);
    }

    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.outbox.lock();
        let before = state.rows.len();
        state
            .rows
            .retain(|row| !row.processed_at.is_some_and(|at| at < cutoff));
        before - state.rows.len()
    }

    async fn get_outbox_entry(&self, id: Uuid) -> Option<OutboxEntry> {
        self.outbox.lock().rows.iter().find(|row| row.id == id).cloned()
    }
}

#[async_trait]
impl CitizenCacheStore for MemoryStore {
    async fn get_citizen(
        &self,
        national_id: &str,
        regulated: bool,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Option<CitizenRecord> {
        let ttl = chrono::Duration::from_std(ttl).ok()?;
        let record = self
            .citizen_cache
            .get(&(national_id.to_string(), regulated))?
            .clone();
        (record.checked_at >= now - ttl).then_some(record)
    }

    async fn put_citizen(&self, record: CitizenRecord, regulated: bool) -> Result<()> {
        self.citizen_cache
            .insert((record.national_id.clone(), regulated), record);
        Ok(())
    }
}

#[async_trait]
impl SanctionsCacheStore for MemoryStore {
    async fn get_sanctions(
        &self,
        national_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Option<SanctionsRecord> {
        let ttl = chrono::Duration::from_std(ttl).ok()?;
        let record = self.sanctions_cache.get(national_id)?.clone();
        (record.checked_at >= now - ttl).then_some(record)
    }

    async fn put_sanctions(&self, record: SanctionsRecord) -> Result<()> {
        self.sanctions_cache
            .insert(record.national_id.clone(), record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Purpose;
    use std::sync::Arc;

    fn make_user(email: &str) -> User {
        User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            first_name: "Test".into(),
            last_name: "User".into(),
            verified: false,
            created_at: Utc::now(),
        }
    }

    fn make_session(user_id: Uuid, code: &str, now: DateTime<Utc>) -> Session {
        Session {
            id: Uuid::new_v4(),
            user_id,
            client_id: "web-app".into(),
            requested_scopes: vec!["openid".into()],
            redirect_uri: "https://app.example.com/cb".into(),
            state: "xyz".into(),
            code: code.to_string(),
            code_consumed: false,
            expires_at: now + chrono::Duration::minutes(10),
            status: SessionStatus::Consented,
        }
    }

    fn make_entry(created_at: DateTime<Utc>) -> OutboxEntry {
        OutboxEntry {
            id: Uuid::new_v4(),
            aggregate_type: "audit_event".into(),
            aggregate_id: "user-1".into(),
            event_type: "consent_granted".into(),
            payload: b"{}".to_vec(),
            created_at,
            processed_at: None,
        }
    }

    #[tokio::test]
    async fn commit_applies_all_writes() {
        let store = MemoryStore::new();
        let user = make_user("alice@example.com");
        let user_id = user.id;

        let tx = TxScope::new();
        tx.stage(StagedWrite::InsertUser(user));
        tx.stage(StagedWrite::InsertConsent(ConsentRecord {
            id: Uuid::new_v4(),
            user_id,
            purpose: Purpose::Login,
            granted_at: Utc::now(),
            expires_at: None,
            revoked_at: None,
        }));
        tx.stage(StagedWrite::AppendOutbox(make_entry(Utc::now())));

        store.commit(tx).await.unwrap();
        assert!(store.get_user(user_id).await.is_some());
        assert_eq!(store.list_consents(user_id).await.len(), 1);
        assert_eq!(store.claim_batch(10).await.len(), 1);
    }

    #[tokio::test]
    async fn commit_conflict_applies_nothing() {
        // GIVEN: a store already holding alice
        let store = MemoryStore::new();
        let tx = TxScope::new();
        tx.stage(StagedWrite::InsertUser(make_user("alice@example.com")));
        store.commit(tx).await.unwrap();

        // WHEN: a scope stages a duplicate insert plus an outbox row
        let tx = TxScope::new();
        tx.stage(StagedWrite::InsertUser(make_user("alice@example.com")));
        tx.stage(StagedWrite::AppendOutbox(make_entry(Utc::now())));
        let result = store.commit(tx).await;

        // THEN: the commit fails and the outbox row is not visible
        assert!(result.is_err());
        assert!(store.claim_batch(10).await.is_empty());
    }

    #[tokio::test]
    async fn dropped_scope_leaves_no_trace() {
        let store = MemoryStore::new();
        {
            let tx = TxScope::new();
            tx.stage(StagedWrite::AppendOutbox(make_entry(Utc::now())));
            // Business operation aborts: the scope is dropped, never committed.
        }
        assert!(store.claim_batch(10).await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_exchanges_observe_one_success() {
        // GIVEN: one consented session
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let session = make_session(Uuid::new_v4(), "code-abc", now);
        store.insert_session(session).await;

        // WHEN: many tasks race to consume the same code
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .consume_code("code-abc", "https://app.example.com/cb", "web-app", now)
                    .await
            }));
        }

        let mut successes = 0;
        let mut reused = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(CodeConsumeError::Reused { .. }) => reused += 1,
                Err(CodeConsumeError::Invalid) => {}
            }
        }

        // THEN: exactly one winner; the rest saw a consumed code
        assert_eq!(successes, 1);
        assert_eq!(reused, 15);
    }

    #[tokio::test]
    async fn consume_code_rejects_mismatches_uniformly() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_session(make_session(Uuid::new_v4(), "code-1", now)).await;

        for (code, uri, client) in [
            ("wrong-code", "https://app.example.com/cb", "web-app"),
            ("code-1", "https://evil.example.com/cb", "web-app"),
            ("code-1", "https://app.example.com/cb", "other-client"),
        ] {
            assert_eq!(
                store.consume_code(code, uri, client, now).await.unwrap_err(),
                CodeConsumeError::Invalid
            );
        }

        // The session is untouched by failed attempts.
        assert!(store
            .consume_code("code-1", "https://app.example.com/cb", "web-app", now)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn consume_code_rejects_expired() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_session(make_session(Uuid::new_v4(), "code-1", now)).await;

        let late = now + chrono::Duration::minutes(11);
        assert_eq!(
            store
                .consume_code("code-1", "https://app.example.com/cb", "web-app", late)
                .await
                .unwrap_err(),
            CodeConsumeError::Invalid
        );
    }

    #[tokio::test]
    async fn revoked_session_is_terminal() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let session = make_session(Uuid::new_v4(), "code-1", now);
        let id = session.id;
        store.insert_session(session).await;

        store.set_session_status(id, SessionStatus::Revoked).await.unwrap();
        assert!(store
            .set_session_status(id, SessionStatus::Consented)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn claim_batch_orders_by_created_at_and_skips_claimed() {
        let store = MemoryStore::new();
        let base = Utc::now();
        let older = make_entry(base - chrono::Duration::seconds(10));
        let newer = make_entry(base);
        let older_id = older.id;
        store.append_outbox(newer).await.unwrap();
        store.append_outbox(older).await.unwrap();

        let first = store.claim_batch(1).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, older_id, "oldest row claimed first");

        // A second claimer skips the locked row.
        let second = store.claim_batch(10).await;
        assert_eq!(second.len(), 1);
        assert_ne!(second[0].id, older_id);
    }

    #[tokio::test]
    async fn mark_processed_is_exactly_once() {
        let store = MemoryStore::new();
        let entry = make_entry(Utc::now());
        let id = entry.id;
        store.append_outbox(entry).await.unwrap();

        assert!(store.mark_processed(id, Utc::now()).await);
        assert!(!store.mark_processed(id, Utc::now()).await);
    }

    #[tokio::test]
    async fn released_claims_become_claimable_again() {
        let store = MemoryStore::new();
        let entry = make_entry(Utc::now());
        let id = entry.id;
        store.append_outbox(entry).await.unwrap();

        assert_eq!(store.claim_batch(1).await.len(), 1);
        assert!(store.claim_batch(1).await.is_empty());

        store.release_claim(id).await;
        assert_eq!(store.claim_batch(1).await.len(), 1);
    }

    #[tokio::test]
    async fn janitor_purges_only_old_processed_rows() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let old_processed = make_entry(now - chrono::Duration::days(10));
        let old_id = old_processed.id;
        let fresh = make_entry(now);
        store.append_outbox(old_processed).await.unwrap();
        store.append_outbox(fresh).await.unwrap();
        store.mark_processed(old_id, now - chrono::Duration::days(9)).await;

        let purged = store
            .purge_processed_before(now - chrono::Duration::days(7))
            .await;
        assert_eq!(purged, 1);
        assert!(store.get_outbox_entry(old_id).await.is_none());
    }

    #[tokio::test]
    async fn sliding_window_prunes_and_denies() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let window = Duration::from_secs(60);

        for i in 0..3 {
            let outcome = store.check_and_record("k", 3, window, now).await;
            assert!(outcome.allowed, "request {i} admitted");
        }
        let denied = store.check_and_record("k", 3, window, now).await;
        assert!(!denied.allowed);
        assert_eq!(denied.count, 3);

        // One window later everything has aged out.
        let later = now + chrono::Duration::seconds(61);
        let outcome = store.check_and_record("k", 3, window, later).await;
        assert!(outcome.allowed);
        assert_eq!(outcome.count, 1);
    }

    #[tokio::test]
    async fn citizen_cache_separates_regulated_rows() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let ttl = Duration::from_secs(300);

        let full = CitizenRecord {
            national_id: "S123".into(),
            full_name: "Ada Lovelace".into(),
            date_of_birth: chrono::NaiveDate::from_ymd_opt(1990, 1, 1),
            address: "1 Analytical Way".into(),
            valid: true,
            source: "civreg".into(),
            checked_at: now,
        };
        store.put_citizen(full.clone(), false).await.unwrap();
        store.put_citizen(full.minimized(), true).await.unwrap();

        let regulated = store.get_citizen("S123", true, ttl, now).await.unwrap();
        assert!(regulated.is_minimized());
        let unregulated = store.get_citizen("S123", false, ttl, now).await.unwrap();
        assert_eq!(unregulated.full_name, "Ada Lovelace");
    }

    #[tokio::test]
    async fn expired_cache_rows_behave_as_misses() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = SanctionsRecord {
            national_id: "S123".into(),
            listed: false,
            source: "sanctions-api".into(),
            checked_at: now,
            list_type: None,
            reason: None,
        };
        store.put_sanctions(record).await.unwrap();

        let ttl = Duration::from_secs(300);
        assert!(store.get_sanctions("S123", ttl, now).await.is_some());
        let later = now + chrono::Duration::seconds(301);
        assert!(store.get_sanctions("S123", ttl, later).await.is_none());
    }
}
