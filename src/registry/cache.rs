//! Read-through evidence cache.
//!
//! Citizen rows are keyed by `(national_id, regulated)` so a minimised row
//! can never serve a full-record read; sanctions rows by national id alone.
//! Saves are best-effort: a cache write failure is logged and swallowed,
//! never surfaced to the lookup path.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::metrics::{Metrics, SharedMetrics};
use crate::model::{CitizenRecord, SanctionsRecord};
use crate::store::{CitizenCacheStore, SanctionsCacheStore};

/// Two-level evidence cache facade.
pub struct EvidenceCache {
    citizen: Arc<dyn CitizenCacheStore>,
    sanctions: Arc<dyn SanctionsCacheStore>,
    clock: Arc<dyn Clock>,
    metrics: SharedMetrics,
    ttl: Duration,
    regulated: bool,
}

impl EvidenceCache {
    /// Create a cache facade.
    #[must_use]
    pub fn new(
        citizen: Arc<dyn CitizenCacheStore>,
        sanctions: Arc<dyn SanctionsCacheStore>,
        clock: Arc<dyn Clock>,
        metrics: SharedMetrics,
        ttl: Duration,
        regulated: bool,
    ) -> Self {
        Self {
            citizen,
            sanctions,
            clock,
            metrics,
            ttl,
            regulated,
        }
    }

    /// Whether regulated mode is active.
    #[must_use]
    pub fn regulated(&self) -> bool {
        self.regulated
    }

    /// Fresh citizen row for the current regulated mode, if any.
    pub async fn get_citizen(&self, national_id: &str) -> Option<CitizenRecord> {
        let hit = self
            .citizen
            .get_citizen(national_id, self.regulated, self.ttl, self.clock.now())
            .await;
        self.count(hit.is_some());
        hit
    }

    /// Fresh sanctions row, if any.
    pub async fn get_sanctions(&self, national_id: &str) -> Option<SanctionsRecord> {
        let hit = self
            .sanctions
            .get_sanctions(national_id, self.ttl, self.clock.now())
            .await;
        self.count(hit.is_some());
        hit
    }

    /// Store a citizen record, minimising first under regulated mode.
    ///
    /// Best-effort: failures are logged, never propagated, and the write is
    /// never cancelled mid-flight (the caller awaits it outside any
    /// cancellable scope).
    pub async fn save_citizen(&self, record: &CitizenRecord) {
        let to_store = if self.regulated {
            record.minimized()
        } else {
            record.clone()
        };
        if let Err(e) = self.citizen.put_citizen(to_store, self.regulated).await {
            warn!(error = %e, "citizen cache write failed, continuing");
        } else {
            debug!(regulated = self.regulated, "citizen record cached");
        }
    }

    /// Store a sanctions record. Best-effort.
    pub async fn save_sanctions(&self, record: &SanctionsRecord) {
        if let Err(e) = self.sanctions.put_sanctions(record.clone()).await {
            warn!(error = %e, "sanctions cache write failed, continuing");
        }
    }

    fn count(&self, hit: bool) {
        if hit {
            Metrics::incr(&self.metrics.cache_hits);
        } else {
            Metrics::incr(&self.metrics.cache_misses);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn record() -> CitizenRecord {
        CitizenRecord {
            national_id: "S123".into(),
            full_name: "Ada Lovelace".into(),
            date_of_birth: chrono::NaiveDate::from_ymd_opt(1990, 1, 1),
            address: "1 Analytical Way".into(),
            valid: true,
            source: "civreg".into(),
            checked_at: Utc::now(),
        }
    }

    fn cache(regulated: bool) -> (EvidenceCache, Arc<MemoryStore>, ManualClock, SharedMetrics) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let metrics = Metrics::shared();
        let cache = EvidenceCache::new(
            store.clone(),
            store.clone(),
            Arc::new(clock.clone()),
            metrics.clone(),
            Duration::from_secs(300),
            regulated,
        );
        (cache, store, clock, metrics)
    }

    #[tokio::test]
    async fn regulated_mode_minimises_before_write() {
        // GIVEN: a regulated cache and a full PII record
        let (cache, store, _clock, _m) = cache(true);
        let full = record();

        // WHEN: the record is saved
        cache.save_citizen(&full).await;

        // THEN: only the minimised row exists, under the regulated key
        let row = cache.get_citizen("S123").await.unwrap();
        assert!(row.is_minimized());
        assert!(row.valid);

        // The unregulated key holds nothing: a minimised row can never be
        // read back as a full record.
        use crate::store::CitizenCacheStore as _;
        assert!(store
            .get_citizen("S123", false, Duration::from_secs(300), Utc::now())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn unregulated_mode_keeps_pii() {
        let (cache, _store, _clock, _m) = cache(false);
        cache.save_citizen(&record()).await;
        let row = cache.get_citizen("S123").await.unwrap();
        assert_eq!(row.full_name, "Ada Lovelace");
    }

    #[tokio::test]
    async fn expired_rows_are_misses() {
        let (cache, _store, clock, metrics) = cache(false);
        cache.save_citizen(&record()).await;
        assert!(cache.get_citizen("S123").await.is_some());

        clock.advance(chrono::Duration::seconds(301));
        assert!(cache.get_citizen("S123").await.is_none());
        assert_eq!(metrics.snapshot().cache_hits, 1);
        assert_eq!(metrics.snapshot().cache_misses, 1);
    }

    #[tokio::test]
    async fn sanctions_round_trip() {
        let (cache, _store, _clock, _m) = cache(false);
        let record = SanctionsRecord {
            national_id: "S123".into(),
            listed: true,
            source: "sanctions-api".into(),
            checked_at: Utc::now(),
            list_type: Some("global".into()),
            reason: Some("test".into()),
        };
        cache.save_sanctions(&record).await;
        assert_eq!(cache.get_sanctions("S123").await.unwrap(), record);
    }
}
