//! Gateway counters.
//!
//! A single injected [`Metrics`] handle is threaded through construction of
//! every subsystem; there is no process-global registry. Counters are atomic
//! and cheap to bump from any task; [`Metrics::snapshot`] produces a
//! serialisable view exposed on `/health`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Shared counter handle.
pub type SharedMetrics = Arc<Metrics>;

/// Atomic gateway counters.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Requests denied by a rate limiter.
    pub rate_limit_denials: AtomicU64,
    /// Hard lockouts triggered.
    pub lockouts_triggered: AtomicU64,
    /// Evidence cache hits.
    pub cache_hits: AtomicU64,
    /// Evidence cache misses.
    pub cache_misses: AtomicU64,
    /// Provider lookups that failed (any error kind).
    pub provider_failures: AtomicU64,
    /// Circuit breakers tripped open.
    pub breaker_trips: AtomicU64,
    /// Security audit events dropped by the ring buffer.
    pub audit_dropped: AtomicU64,
    /// Ops audit events discarded by sampling or an open breaker.
    pub audit_sampled_out: AtomicU64,
    /// Outbox entries published downstream.
    pub outbox_published: AtomicU64,
    /// Outbox publish attempts that failed.
    pub outbox_publish_failures: AtomicU64,
    /// Decisions evaluated.
    pub decisions_evaluated: AtomicU64,
}

impl Metrics {
    /// Create a zeroed counter set behind an `Arc`.
    #[must_use]
    pub fn shared() -> SharedMetrics {
        Arc::new(Self::default())
    }

    /// Increment a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`.
    pub fn incr_by(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time view of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rate_limit_denials: self.rate_limit_denials.load(Ordering::Relaxed),
            lockouts_triggered: self.lockouts_triggered.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            provider_failures: self.provider_failures.load(Ordering::Relaxed),
            breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
            audit_dropped: self.audit_dropped.load(Ordering::Relaxed),
            audit_sampled_out: self.audit_sampled_out.load(Ordering::Relaxed),
            outbox_published: self.outbox_published.load(Ordering::Relaxed),
            outbox_publish_failures: self.outbox_publish_failures.load(Ordering::Relaxed),
            decisions_evaluated: self.decisions_evaluated.load(Ordering::Relaxed),
        }
    }
}

/// Serialisable counter snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Requests denied by a rate limiter.
    pub rate_limit_denials: u64,
    /// Hard lockouts triggered.
    pub lockouts_triggered: u64,
    /// Evidence cache hits.
    pub cache_hits: u64,
    /// Evidence cache misses.
    pub cache_misses: u64,
    /// Provider lookups that failed.
    pub provider_failures: u64,
    /// Circuit breakers tripped open.
    pub breaker_trips: u64,
    /// Security audit events dropped.
    pub audit_dropped: u64,
    /// Ops audit events discarded.
    pub audit_sampled_out: u64,
    /// Outbox entries published.
    pub outbox_published: u64,
    /// Outbox publish failures.
    pub outbox_publish_failures: u64,
    /// Decisions evaluated.
    pub decisions_evaluated: u64,
}
