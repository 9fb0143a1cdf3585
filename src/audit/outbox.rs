//! Outbox drain: worker, janitor, and the idempotent stream consumer.
//!
//! Compliance rows are co-committed with business data; the worker is the
//! only component that moves rows downstream and stamps `processed_at`. The
//! janitor bounds table growth. The materialiser is the reference stream
//! consumer: it lands events in per-category tables keyed by event id, so
//! replays are no-ops.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::OutboxConfig;
use crate::error::Result;
use crate::metrics::{Metrics, SharedMetrics};
use crate::store::{OutboxEntry, OutboxStore};

use super::{AuditCategory, OutboxPayload};

/// Downstream event stream.
#[async_trait]
pub trait StreamPublisher: Send + Sync + 'static {
    /// Publish one outbox row downstream.
    ///
    /// # Errors
    ///
    /// Returns an error when the downstream rejects the row; the worker will
    /// release its claim and retry on a later pass.
    async fn publish(&self, entry: &OutboxEntry) -> Result<()>;
}

/// Polls unprocessed outbox rows and publishes them downstream.
pub struct OutboxWorker {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn StreamPublisher>,
    clock: Arc<dyn Clock>,
    metrics: SharedMetrics,
    batch_size: usize,
    poll_interval: Duration,
}

impl OutboxWorker {
    /// Create a worker.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn StreamPublisher>,
        clock: Arc<dyn Clock>,
        metrics: SharedMetrics,
        config: &OutboxConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            metrics,
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
        }
    }

    /// Claim and publish one batch. Returns rows successfully processed.
    pub async fn tick(&self) -> usize {
        let batch = self.store.claim_batch(self.batch_size).await;
        let mut processed = 0;

        for entry in batch {
            match self.publisher.publish(&entry).await {
                Ok(()) => {
                    if self.store.mark_processed(entry.id, self.clock.now()).await {
                        processed += 1;
                        Metrics::incr(&self.metrics.outbox_published);
                    }
                }
                Err(e) => {
                    warn!(entry = %entry.id, error = %e, "outbox publish failed, releasing claim");
                    Metrics::incr(&self.metrics.outbox_publish_failures);
                    self.store.release_claim(entry.id).await;
                }
            }
        }

        processed
    }

    /// Run until the shutdown signal fires.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let n = self.tick().await;
                        if n > 0 {
                            debug!(published = n, "outbox batch drained");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("outbox worker shutting down");
                        break;
                    }
                }
            }
        })
    }
}

/// Deletes processed outbox rows past retention.
pub struct OutboxJanitor {
    store: Arc<dyn OutboxStore>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    sweep_interval: Duration,
}

impl OutboxJanitor {
    /// Create a janitor.
    #[must_use]
    pub fn new(store: Arc<dyn OutboxStore>, clock: Arc<dyn Clock>, config: &OutboxConfig) -> Self {
        Self {
            store,
            clock,
            retention: config.retention,
            sweep_interval: config.janitor_interval,
        }
    }

    /// One retention sweep. Returns rows purged.
    pub async fn tick(&self) -> usize {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        let cutoff = self.clock.now() - retention;
        self.store.purge_processed_before(cutoff).await
    }

    /// Run until the shutdown signal fires.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = self.tick().await;
                        if purged > 0 {
                            debug!(purged, "outbox retention sweep");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

/// Reference stream consumer: materialises events into partitioned
/// per-category tables with insert-if-absent semantics, so re-delivery of the
/// same event id is a no-op.
#[derive(Default)]
pub struct MaterializedAuditLog {
    compliance: DashMap<Uuid, OutboxPayload>,
    security: DashMap<Uuid, OutboxPayload>,
    ops: DashMap<Uuid, OutboxPayload>,
}

impl MaterializedAuditLog {
    /// Create empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one payload idempotently. Returns `true` when the row was new.
    pub fn ingest(&self, payload: OutboxPayload) -> bool {
        let table = match payload.category.as_str() {
            "compliance" => &self.compliance,
            "security" => &self.security,
            _ => &self.ops,
        };
        let mut inserted = false;
        table.entry(payload.id).or_insert_with(|| {
            inserted = true;
            payload
        });
        inserted
    }

    /// Rows in a category table.
    #[must_use]
    pub fn count(&self, category: AuditCategory) -> usize {
        match category {
            AuditCategory::Compliance => self.compliance.len(),
            AuditCategory::Security => self.security.len(),
            AuditCategory::Ops => self.ops.len(),
        }
    }

    /// Fetch a materialised event by id.
    #[must_use]
    pub fn get(&self, category: AuditCategory, id: Uuid) -> Option<OutboxPayload> {
        let table = match category {
            AuditCategory::Compliance => &self.compliance,
            AuditCategory::Security => &self.security,
            AuditCategory::Ops => &self.ops,
        };
        table.get(&id).map(|p| p.clone())
    }

    /// All events in a category whose action matches.
    #[must_use]
    pub fn find_by_action(&self, category: AuditCategory, action: &str) -> Vec<OutboxPayload> {
        let table = match category {
            AuditCategory::Compliance => &self.compliance,
            AuditCategory::Security => &self.security,
            AuditCategory::Ops => &self.ops,
        };
        table
            .iter()
            .filter(|p| p.action == action)
            .map(|p| p.clone())
            .collect()
    }
}

#[async_trait]
impl StreamPublisher for MaterializedAuditLog {
    async fn publish(&self, entry: &OutboxEntry) -> Result<()> {
        match serde_json::from_slice::<OutboxPayload>(&entry.payload) {
            Ok(payload) => {
                self.ingest(payload);
                Ok(())
            }
            Err(e) => {
                // A malformed row would otherwise be retried forever; drop it
                // loudly instead.
                warn!(entry = %entry.id, error = %e, "unparseable outbox payload discarded");
                Ok(())
            }
        }
    }
}
