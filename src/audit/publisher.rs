//! The three audit publishers.
//!
//! Delivery guarantees differ by category and that difference is the point:
//! compliance must never be lost (fail-closed, co-committed), security must
//! never block the hot path (bounded buffer, drop-oldest), ops must never
//! hurt a healthy system to observe a sick one (sampled, circuit-broken).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{OpsAuditConfig, SecurityAuditConfig};
use crate::error::{Error, Result};
use crate::failsafe::CircuitBreaker;
use crate::metrics::{Metrics, SharedMetrics};
use crate::store::{OutboxStore, StagedWrite, TxScope};

use super::{ComplianceEvent, OutboxPayload, RingBuffer, SecurityEvent};

/// Synchronous, fail-closed compliance publisher.
///
/// `emit` stages the outbox row into the caller's [`TxScope`]; the row
/// becomes durable if and only if the business transaction commits. Any
/// validation failure surfaces to the caller, which must abort its operation.
pub struct ComplianceAuditor {
    clock: Arc<dyn Clock>,
}

impl ComplianceAuditor {
    /// Create a compliance auditor.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Validate, stamp, and stage a compliance event.
    ///
    /// # Errors
    ///
    /// Returns `validation` when `user_id` or `action` is missing. The caller
    /// must treat this as fatal for its business operation.
    pub fn emit(&self, tx: &TxScope, mut event: ComplianceEvent) -> Result<Uuid> {
        if event.user_id.is_nil() {
            return Err(Error::validation("compliance event requires user_id"));
        }
        if event.action.is_empty() {
            return Err(Error::validation("compliance event requires action"));
        }

        let now = self.clock.now();
        event.timestamp = Some(now);

        let id = Uuid::new_v4();
        let payload = OutboxPayload::from_compliance(&event, id, now);
        tx.stage(StagedWrite::AppendOutbox(payload.into_entry(now)));
        Ok(id)
    }
}

/// Buffered, asynchronous security publisher.
///
/// `emit` is constant-time and never blocks: events land in a bounded ring
/// buffer and a background worker batches them into the outbox. Overflow
/// drops the oldest event and increments the drop counter.
pub struct SecurityAuditor {
    buffer: Arc<RingBuffer<SecurityEvent>>,
    clock: Arc<dyn Clock>,
    metrics: SharedMetrics,
}

impl SecurityAuditor {
    /// Create a security auditor with the configured buffer capacity.
    #[must_use]
    pub fn new(config: &SecurityAuditConfig, clock: Arc<dyn Clock>, metrics: SharedMetrics) -> Self {
        Self {
            buffer: Arc::new(RingBuffer::new(config.buffer_capacity)),
            clock,
            metrics,
        }
    }

    /// Enqueue a security event. Never blocks, never fails.
    pub fn emit(&self, mut event: SecurityEvent) {
        event.timestamp = self.clock.now();
        if !self.buffer.push(event) {
            Metrics::incr(&self.metrics.audit_dropped);
        }
    }

    /// Events waiting to be flushed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Build the background worker draining this auditor's buffer.
    #[must_use]
    pub fn worker(
        &self,
        store: Arc<dyn OutboxStore>,
        config: &SecurityAuditConfig,
    ) -> SecurityAuditWorker {
        SecurityAuditWorker {
            buffer: Arc::clone(&self.buffer),
            store,
            clock: Arc::clone(&self.clock),
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
        }
    }
}

/// Background worker writing buffered security events to the outbox.
pub struct SecurityAuditWorker {
    buffer: Arc<RingBuffer<SecurityEvent>>,
    store: Arc<dyn OutboxStore>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    flush_interval: Duration,
}

impl SecurityAuditWorker {
    /// Drain one batch into the outbox. Returns events written.
    ///
    /// Store failures are absorbed: the batch is lost but the caller-facing
    /// path was never involved.
    pub async fn tick(&self) -> usize {
        let batch = self.buffer.drain(self.batch_size);
        let mut written = 0;
        for event in batch {
            let payload = OutboxPayload::from_security(&event, Uuid::new_v4());
            match self.store.append_outbox(payload.into_entry(self.clock.now())).await {
                Ok(()) => written += 1,
                Err(e) => warn!(error = %e, "security audit write failed, event lost"),
            }
        }
        written
    }

    /// Run until the shutdown signal fires, then flush what remains.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.flush_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    _ = shutdown.recv() => {
                        // Final drain so a clean shutdown loses nothing.
                        while self.tick().await > 0 {}
                        debug!("security audit worker shutting down");
                        break;
                    }
                }
            }
        })
    }
}

/// Sampled, fire-and-forget ops publisher.
///
/// Sampling is deterministic per action (every ceil(1/rate)-th event is kept), so
/// behaviour is reproducible. A circuit breaker disables writes while the
/// store is unhealthy.
pub struct OpsTracker {
    store: Arc<dyn OutboxStore>,
    clock: Arc<dyn Clock>,
    metrics: SharedMetrics,
    breaker: CircuitBreaker,
    global_rate: f64,
    action_rates: HashMap<String, f64>,
    counters: DashMap<String, u64>,
}

impl OpsTracker {
    /// Create an ops tracker.
    #[must_use]
    pub fn new(
        config: &OpsAuditConfig,
        store: Arc<dyn OutboxStore>,
        clock: Arc<dyn Clock>,
        metrics: SharedMetrics,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            "audit-ops",
            config.circuit_threshold,
            config.circuit_cooldown,
            Arc::clone(&clock),
        );
        Self {
            store,
            clock,
            metrics,
            breaker,
            global_rate: config.sample_rate,
            action_rates: config.action_sample_rates.clone(),
            counters: DashMap::new(),
        }
    }

    fn sampled_in(&self, action: &str) -> bool {
        let rate = self
            .action_rates
            .get(action)
            .copied()
            .unwrap_or(self.global_rate);
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }

        let mut counter = self.counters.entry(action.to_string()).or_insert(0);
        *counter += 1;
        let period = (1.0 / rate).ceil() as u64;
        (*counter - 1) % period == 0
    }

    /// Record an ops event, maybe. Errors are absorbed.
    pub async fn emit(&self, subject: &str, action: &str, request_id: &str) {
        if !self.sampled_in(action) {
            Metrics::incr(&self.metrics.audit_sampled_out);
            return;
        }
        if !self.breaker.allow() {
            Metrics::incr(&self.metrics.audit_sampled_out);
            return;
        }

        let event = super::OpsEvent {
            timestamp: self.clock.now(),
            subject: subject.to_string(),
            action: action.to_string(),
            request_id: request_id.to_string(),
        };
        let payload = OutboxPayload::from_ops(&event, Uuid::new_v4());
        match self.store.append_outbox(payload.into_entry(event.timestamp)).await {
            Ok(()) => self.breaker.record_success(),
            Err(e) => {
                self.breaker.record_failure();
                if self.breaker.stats().state == crate::failsafe::CircuitState::Open {
                    Metrics::incr(&self.metrics.breaker_trips);
                }
                warn!(error = %e, action, "ops audit write failed");
            }
        }
    }
}
