//! Transactional outbox delivery guarantees.
//!
//! Scenario: a compliance event emitted inside a business transaction is
//! published downstream exactly once; reruns are no-ops; aborted
//! transactions leave no row for the worker to see.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use verity_gateway::audit::{
    AuditCategory, ComplianceAuditor, ComplianceEvent, MaterializedAuditLog, OutboxJanitor,
    OutboxWorker,
};
use verity_gateway::clock::{Clock, ManualClock};
use verity_gateway::config::OutboxConfig;
use verity_gateway::metrics::Metrics;
use verity_gateway::store::{MemoryStore, OutboxStore, TxScope, TxStore};

struct Pipeline {
    store: Arc<MemoryStore>,
    auditor: ComplianceAuditor,
    worker: OutboxWorker,
    janitor: OutboxJanitor,
    log: Arc<MaterializedAuditLog>,
    clock: ManualClock,
    metrics: verity_gateway::metrics::SharedMetrics,
}

fn pipeline() -> Pipeline {
    let clock = ManualClock::new(Utc::now());
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = Arc::new(MemoryStore::new());
    let log = Arc::new(MaterializedAuditLog::new());
    let metrics = Metrics::shared();
    let config = OutboxConfig::default();

    Pipeline {
        auditor: ComplianceAuditor::new(Arc::clone(&shared)),
        worker: OutboxWorker::new(
            store.clone(),
            log.clone(),
            Arc::clone(&shared),
            metrics.clone(),
            &config,
        ),
        janitor: OutboxJanitor::new(store.clone(), shared, &config),
        store,
        log,
        clock,
        metrics,
    }
}

fn consent_event(user_id: Uuid) -> ComplianceEvent {
    ComplianceEvent {
        user_id,
        subject: "consent".into(),
        action: "consent_granted".into(),
        request_id: "req-outbox".into(),
        actor_id: user_id.to_string(),
        ..ComplianceEvent::default()
    }
}

#[tokio::test]
async fn committed_event_is_published_exactly_once() {
    let p = pipeline();
    let user = Uuid::new_v4();

    // Emit inside a transaction and commit.
    let tx = TxScope::new();
    let event_id = p.auditor.emit(&tx, consent_event(user)).unwrap();
    p.store.commit(tx).await.unwrap();

    // One worker pass publishes exactly one event.
    assert_eq!(p.worker.tick().await, 1);
    assert_eq!(p.log.count(AuditCategory::Compliance), 1);
    assert_eq!(p.metrics.snapshot().outbox_published, 1);

    // The row's processed_at is set once and stays set.
    let row = p.store.get_outbox_entry(event_id).await.unwrap();
    let processed_at = row.processed_at.expect("processed_at set");
    assert!(!p.store.mark_processed(event_id, Utc::now()).await, "second mark refused");
    assert_eq!(
        p.store.get_outbox_entry(event_id).await.unwrap().processed_at,
        Some(processed_at)
    );

    // Rerunning the worker does not republish.
    assert_eq!(p.worker.tick().await, 0);
    assert_eq!(p.log.count(AuditCategory::Compliance), 1);
}

#[tokio::test]
async fn aborted_transaction_is_invisible_to_the_worker() {
    let p = pipeline();
    let user = Uuid::new_v4();

    {
        let tx = TxScope::new();
        p.auditor.emit(&tx, consent_event(user)).unwrap();
        // The business operation fails before commit; the scope drops.
    }

    assert_eq!(p.worker.tick().await, 0);
    assert_eq!(p.log.count(AuditCategory::Compliance), 0);
}

#[tokio::test]
async fn payload_survives_the_pipeline_intact() {
    let p = pipeline();
    let user = Uuid::new_v4();

    let tx = TxScope::new();
    let event_id = p
        .auditor
        .emit(
            &tx,
            ComplianceEvent {
                user_id: user,
                subject: "age_verification".into(),
                action: "decision_evaluated".into(),
                purpose: Some(verity_gateway::model::Purpose::DecisionEvaluation),
                decision: "pass".into(),
                reason: "all_checks_passed".into(),
                subject_id_hash: verity_gateway::audit::hash_subject_id("S123"),
                request_id: "req-1".into(),
                actor_id: user.to_string(),
                ..ComplianceEvent::default()
            },
        )
        .unwrap();
    p.store.commit(tx).await.unwrap();
    p.worker.tick().await;

    let materialized = p.log.get(AuditCategory::Compliance, event_id).unwrap();
    assert_eq!(materialized.category, "compliance");
    assert_eq!(materialized.action, "decision_evaluated");
    assert_eq!(materialized.purpose, "decision_evaluation");
    assert_eq!(materialized.decision, "pass");
    assert_eq!(materialized.user_id, user.to_string());
    // Hashed subject id, never the raw value.
    assert_eq!(materialized.actor_id, user.to_string());
    assert_ne!(materialized.reason, "S123");
    assert_eq!(
        p.log.get(AuditCategory::Security, event_id),
        None,
        "category tables are partitioned"
    );
}

#[tokio::test]
async fn batches_drain_in_created_at_order() {
    let p = pipeline();
    let user = Uuid::new_v4();

    for _ in 0..3 {
        let tx = TxScope::new();
        p.auditor.emit(&tx, consent_event(user)).unwrap();
        p.store.commit(tx).await.unwrap();
        p.clock.advance(chrono::Duration::seconds(1));
    }

    assert_eq!(p.worker.tick().await, 3);
    assert_eq!(p.log.count(AuditCategory::Compliance), 3);
}

#[tokio::test]
async fn janitor_respects_retention() {
    let p = pipeline();
    let user = Uuid::new_v4();

    let tx = TxScope::new();
    p.auditor.emit(&tx, consent_event(user)).unwrap();
    p.store.commit(tx).await.unwrap();
    p.worker.tick().await;

    // Inside retention: nothing purged.
    assert_eq!(p.janitor.tick().await, 0);

    // Past retention: the processed row goes.
    p.clock.advance(chrono::Duration::days(8));
    assert_eq!(p.janitor.tick().await, 1);

    // The materialised copy is unaffected by outbox hygiene.
    assert_eq!(p.log.count(AuditCategory::Compliance), 1);
}

#[tokio::test]
async fn unprocessed_rows_survive_the_janitor() {
    let p = pipeline();
    let user = Uuid::new_v4();

    let tx = TxScope::new();
    p.auditor.emit(&tx, consent_event(user)).unwrap();
    p.store.commit(tx).await.unwrap();

    p.clock.advance(chrono::Duration::days(30));
    assert_eq!(p.janitor.tick().await, 0, "unprocessed rows are never purged");
    assert_eq!(p.worker.tick().await, 1, "still deliverable");
}
