//! HTTP surface: router, shared state, and server lifecycle.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tokio::sync::broadcast;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::audit::{
    ComplianceAuditor, MaterializedAuditLog, OpsTracker, OutboxJanitor, OutboxWorker,
    SecurityAuditWorker, SecurityAuditor,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::consent::ConsentService;
use crate::error::Result;
use crate::metrics::{Metrics, SharedMetrics};
use crate::oidc::{InMemoryTokenStore, OidcFlow, TokenStore};
use crate::ratelimit::{LockoutGuard, RateLimiter};
use crate::registry::{
    build_registry, CitizenNameRule, EvidenceCache, EvidenceOrchestrator, WeightedAverageRule,
};
use crate::store::{MemoryStore, TxStore};

/// Shared per-request state. Cheap to clone; everything is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// OIDC flow engine.
    pub flow: Arc<OidcFlow>,
    /// Consent service.
    pub consent: Arc<ConsentService>,
    /// Evidence orchestrator.
    pub orchestrator: Arc<EvidenceOrchestrator>,
    /// Sliding-window limiter.
    pub limiter: Arc<RateLimiter>,
    /// Auth lockout guard.
    pub lockout: Arc<LockoutGuard>,
    /// Compliance auditor (decision events).
    pub auditor: Arc<ComplianceAuditor>,
    /// Ops tracker.
    pub ops: Arc<OpsTracker>,
    /// Transaction sink for compliance co-commits.
    pub tx: Arc<dyn TxStore>,
    /// Gateway counters.
    pub metrics: SharedMetrics,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Admin token, when the admin surface is enabled.
    pub admin_token: Option<String>,
}

/// Build the router over the shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/auth/authorize", post(handlers::authorize))
        .route("/auth/token", post(handlers::token))
        .route("/auth/userinfo", get(handlers::userinfo))
        .route(
            "/auth/consent",
            post(handlers::consent_post).get(handlers::consent_list),
        )
        .route("/auth/consent/revoke", post(handlers::consent_revoke))
        .route("/decision/evaluate", post(handlers::evaluate_decision))
        .route("/admin/auth/users/{id}", delete(handlers::delete_user))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The assembled gateway: state plus background workers.
pub struct Gateway {
    state: AppState,
    config: Config,
    token_store: Arc<dyn TokenStore>,
    security_worker: SecurityAuditWorker,
    outbox_worker: OutboxWorker,
    janitor: OutboxJanitor,
}

impl Gateway {
    /// Wire every subsystem from configuration.
    ///
    /// The in-memory store backs all persistence traits; the audit stream
    /// materialises into in-process per-category tables.
    ///
    /// # Errors
    ///
    /// Returns configuration errors from provider construction.
    pub fn new(config: Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let metrics = Metrics::shared();
        let store = Arc::new(MemoryStore::new());
        let token_store: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::new());

        let auditor = Arc::new(ComplianceAuditor::new(Arc::clone(&clock)));
        let security = Arc::new(SecurityAuditor::new(
            &config.audit.security,
            Arc::clone(&clock),
            metrics.clone(),
        ));
        let security_worker = security.worker(store.clone(), &config.audit.security);
        let ops = Arc::new(OpsTracker::new(
            &config.audit.ops,
            store.clone(),
            Arc::clone(&clock),
            metrics.clone(),
        ));

        let stream = Arc::new(MaterializedAuditLog::new());
        let outbox_worker = OutboxWorker::new(
            store.clone(),
            stream,
            Arc::clone(&clock),
            metrics.clone(),
            &config.audit.outbox,
        );
        let janitor = OutboxJanitor::new(store.clone(), Arc::clone(&clock), &config.audit.outbox);

        let registry = Arc::new(build_registry(&config.registry, Arc::clone(&clock))?);
        let cache = EvidenceCache::new(
            store.clone(),
            store.clone(),
            Arc::clone(&clock),
            metrics.clone(),
            config.registry.cache_ttl,
            config.registry.regulated_mode,
        );
        let orchestrator = Arc::new(EvidenceOrchestrator::new(
            registry,
            &config.registry,
            vec![
                Arc::new(CitizenNameRule),
                Arc::new(WeightedAverageRule::default()),
            ],
            cache,
            Arc::clone(&clock),
            metrics.clone(),
        ));

        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.clone(),
            store.clone(),
            Arc::clone(&clock),
            metrics.clone(),
        ));
        let lockout = Arc::new(LockoutGuard::new(
            config.auth_lockout.clone(),
            store.clone(),
            Arc::clone(&limiter),
            Arc::clone(&security),
            Arc::clone(&clock),
            metrics.clone(),
        ));

        let flow = Arc::new(OidcFlow::new(
            config.oidc.clone(),
            store.clone(),
            store.clone(),
            Arc::clone(&token_store),
            store.clone(),
            Arc::clone(&auditor),
            Arc::clone(&security),
            Arc::clone(&ops),
            Arc::clone(&clock),
        ));
        let consent = Arc::new(ConsentService::new(
            store.clone(),
            store.clone(),
            Arc::clone(&auditor),
            Arc::clone(&clock),
        ));

        let state = AppState {
            flow,
            consent,
            orchestrator,
            limiter,
            lockout,
            auditor,
            ops,
            tx: store,
            metrics,
            clock,
            admin_token: config.admin.token.clone(),
        };

        Ok(Self {
            state,
            config,
            token_store,
            security_worker,
            outbox_worker,
            janitor,
        })
    }

    /// The shared state (router construction, tests).
    #[must_use]
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Serve until ctrl-c, then drain background workers.
    ///
    /// # Errors
    ///
    /// Returns `unavailable` when the listener cannot bind.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, _) = broadcast::channel(1);

        crate::oidc::token::spawn_reaper(
            Arc::clone(&self.token_store),
            Arc::clone(&self.state.clock),
            std::time::Duration::from_secs(60),
            shutdown_tx.subscribe(),
        );
        let security_handle = self.security_worker.spawn(shutdown_tx.subscribe());
        let outbox_handle = self.outbox_worker.spawn(shutdown_tx.subscribe());
        let janitor_handle = self.janitor.spawn(shutdown_tx.subscribe());

        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            crate::error::Error::unavailable(format!("cannot bind {addr}")).with_source(e)
        })?;
        info!(%addr, "gateway listening");

        let app = router(self.state);
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received");
            })
            .await
            .map_err(|e| crate::error::Error::internal("server error").with_source(e))?;

        let _ = shutdown_tx.send(());
        let _ = tokio::join!(security_handle, outbox_handle, janitor_handle);
        Ok(())
    }
}
