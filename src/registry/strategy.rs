//! Evidence gathering strategies.
//!
//! The orchestrator resolves each requested evidence type through the cache
//! first, then runs the configured strategy over the registered providers.
//! Every provider call goes through that provider's circuit breaker; an open
//! circuit short-circuits to the next candidate as a retryable outage.
//!
//! Concurrency: the parallel and voting strategies spawn one task per
//! provider. In parallel mode the first provider error cancels the sibling
//! tasks through a shared cancellation token; voting tolerates individual
//! failures and reduces whatever succeeded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{ProviderType, RegistryConfig, StrategyConfig};
use crate::error::{Error, Result};
use crate::failsafe::{CircuitBreaker, CircuitState};
use crate::metrics::{Metrics, SharedMetrics};
use crate::model::validate_national_id;

use super::{
    CorrelationRule, Evidence, EvidenceBundle, EvidenceCache, LookupQuery, ProviderError,
    ProviderErrorKind, ProviderRegistry, RegistryProvider,
};

/// Multi-provider evidence orchestrator.
pub struct EvidenceOrchestrator {
    registry: Arc<ProviderRegistry>,
    strategy: StrategyConfig,
    rules: Vec<Arc<dyn CorrelationRule>>,
    cache: EvidenceCache,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    clock: Arc<dyn Clock>,
    metrics: SharedMetrics,
    breaker_threshold: u32,
    breaker_cooldown: Duration,
    deadline: Duration,
}

impl EvidenceOrchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        config: &RegistryConfig,
        rules: Vec<Arc<dyn CorrelationRule>>,
        cache: EvidenceCache,
        clock: Arc<dyn Clock>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            registry,
            strategy: config.strategy.clone(),
            rules,
            cache,
            breakers: DashMap::new(),
            clock,
            metrics,
            breaker_threshold: config.circuit_threshold,
            breaker_cooldown: config.circuit_cooldown,
            deadline: config.lookup_timeout,
        }
    }

    /// Gather evidence of the requested types for one subject.
    ///
    /// Cache hits bypass providers entirely. Fresh results are cached
    /// best-effort after the join (cache writes are never cancelled
    /// mid-write). Under regulated mode citizen evidence is minimised before
    /// caching and before being returned.
    ///
    /// # Errors
    ///
    /// Returns `bad_request` on malformed national ids, `unavailable` when
    /// the strategy deadline passes, and the mapped provider error when the
    /// strategy fails.
    pub async fn gather(
        &self,
        national_id: &str,
        types: &[ProviderType],
    ) -> Result<EvidenceBundle> {
        validate_national_id(national_id)?;
        let query = LookupQuery {
            national_id: national_id.to_string(),
        };

        let mut items = Vec::new();
        let mut missing = Vec::new();
        for &provider_type in types {
            match self.cached(&query.national_id, provider_type).await {
                Some(evidence) => items.push(evidence),
                None => missing.push(provider_type),
            }
        }

        if !missing.is_empty() {
            let fresh = tokio::time::timeout(self.deadline, self.run_strategy(&query, &missing))
                .await
                .map_err(|_| Error::unavailable("registry lookup deadline exceeded"))??;
            items.extend(fresh);

            // Correlation runs over full-fidelity evidence, before any
            // minimisation.
            if matches!(self.strategy, StrategyConfig::Parallel) {
                items = self.correlate(items);
            }

            self.save_fresh(&items, &missing).await;
        }

        if self.cache.regulated() {
            items = items
                .into_iter()
                .map(|evidence| match evidence.citizen_record() {
                    Some(record) if !record.is_minimized() => {
                        let minimized = record.minimized();
                        let mut e = Evidence::from_citizen(
                            &minimized,
                            &evidence.provider_id,
                            evidence.confidence,
                        );
                        e.metadata = evidence.metadata;
                        e.with_metadata("minimized", "true")
                    }
                    _ => evidence,
                })
                .collect();
        }

        Ok(EvidenceBundle { items })
    }

    async fn cached(&self, national_id: &str, provider_type: ProviderType) -> Option<Evidence> {
        match provider_type {
            ProviderType::Citizen => {
                let record = self.cache.get_citizen(national_id).await?;
                let source = record.source.clone();
                Some(Evidence::from_citizen(&record, &source, 1.0).with_metadata("cache", "hit"))
            }
            ProviderType::Sanctions => {
                let record = self.cache.get_sanctions(national_id).await?;
                let source = record.source.clone();
                Some(Evidence::from_sanctions(&record, &source, 1.0).with_metadata("cache", "hit"))
            }
        }
    }

    async fn save_fresh(&self, items: &[Evidence], fresh_types: &[ProviderType]) {
        for &provider_type in fresh_types {
            let bundle = EvidenceBundle {
                items: items.to_vec(),
            };
            match provider_type {
                ProviderType::Citizen => {
                    if let Some(record) = bundle.citizen() {
                        self.cache.save_citizen(&record).await;
                    }
                }
                ProviderType::Sanctions => {
                    if let Some(record) = bundle.sanctions() {
                        self.cache.save_sanctions(&record).await;
                    }
                }
            }
        }
    }

    fn correlate(&self, items: Vec<Evidence>) -> Vec<Evidence> {
        let types: Vec<ProviderType> = items.iter().map(|e| e.provider_type).collect();
        for rule in &self.rules {
            if !rule.applicable(&types) {
                continue;
            }
            if let Some(merged) = rule.merge(&items) {
                debug!(rule = rule.name(), "correlation rule applied");
                let merged_type = merged.provider_type;
                let mut reduced: Vec<Evidence> = items
                    .into_iter()
                    .filter(|e| e.provider_type != merged_type)
                    .collect();
                reduced.push(merged);
                return reduced;
            }
            // First applicable rule decides, even when it had nothing to
            // merge.
            break;
        }
        items
    }

    fn breaker_for(&self, provider_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    provider_id,
                    self.breaker_threshold,
                    self.breaker_cooldown,
                    Arc::clone(&self.clock),
                ))
            })
            .clone()
    }

    async fn call_provider(
        &self,
        provider: &Arc<dyn RegistryProvider>,
        query: &LookupQuery,
    ) -> std::result::Result<Evidence, ProviderError> {
        let breaker = self.breaker_for(provider.id());
        if !breaker.allow() {
            return Err(ProviderError::outage(provider.id(), "circuit open"));
        }

        match provider.lookup(query).await {
            Ok(evidence) => {
                breaker.record_success();
                Ok(evidence)
            }
            // A not-found answer is a healthy provider telling us the
            // subject is unknown; it must not poison the circuit.
            Err(err) if err.kind == ProviderErrorKind::NotFound => {
                breaker.record_success();
                Err(err)
            }
            Err(err) => {
                Metrics::incr(&self.metrics.provider_failures);
                breaker.record_failure();
                if breaker.stats().state == CircuitState::Open {
                    Metrics::incr(&self.metrics.breaker_trips);
                }
                warn!(provider = provider.id(), error = %err, "provider lookup failed");
                Err(err)
            }
        }
    }

    fn chain_for(&self, provider_type: ProviderType) -> Vec<(usize, Arc<dyn RegistryProvider>)> {
        let registered = self.registry.list_by_type(provider_type);
        match &self.strategy {
            StrategyConfig::Primary { provider } => registered
                .iter()
                .find(|(_, p)| p.id() == provider)
                .cloned()
                .map_or_else(|| registered.into_iter().take(1).collect(), |found| vec![found]),
            StrategyConfig::Fallback { primary, secondary } => {
                let mut chain = Vec::new();
                for wanted in std::iter::once(primary).chain(secondary.iter()) {
                    if let Some(found) = registered.iter().find(|(_, p)| p.id() == wanted) {
                        chain.push(found.clone());
                    }
                }
                if chain.is_empty() {
                    registered
                } else {
                    chain
                }
            }
            StrategyConfig::Parallel | StrategyConfig::Voting => registered,
        }
    }

    async fn run_strategy(
        &self,
        query: &LookupQuery,
        types: &[ProviderType],
    ) -> Result<Vec<Evidence>> {
        match &self.strategy {
            StrategyConfig::Primary { .. } | StrategyConfig::Fallback { .. } => {
                let mut items = Vec::new();
                for &provider_type in types {
                    if let Some(evidence) = self.sequential_lookup(query, provider_type).await? {
                        items.push(evidence);
                    }
                }
                Ok(items)
            }
            StrategyConfig::Parallel => self.parallel_lookup(query, types, true).await,
            StrategyConfig::Voting => {
                let all = self.parallel_lookup(query, types, false).await?;
                Ok(Self::reduce_by_vote(all))
            }
        }
    }

    /// Try the chain in order; retryable errors move to the next candidate,
    /// terminal errors stop the chain.
    async fn sequential_lookup(
        &self,
        query: &LookupQuery,
        provider_type: ProviderType,
    ) -> Result<Option<Evidence>> {
        let chain = self.chain_for(provider_type);
        if chain.is_empty() {
            return Ok(None);
        }

        let mut attempts: Vec<String> = Vec::new();
        for (_, provider) in chain {
            match self.call_provider(&provider, query).await {
                Ok(evidence) => return Ok(Some(evidence)),
                Err(err) if err.is_retryable() => {
                    attempts.push(err.to_string());
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(Error::unavailable(format!(
            "all providers failed for {provider_type}: {}",
            attempts.join("; ")
        )))
    }

    /// One task per provider of each type. With `fail_fast`, the first error
    /// cancels the sibling tasks and fails the gather; otherwise failures are
    /// skipped and the successes returned.
    async fn parallel_lookup(
        &self,
        query: &LookupQuery,
        types: &[ProviderType],
        fail_fast: bool,
    ) -> Result<Vec<Evidence>> {
        let token = CancellationToken::new();
        let mut set: JoinSet<(usize, std::result::Result<Evidence, ProviderError>)> = JoinSet::new();

        for &provider_type in types {
            for (seq, provider) in self.chain_for(provider_type) {
                let breaker = self.breaker_for(provider.id());
                let metrics = self.metrics.clone();
                let query = query.clone();
                let child = token.child_token();
                set.spawn(async move {
                    if !breaker.allow() {
                        return (seq, Err(ProviderError::outage(provider.id(), "circuit open")));
                    }
                    let outcome = tokio::select! {
                        result = provider.lookup(&query) => result,
                        () = child.cancelled() => {
                            Err(ProviderError::new(
                                ProviderErrorKind::Internal,
                                provider.id(),
                                "cancelled by sibling failure",
                            ))
                        }
                    };
                    match &outcome {
                        Ok(_) => breaker.record_success(),
                        Err(err) if err.kind == ProviderErrorKind::NotFound => {
                            breaker.record_success();
                        }
                        Err(_) => {
                            Metrics::incr(&metrics.provider_failures);
                            breaker.record_failure();
                            if breaker.stats().state == CircuitState::Open {
                                Metrics::incr(&metrics.breaker_trips);
                            }
                        }
                    }
                    (seq, outcome)
                });
            }
        }

        let mut collected: Vec<(usize, Evidence)> = Vec::new();
        let mut first_error: Option<ProviderError> = None;

        while let Some(joined) = set.join_next().await {
            let Ok((seq, outcome)) = joined else { continue };
            match outcome {
                Ok(evidence) => collected.push((seq, evidence)),
                Err(err) => {
                    if fail_fast && first_error.is_none() && err.kind != ProviderErrorKind::Internal
                    {
                        // Cancel the siblings; they will come back as
                        // internal/cancelled and be ignored.
                        token.cancel();
                        first_error = Some(err);
                    } else if !fail_fast {
                        debug!(error = %err, "voting strategy skipping failed provider");
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err.into());
        }

        collected.sort_by_key(|(seq, _)| *seq);
        Ok(collected.into_iter().map(|(_, e)| e).collect())
    }

    /// Highest confidence per type wins; ties go to the earliest-registered
    /// provider (the input is already in registration order).
    fn reduce_by_vote(items: Vec<Evidence>) -> Vec<Evidence> {
        let mut winners: HashMap<ProviderType, Evidence> = HashMap::new();
        let mut order: Vec<ProviderType> = Vec::new();
        for item in items {
            match winners.get(&item.provider_type) {
                Some(current) if current.confidence >= item.confidence => {}
                _ => {
                    if !winners.contains_key(&item.provider_type) {
                        order.push(item.provider_type);
                    }
                    winners.insert(item.provider_type, item);
                }
            }
        }
        order
            .into_iter()
            .filter_map(|t| winners.remove(&t))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{CitizenRecord, SanctionsRecord};
    use crate::registry::{CitizenNameRule, ProviderCapabilities, ProviderHealth};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    enum Behavior {
        Citizen { name: String, confidence: f64 },
        Sanctions { listed: bool, confidence: f64 },
        Fail(ProviderErrorKind),
        Hang,
    }

    struct MockProvider {
        id: String,
        provider_type: ProviderType,
        behavior: Behavior,
        calls: AtomicU32,
    }

    impl MockProvider {
        fn citizen(id: &str, name: &str, confidence: f64) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                provider_type: ProviderType::Citizen,
                behavior: Behavior::Citizen {
                    name: name.into(),
                    confidence,
                },
                calls: AtomicU32::new(0),
            })
        }

        fn sanctions(id: &str, listed: bool, confidence: f64) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                provider_type: ProviderType::Sanctions,
                behavior: Behavior::Sanctions { listed, confidence },
                calls: AtomicU32::new(0),
            })
        }

        fn failing(id: &str, provider_type: ProviderType, kind: ProviderErrorKind) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                provider_type,
                behavior: Behavior::Fail(kind),
                calls: AtomicU32::new(0),
            })
        }

        fn hanging(id: &str, provider_type: ProviderType) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                provider_type,
                behavior: Behavior::Hang,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RegistryProvider for MockProvider {
        fn id(&self) -> &str {
            &self.id
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities {
                protocol: "mock".into(),
                provider_type: self.provider_type,
                version: "1".into(),
                fields: vec![],
                filters: vec!["national_id".into()],
            }
        }

        async fn lookup(&self, query: &LookupQuery) -> std::result::Result<Evidence, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Citizen { name, confidence } => {
                    let record = CitizenRecord {
                        national_id: query.national_id.clone(),
                        full_name: name.clone(),
                        date_of_birth: chrono::NaiveDate::from_ymd_opt(1990, 1, 1),
                        address: "somewhere".into(),
                        valid: true,
                        source: self.id.clone(),
                        checked_at: Utc::now(),
                    };
                    Ok(Evidence::from_citizen(&record, &self.id, *confidence))
                }
                Behavior::Sanctions { listed, confidence } => {
                    let record = SanctionsRecord {
                        national_id: query.national_id.clone(),
                        listed: *listed,
                        source: self.id.clone(),
                        checked_at: Utc::now(),
                        list_type: None,
                        reason: None,
                    };
                    Ok(Evidence::from_sanctions(&record, &self.id, *confidence))
                }
                Behavior::Fail(kind) => Err(ProviderError::new(*kind, &self.id, "mock failure")),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(ProviderError::timeout(&self.id, "unreachable"))
                }
            }
        }

        async fn health(&self) -> ProviderHealth {
            ProviderHealth::Healthy
        }
    }

    struct Fixture {
        orchestrator: EvidenceOrchestrator,
        clock: ManualClock,
    }

    fn fixture(
        providers: Vec<Arc<MockProvider>>,
        strategy: StrategyConfig,
        regulated: bool,
    ) -> Fixture {
        let clock = ManualClock::new(Utc::now());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let mut registry = ProviderRegistry::new();
        for provider in providers {
            registry.register(provider).unwrap();
        }
        let store = Arc::new(crate::store::MemoryStore::new());
        let metrics = Metrics::shared();
        let config = RegistryConfig {
            strategy,
            regulated_mode: regulated,
            ..RegistryConfig::default()
        };
        let cache = EvidenceCache::new(
            store.clone(),
            store,
            Arc::clone(&shared_clock),
            metrics.clone(),
            config.cache_ttl,
            regulated,
        );
        let orchestrator = EvidenceOrchestrator::new(
            Arc::new(registry),
            &config,
            vec![Arc::new(CitizenNameRule)],
            cache,
            shared_clock,
            metrics,
        );
        Fixture { orchestrator, clock }
    }

    const BOTH: &[ProviderType] = &[ProviderType::Citizen, ProviderType::Sanctions];

    #[tokio::test]
    async fn parallel_gathers_all_types() {
        let f = fixture(
            vec![
                MockProvider::citizen("civreg", "Ada Lovelace", 0.9),
                MockProvider::sanctions("sanctions-api", true, 1.0),
            ],
            StrategyConfig::Parallel,
            false,
        );

        let bundle = f.orchestrator.gather("S123", BOTH).await.unwrap();
        assert_eq!(bundle.citizen().unwrap().full_name, "Ada Lovelace");
        assert!(bundle.sanctions().unwrap().listed);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_first_error_cancels_siblings() {
        // GIVEN: a failing sanctions provider and a citizen provider that
        // would hang for an hour
        let hanging = MockProvider::hanging("civreg", ProviderType::Citizen);
        let f = fixture(
            vec![
                hanging.clone(),
                MockProvider::failing("sanctions-api", ProviderType::Sanctions, ProviderErrorKind::ProviderOutage),
            ],
            StrategyConfig::Parallel,
            false,
        );

        // WHEN: gathering (virtual time; a non-cancelled hang would trip the
        // 5s deadline path instead of the provider error path)
        let err = f.orchestrator.gather("S123", BOTH).await.unwrap_err();

        // THEN: the provider failure surfaced, not the deadline
        assert_eq!(err.code(), crate::error::ErrorCode::Unavailable);
        assert!(err.message().contains("sanctions-api"));
    }

    #[tokio::test]
    async fn fallback_tries_secondaries_on_retryable_errors() {
        let primary = MockProvider::failing("civreg", ProviderType::Citizen, ProviderErrorKind::Timeout);
        let secondary = MockProvider::citizen("civreg-dr", "Ada Lovelace", 0.8);
        let f = fixture(
            vec![primary.clone(), secondary.clone()],
            StrategyConfig::Fallback {
                primary: "civreg".into(),
                secondary: vec!["civreg-dr".into()],
            },
            false,
        );

        let bundle = f
            .orchestrator
            .gather("S123", &[ProviderType::Citizen])
            .await
            .unwrap();
        assert_eq!(bundle.best(ProviderType::Citizen).unwrap().provider_id, "civreg-dr");
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
    }

    #[tokio::test]
    async fn fallback_stops_on_terminal_errors() {
        let primary = MockProvider::failing("civreg", ProviderType::Citizen, ProviderErrorKind::BadData);
        let secondary = MockProvider::citizen("civreg-dr", "Ada", 0.8);
        let f = fixture(
            vec![primary, secondary.clone()],
            StrategyConfig::Fallback {
                primary: "civreg".into(),
                secondary: vec!["civreg-dr".into()],
            },
            false,
        );

        assert!(f
            .orchestrator
            .gather("S123", &[ProviderType::Citizen])
            .await
            .is_err());
        assert_eq!(secondary.calls(), 0, "terminal error must not fall through");
    }

    #[tokio::test]
    async fn fallback_accumulates_when_all_fail() {
        let f = fixture(
            vec![
                MockProvider::failing("a", ProviderType::Citizen, ProviderErrorKind::Timeout),
                MockProvider::failing("b", ProviderType::Citizen, ProviderErrorKind::ProviderOutage),
            ],
            StrategyConfig::Fallback {
                primary: "a".into(),
                secondary: vec!["b".into()],
            },
            false,
        );

        let err = f
            .orchestrator
            .gather("S123", &[ProviderType::Citizen])
            .await
            .unwrap_err();
        assert!(err.message().contains("a"));
        assert!(err.message().contains("b"));
    }

    #[tokio::test]
    async fn voting_picks_highest_confidence_per_type() {
        let f = fixture(
            vec![
                MockProvider::citizen("weak", "Ada K.", 0.5),
                MockProvider::citizen("strong", "Ada Lovelace", 0.9),
                MockProvider::sanctions("sanctions-api", false, 1.0),
            ],
            StrategyConfig::Voting,
            false,
        );

        let bundle = f.orchestrator.gather("S123", BOTH).await.unwrap();
        let citizens: Vec<&Evidence> = bundle
            .items
            .iter()
            .filter(|e| e.provider_type == ProviderType::Citizen)
            .collect();
        assert_eq!(citizens.len(), 1, "one winner per type");
        assert_eq!(citizens[0].provider_id, "strong");
    }

    #[tokio::test]
    async fn voting_ties_break_by_registration_order() {
        let f = fixture(
            vec![
                MockProvider::citizen("first", "Ada", 0.7),
                MockProvider::citizen("second", "Ada", 0.7),
            ],
            StrategyConfig::Voting,
            false,
        );

        let bundle = f
            .orchestrator
            .gather("S123", &[ProviderType::Citizen])
            .await
            .unwrap();
        assert_eq!(bundle.items[0].provider_id, "first");
    }

    #[tokio::test]
    async fn voting_tolerates_individual_failures() {
        let f = fixture(
            vec![
                MockProvider::failing("down", ProviderType::Citizen, ProviderErrorKind::ProviderOutage),
                MockProvider::citizen("up", "Ada", 0.8),
            ],
            StrategyConfig::Voting,
            false,
        );

        let bundle = f
            .orchestrator
            .gather("S123", &[ProviderType::Citizen])
            .await
            .unwrap();
        assert_eq!(bundle.items[0].provider_id, "up");
    }

    #[tokio::test]
    async fn parallel_applies_first_applicable_correlation_rule() {
        let f = fixture(
            vec![
                MockProvider::citizen("a", "Ada Lovelace", 0.9),
                MockProvider::citizen("b", "Ada King", 0.7),
            ],
            StrategyConfig::Parallel,
            false,
        );

        let bundle = f
            .orchestrator
            .gather("S123", &[ProviderType::Citizen])
            .await
            .unwrap();
        assert_eq!(bundle.items.len(), 1, "citizen evidence merged");
        assert_eq!(bundle.items[0].metadata["correlation_rule"], "citizen_name");
        assert_eq!(bundle.citizen().unwrap().full_name, "Ada Lovelace");
    }

    #[tokio::test]
    async fn second_gather_is_served_from_cache() {
        let provider = MockProvider::citizen("civreg", "Ada", 0.9);
        let f = fixture(vec![provider.clone()], StrategyConfig::Parallel, false);

        f.orchestrator.gather("S123", &[ProviderType::Citizen]).await.unwrap();
        let bundle = f
            .orchestrator
            .gather("S123", &[ProviderType::Citizen])
            .await
            .unwrap();

        assert_eq!(provider.calls(), 1, "second gather never reached the provider");
        assert_eq!(bundle.items[0].metadata.get("cache").map(String::as_str), Some("hit"));
    }

    #[tokio::test]
    async fn cache_expiry_reaches_provider_again() {
        let provider = MockProvider::citizen("civreg", "Ada", 0.9);
        let f = fixture(vec![provider.clone()], StrategyConfig::Parallel, false);

        f.orchestrator.gather("S123", &[ProviderType::Citizen]).await.unwrap();
        f.clock.advance(chrono::Duration::seconds(301));
        f.orchestrator.gather("S123", &[ProviderType::Citizen]).await.unwrap();
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn regulated_mode_returns_minimised_evidence() {
        let f = fixture(
            vec![MockProvider::citizen("civreg", "Ada Lovelace", 0.9)],
            StrategyConfig::Parallel,
            true,
        );

        let bundle = f
            .orchestrator
            .gather("S123", &[ProviderType::Citizen])
            .await
            .unwrap();
        let record = bundle.citizen().unwrap();
        assert!(record.is_minimized());
        assert!(record.valid, "validity survives minimisation");

        // The cached row is minimised too and stays minimised on re-read.
        let again = f
            .orchestrator
            .gather("S123", &[ProviderType::Citizen])
            .await
            .unwrap();
        assert!(again.citizen().unwrap().is_minimized());
    }

    #[tokio::test]
    async fn breaker_short_circuits_after_threshold() {
        let failing = MockProvider::failing("civreg", ProviderType::Citizen, ProviderErrorKind::ProviderOutage);
        let f = fixture(vec![failing.clone()], StrategyConfig::Primary {
            provider: "civreg".into(),
        }, false);

        // Five failures open the circuit (default threshold).
        for _ in 0..5 {
            let _ = f.orchestrator.gather("S123", &[ProviderType::Citizen]).await;
        }
        assert_eq!(failing.calls(), 5);

        // Further gathers short-circuit without touching the provider.
        let _ = f.orchestrator.gather("S123", &[ProviderType::Citizen]).await;
        assert_eq!(failing.calls(), 5);

        // After the cooldown a probe goes through again.
        f.clock.advance(chrono::Duration::seconds(60));
        let _ = f.orchestrator.gather("S123", &[ProviderType::Citizen]).await;
        assert_eq!(failing.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_the_whole_gather() {
        let f = fixture(
            vec![MockProvider::hanging("civreg", ProviderType::Citizen)],
            StrategyConfig::Primary {
                provider: "civreg".into(),
            },
            false,
        );

        let err = f
            .orchestrator
            .gather("S123", &[ProviderType::Citizen])
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Unavailable);
        assert!(err.message().contains("deadline"));
    }

    #[tokio::test]
    async fn malformed_national_id_is_rejected_before_any_lookup() {
        let provider = MockProvider::citizen("civreg", "Ada", 0.9);
        let f = fixture(vec![provider.clone()], StrategyConfig::Parallel, false);

        let err = f
            .orchestrator
            .gather("has space", &[ProviderType::Citizen])
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::BadRequest);
        assert_eq!(provider.calls(), 0);
    }
}
