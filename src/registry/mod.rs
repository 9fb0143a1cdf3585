//! Evidence orchestration over external registries.
//!
//! A [`RegistryProvider`] turns a national-id lookup into a provider-agnostic
//! [`Evidence`] envelope. Providers register into a [`ProviderRegistry`]
//! (registration order is meaningful: it breaks confidence ties), and the
//! [`EvidenceOrchestrator`] combines them under a configured strategy with
//! per-provider circuit breakers and a read-through cache.

mod cache;
mod correlation;
mod error;
mod providers;
mod strategy;

pub use cache::EvidenceCache;
pub use correlation::{CitizenNameRule, CorrelationRule, WeightedAverageRule};
pub use error::{ProviderError, ProviderErrorKind};
pub use providers::{build_registry, HttpRegistryProvider, StaticRegistryProvider};
pub use strategy::EvidenceOrchestrator;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ProviderType;
use crate::error::{Error, Result};
use crate::model::{CitizenRecord, SanctionsRecord};

/// A lookup request passed to providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupQuery {
    /// Subject national identifier.
    pub national_id: String,
}

/// What a provider can do, advertised at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Transport protocol label (`"http"`, `"static"`).
    pub protocol: String,
    /// Data type served.
    pub provider_type: ProviderType,
    /// Contract version.
    pub version: String,
    /// Fields present in returned evidence.
    pub fields: Vec<String>,
    /// Filters the provider accepts.
    pub filters: Vec<String>,
}

/// Provider liveness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderHealth {
    /// Operating normally.
    Healthy,
    /// Partially operational.
    Degraded(String),
    /// Down.
    Unavailable(String),
}

impl ProviderHealth {
    /// Returns `true` if the provider is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Provider-agnostic evidence envelope.
///
/// `data` carries opaque provider-specific fields; typed accessors decode the
/// well-known shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Producing provider.
    pub provider_id: String,
    /// Data type.
    pub provider_type: ProviderType,
    /// Provider confidence in `[0, 1]`.
    pub confidence: f64,
    /// Opaque payload.
    pub data: HashMap<String, Value>,
    /// When the source was consulted.
    pub checked_at: DateTime<Utc>,
    /// Provenance annotations (e.g. `cache: hit`).
    pub metadata: HashMap<String, String>,
}

impl Evidence {
    /// Wrap a citizen record.
    #[must_use]
    pub fn from_citizen(record: &CitizenRecord, provider_id: &str, confidence: f64) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            provider_type: ProviderType::Citizen,
            confidence: confidence.clamp(0.0, 1.0),
            data: record_to_map(record),
            checked_at: record.checked_at,
            metadata: HashMap::new(),
        }
    }

    /// Wrap a sanctions record.
    #[must_use]
    pub fn from_sanctions(record: &SanctionsRecord, provider_id: &str, confidence: f64) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            provider_type: ProviderType::Sanctions,
            confidence: confidence.clamp(0.0, 1.0),
            data: record_to_map(record),
            checked_at: record.checked_at,
            metadata: HashMap::new(),
        }
    }

    /// Decode the citizen record carried in `data`, if this is citizen
    /// evidence.
    #[must_use]
    pub fn citizen_record(&self) -> Option<CitizenRecord> {
        if self.provider_type != ProviderType::Citizen {
            return None;
        }
        map_to_record(&self.data)
    }

    /// Decode the sanctions record carried in `data`, if this is sanctions
    /// evidence.
    #[must_use]
    pub fn sanctions_record(&self) -> Option<SanctionsRecord> {
        if self.provider_type != ProviderType::Sanctions {
            return None;
        }
        map_to_record(&self.data)
    }

    /// Annotate provenance.
    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

fn record_to_map<T: Serialize>(record: &T) -> HashMap<String, Value> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        _ => HashMap::new(),
    }
}

fn map_to_record<T: for<'de> Deserialize<'de>>(map: &HashMap<String, Value>) -> Option<T> {
    let object: serde_json::Map<String, Value> =
        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    serde_json::from_value(Value::Object(object)).ok()
}

/// A pluggable registry data source.
#[async_trait]
pub trait RegistryProvider: Send + Sync + 'static {
    /// Unique, stable provider id.
    fn id(&self) -> &str;

    /// Advertised capabilities.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Perform a lookup.
    ///
    /// # Errors
    ///
    /// Returns a classified [`ProviderError`]; the orchestrator uses the
    /// kind to decide whether to try another provider.
    async fn lookup(&self, query: &LookupQuery) -> std::result::Result<Evidence, ProviderError>;

    /// Provider liveness.
    async fn health(&self) -> ProviderHealth;
}

/// Registered providers, keyed by id with registration order preserved.
///
/// Read-mostly: built at startup, then shared immutably behind an `Arc`.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn RegistryProvider>>,
    by_id: HashMap<String, usize>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. Registration order is the voting tie-break.
    ///
    /// # Errors
    ///
    /// Returns `conflict` when the id is already registered.
    pub fn register(&mut self, provider: Arc<dyn RegistryProvider>) -> Result<()> {
        let id = provider.id().to_string();
        if self.by_id.contains_key(&id) {
            return Err(Error::conflict(format!("provider already registered: {id}")));
        }
        self.by_id.insert(id, self.providers.len());
        self.providers.push(provider);
        Ok(())
    }

    /// Look a provider up by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn RegistryProvider>> {
        self.by_id.get(id).map(|&i| Arc::clone(&self.providers[i]))
    }

    /// All providers of a type, in registration order, with their sequence.
    #[must_use]
    pub fn list_by_type(&self, provider_type: ProviderType) -> Vec<(usize, Arc<dyn RegistryProvider>)> {
        self.providers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.capabilities().provider_type == provider_type)
            .map(|(i, p)| (i, Arc::clone(p)))
            .collect()
    }

    /// Number of registered providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no providers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Evidence gathered for one subject, after strategy and correlation.
#[derive(Debug, Clone, Default)]
pub struct EvidenceBundle {
    /// Evidence items, one or more per gathered type.
    pub items: Vec<Evidence>,
}

impl EvidenceBundle {
    /// Highest-confidence evidence of a type (first on ties).
    #[must_use]
    pub fn best(&self, provider_type: ProviderType) -> Option<&Evidence> {
        self.items
            .iter()
            .filter(|e| e.provider_type == provider_type)
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// Best citizen record, decoded.
    #[must_use]
    pub fn citizen(&self) -> Option<CitizenRecord> {
        self.best(ProviderType::Citizen)?.citizen_record()
    }

    /// Best sanctions record, decoded.
    #[must_use]
    pub fn sanctions(&self) -> Option<SanctionsRecord> {
        self.best(ProviderType::Sanctions)?.sanctions_record()
    }
}
