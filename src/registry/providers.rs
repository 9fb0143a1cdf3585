//! Built-in providers: JSON-over-HTTP registries and fixture-backed statics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::clock::Clock;
use crate::config::{ProviderTransport, ProviderType, RegistryConfig, StaticCitizen, StaticSanction};
use crate::error::{Error, Result};
use crate::model::{CitizenRecord, SanctionsRecord};

use super::{
    Evidence, LookupQuery, ProviderCapabilities, ProviderError, ProviderHealth, ProviderRegistry,
    RegistryProvider,
};

/// Build the provider registry from configuration, preserving config order.
///
/// # Errors
///
/// Returns `conflict` on duplicate provider ids and `validation` on
/// unconstructible providers.
pub fn build_registry(config: &RegistryConfig, clock: Arc<dyn Clock>) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    for provider in &config.providers {
        let built: Arc<dyn RegistryProvider> = match &provider.transport {
            ProviderTransport::Http { base_url } => Arc::new(HttpRegistryProvider::new(
                &provider.id,
                provider.provider_type,
                base_url,
                config.lookup_timeout,
                Arc::clone(&clock),
            )?),
            ProviderTransport::Static { citizens, sanctions } => Arc::new(StaticRegistryProvider::new(
                &provider.id,
                provider.provider_type,
                citizens.clone(),
                sanctions.clone(),
                Arc::clone(&clock),
            )),
        };
        registry.register(built)?;
    }
    Ok(registry)
}

/// Fixture-backed provider for demos and tests.
pub struct StaticRegistryProvider {
    id: String,
    provider_type: ProviderType,
    citizens: HashMap<String, StaticCitizen>,
    sanctions: HashMap<String, StaticSanction>,
    clock: Arc<dyn Clock>,
}

impl StaticRegistryProvider {
    /// Create a provider serving the given fixtures.
    #[must_use]
    pub fn new(
        id: &str,
        provider_type: ProviderType,
        citizens: Vec<StaticCitizen>,
        sanctions: Vec<StaticSanction>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id: id.to_string(),
            provider_type,
            citizens: citizens
                .into_iter()
                .map(|c| (c.national_id.clone(), c))
                .collect(),
            sanctions: sanctions
                .into_iter()
                .map(|s| (s.national_id.clone(), s))
                .collect(),
            clock,
        }
    }
}

#[async_trait]
impl RegistryProvider for StaticRegistryProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            protocol: "static".to_string(),
            provider_type: self.provider_type,
            version: "1".to_string(),
            fields: match self.provider_type {
                ProviderType::Citizen => vec![
                    "national_id".into(),
                    "full_name".into(),
                    "date_of_birth".into(),
                    "address".into(),
                    "valid".into(),
                ],
                ProviderType::Sanctions => {
                    vec!["national_id".into(), "listed".into(), "list_type".into()]
                }
            },
            filters: vec!["national_id".to_string()],
        }
    }

    async fn lookup(&self, query: &LookupQuery) -> std::result::Result<Evidence, ProviderError> {
        let now = self.clock.now();
        match self.provider_type {
            ProviderType::Citizen => {
                let fixture = self.citizens.get(&query.national_id).ok_or_else(|| {
                    ProviderError::not_found(&self.id, "no citizen fixture for subject")
                })?;
                let record = CitizenRecord {
                    national_id: fixture.national_id.clone(),
                    full_name: fixture.full_name.clone(),
                    date_of_birth: fixture.date_of_birth,
                    address: fixture.address.clone(),
                    valid: fixture.valid,
                    source: self.id.clone(),
                    checked_at: now,
                };
                Ok(Evidence::from_citizen(&record, &self.id, 1.0))
            }
            ProviderType::Sanctions => {
                let fixture = self.sanctions.get(&query.national_id).ok_or_else(|| {
                    ProviderError::not_found(&self.id, "no sanctions fixture for subject")
                })?;
                let record = SanctionsRecord {
                    national_id: fixture.national_id.clone(),
                    listed: fixture.listed,
                    source: self.id.clone(),
                    checked_at: now,
                    list_type: fixture.list_type.clone(),
                    reason: fixture.reason.clone(),
                };
                Ok(Evidence::from_sanctions(&record, &self.id, 1.0))
            }
        }
    }

    async fn health(&self) -> ProviderHealth {
        ProviderHealth::Healthy
    }
}

#[derive(Debug, Deserialize)]
struct CitizenWire {
    national_id: String,
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    date_of_birth: Option<chrono::NaiveDate>,
    #[serde(default)]
    address: String,
    #[serde(default)]
    valid: bool,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SanctionsWire {
    national_id: String,
    #[serde(default)]
    listed: bool,
    #[serde(default)]
    list_type: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// JSON-over-HTTPS registry provider.
///
/// Lookups POST `{"national_id": ...}` to `<base_url>/lookup`; health probes
/// GET `<base_url>/health`. HTTP failures are classified into the provider
/// error taxonomy.
pub struct HttpRegistryProvider {
    id: String,
    provider_type: ProviderType,
    base_url: String,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl HttpRegistryProvider {
    /// Create a provider for the given base URL.
    ///
    /// # Errors
    ///
    /// Returns `validation` when the HTTP client cannot be constructed.
    pub fn new(
        id: &str,
        provider_type: ProviderType,
        base_url: &str,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::validation("http provider client rejected").with_source(e))?;
        Ok(Self {
            id: id.to_string(),
            provider_type,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            clock,
        })
    }

    fn classify(&self, err: reqwest::Error) -> ProviderError {
        let kind = if err.is_timeout() {
            super::ProviderErrorKind::Timeout
        } else if err.is_connect() {
            super::ProviderErrorKind::ProviderOutage
        } else if err.is_decode() {
            super::ProviderErrorKind::BadData
        } else {
            super::ProviderErrorKind::Internal
        };
        ProviderError::new(kind, &self.id, "registry call failed").with_source(err)
    }

    fn classify_status(&self, status: StatusCode) -> ProviderError {
        let kind = match status {
            StatusCode::TOO_MANY_REQUESTS => super::ProviderErrorKind::RateLimited,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                super::ProviderErrorKind::Authentication
            }
            StatusCode::NOT_FOUND => super::ProviderErrorKind::NotFound,
            s if s.is_client_error() => super::ProviderErrorKind::ContractMismatch,
            _ => super::ProviderErrorKind::ProviderOutage,
        };
        ProviderError::new(kind, &self.id, format!("registry answered {status}"))
    }
}

#[async_trait]
impl RegistryProvider for HttpRegistryProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            protocol: "http".to_string(),
            provider_type: self.provider_type,
            version: "1".to_string(),
            fields: match self.provider_type {
                ProviderType::Citizen => vec![
                    "national_id".into(),
                    "full_name".into(),
                    "date_of_birth".into(),
                    "address".into(),
                    "valid".into(),
                ],
                ProviderType::Sanctions => {
                    vec!["national_id".into(), "listed".into(), "list_type".into()]
                }
            },
            filters: vec!["national_id".to_string()],
        }
    }

    async fn lookup(&self, query: &LookupQuery) -> std::result::Result<Evidence, ProviderError> {
        let url = format!("{}/lookup", self.base_url);
        debug!(provider = %self.id, %url, "registry lookup");

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "national_id": query.national_id,
                "type": self.provider_type.as_str(),
            }))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.classify_status(status));
        }

        let now = self.clock.now();
        match self.provider_type {
            ProviderType::Citizen => {
                let wire: CitizenWire = response.json().await.map_err(|e| self.classify(e))?;
                let record = CitizenRecord {
                    national_id: wire.national_id,
                    full_name: wire.full_name,
                    date_of_birth: wire.date_of_birth,
                    address: wire.address,
                    valid: wire.valid,
                    source: self.id.clone(),
                    checked_at: now,
                };
                Ok(Evidence::from_citizen(
                    &record,
                    &self.id,
                    wire.confidence.unwrap_or(1.0),
                ))
            }
            ProviderType::Sanctions => {
                let wire: SanctionsWire = response.json().await.map_err(|e| self.classify(e))?;
                let record = SanctionsRecord {
                    national_id: wire.national_id,
                    listed: wire.listed,
                    source: self.id.clone(),
                    checked_at: now,
                    list_type: wire.list_type,
                    reason: wire.reason,
                };
                Ok(Evidence::from_sanctions(
                    &record,
                    &self.id,
                    wire.confidence.unwrap_or(1.0),
                ))
            }
        }
    }

    async fn health(&self) -> ProviderHealth {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => ProviderHealth::Healthy,
            Ok(response) => ProviderHealth::Degraded(format!("health returned {}", response.status())),
            Err(e) => ProviderHealth::Unavailable(e.to_string()),
        }
    }
}
