//! Configuration management.
//!
//! Configuration merges, in order: built-in defaults, a YAML file, and
//! `VERITY_GW_*` environment variables (nested keys separated by `__`).

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorCode, Result};

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration.
    pub server: ServerConfig,
    /// Admin surface configuration.
    pub admin: AdminConfig,
    /// OIDC flow configuration.
    pub oidc: OidcConfig,
    /// Evidence registry configuration.
    pub registry: RegistryConfig,
    /// Sliding-window rate limits.
    pub rate_limit: RateLimitConfig,
    /// Auth lockout behaviour.
    pub auth_lockout: AuthLockoutConfig,
    /// Audit pipeline configuration.
    pub audit: AuditConfig,
}

impl Config {
    /// Load configuration from an optional YAML file plus environment.
    ///
    /// # Errors
    ///
    /// Returns `validation` when the merged figment cannot be deserialised.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed("VERITY_GW_").split("__"))
            .extract()
            .map_err(|e| Error::new(ErrorCode::Validation, "configuration rejected").with_source(e))
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8470,
        }
    }
}

/// Admin surface configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Token required in `X-Admin-Token`. Admin routes are disabled when unset.
    pub token: Option<String>,
}

/// A registered OIDC client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Client identifier presented at `/auth/authorize`.
    pub client_id: String,
    /// Redirect URIs the client may use. Empty list accepts any URI.
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

/// OIDC flow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    /// Authorization-code lifetime.
    #[serde(with = "humantime_serde")]
    pub code_ttl: Duration,
    /// Access/id token lifetime.
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,
    /// Issuer URL stamped into id tokens.
    pub issuer: String,
    /// HS256 secret for id-token signing. Replace outside development.
    pub signing_secret: String,
    /// Registered clients.
    pub clients: Vec<ClientConfig>,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            code_ttl: Duration::from_secs(10 * 60),
            token_ttl: Duration::from_secs(60 * 60),
            issuer: "https://verity.localhost".to_string(),
            signing_secret: "dev-only-signing-secret".to_string(),
            clients: Vec::new(),
        }
    }
}

/// Provider type served by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    /// Citizen records (PII-bearing).
    Citizen,
    /// Sanctions lists.
    Sanctions,
}

impl ProviderType {
    /// Wire label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Citizen => "citizen",
            Self::Sanctions => "sanctions",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inline citizen fixture for static providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticCitizen {
    /// National identifier.
    pub national_id: String,
    /// Full legal name.
    #[serde(default)]
    pub full_name: String,
    /// Date of birth (ISO 8601).
    #[serde(default)]
    pub date_of_birth: Option<chrono::NaiveDate>,
    /// Registered address.
    #[serde(default)]
    pub address: String,
    /// Registry validity verdict.
    #[serde(default)]
    pub valid: bool,
}

/// Inline sanctions fixture for static providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticSanction {
    /// National identifier.
    pub national_id: String,
    /// Whether the subject is listed.
    #[serde(default)]
    pub listed: bool,
    /// List name, when listed.
    #[serde(default)]
    pub list_type: Option<String>,
    /// Listing reason, when disclosed.
    #[serde(default)]
    pub reason: Option<String>,
}

/// How a configured provider is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum ProviderTransport {
    /// JSON-over-HTTPS registry endpoint.
    Http {
        /// Base URL; lookups POST to `<base_url>/lookup`.
        base_url: String,
    },
    /// Fixture-backed provider (demos, tests).
    Static {
        /// Citizen fixtures, keyed by national id.
        #[serde(default)]
        citizens: Vec<StaticCitizen>,
        /// Sanctions fixtures, keyed by national id.
        #[serde(default)]
        sanctions: Vec<StaticSanction>,
    },
}

/// A configured evidence provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider id.
    pub id: String,
    /// Provider type.
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    /// Transport details.
    #[serde(flatten)]
    pub transport: ProviderTransport,
}

/// Lookup strategy selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Query one configured provider.
    Primary {
        /// Provider id to query.
        provider: String,
    },
    /// Try the primary, then secondaries in order on retryable errors.
    Fallback {
        /// First provider to try.
        primary: String,
        /// Ordered fallbacks.
        #[serde(default)]
        secondary: Vec<String>,
    },
    /// One concurrent task per provider of each requested type.
    Parallel,
    /// Parallel, then highest confidence per type wins.
    Voting,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::Parallel
    }
}

/// Evidence registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Evidence cache TTL.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Regulated mode: minimise citizen PII before caching or returning.
    pub regulated_mode: bool,
    /// Deadline for a full orchestrated lookup.
    #[serde(with = "humantime_serde")]
    pub lookup_timeout: Duration,
    /// Consecutive failures before a provider's circuit opens.
    pub circuit_threshold: u32,
    /// How long an open provider circuit short-circuits calls.
    #[serde(with = "humantime_serde")]
    pub circuit_cooldown: Duration,
    /// Strategy for multi-provider lookup.
    pub strategy: StrategyConfig,
    /// Configured providers, in registration order.
    pub providers: Vec<ProviderConfig>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5 * 60),
            regulated_mode: false,
            lookup_timeout: Duration::from_secs(5),
            circuit_threshold: 5,
            circuit_cooldown: Duration::from_secs(60),
            strategy: StrategyConfig::default(),
            providers: Vec::new(),
        }
    }
}

/// A per-class request budget.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowLimit {
    /// Requests allowed per window.
    pub requests_per_window: u32,
    /// Window length.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for WindowLimit {
    fn default() -> Self {
        Self {
            requests_per_window: 60,
            window: Duration::from_secs(60),
        }
    }
}

/// Budgets for the three request classes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassLimits {
    /// Authentication endpoints.
    pub auth: WindowLimit,
    /// General API endpoints.
    pub api: WindowLimit,
    /// Admin endpoints.
    pub admin: WindowLimit,
}

impl Default for ClassLimits {
    fn default() -> Self {
        Self {
            auth: WindowLimit {
                requests_per_window: 10,
                window: Duration::from_secs(60),
            },
            api: WindowLimit::default(),
            admin: WindowLimit {
                requests_per_window: 30,
                window: Duration::from_secs(60),
            },
        }
    }
}

/// Sliding-window rate-limit configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Per-IP budgets.
    pub ip: ClassLimits,
    /// Per-user budgets.
    pub user: ClassLimits,
    /// Keys that bypass the buckets entirely (full composite keys or bare
    /// identifiers, e.g. `"10.0.0.8"` or `"user:<uuid>:api"`).
    pub allow_list: Vec<String>,
}

/// Auth lockout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthLockoutConfig {
    /// Failures tolerated inside one window before denial.
    pub attempts_per_window: u32,
    /// Failure-counting window.
    #[serde(with = "humantime_serde")]
    pub window_duration: Duration,
    /// Failure count that triggers a hard lock.
    pub hard_lock_threshold: u32,
    /// Hard lock duration.
    #[serde(with = "humantime_serde")]
    pub hard_lock_duration: Duration,
    /// Daily failures after which a CAPTCHA is demanded.
    pub captcha_after_lockouts: u32,
}

impl Default for AuthLockoutConfig {
    fn default() -> Self {
        Self {
            attempts_per_window: 5,
            window_duration: Duration::from_secs(15 * 60),
            hard_lock_threshold: 10,
            hard_lock_duration: Duration::from_secs(60 * 60),
            captcha_after_lockouts: 20,
        }
    }
}

/// Audit pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Security (buffered) publisher settings.
    pub security: SecurityAuditConfig,
    /// Ops (sampled) publisher settings.
    pub ops: OpsAuditConfig,
    /// Outbox worker settings.
    pub outbox: OutboxConfig,
}

/// Buffered security publisher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityAuditConfig {
    /// Ring buffer capacity; oldest events drop when full.
    pub buffer_capacity: usize,
    /// Maximum events drained per worker pass.
    pub batch_size: usize,
    /// Worker wake interval.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for SecurityAuditConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            batch_size: 256,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Sampled ops publisher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsAuditConfig {
    /// Global sample rate in `[0, 1]`; per-action overrides win.
    pub sample_rate: f64,
    /// Per-action sample-rate overrides.
    pub action_sample_rates: std::collections::HashMap<String, f64>,
    /// Store failures before the ops circuit opens.
    pub circuit_threshold: u32,
    /// Open-circuit cooldown.
    #[serde(with = "humantime_serde")]
    pub circuit_cooldown: Duration,
}

impl Default for OpsAuditConfig {
    fn default() -> Self {
        Self {
            sample_rate: 0.1,
            action_sample_rates: std::collections::HashMap::new(),
            circuit_threshold: 5,
            circuit_cooldown: Duration::from_secs(60),
        }
    }
}

/// Outbox worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Rows claimed per poll.
    pub batch_size: usize,
    /// Poll interval.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Processed rows older than this are purged by the janitor.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// Janitor sweep interval.
    #[serde(with = "humantime_serde")]
    pub janitor_interval: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            janitor_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Human-readable duration serde (`"250ms"`, `"30s"`, `"5m"`, `"1h"`, `"7d"`).
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize a duration as seconds (or millis below one second).
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 && duration.as_secs() == 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize `"250ms"`, `"30s"`, `"5m"`, `"1h"`, `"7d"`, or bare seconds.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error for unparseable strings.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        let parse = |v: &str| v.parse::<u64>().map_err(serde::de::Error::custom);

        if let Some(ms) = s.strip_suffix("ms") {
            parse(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            parse(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            parse(mins).map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            parse(hours).map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            parse(days).map(|d| Duration::from_secs(d * 86_400))
        } else {
            parse(&s).map(Duration::from_secs)
        }
    }
}
