//! Provider error taxonomy.
//!
//! Every provider failure is normalised into a [`ProviderErrorKind`] so the
//! orchestrator can decide mechanically whether another provider is worth
//! trying. Retryable kinds describe the provider's moment; terminal kinds
//! describe the request or the contract.

use crate::error::{Error, ErrorCode};

/// Normalised provider failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The provider did not answer in time.
    Timeout,
    /// The provider is down or its circuit is open.
    ProviderOutage,
    /// The provider throttled us.
    RateLimited,
    /// The provider answered with data we cannot use.
    BadData,
    /// The provider rejected our credentials.
    Authentication,
    /// The provider's response shape does not match its contract.
    ContractMismatch,
    /// The subject is not known to this provider.
    NotFound,
    /// Anything else.
    Internal,
}

impl ProviderErrorKind {
    /// Whether a different provider might succeed where this one failed.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::ProviderOutage | Self::RateLimited)
    }

    /// Wire/log label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ProviderOutage => "provider_outage",
            Self::RateLimited => "rate_limited",
            Self::BadData => "bad_data",
            Self::Authentication => "authentication",
            Self::ContractMismatch => "contract_mismatch",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified provider failure.
#[derive(Debug, thiserror::Error)]
#[error("provider {provider_id}: {kind}: {message}")]
pub struct ProviderError {
    /// Failure kind.
    pub kind: ProviderErrorKind,
    /// Which provider failed.
    pub provider_id: String,
    /// Human-readable detail.
    pub message: String,
    /// Underlying cause, when available.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl ProviderError {
    /// Create an error of the given kind.
    pub fn new(
        kind: ProviderErrorKind,
        provider_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            provider_id: provider_id.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying cause.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// `timeout` shorthand.
    pub fn timeout(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, provider_id, message)
    }

    /// `provider_outage` shorthand.
    pub fn outage(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ProviderOutage, provider_id, message)
    }

    /// `rate_limited` shorthand.
    pub fn rate_limited(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimited, provider_id, message)
    }

    /// `bad_data` shorthand.
    pub fn bad_data(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::BadData, provider_id, message)
    }

    /// `not_found` shorthand.
    pub fn not_found(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NotFound, provider_id, message)
    }

    /// Whether another provider might succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        let code = match err.kind {
            ProviderErrorKind::NotFound => ErrorCode::NotFound,
            ProviderErrorKind::BadData | ProviderErrorKind::ContractMismatch => ErrorCode::Internal,
            ProviderErrorKind::Authentication | ProviderErrorKind::Internal => ErrorCode::Internal,
            ProviderErrorKind::Timeout
            | ProviderErrorKind::ProviderOutage
            | ProviderErrorKind::RateLimited => ErrorCode::Unavailable,
        };
        Error::new(code, format!("registry lookup failed via {}", err.provider_id)).with_source(err)
    }
}
