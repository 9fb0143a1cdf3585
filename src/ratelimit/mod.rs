//! Sliding-window rate limiting over composite keys.
//!
//! Keys are `ip:<addr>:<class>` or `user:<id>:<class>` with class one of
//! `auth`, `api`, `admin`. The window store does the counting; this module
//! owns key construction, the allow-list short-circuit, and the combined
//! IP + user check.

pub mod lockout;

pub use lockout::{backoff_delay, LockoutGuard};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{RateLimitConfig, WindowLimit};
use crate::error::RateLimitInfo;
use crate::metrics::{Metrics, SharedMetrics};
use crate::store::RateWindowStore;

/// Request class, each with its own budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitClass {
    /// Authentication endpoints.
    Auth,
    /// General API endpoints.
    Api,
    /// Admin endpoints.
    Admin,
}

impl LimitClass {
    /// Key segment for this class.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Api => "api",
            Self::Admin => "admin",
        }
    }
}

/// Composite bucket key for an IP.
#[must_use]
pub fn ip_key(ip: &str, class: LimitClass) -> String {
    format!("ip:{ip}:{}", class.as_str())
}

/// Composite bucket key for a user.
#[must_use]
pub fn user_key(user_id: Uuid, class: LimitClass) -> String {
    format!("user:{user_id}:{}", class.as_str())
}

/// Composite lockout key: `identifier + ip`, so neither per-account nor
/// per-IP attack patterns can evade the other's caps.
#[must_use]
pub fn auth_lockout_key(identifier: &str, ip: &str) -> String {
    format!("auth:{identifier}:{ip}")
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Configured limit for the consulted bucket.
    pub limit: u32,
    /// Requests remaining in the window.
    pub remaining: u32,
    /// When the window resets.
    pub reset_at: DateTime<Utc>,
    /// How long to wait when denied.
    pub retry_after: Option<Duration>,
    /// Whether a CAPTCHA is demanded (lockout path only).
    pub requires_captcha: bool,
}

impl RateLimitDecision {
    /// Allow-list short-circuit: full budget, no bucket consulted.
    #[must_use]
    pub fn allow_listed(limit: u32, now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_at: now + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(60)),
            retry_after: None,
            requires_captcha: false,
        }
    }

    /// Header metadata for the HTTP surface.
    #[must_use]
    pub fn header_info(&self, now: DateTime<Utc>) -> RateLimitInfo {
        let reset_secs = (self.reset_at - now).num_seconds().max(0) as u64;
        RateLimitInfo {
            limit: self.limit,
            remaining: self.remaining,
            reset_secs,
            retry_after_secs: self
                .retry_after
                .map_or(reset_secs, |d| d.as_secs().max(1)),
        }
    }
}

/// Sliding-window rate limiter.
pub struct RateLimiter {
    store: Arc<dyn RateWindowStore>,
    clock: Arc<dyn Clock>,
    metrics: SharedMetrics,
    config: RateLimitConfig,
    allow_list: HashSet<String>,
}

impl RateLimiter {
    /// Create a limiter from configuration.
    #[must_use]
    pub fn new(
        config: RateLimitConfig,
        store: Arc<dyn RateWindowStore>,
        clock: Arc<dyn Clock>,
        metrics: SharedMetrics,
    ) -> Self {
        let allow_list = config.allow_list.iter().cloned().collect();
        Self {
            store,
            clock,
            metrics,
            config,
            allow_list,
        }
    }

    fn is_allow_listed(&self, bare: &str, key: &str) -> bool {
        self.allow_list.contains(bare) || self.allow_list.contains(key)
    }

    /// Check an arbitrary composite key against a budget.
    pub async fn allow(&self, key: &str, limit: WindowLimit) -> RateLimitDecision {
        let now = self.clock.now();
        let outcome = self
            .store
            .check_and_record(key, limit.requests_per_window, limit.window, now)
            .await;

        let remaining = limit.requests_per_window.saturating_sub(outcome.count);
        let decision = RateLimitDecision {
            allowed: outcome.allowed,
            limit: limit.requests_per_window,
            remaining,
            reset_at: outcome.reset_at,
            retry_after: if outcome.allowed {
                None
            } else {
                Some(
                    (outcome.reset_at - now)
                        .to_std()
                        .unwrap_or(Duration::from_secs(1)),
                )
            },
            requires_captcha: false,
        };

        if !decision.allowed {
            Metrics::incr(&self.metrics.rate_limit_denials);
            tracing::debug!(key, "rate limit exceeded");
        }
        decision
    }

    /// Check the per-IP budget for a class.
    pub async fn check_ip(&self, ip: &str, class: LimitClass) -> RateLimitDecision {
        let key = ip_key(ip, class);
        let limit = self.limit_for(&self.config.ip, class);
        if self.is_allow_listed(ip, &key) {
            return RateLimitDecision::allow_listed(limit.requests_per_window, self.clock.now(), limit.window);
        }
        self.allow(&key, limit).await
    }

    /// Check the per-user budget for a class.
    pub async fn check_user(&self, user_id: Uuid, class: LimitClass) -> RateLimitDecision {
        let key = user_key(user_id, class);
        let limit = self.limit_for(&self.config.user, class);
        if self.is_allow_listed(&user_id.to_string(), &key) {
            return RateLimitDecision::allow_listed(limit.requests_per_window, self.clock.now(), limit.window);
        }
        self.allow(&key, limit).await
    }

    /// Evaluate the IP budget then the user budget.
    ///
    /// If either blocks, that result wins (IP first). Otherwise returns the
    /// tighter of the two: smaller `remaining`, ties broken by earlier
    /// `reset_at`.
    pub async fn check_both_limits(
        &self,
        ip: &str,
        user_id: Uuid,
        class: LimitClass,
    ) -> RateLimitDecision {
        let ip_decision = self.check_ip(ip, class).await;
        if !ip_decision.allowed {
            return ip_decision;
        }
        let user_decision = self.check_user(user_id, class).await;
        if !user_decision.allowed {
            return user_decision;
        }

        if user_decision.remaining < ip_decision.remaining {
            user_decision
        } else if ip_decision.remaining < user_decision.remaining {
            ip_decision
        } else if ip_decision.reset_at <= user_decision.reset_at {
            ip_decision
        } else {
            user_decision
        }
    }

    fn limit_for(&self, limits: &crate::config::ClassLimits, class: LimitClass) -> WindowLimit {
        match class {
            LimitClass::Auth => limits.auth,
            LimitClass::Api => limits.api,
            LimitClass::Admin => limits.admin,
        }
    }
}
