//! Auth lockout: failure counting, hard locks, progressive backoff, and
//! CAPTCHA gating over the composite `identifier + ip` key.
//!
//! All mutations go through [`crate::store::LockoutStore::mutate_lockout`],
//! which persists the whole record atomically: `failure_count`,
//! `daily_failures`, `locked_until`, and `requires_captcha` are never
//! observed half-updated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
use chrono::Utc;
use tracing::{debug, warn};

use crate::audit::{SecurityAuditor, SecurityEvent, Severity};
use crate::clock::Clock;
use crate::config::AuthLockoutConfig;
use crate::metrics::{Metrics, SharedMetrics};
use crate::model::AuthLockout;
use crate::store::LockoutStore;

use super::{auth_lockout_key, LimitClass, RateLimitDecision, RateLimiter};

/// Progressive backoff for a given failure count:
/// `min(250ms · 2^(count−1), 1s)`, zero for a clean slate.
#[must_use]
pub fn backoff_delay(failure_count: u32) -> Duration {
    if failure_count == 0 {
        return Duration::ZERO;
    }
    let exp = failure_count.saturating_sub(1).min(2);
    let delay = Duration::from_millis(250) * 2u32.pow(exp);
    delay.min(Duration::from_secs(1))
}

/// Lockout guard consulted before every credentialed attempt.
pub struct LockoutGuard {
    store: Arc<dyn LockoutStore>,
    limiter: Arc<RateLimiter>,
    security: Arc<SecurityAuditor>,
    clock: Arc<dyn Clock>,
    metrics: SharedMetrics,
    config: AuthLockoutConfig,
}

impl LockoutGuard {
    /// Create a guard.
    #[must_use]
    pub fn new(
        config: AuthLockoutConfig,
        store: Arc<dyn LockoutStore>,
        limiter: Arc<RateLimiter>,
        security: Arc<SecurityAuditor>,
        clock: Arc<dyn Clock>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            store,
            limiter,
            security,
            clock,
            metrics,
            config,
        }
    }

    /// Gate an authentication attempt for `identifier` from `ip`.
    ///
    /// In order: hard lock, window exhaustion, progressive backoff, then the
    /// standard per-IP auth rate limit as secondary defense.
    pub async fn check(&self, identifier: &str, ip: &str) -> RateLimitDecision {
        let key = auth_lockout_key(identifier, ip);
        let now = self.clock.now();

        if let Some(lockout) = self.store.get_lockout(&key).await {
            if let Some(locked_until) = lockout.locked_until {
                if locked_until > now {
                    debug!(key, "attempt denied: hard lock");
                    return RateLimitDecision {
                        allowed: false,
                        limit: self.config.attempts_per_window,
                        remaining: 0,
                        reset_at: locked_until,
                        retry_after: Some(
                            (locked_until - now).to_std().unwrap_or(Duration::from_secs(1)),
                        ),
                        requires_captcha: lockout.requires_captcha,
                    };
                }
            }

            let window = chrono::Duration::from_std(self.config.window_duration)
                .unwrap_or_else(|_| chrono::Duration::minutes(15));
            let window_open = now - lockout.last_failure_at < window;
            if window_open && lockout.failure_count >= self.config.attempts_per_window {
                let reset_at = lockout.last_failure_at + window;
                debug!(key, failures = lockout.failure_count, "attempt denied: window exhausted");
                return RateLimitDecision {
                    allowed: false,
                    limit: self.config.attempts_per_window,
                    remaining: 0,
                    reset_at,
                    retry_after: Some((reset_at - now).to_std().unwrap_or(Duration::from_secs(1))),
                    requires_captcha: lockout.requires_captcha,
                };
            }

            let delay = backoff_delay(if window_open { lockout.failure_count } else { 0 });
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        self.limiter.check_ip(ip, LimitClass::Auth).await
    }

    /// Record a failed attempt. Returns the persisted state.
    ///
    /// Window and daily counters reset lazily when their horizons pass.
    /// Crossing `attempts_per_window` or the hard-lock threshold emits an
    /// `auth_lockout_triggered` security event.
    pub async fn record_failure(&self, identifier: &str, ip: &str, request_id: &str) -> AuthLockout {
        let key = auth_lockout_key(identifier, ip);
        let now = self.clock.now();
        let config = self.config.clone();

        let window = chrono::Duration::from_std(config.window_duration)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));

        let lockout_tripped = AtomicBool::new(false);
        let hard_locked = AtomicBool::new(false);

        let updated = self
            .store
            .mutate_lockout(&key, AuthLockout::new(key.clone(), now), &|state| {
                if now - state.last_failure_at >= window {
                    state.failure_count = 0;
                }
                if now - state.last_failure_at >= chrono::Duration::hours(24) {
                    state.daily_failures = 0;
                }

                state.failure_count += 1;
                state.daily_failures += 1;
                state.last_failure_at = now;

                if state.failure_count == config.attempts_per_window {
                    lockout_tripped.store(true, Ordering::Relaxed);
                }
                if state.failure_count >= config.hard_lock_threshold {
                    let already_locked = state.locked_until.is_some_and(|until| until > now);
                    state.locked_until =
                        Some(now + chrono::Duration::from_std(config.hard_lock_duration)
                            .unwrap_or_else(|_| chrono::Duration::hours(1)));
                    if !already_locked {
                        hard_locked.store(true, Ordering::Relaxed);
                    }
                }
                if state.daily_failures >= config.captcha_after_lockouts {
                    state.requires_captcha = true;
                }
            })
            .await;

        self.security.emit(SecurityEvent {
            timestamp: now,
            subject: "auth".to_string(),
            action: "auth_failure".to_string(),
            reason: "invalid credentials or grant".to_string(),
            ip: ip.to_string(),
            request_id: request_id.to_string(),
            severity: Severity::Info,
        });

        if lockout_tripped.load(Ordering::Relaxed) || hard_locked.load(Ordering::Relaxed) {
            Metrics::incr(&self.metrics.lockouts_triggered);
            let severity = if hard_locked.load(Ordering::Relaxed) {
                Severity::Critical
            } else {
                Severity::Warning
            };
            warn!(key, failures = updated.failure_count, "auth lockout triggered");
            self.security.emit(SecurityEvent {
                timestamp: now,
                subject: "auth".to_string(),
                action: "auth_lockout_triggered".to_string(),
                reason: format!("{} consecutive failures", updated.failure_count),
                ip: ip.to_string(),
                request_id: request_id.to_string(),
                severity,
            });
        }

        updated
    }

    /// Wipe state for a key after a successful login.
    pub async fn clear(&self, identifier: &str, ip: &str) {
        self.store
            .clear_lockout(&auth_lockout_key(identifier, ip))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{RateLimitConfig, SecurityAuditConfig};
    use crate::store::MemoryStore;

    #[test]
    fn backoff_table_matches_contract() {
        let cases = [
            (0, Duration::ZERO),
            (1, Duration::from_millis(250)),
            (2, Duration::from_millis(500)),
            (3, Duration::from_secs(1)),
            (4, Duration::from_secs(1)),
            (10, Duration::from_secs(1)),
        ];
        for (count, expected) in cases {
            assert_eq!(backoff_delay(count), expected, "failure_count={count}");
        }
    }

    struct Fixture {
        guard: LockoutGuard,
        clock: ManualClock,
        security: Arc<SecurityAuditor>,
        metrics: SharedMetrics,
    }

    fn fixture(config: AuthLockoutConfig) -> Fixture {
        let clock = ManualClock::new(Utc::now());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(MemoryStore::new());
        let metrics = Metrics::shared();
        let security = Arc::new(SecurityAuditor::new(
            &SecurityAuditConfig::default(),
            Arc::clone(&shared_clock),
            metrics.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::default(),
            store.clone(),
            Arc::clone(&shared_clock),
            metrics.clone(),
        ));
        let guard = LockoutGuard::new(
            config,
            store,
            limiter,
            Arc::clone(&security),
            shared_clock,
            metrics.clone(),
        );
        Fixture {
            guard,
            clock,
            security,
            metrics,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_exhaustion_denies_with_reset() {
        let f = fixture(AuthLockoutConfig::default());

        for _ in 0..5 {
            f.guard.record_failure("bob@x.io", "1.2.3.4", "req").await;
        }

        let decision = f.guard.check("bob@x.io", "1.2.3.4").await;
        assert!(!decision.allowed);
        assert!(decision.retry_after.unwrap() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn lockout_keys_are_composite() {
        let f = fixture(AuthLockoutConfig::default());

        for _ in 0..5 {
            f.guard.record_failure("bob@x.io", "1.2.3.4", "req").await;
        }

        // Same identifier from a different IP is unaffected; same IP with a
        // different identifier is unaffected.
        assert!(f.guard.check("bob@x.io", "5.6.7.8").await.allowed);
        assert!(f.guard.check("carol@x.io", "1.2.3.4").await.allowed);
        assert!(!f.guard.check("bob@x.io", "1.2.3.4").await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_lock_persists_locked_until_and_captcha_state() {
        let config = AuthLockoutConfig {
            hard_lock_threshold: 6,
            captcha_after_lockouts: 6,
            ..AuthLockoutConfig::default()
        };
        let f = fixture(config);

        let mut last = None;
        for _ in 0..6 {
            last = Some(f.guard.record_failure("bob@x.io", "1.2.3.4", "req").await);
        }

        // The returned (persisted) state carries everything atomically.
        let state = last.unwrap();
        assert!(state.locked_until.is_some());
        assert!(state.requires_captcha);

        let decision = f.guard.check("bob@x.io", "1.2.3.4").await;
        assert!(!decision.allowed);
        assert!(decision.requires_captcha, "captcha flag propagated");
    }

    #[tokio::test(start_paused = true)]
    async fn failure_window_resets_after_duration() {
        let f = fixture(AuthLockoutConfig::default());

        for _ in 0..5 {
            f.guard.record_failure("bob@x.io", "1.2.3.4", "req").await;
        }
        assert!(!f.guard.check("bob@x.io", "1.2.3.4").await.allowed);

        // Past the window the counter is stale and attempts flow again.
        f.clock.advance(chrono::Duration::minutes(16));
        assert!(f.guard.check("bob@x.io", "1.2.3.4").await.allowed);

        // The next failure restarts the count from a clean window.
        let state = f.guard.record_failure("bob@x.io", "1.2.3.4", "req").await;
        assert_eq!(state.failure_count, 1);
        assert_eq!(state.daily_failures, 6, "daily counter keeps accumulating");
    }

    #[tokio::test(start_paused = true)]
    async fn clear_wipes_all_counters() {
        let f = fixture(AuthLockoutConfig::default());

        for _ in 0..5 {
            f.guard.record_failure("bob@x.io", "1.2.3.4", "req").await;
        }
        f.guard.clear("bob@x.io", "1.2.3.4").await;
        assert!(f.guard.check("bob@x.io", "1.2.3.4").await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn lockout_emits_security_event_and_metric() {
        let f = fixture(AuthLockoutConfig::default());

        for _ in 0..5 {
            f.guard.record_failure("bob@x.io", "1.2.3.4", "req").await;
        }

        assert_eq!(f.metrics.snapshot().lockouts_triggered, 1);
        // Buffered events: 5 auth_failure + 1 auth_lockout_triggered.
        assert_eq!(f.security.buffered(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_delays_but_allows_under_threshold() {
        let f = fixture(AuthLockoutConfig::default());

        f.guard.record_failure("bob@x.io", "1.2.3.4", "req").await;
        f.guard.record_failure("bob@x.io", "1.2.3.4", "req").await;

        let started = tokio::time::Instant::now();
        let decision = f.guard.check("bob@x.io", "1.2.3.4").await;
        assert!(decision.allowed);
        // Two failures: 500ms of progressive backoff (virtual time).
        assert!(started.elapsed() >= Duration::from_millis(500));
    }
}
