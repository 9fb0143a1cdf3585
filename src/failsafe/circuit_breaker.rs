//! Circuit breaker.
//!
//! Opens after a configured number of consecutive failures and stays open for
//! a cooldown, during which calls short-circuit. After the cooldown the next
//! `allow()` moves the circuit to half-open; a single successful probe closes
//! it again, a failed probe re-opens it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::clock::Clock;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are short-circuited.
    Open,
    /// Cooldown elapsed; one probe is in flight.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase label used in logs and health output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Inner {
    Closed { failures: u32 },
    Open { since: DateTime<Utc> },
    HalfOpen,
}

/// Snapshot of breaker observability data.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerStats {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures while closed.
    pub consecutive_failures: u32,
    /// Times the circuit has tripped open.
    pub trips: u64,
}

/// A named circuit breaker with injected time.
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner>,
    trips: AtomicU64,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    ///
    /// `threshold` consecutive failures open the circuit; it stays open for
    /// `cooldown` before admitting a half-open probe.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        threshold: u32,
        cooldown: std::time::Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cooldown: Duration::from_std(cooldown).unwrap_or_else(|_| Duration::seconds(60)),
            clock,
            inner: RwLock::new(Inner::Closed { failures: 0 }),
            trips: AtomicU64::new(0),
        }
    }

    /// Whether a request may proceed.
    ///
    /// When open and the cooldown has elapsed, transitions to half-open and
    /// admits the probe. The transition takes the write lock and re-checks
    /// state, so concurrent callers observe a single transition.
    pub fn allow(&self) -> bool {
        let now = self.clock.now();

        match *self.inner.read() {
            Inner::Closed { .. } | Inner::HalfOpen => return true,
            Inner::Open { since } => {
                if now - since < self.cooldown {
                    return false;
                }
            }
        }

        // Cooldown elapsed: upgrade to a write lock and double-check, since
        // another caller may have transitioned first.
        let mut inner = self.inner.write();
        match *inner {
            Inner::Open { since } if now - since >= self.cooldown => {
                *inner = Inner::HalfOpen;
                debug!(breaker = %self.name, "circuit half-open, admitting probe");
                true
            }
            Inner::Open { .. } => false,
            Inner::Closed { .. } | Inner::HalfOpen => true,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        match *inner {
            Inner::Closed { failures } if failures > 0 => {
                *inner = Inner::Closed { failures: 0 };
            }
            Inner::HalfOpen => {
                *inner = Inner::Closed { failures: 0 };
                info!(breaker = %self.name, "circuit closed after successful probe");
            }
            _ => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        match *inner {
            Inner::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.threshold {
                    *inner = Inner::Open { since: now };
                    self.trips.fetch_add(1, Ordering::Relaxed);
                    warn!(breaker = %self.name, failures, "circuit opened");
                } else {
                    *inner = Inner::Closed { failures };
                }
            }
            Inner::HalfOpen => {
                *inner = Inner::Open { since: now };
                self.trips.fetch_add(1, Ordering::Relaxed);
                warn!(breaker = %self.name, "probe failed, circuit re-opened");
            }
            Inner::Open { .. } => {}
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        match *self.inner.read() {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen => CircuitState::HalfOpen,
        }
    }

    /// Observability snapshot.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let (state, consecutive_failures) = match *self.inner.read() {
            Inner::Closed { failures } => (CircuitState::Closed, failures),
            Inner::Open { .. } => (CircuitState::Open, 0),
            Inner::HalfOpen => (CircuitState::HalfOpen, 0),
        };
        CircuitBreakerStats {
            state,
            consecutive_failures,
            trips: self.trips.load(Ordering::Relaxed),
        }
    }
}
