//! Verity Gateway library.
//!
//! An identity & decision gateway: OIDC authorization-code authentication,
//! purpose-bound consent, multi-registry evidence orchestration, pure
//! rule-based decisions, and a tri-category tamper-evident audit trail.
//!
//! # Subsystems
//!
//! - **oidc**: authorization-code session lifecycle and token exchange
//! - **consent**: purpose-bound grants with expiry and revocation
//! - **registry**: multi-provider evidence lookup (fallback/parallel/voting)
//! - **decision-core** (workspace crate): pure rule evaluation
//! - **ratelimit**: sliding-window buckets and the auth-lockout state machine
//! - **audit**: compliance (fail-closed) / security (buffered) / ops
//!   (sampled) publishers over a transactional outbox

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cli;
pub mod clock;
pub mod config;
pub mod consent;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod metrics;
pub mod model;
pub mod oidc;
pub mod ratelimit;
pub mod registry;
pub mod store;

pub use error::{Error, ErrorCode, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup tracing/logging.
///
/// # Errors
///
/// Currently infallible; kept fallible for parity with future sinks.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
