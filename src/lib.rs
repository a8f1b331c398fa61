//! Content gateway: a resilience layer between the application and its
//! upstream LLM and news providers.
//!
//! Every outbound call runs through the same chain: response cache, token
//! bucket rate limiter, circuit breaker, concurrency cap, retry with
//! exponential backoff, and error classification. On top of the per-provider
//! clients sits a content aggregation pipeline (fan-out, filtering,
//! deduplication, ranking) and the [`manager::IntegrationManager`], the
//! top-level library API for briefing generation, search, health, and cost
//! reporting.

pub mod aggregate;
pub mod cache;
pub mod classify;
pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod models;
pub mod ratelimit;
pub mod retry;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use manager::IntegrationManager;

/// Install the global tracing subscriber, honoring `RUST_LOG`. Call once at
/// application startup; embedding applications that install their own
/// subscriber can skip this.
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}
