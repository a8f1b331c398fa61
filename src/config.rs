//! Gateway configuration
//!
//! One explicit [`GatewayConfig`] is constructed at startup and handed by
//! reference into each component constructor. There is no ambient global
//! configuration state.

use crate::models::BiasLabel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// What kind of upstream a provider entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Llm,
    News,
}

/// Retry policy knobs per provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> usize { 3 }
fn default_base_delay_ms() -> u64 { 100 }
fn default_max_delay_ms() -> u64 { 10_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Requests-per-window quotas. `None` means that window is unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub per_second: Option<u32>,
    #[serde(default)]
    pub per_minute: Option<u32>,
    #[serde(default)]
    pub per_hour: Option<u32>,
    #[serde(default)]
    pub per_day: Option<u32>,
    /// Extra headroom added to the per-second bucket capacity
    #[serde(default)]
    pub burst: u32,
}

impl RateLimitConfig {
    pub fn is_unlimited(&self) -> bool {
        self.per_second.is_none()
            && self.per_minute.is_none()
            && self.per_hour.is_none()
            && self.per_day.is_none()
    }
}

/// Circuit breaker knobs per provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: usize,
}

fn default_failure_threshold() -> usize { 5 }
fn default_reset_timeout_secs() -> u64 { 30 }
fn default_half_open_max_calls() -> usize { 1 }

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

/// Response cache knobs per provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_enabled() -> bool { true }
fn default_cache_ttl_secs() -> u64 { 300 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Per-provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Model name for LLM providers
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub cost_per_million_input_tokens: f64,
    #[serde(default)]
    pub cost_per_million_output_tokens: f64,
    #[serde(default = "default_cost_tracking")]
    pub cost_tracking: bool,
}

fn default_enabled() -> bool { true }
fn default_base_url() -> String { "http://localhost:8080".to_string() }
fn default_timeout_ms() -> u64 { 10_000 }
fn default_max_concurrent() -> usize { 8 }
fn default_cost_tracking() -> bool { true }

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            enabled: default_enabled(),
            base_url: default_base_url(),
            api_key: None,
            model: None,
            timeout_ms: default_timeout_ms(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            breaker: BreakerConfig::default(),
            max_concurrent: default_max_concurrent(),
            cost_per_million_input_tokens: 0.0,
            cost_per_million_output_tokens: 0.0,
            cost_tracking: default_cost_tracking(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Credibility/bias profile for a known news source. These are heuristic,
/// replaceable inputs, not validated ground truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceProfile {
    pub credibility: f64,
    pub bias_label: BiasLabel,
    pub bias_score: f64,
}

impl Default for SourceProfile {
    fn default() -> Self {
        Self {
            credibility: 50.0,
            bias_label: BiasLabel::Neutral,
            bias_score: 0.0,
        }
    }
}

/// Composite ranking weights. Should sum to roughly 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingWeights {
    #[serde(default = "default_w_credibility")]
    pub credibility: f64,
    #[serde(default = "default_w_relevance")]
    pub relevance: f64,
    #[serde(default = "default_w_recency")]
    pub recency: f64,
    #[serde(default = "default_w_diversity")]
    pub diversity: f64,
}

fn default_w_credibility() -> f64 { 0.4 }
fn default_w_relevance() -> f64 { 0.3 }
fn default_w_recency() -> f64 { 0.2 }
fn default_w_diversity() -> f64 { 0.1 }

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            credibility: default_w_credibility(),
            relevance: default_w_relevance(),
            recency: default_w_recency(),
            diversity: default_w_diversity(),
        }
    }
}

/// Aggregation pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "default_min_credibility")]
    pub min_credibility: f64,
    #[serde(default = "default_max_bias_score")]
    pub max_bias_score: f64,
    #[serde(default = "default_recency_window_hours")]
    pub recency_window_hours: i64,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_min_title_words")]
    pub min_title_words: usize,
    #[serde(default = "default_min_body_chars")]
    pub min_body_chars: usize,
    #[serde(default)]
    pub weights: RankingWeights,
    #[serde(default)]
    pub prohibited_terms: Vec<String>,
    #[serde(default = "default_clickbait_terms")]
    pub clickbait_terms: Vec<String>,
    #[serde(default = "default_per_provider_timeout_ms")]
    pub per_provider_timeout_ms: u64,
    /// Per-source credibility/bias annotations used by news transports
    #[serde(default)]
    pub source_profiles: HashMap<String, SourceProfile>,
}

fn default_min_credibility() -> f64 { 30.0 }
fn default_max_bias_score() -> f64 { 80.0 }
fn default_recency_window_hours() -> i64 { 72 }
fn default_similarity_threshold() -> f64 { 0.8 }
fn default_min_title_words() -> usize { 3 }
fn default_min_body_chars() -> usize { 80 }
fn default_per_provider_timeout_ms() -> u64 { 15_000 }
fn default_clickbait_terms() -> Vec<String> {
    [
        "you won't believe",
        "shocking",
        "this one trick",
        "doctors hate",
        "number 7 will",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            min_credibility: default_min_credibility(),
            max_bias_score: default_max_bias_score(),
            recency_window_hours: default_recency_window_hours(),
            similarity_threshold: default_similarity_threshold(),
            min_title_words: default_min_title_words(),
            min_body_chars: default_min_body_chars(),
            weights: RankingWeights::default(),
            prohibited_terms: Vec::new(),
            clickbait_terms: default_clickbait_terms(),
            per_provider_timeout_ms: default_per_provider_timeout_ms(),
            source_profiles: HashMap::new(),
        }
    }
}

impl AggregatorConfig {
    pub fn per_provider_timeout(&self) -> Duration {
        Duration::from_millis(self.per_provider_timeout_ms)
    }
}

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default = "default_daily_budget_usd")]
    pub daily_budget_usd: f64,
    /// Fraction of the daily budget that triggers a cost alert
    #[serde(default = "default_cost_alert_threshold")]
    pub cost_alert_threshold: f64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_cache_sweep_interval_secs")]
    pub cache_sweep_interval_secs: u64,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
}

fn default_daily_budget_usd() -> f64 { 10.0 }
fn default_cost_alert_threshold() -> f64 { 0.8 }
fn default_health_check_interval_secs() -> u64 { 60 }
fn default_cache_sweep_interval_secs() -> u64 { 60 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            daily_budget_usd: default_daily_budget_usd(),
            cost_alert_threshold: default_cost_alert_threshold(),
            health_check_interval_secs: default_health_check_interval_secs(),
            cache_sweep_interval_secs: default_cache_sweep_interval_secs(),
            aggregator: AggregatorConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Override settings from environment variables where present.
    ///
    /// Per-provider API keys are read from `GATEWAY_<PROVIDER>_API_KEY`
    /// (provider id uppercased).
    pub fn from_env(mut self) -> Self {
        if let Ok(val) = std::env::var("GATEWAY_DAILY_BUDGET_USD") {
            if let Ok(budget) = val.parse() {
                self.daily_budget_usd = budget;
            }
        }

        if let Ok(val) = std::env::var("GATEWAY_COST_ALERT_THRESHOLD") {
            if let Ok(threshold) = val.parse() {
                self.cost_alert_threshold = threshold;
            }
        }

        if let Ok(val) = std::env::var("GATEWAY_HEALTH_CHECK_INTERVAL_SECS") {
            if let Ok(secs) = val.parse() {
                self.health_check_interval_secs = secs;
            }
        }

        if let Ok(val) = std::env::var("GATEWAY_CACHE_SWEEP_INTERVAL_SECS") {
            if let Ok(secs) = val.parse() {
                self.cache_sweep_interval_secs = secs;
            }
        }

        for (id, provider) in self.providers.iter_mut() {
            let key_var = format!("GATEWAY_{}_API_KEY", id.to_uppercase().replace('-', "_"));
            if let Ok(val) = std::env::var(&key_var) {
                provider.api_key = Some(val);
            }

            let url_var = format!("GATEWAY_{}_BASE_URL", id.to_uppercase().replace('-', "_"));
            if let Ok(val) = std::env::var(&url_var) {
                provider.base_url = val;
            }

            let enabled_var = format!("GATEWAY_{}_ENABLED", id.to_uppercase().replace('-', "_"));
            if let Ok(val) = std::env::var(&enabled_var) {
                provider.enabled = val.to_lowercase() == "true" || val == "1";
            }
        }

        self
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }

    /// Provider ids of a given kind, enabled first, sorted for determinism
    pub fn providers_of_kind(&self, kind: ProviderKind) -> Vec<String> {
        let mut ids: Vec<String> = self
            .providers
            .iter()
            .filter(|(_, p)| p.kind == kind)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}
