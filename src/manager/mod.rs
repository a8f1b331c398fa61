//! Integration manager, the top-level library API
//!
//! Owns every provider client, the aggregation pipeline, and the cost ledger.
//! Built once from an explicit [`GatewayConfig`]; nothing here reads ambient
//! global state. Background work (cache sweeping, health polling, limiter GC)
//! runs in tasks whose handles the manager owns and aborts on shutdown.

use crate::aggregate::{ContentAggregator, SearchRequest, UserPreferences};
use crate::cache::{CacheHealth, CacheManager, SweepHandle};
use crate::classify::{ErrorClassifier, ProviderStatus};
use crate::client::llm::{LlmClient, Tone};
use crate::client::news::NewsClient;
use crate::client::{ClientHealth, HttpTransport, ProviderClient};
use crate::config::{GatewayConfig, ProviderKind};
use crate::error::{GatewayError, Result};
use crate::models::{AggregatedResult, BiasLabel, BriefingCard, ContentItem, TokenUsage};
use crate::ratelimit::RateLimiter;
use crate::retry::breaker::CircuitBreaker;
use crate::retry::CancelToken;
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Word budget handed to the LLM for briefing and analysis summaries
const SUMMARY_MAX_WORDS: usize = 150;
/// Extra candidates fetched per requested article, consumed by filtering
const FETCH_HEADROOM: usize = 3;

/// Inputs for one briefing generation
#[derive(Debug, Clone)]
pub struct BriefingOptions {
    pub interests: Vec<String>,
    pub max_articles: usize,
    pub tone: Tone,
    pub include_financial: bool,
    pub cancel: Option<CancelToken>,
}

impl Default for BriefingOptions {
    fn default() -> Self {
        Self {
            interests: Vec::new(),
            max_articles: 10,
            tone: Tone::default(),
            include_financial: false,
            cancel: None,
        }
    }
}

/// Bookkeeping attached to a generated briefing
#[derive(Debug, Clone)]
pub struct BriefingMetadata {
    pub total_cost_usd: f64,
    pub generation_time_ms: u64,
    pub sources_used: Vec<String>,
    pub tokens_used: u64,
    /// Set when a provider failed during fan-out or no LLM was available
    pub degraded: bool,
    pub llm_provider: Option<String>,
}

/// One generated briefing
#[derive(Debug, Clone)]
pub struct Briefing {
    pub cards: Vec<BriefingCard>,
    pub metadata: BriefingMetadata,
}

/// Inputs for one content search
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub categories: Vec<String>,
    pub max_results: usize,
    /// Ask an LLM for a short synthesis of the top results
    pub include_analysis: bool,
    pub tone: Tone,
    pub cancel: Option<CancelToken>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            categories: Vec::new(),
            max_results: 20,
            include_analysis: false,
            tone: Tone::default(),
            cancel: None,
        }
    }
}

/// Search results plus the optional LLM synthesis
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub result: AggregatedResult,
    pub analysis: Option<String>,
    pub elapsed_ms: u64,
}

/// Point-in-time health snapshot across all providers
#[derive(Debug, Clone)]
pub struct SystemHealth {
    pub overall: ProviderStatus,
    pub providers: Vec<ClientHealth>,
    pub cache: CacheHealth,
    pub uptime_secs: u64,
}

/// One cost ledger entry
#[derive(Debug, Clone)]
pub struct CostRecord {
    pub provider: String,
    pub cost_usd: f64,
    pub tokens: u64,
    pub timestamp: DateTime<Utc>,
}

/// Spend report against the configured daily budget
#[derive(Debug, Clone)]
pub struct CostAnalysis {
    pub today_usd: f64,
    pub daily_budget_usd: f64,
    pub by_provider: HashMap<String, f64>,
    pub alerts: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Top-level façade over providers, aggregation, health, and cost
pub struct IntegrationManager {
    config: GatewayConfig,
    cache: Arc<CacheManager>,
    limiter: Arc<RateLimiter>,
    llm_clients: Vec<Arc<LlmClient>>,
    news_clients: Vec<Arc<NewsClient>>,
    aggregator: ContentAggregator,
    ledger: Mutex<Vec<CostRecord>>,
    started_at: Instant,
    sweeper: Mutex<Option<SweepHandle>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl IntegrationManager {
    /// Build the manager and start its background tasks (cache sweeper,
    /// health monitor).
    ///
    /// Must be called from within a Tokio runtime, since the background
    /// tasks are spawned during construction.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Self::build(config, Arc::new(CacheManager::new()))
    }

    /// Like [`new`](Self::new), with a shared cache tier behind the local
    /// one. Must also be called from within a Tokio runtime.
    pub fn with_shared_store(
        config: GatewayConfig,
        store: Arc<dyn crate::cache::shared::SharedStore>,
    ) -> Result<Self> {
        Self::build(config, Arc::new(CacheManager::with_shared_store(store)))
    }

    fn build(config: GatewayConfig, cache: Arc<CacheManager>) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new());
        let classifier = Arc::new(ErrorClassifier::new());

        let mut llm_clients = Vec::new();
        for id in config.providers_of_kind(ProviderKind::Llm) {
            let provider_config = config.providers[&id].clone();
            llm_clients.push(Arc::new(LlmClient::new(Self::provider_client(
                &id,
                provider_config,
                &limiter,
                &cache,
                &classifier,
            )?)));
        }

        let mut news_clients = Vec::new();
        for id in config.providers_of_kind(ProviderKind::News) {
            let provider_config = config.providers[&id].clone();
            news_clients.push(Arc::new(NewsClient::new(
                Self::provider_client(&id, provider_config, &limiter, &cache, &classifier)?,
                config.aggregator.source_profiles.clone(),
            )));
        }

        let aggregator = ContentAggregator::new(news_clients.clone(), config.aggregator.clone());
        let sweeper = cache.spawn_sweeper(config.cache_sweep_interval());

        let manager = Self {
            config,
            cache,
            limiter,
            llm_clients,
            news_clients,
            aggregator,
            ledger: Mutex::new(Vec::new()),
            started_at: Instant::now(),
            sweeper: Mutex::new(Some(sweeper)),
            monitor: Mutex::new(None),
        };
        manager.spawn_health_monitor();

        info!(
            llm_providers = manager.llm_clients.len(),
            news_providers = manager.news_clients.len(),
            "integration manager initialized"
        );
        Ok(manager)
    }

    fn provider_client(
        id: &str,
        config: crate::config::ProviderConfig,
        limiter: &Arc<RateLimiter>,
        cache: &Arc<CacheManager>,
        classifier: &Arc<ErrorClassifier>,
    ) -> Result<ProviderClient> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        // Breaker thresholds are per provider, so each client gets its own
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        Ok(ProviderClient::new(
            id,
            config,
            transport,
            Arc::clone(limiter),
            breaker,
            Arc::clone(cache),
            Arc::clone(classifier),
        ))
    }

    /// Generate a personalized briefing from fresh aggregated content.
    ///
    /// LLM synthesis falls back through the configured providers in order;
    /// when none succeeds the briefing degrades to extractive cards instead
    /// of failing.
    pub async fn generate_briefing(&self, options: &BriefingOptions) -> Result<Briefing> {
        let started = Instant::now();

        let spent = self.today_spend();
        if spent >= self.config.daily_budget_usd {
            return Err(GatewayError::BudgetExhausted(format!(
                "${:.2} spent of ${:.2}",
                spent, self.config.daily_budget_usd
            )));
        }

        let mut categories: Vec<String> =
            options.interests.iter().map(|i| i.to_lowercase()).collect();
        if options.include_financial && !categories.iter().any(|c| c == "business") {
            categories.push("business".to_string());
        }

        let request = SearchRequest {
            query: options.interests.join(" "),
            categories,
            max_results: options.max_articles.max(1) * FETCH_HEADROOM,
            min_credibility: None,
            recency_window_hours: None,
            cancel: options.cancel.clone(),
        };
        let result = self.aggregator.search(&request).await?;

        // Interests re-rank the candidate pool before it is cut down
        let preferences = UserPreferences {
            interests: options
                .interests
                .iter()
                .map(|i| (i.to_lowercase(), 1.0))
                .collect(),
            ..Default::default()
        };
        let mut items = self.aggregator.personalize(result.items, &preferences);
        items.truncate(options.max_articles);

        let mut cards = Vec::new();
        let mut total_cost = 0.0;
        let mut tokens_used = 0u64;
        let mut llm_provider = None;

        if !items.is_empty() {
            match self
                .summarize_with_fallback(&items, options.tone, options.cancel.clone())
                .await
            {
                Some((provider, content, usage, cost)) => {
                    total_cost = cost;
                    tokens_used = usage.total_tokens;
                    cards.push(overview_card(&items, content));
                    llm_provider = Some(provider);
                }
                None => {
                    warn!("all LLM providers failed, emitting extractive briefing");
                }
            }
            cards.extend(items.iter().map(extractive_card));
        }

        let sources_used = distinct_sources(&items);
        Ok(Briefing {
            cards,
            metadata: BriefingMetadata {
                total_cost_usd: total_cost,
                generation_time_ms: started.elapsed().as_millis() as u64,
                sources_used,
                tokens_used,
                degraded: result.degraded || (llm_provider.is_none() && !items.is_empty()),
                llm_provider,
            },
        })
    }

    /// Search aggregated content, optionally with an LLM synthesis of the
    /// top results. Search itself is never blocked by the budget; only the
    /// analysis call is skipped once the budget is spent.
    pub async fn search_content(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<SearchOutcome> {
        let started = Instant::now();
        let request = SearchRequest {
            query: query.to_string(),
            categories: options.categories.clone(),
            max_results: options.max_results,
            min_credibility: None,
            recency_window_hours: None,
            cancel: options.cancel.clone(),
        };
        let result = self.aggregator.search(&request).await?;

        let analysis = if options.include_analysis && !result.items.is_empty() {
            if self.today_spend() >= self.config.daily_budget_usd {
                warn!("daily budget spent, skipping search analysis");
                None
            } else {
                self.summarize_with_fallback(&result.items, options.tone, options.cancel.clone())
                    .await
                    .map(|(_, content, _, _)| content)
            }
        } else {
            None
        };

        Ok(SearchOutcome {
            result,
            analysis,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Try each enabled LLM provider in order until one produces a summary
    async fn summarize_with_fallback(
        &self,
        items: &[ContentItem],
        tone: Tone,
        cancel: Option<CancelToken>,
    ) -> Option<(String, String, TokenUsage, f64)> {
        for llm in self.llm_clients.iter().filter(|c| c.is_enabled()) {
            match llm
                .summarize_articles(items, tone, SUMMARY_MAX_WORDS, cancel.clone())
                .await
            {
                Ok(response) => {
                    let config = llm.client().config();
                    let cost = response.usage.prompt_tokens as f64 / 1_000_000.0
                        * config.cost_per_million_input_tokens
                        + response.usage.completion_tokens as f64 / 1_000_000.0
                            * config.cost_per_million_output_tokens;
                    self.record_cost(llm.id(), cost, response.usage.total_tokens);
                    return Some((llm.id().to_string(), response.content, response.usage, cost));
                }
                Err(e) => {
                    warn!(provider = %llm.id(), "LLM summarization failed: {}", e);
                }
            }
        }
        None
    }

    /// Poll every provider plus the cache tier
    pub async fn system_health(&self) -> SystemHealth {
        let checks = self
            .llm_clients
            .iter()
            .map(|c| c.client())
            .chain(self.news_clients.iter().map(|c| c.client()))
            .map(|client| client.health_check());
        let providers = join_all(checks).await;

        let overall = providers
            .iter()
            .map(|h| h.status)
            .fold(ProviderStatus::Healthy, worse_of);

        SystemHealth {
            overall,
            providers,
            cache: self.cache.health_check().await,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Spend report for the current UTC day
    pub fn cost_analysis(&self) -> CostAnalysis {
        let today = Utc::now().date_naive();
        let ledger = self.ledger.lock().unwrap();

        let mut by_provider: HashMap<String, f64> = HashMap::new();
        for record in ledger.iter().filter(|r| r.timestamp.date_naive() == today) {
            *by_provider.entry(record.provider.clone()).or_insert(0.0) += record.cost_usd;
        }
        drop(ledger);
        let today_usd: f64 = by_provider.values().sum();

        let budget = self.config.daily_budget_usd;
        let mut alerts = Vec::new();
        if today_usd >= budget {
            alerts.push(format!(
                "daily budget exhausted: ${:.2} spent of ${:.2}",
                today_usd, budget
            ));
        } else if today_usd >= self.config.cost_alert_threshold * budget {
            alerts.push(format!(
                "spend at {:.0}% of daily budget (${:.2} of ${:.2})",
                today_usd / budget * 100.0,
                today_usd,
                budget
            ));
        }

        let mut recommendations = Vec::new();
        if let Some((top, spend)) = by_provider
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        {
            if today_usd > 0.0 && spend / today_usd > 0.7 {
                recommendations.push(format!(
                    "provider '{}' accounts for {:.0}% of today's spend, consider a cheaper model or tier",
                    top,
                    spend / today_usd * 100.0
                ));
            }
        }
        if !alerts.is_empty() {
            recommendations
                .push("raise cache TTLs or reduce briefing frequency to lower spend".to_string());
        }

        CostAnalysis {
            today_usd,
            daily_budget_usd: budget,
            by_provider,
            alerts,
            recommendations,
        }
    }

    /// Append one entry to the cost ledger
    pub fn record_cost(&self, provider: &str, cost_usd: f64, tokens: u64) {
        if cost_usd <= 0.0 {
            return;
        }
        self.ledger.lock().unwrap().push(CostRecord {
            provider: provider.to_string(),
            cost_usd,
            tokens,
            timestamp: Utc::now(),
        });
    }

    fn today_spend(&self) -> f64 {
        let today = Utc::now().date_naive();
        self.spend_on(today)
    }

    fn spend_on(&self, day: NaiveDate) -> f64 {
        self.ledger
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.timestamp.date_naive() == day)
            .map(|r| r.cost_usd)
            .sum()
    }

    fn spawn_health_monitor(&self) {
        let interval = self.config.health_check_interval();
        let clients: Vec<Arc<LlmClient>> = self.llm_clients.clone();
        let news: Vec<Arc<NewsClient>> = self.news_clients.clone();
        let limiter = Arc::clone(&self.limiter);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for client in clients.iter().map(|c| c.client()).chain(news.iter().map(|c| c.client())) {
                    let health = client.health_check().await;
                    if health.status != ProviderStatus::Healthy {
                        warn!(
                            provider = %health.provider,
                            status = ?health.status,
                            error_rate = health.error_rate,
                            "provider health degraded"
                        );
                    }
                }
                limiter.purge_idle();
            }
        });
        *self.monitor.lock().unwrap() = Some(handle);
    }

    /// Stop background tasks. Also runs on drop.
    pub fn shutdown(&self) {
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(sweeper) = self.sweeper.lock().unwrap().take() {
            sweeper.shutdown();
        }
    }
}

impl Drop for IntegrationManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worse_of(a: ProviderStatus, b: ProviderStatus) -> ProviderStatus {
    use ProviderStatus::*;
    match (a, b) {
        (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
        (Degraded, _) | (_, Degraded) => Degraded,
        _ => Healthy,
    }
}

fn distinct_sources(items: &[ContentItem]) -> Vec<String> {
    let mut sources: Vec<String> = items.iter().map(|i| i.source_id.clone()).collect();
    sources.sort();
    sources.dedup();
    sources
}

/// Lead card synthesizing the whole item set
fn overview_card(items: &[ContentItem], summary: String) -> BriefingCard {
    let credibility = if items.is_empty() {
        0.0
    } else {
        items.iter().map(|i| i.credibility_score).sum::<f64>() / items.len() as f64
    };
    BriefingCard {
        id: Uuid::new_v4().to_string(),
        headline: "Today's briefing".to_string(),
        summary,
        category: "overview".to_string(),
        source_ids: distinct_sources(items),
        credibility,
        bias_label: BiasLabel::Neutral,
    }
}

/// Card built from the article text alone, used when no LLM is available
fn extractive_card(item: &ContentItem) -> BriefingCard {
    let summary: String = match item.body.char_indices().nth(280) {
        Some((idx, _)) => format!("{}…", &item.body[..idx]),
        None => item.body.clone(),
    };
    BriefingCard {
        id: item.id.clone(),
        headline: item.title.clone(),
        summary,
        category: item.category.clone(),
        source_ids: vec![item.source_id.clone()],
        credibility: item.credibility_score,
        bias_label: item.bias_label,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn empty_manager() -> IntegrationManager {
        IntegrationManager::new(GatewayConfig::default()).unwrap()
    }

    fn item(id: &str, source: &str, credibility: f64) -> ContentItem {
        ContentItem {
            id: id.to_string(),
            title: format!("Headline for {}", id),
            body: "Body text long enough to build an extractive summary from.".to_string(),
            source_id: source.to_string(),
            published_at: Utc::now(),
            credibility_score: credibility,
            bias_label: BiasLabel::Center,
            bias_score: 0.0,
            relevance_score: 0.0,
            category: "business".to_string(),
            tags: vec![],
            url: None,
        }
    }

    #[tokio::test]
    async fn test_budget_exhaustion_blocks_briefing() {
        let mut config = GatewayConfig::default();
        config.daily_budget_usd = 1.0;
        let manager = IntegrationManager::new(config).unwrap();
        manager.record_cost("openai", 1.5, 1000);

        let err = manager
            .generate_briefing(&BriefingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BudgetExhausted(_)));
    }

    #[tokio::test]
    async fn test_briefing_with_no_providers_is_empty() {
        let manager = empty_manager();
        let briefing = manager
            .generate_briefing(&BriefingOptions::default())
            .await
            .unwrap();
        assert!(briefing.cards.is_empty());
        assert!(briefing.metadata.llm_provider.is_none());
        assert!((briefing.metadata.total_cost_usd).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_cost_analysis_alerts() {
        let mut config = GatewayConfig::default();
        config.daily_budget_usd = 10.0;
        config.cost_alert_threshold = 0.8;
        let manager = IntegrationManager::new(config).unwrap();

        manager.record_cost("openai", 8.5, 100);
        let analysis = manager.cost_analysis();
        assert!((analysis.today_usd - 8.5).abs() < 1e-9);
        assert_eq!(analysis.alerts.len(), 1);
        assert!(analysis.alerts[0].contains("85%"));

        manager.record_cost("openai", 2.0, 100);
        let analysis = manager.cost_analysis();
        assert!(analysis.alerts[0].contains("exhausted"));
        assert!(!analysis.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_ledger_only_counts_today() {
        let manager = empty_manager();
        manager.record_cost("openai", 2.0, 100);
        manager
            .ledger
            .lock()
            .unwrap()
            .push(CostRecord {
                provider: "openai".to_string(),
                cost_usd: 50.0,
                tokens: 0,
                timestamp: Utc::now() - ChronoDuration::days(2),
            });

        assert!((manager.today_spend() - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_zero_cost_not_recorded() {
        let manager = empty_manager();
        manager.record_cost("openai", 0.0, 100);
        assert!(manager.ledger.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_system_health_with_no_providers() {
        let manager = empty_manager();
        let health = manager.system_health().await;
        assert_eq!(health.overall, ProviderStatus::Healthy);
        assert!(health.providers.is_empty());
    }

    #[test]
    fn test_worse_of_ordering() {
        use ProviderStatus::*;
        assert_eq!(worse_of(Healthy, Degraded), Degraded);
        assert_eq!(worse_of(Degraded, Unhealthy), Unhealthy);
        assert_eq!(worse_of(Healthy, Healthy), Healthy);
    }

    #[test]
    fn test_extractive_card_truncates() {
        let mut long = item("a", "src", 80.0);
        long.body = "x".repeat(500);
        let card = extractive_card(&long);
        assert!(card.summary.chars().count() <= 281);
        assert!(card.summary.ends_with('…'));

        let short = item("b", "src", 80.0);
        let card = extractive_card(&short);
        assert_eq!(card.summary, short.body);
    }

    #[test]
    fn test_overview_card_averages_credibility() {
        let items = vec![item("a", "s1", 90.0), item("b", "s2", 70.0)];
        let card = overview_card(&items, "summary".to_string());
        assert!((card.credibility - 80.0).abs() < f64::EPSILON);
        assert_eq!(card.source_ids, vec!["s1".to_string(), "s2".to_string()]);
    }
}
