//! Shared data model for provider responses and aggregated content

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Political lean label attached to a content item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BiasLabel {
    Left,
    Center,
    Right,
    Neutral,
}

impl BiasLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            BiasLabel::Left => "left",
            BiasLabel::Center => "center",
            BiasLabel::Right => "right",
            BiasLabel::Neutral => "neutral",
        }
    }
}

/// A news article or generated card, normalized across providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub title: String,
    pub body: String,
    pub source_id: String,
    pub published_at: DateTime<Utc>,
    /// Heuristic trustworthiness estimate, 0..=100
    pub credibility_score: f64,
    pub bias_label: BiasLabel,
    /// Heuristic lean estimate, -100..=100 (negative = left)
    pub bias_score: f64,
    /// Filled in by the aggregator's ranking stage, 0..=100
    pub relevance_score: f64,
    pub category: String,
    pub tags: Vec<String>,
    pub url: Option<String>,
}

/// One deduplication decision: the item kept and the near-duplicates dropped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateRecord {
    pub kept_id: String,
    pub dropped_ids: Vec<String>,
}

/// Topic frequency entry for the trends block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trend {
    pub topic: String,
    pub count: usize,
}

/// Aggregate statistics over the final item set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    pub average_credibility: f64,
    pub bias_distribution: HashMap<String, usize>,
}

/// Output of a full aggregation pass. Built fresh per request, never cached
/// as a whole (individual provider responses are cached instead).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub items: Vec<ContentItem>,
    pub duplicates_removed: Vec<DuplicateRecord>,
    pub trends: Vec<Trend>,
    pub summary: ResultSummary,
    /// True when at least one enabled provider failed and was excluded
    pub degraded: bool,
    pub failed_providers: Vec<String>,
}

/// Token accounting reported by an LLM provider
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Normalized LLM generation result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// Chat-completion style message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Briefing card derived from one or more content items
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BriefingCard {
    pub id: String,
    pub headline: String,
    pub summary: String,
    pub category: String,
    pub source_ids: Vec<String>,
    pub credibility: f64,
    pub bias_label: BiasLabel,
}

/// Running per-client request metrics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RequestMetrics {
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub average_latency_ms: f64,
    pub total_cost_usd: f64,
}

impl RequestMetrics {
    /// Fold one completed request into the running totals
    pub fn record(&mut self, success: bool, latency_ms: f64) {
        self.total_requests += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        // Running average over all requests
        let n = self.total_requests as f64;
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / n;
    }
}
