//! Content aggregation pipeline
//!
//! Fans one logical request out across every enabled news client, then runs
//! the merged candidates through filtering, deduplication, ranking, and an
//! optional personalization pass. A single provider failure degrades the
//! result instead of failing it; the request only errors when every enabled
//! provider fails. Output ordering is deterministic for a fixed input set
//! (ties broken by item id).

use crate::client::news::{NewsClient, NewsQuery};
use crate::config::AggregatorConfig;
use crate::error::{ClassifiedError, ErrorKind, GatewayError, Result, Severity};
use crate::metrics::METRICS;
use crate::models::{
    AggregatedResult, BiasLabel, ContentItem, DuplicateRecord, ResultSummary, Trend,
};
use crate::retry::CancelToken;
use chrono::{Duration as ChronoDuration, DurationRound, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Number of leading normalized title words used as the dedup bucket key
const SIMILARITY_KEY_WORDS: usize = 5;

/// One logical aggregation request
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub categories: Vec<String>,
    pub max_results: usize,
    pub min_credibility: Option<f64>,
    pub recency_window_hours: Option<i64>,
    pub cancel: Option<CancelToken>,
}

/// Per-user re-ranking inputs
#[derive(Debug, Clone, Default)]
pub struct UserPreferences {
    /// Category or tag -> interest weight
    pub interests: HashMap<String, f64>,
    pub preferred_sources: Vec<String>,
    pub blocked_sources: Vec<String>,
    pub bias_preference: Option<BiasLabel>,
}

/// Fans out, merges, and ranks content from all enabled news clients
pub struct ContentAggregator {
    clients: Vec<Arc<NewsClient>>,
    config: AggregatorConfig,
}

impl ContentAggregator {
    pub fn new(clients: Vec<Arc<NewsClient>>, config: AggregatorConfig) -> Self {
        Self { clients, config }
    }

    /// Run the full pipeline for one request
    pub async fn search(&self, request: &SearchRequest) -> Result<AggregatedResult> {
        let started = Instant::now();

        let (candidates, failures) = self.fan_out(request).await;
        let failed_providers: Vec<String> = failures.iter().map(|(id, _)| id.clone()).collect();

        if candidates.is_empty() && !failures.is_empty() {
            METRICS
                .aggregation_requests
                .with_label_values(&["error"])
                .inc();
            return Err(GatewayError::AllProvidersFailed(
                failures.into_iter().map(|(_, e)| e).collect(),
            ));
        }

        let total_in = candidates.len();
        let filtered = self.basic_filter(candidates, request);
        let (deduped, duplicates_removed) = self.deduplicate(filtered);
        let cleaned = self.content_filter(deduped);
        let mut ranked = self.rank(cleaned, &request.query);

        if request.max_results > 0 && ranked.len() > request.max_results {
            ranked.truncate(request.max_results);
        }

        let trends = Self::trends(&ranked);
        let summary = Self::summarize(&ranked);

        debug!(
            candidates = total_in,
            kept = ranked.len(),
            duplicates = duplicates_removed.len(),
            failed_providers = failed_providers.len(),
            "aggregation complete"
        );
        METRICS
            .aggregation_requests
            .with_label_values(&["success"])
            .inc();
        METRICS
            .aggregation_duration
            .with_label_values(&["search"])
            .observe(started.elapsed().as_secs_f64());

        Ok(AggregatedResult {
            items: ranked,
            duplicates_removed,
            trends,
            summary,
            degraded: !failed_providers.is_empty(),
            failed_providers,
        })
    }

    /// Issue the request to every enabled client concurrently. Failures are
    /// collected separately; one slow or failing provider never blocks the
    /// others past the per-call timeout.
    async fn fan_out(
        &self,
        request: &SearchRequest,
    ) -> (Vec<ContentItem>, Vec<(String, ClassifiedError)>) {
        let window_hours = request
            .recency_window_hours
            .unwrap_or(self.config.recency_window_hours);
        // Truncated to the hour so repeated searches produce identical
        // provider cache keys within it
        let from = (Utc::now() - ChronoDuration::hours(window_hours))
            .duration_trunc(ChronoDuration::hours(1))
            .unwrap_or_else(|_| Utc::now() - ChronoDuration::hours(window_hours));
        let query = NewsQuery {
            query: request.query.clone(),
            categories: request.categories.clone(),
            max_results: request.max_results,
            from: Some(from),
            to: None,
        };
        let timeout = self.config.per_provider_timeout();

        let calls = self
            .clients
            .iter()
            .filter(|c| c.is_enabled())
            .map(|client| {
                let client = Arc::clone(client);
                let query = query.clone();
                let cancel = request.cancel.clone();
                async move {
                    let id = client.id().to_string();
                    if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                        return Err((id, cancelled_error(client.id())));
                    }
                    match tokio::time::timeout(timeout, client.search(&query, cancel)).await {
                        Ok(Ok(items)) => Ok(items),
                        Ok(Err(e)) => Err((id.clone(), to_classified(&id, e))),
                        Err(_) => Err((id.clone(), timeout_error(&id, timeout.as_millis()))),
                    }
                }
            });

        let mut items = Vec::new();
        let mut failures = Vec::new();
        for outcome in join_all(calls).await {
            match outcome {
                Ok(mut provider_items) => items.append(&mut provider_items),
                Err((id, err)) => {
                    warn!(provider = %id, "provider excluded from aggregation: {}", err);
                    METRICS
                        .provider_fanout_failures
                        .with_label_values(&[&id])
                        .inc();
                    failures.push((id, err));
                }
            }
        }
        (items, failures)
    }

    /// Drop items with missing/too-short text, low credibility, or stale
    /// publication time
    fn basic_filter(&self, items: Vec<ContentItem>, request: &SearchRequest) -> Vec<ContentItem> {
        let min_credibility = request
            .min_credibility
            .unwrap_or(self.config.min_credibility);
        let window_hours = request
            .recency_window_hours
            .unwrap_or(self.config.recency_window_hours);
        let cutoff = Utc::now() - ChronoDuration::hours(window_hours);

        items
            .into_iter()
            .filter(|item| {
                item.title.split_whitespace().count() >= self.config.min_title_words
                    && item.body.len() >= self.config.min_body_chars
                    && item.credibility_score >= min_credibility
                    && item.published_at >= cutoff
            })
            .collect()
    }

    /// Keep the newest of each near-duplicate cluster and record the rest.
    /// Running this stage on its own output finds nothing further to drop.
    fn deduplicate(&self, mut items: Vec<ContentItem>) -> (Vec<ContentItem>, Vec<DuplicateRecord>) {
        // Newest first so the kept representative is always the freshest
        items.sort_by(|a, b| b.published_at.cmp(&a.published_at).then(a.id.cmp(&b.id)));

        let mut kept: Vec<ContentItem> = Vec::with_capacity(items.len());
        let mut drops: HashMap<String, Vec<String>> = HashMap::new();
        // Bucket index into `kept` by similarity key
        let mut buckets: HashMap<String, Vec<usize>> = HashMap::new();

        for item in items {
            let key = similarity_key(&item.title);
            let bucket = buckets.entry(key).or_default();

            let duplicate_of = bucket.iter().copied().find(|&idx| {
                title_similarity(&kept[idx].title, &item.title) >= self.config.similarity_threshold
            });

            match duplicate_of {
                Some(idx) => {
                    drops
                        .entry(kept[idx].id.clone())
                        .or_default()
                        .push(item.id.clone());
                }
                None => {
                    bucket.push(kept.len());
                    kept.push(item);
                }
            }
        }

        let mut records: Vec<DuplicateRecord> = kept
            .iter()
            .filter_map(|item| {
                drops.remove(&item.id).map(|dropped_ids| DuplicateRecord {
                    kept_id: item.id.clone(),
                    dropped_ids,
                })
            })
            .collect();
        records.sort_by(|a, b| a.kept_id.cmp(&b.kept_id));

        let dropped_total: usize = records.iter().map(|r| r.dropped_ids.len()).sum();
        METRICS.items_deduplicated.inc_by(dropped_total as f64);

        (kept, records)
    }

    /// Reject prohibited terms, excessive bias, and clickbait titles
    fn content_filter(&self, items: Vec<ContentItem>) -> Vec<ContentItem> {
        items
            .into_iter()
            .filter(|item| {
                let text = format!("{} {}", item.title, item.body).to_lowercase();
                let title = item.title.to_lowercase();

                !self
                    .config
                    .prohibited_terms
                    .iter()
                    .any(|term| text.contains(&term.to_lowercase()))
                    && item.bias_score.abs() <= self.config.max_bias_score
                    && !self
                        .config
                        .clickbait_terms
                        .iter()
                        .any(|term| title.contains(&term.to_lowercase()))
            })
            .collect()
    }

    /// Composite scoring: credibility, query relevance, recency decay, and a
    /// source diversity bonus, weighted per configuration
    fn rank(&self, mut items: Vec<ContentItem>, query: &str) -> Vec<ContentItem> {
        let weights = &self.config.weights;
        let query_terms: Vec<String> = normalize_words(query);
        let window_hours = self.config.recency_window_hours.max(1) as f64;

        let mut source_counts: HashMap<String, usize> = HashMap::new();
        for item in &items {
            *source_counts.entry(item.source_id.clone()).or_insert(0) += 1;
        }

        let now = Utc::now();
        for item in items.iter_mut() {
            let credibility = (item.credibility_score / 100.0).clamp(0.0, 1.0);

            let haystack = format!("{} {}", item.title, item.body).to_lowercase();
            let relevance = if query_terms.is_empty() {
                0.5
            } else {
                let matched = query_terms
                    .iter()
                    .filter(|t| haystack.contains(t.as_str()))
                    .count();
                matched as f64 / query_terms.len() as f64
            };

            let age_hours = (now - item.published_at).num_minutes() as f64 / 60.0;
            let recency = (1.0 - age_hours / window_hours).clamp(0.0, 1.0);

            let diversity = 1.0 / source_counts[&item.source_id] as f64;

            let score = weights.credibility * credibility
                + weights.relevance * relevance
                + weights.recency * recency
                + weights.diversity * diversity;
            item.relevance_score = (score * 100.0).clamp(0.0, 100.0);
        }

        items.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        items
    }

    /// Optional second scoring pass with per-user interest weights
    pub fn personalize(
        &self,
        items: Vec<ContentItem>,
        preferences: &UserPreferences,
    ) -> Vec<ContentItem> {
        let mut items: Vec<ContentItem> = items
            .into_iter()
            .filter(|item| !preferences.blocked_sources.contains(&item.source_id))
            .collect();

        for item in items.iter_mut() {
            let mut multiplier = 1.0;
            if let Some(weight) = preferences.interests.get(&item.category) {
                multiplier += weight;
            }
            for tag in &item.tags {
                if let Some(weight) = preferences.interests.get(tag) {
                    multiplier += weight * 0.5;
                }
            }

            let mut bonus = 0.0;
            if preferences.preferred_sources.contains(&item.source_id) {
                bonus += 10.0;
            }
            if preferences.bias_preference == Some(item.bias_label) {
                bonus += 5.0;
            }

            item.relevance_score = (item.relevance_score * multiplier + bonus).clamp(0.0, 100.0);
        }

        items.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        items
    }

    fn trends(items: &[ContentItem]) -> Vec<Trend> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for item in items {
            *counts.entry(item.category.clone()).or_insert(0) += 1;
        }
        let mut trends: Vec<Trend> = counts
            .into_iter()
            .map(|(topic, count)| Trend { topic, count })
            .collect();
        trends.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.topic.cmp(&b.topic)));
        trends
    }

    fn summarize(items: &[ContentItem]) -> ResultSummary {
        let average_credibility = if items.is_empty() {
            0.0
        } else {
            items.iter().map(|i| i.credibility_score).sum::<f64>() / items.len() as f64
        };

        let mut bias_distribution: HashMap<String, usize> = HashMap::new();
        for item in items {
            *bias_distribution
                .entry(item.bias_label.as_str().to_string())
                .or_insert(0) += 1;
        }

        ResultSummary {
            average_credibility,
            bias_distribution,
        }
    }
}

/// First few normalized title words, the coarse dedup bucket key
fn similarity_key(title: &str) -> String {
    normalize_words(title)
        .into_iter()
        .take(SIMILARITY_KEY_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Word-overlap ratio of two titles (Jaccard over normalized word sets)
fn title_similarity(a: &str, b: &str) -> f64 {
    let set_a: std::collections::HashSet<String> = normalize_words(a).into_iter().collect();
    let set_b: std::collections::HashSet<String> = normalize_words(b).into_iter().collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

fn normalize_words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}

fn to_classified(provider: &str, err: GatewayError) -> ClassifiedError {
    match err {
        GatewayError::Provider(e) => e,
        other => ClassifiedError {
            kind: ErrorKind::UnknownProvider,
            provider: provider.to_string(),
            retryable: false,
            http_status: None,
            severity: Severity::Low,
            retry_after: None,
            detail: other.to_string(),
        },
    }
}

fn timeout_error(provider: &str, timeout_ms: u128) -> ClassifiedError {
    ClassifiedError {
        kind: ErrorKind::TransientNetwork,
        provider: provider.to_string(),
        retryable: true,
        http_status: None,
        severity: Severity::Medium,
        retry_after: None,
        detail: format!("fan-out call exceeded {}ms", timeout_ms),
    }
}

fn cancelled_error(provider: &str) -> ClassifiedError {
    ClassifiedError {
        kind: ErrorKind::UnknownProvider,
        provider: provider.to_string(),
        retryable: false,
        http_status: None,
        severity: Severity::Low,
        retry_after: None,
        detail: "request cancelled before dispatch".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn aggregator() -> ContentAggregator {
        ContentAggregator::new(Vec::new(), AggregatorConfig::default())
    }

    fn item(id: &str, title: &str, hours_ago: i64, credibility: f64, source: &str) -> ContentItem {
        ContentItem {
            id: id.to_string(),
            title: title.to_string(),
            body: "A sufficiently long article body with enough detail to pass the basic \
                   length filter applied during aggregation."
                .to_string(),
            source_id: source.to_string(),
            published_at: Utc::now() - ChronoDuration::hours(hours_ago),
            credibility_score: credibility,
            bias_label: BiasLabel::Center,
            bias_score: 0.0,
            relevance_score: 0.0,
            category: "business".to_string(),
            tags: vec![],
            url: None,
        }
    }

    #[test]
    fn test_basic_filter_drops_short_and_stale() {
        let agg = aggregator();
        let request = SearchRequest {
            min_credibility: Some(60.0),
            ..Default::default()
        };

        let mut short_title = item("a", "Hi", 1, 90.0, "s1");
        short_title.title = "Hi".to_string();
        let mut empty_body = item("b", "A perfectly fine headline here", 1, 90.0, "s1");
        empty_body.body = "too short".to_string();
        let low_cred = item("c", "A perfectly fine headline here", 1, 40.0, "s1");
        let stale = item("d", "A perfectly fine headline here", 500, 90.0, "s1");
        let good = item("e", "A perfectly fine headline here", 1, 90.0, "s1");

        let kept = agg.basic_filter(
            vec![short_title, empty_body, low_cred, stale, good],
            &request,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "e");
    }

    #[test]
    fn test_dedup_keeps_newest_and_records_drops() {
        let agg = aggregator();
        let newest = item("n", "Central bank raises interest rates again", 1, 80.0, "s1");
        let older = item("o", "Central bank raises interest rates again today", 5, 80.0, "s2");
        let unrelated = item("u", "Completely different story about sports teams", 2, 80.0, "s3");

        let (kept, records) = agg.deduplicate(vec![older.clone(), newest.clone(), unrelated]);

        assert_eq!(kept.len(), 2);
        assert!(kept.iter().any(|i| i.id == "n"));
        assert!(kept.iter().all(|i| i.id != "o"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kept_id, "n");
        assert_eq!(records[0].dropped_ids, vec!["o".to_string()]);
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let agg = aggregator();
        let input = vec![
            item("a", "Central bank raises interest rates again", 1, 80.0, "s1"),
            item("b", "Central bank raises interest rates again today", 5, 80.0, "s2"),
            item("c", "Completely different story about sports teams", 2, 80.0, "s3"),
        ];
        let input_len = input.len();

        let (first_pass, records) = agg.deduplicate(input);
        let dropped: usize = records.iter().map(|r| r.dropped_ids.len()).sum();
        assert_eq!(dropped, input_len - first_pass.len());

        let first_ids: Vec<String> = first_pass.iter().map(|i| i.id.clone()).collect();
        let (second_pass, second_records) = agg.deduplicate(first_pass);
        let second_ids: Vec<String> = second_pass.iter().map(|i| i.id.clone()).collect();

        assert_eq!(first_ids, second_ids);
        assert!(second_records.is_empty());
    }

    #[test]
    fn test_content_filter_rejects_bias_and_clickbait() {
        let mut config = AggregatorConfig::default();
        config.prohibited_terms = vec!["gambling".to_string()];
        let agg = ContentAggregator::new(Vec::new(), config);

        let mut biased = item("a", "A perfectly reasonable headline about events", 1, 80.0, "s1");
        biased.bias_score = 95.0;
        let clickbait = item("b", "You won't believe what happened next here", 1, 80.0, "s1");
        let mut prohibited = item("c", "Another normal headline about daily events", 1, 80.0, "s1");
        prohibited.body.push_str(" gambling");
        let good = item("d", "A normal story about the city council", 1, 80.0, "s1");

        let kept = agg.content_filter(vec![biased, clickbait, prohibited, good]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "d");
    }

    #[test]
    fn test_rank_orders_by_composite_score() {
        let agg = aggregator();
        let strong = item("a", "Fed rate decision shakes markets", 1, 95.0, "s1");
        let weak = item("b", "Garden show draws record visitors", 60, 40.0, "s2");

        let ranked = agg.rank(vec![weak, strong], "fed rate markets");
        assert_eq!(ranked[0].id, "a");
        assert!(ranked[0].relevance_score > ranked[1].relevance_score);
    }

    #[test]
    fn test_rank_ties_broken_by_id() {
        let agg = aggregator();
        let now = Utc::now();
        let mut x = item("x", "Same headline for both stories here", 0, 70.0, "s1");
        let mut y = item("y", "Same headline for both stories here", 0, 70.0, "s1");
        x.published_at = now;
        y.published_at = now;

        let ranked = agg.rank(vec![y, x], "irrelevant query terms");
        assert_eq!(ranked[0].id, "x");
        assert_eq!(ranked[1].id, "y");
    }

    #[test]
    fn test_personalize_applies_interest_and_blocks() {
        let agg = aggregator();
        let mut business = item("a", "Business story about quarterly earnings", 1, 80.0, "s1");
        business.relevance_score = 50.0;
        let mut sports = item("b", "Sports story about the local team", 1, 80.0, "s2");
        sports.category = "sports".to_string();
        sports.relevance_score = 50.0;
        let mut blocked = item("c", "Story from a blocked source outlet", 1, 80.0, "bad-src");
        blocked.relevance_score = 99.0;

        let preferences = UserPreferences {
            interests: HashMap::from([("business".to_string(), 0.5)]),
            preferred_sources: vec![],
            blocked_sources: vec!["bad-src".to_string()],
            bias_preference: None,
        };

        let result = agg.personalize(vec![business, sports, blocked], &preferences);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].id, "a");
        assert!(result[0].relevance_score > result[1].relevance_score);
    }

    #[test]
    fn test_trends_and_summary() {
        let mut sports = item("a", "Sports story about the local team", 1, 90.0, "s1");
        sports.category = "sports".to_string();
        sports.bias_label = BiasLabel::Left;
        let business1 = item("b", "Business story about quarterly earnings", 1, 70.0, "s2");
        let business2 = item("c", "Another business story about markets", 1, 80.0, "s3");

        let items = vec![sports, business1, business2];
        let trends = ContentAggregator::trends(&items);
        assert_eq!(trends[0].topic, "business");
        assert_eq!(trends[0].count, 2);

        let summary = ContentAggregator::summarize(&items);
        assert!((summary.average_credibility - 80.0).abs() < f64::EPSILON);
        assert_eq!(summary.bias_distribution["left"], 1);
        assert_eq!(summary.bias_distribution["center"], 2);
    }

    #[test]
    fn test_title_similarity() {
        let a = "Central bank raises interest rates again";
        let b = "Central bank raises interest rates again today";
        assert!(title_similarity(a, b) > 0.8);

        let c = "Completely different story about sports teams";
        assert!(title_similarity(a, c) < 0.2);
        assert!((title_similarity(a, a) - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_search_with_no_providers_fails() {
        let agg = aggregator();
        let err = agg.search(&SearchRequest::default()).await;
        // No candidates and no failures still yields an empty success; the
        // all-failed error needs at least one failing provider
        assert!(err.is_ok());
        assert!(err.unwrap().items.is_empty());
    }
}
