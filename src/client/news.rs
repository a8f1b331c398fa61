//! News search provider client
//!
//! Translates search requests into the provider's query parameters and
//! normalizes response articles into [`ContentItem`]s. Credibility and bias
//! annotations come from a configurable per-source profile table, never from
//! hard-coded truth.

use super::{ProviderClient, RequestOptions, TransportRequest};
use crate::config::SourceProfile;
use crate::error::{ClassifiedError, ErrorKind, GatewayError, Result, Severity};
use crate::models::ContentItem;
use crate::retry::CancelToken;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

/// Logical news search request
#[derive(Debug, Clone, Default)]
pub struct NewsQuery {
    pub query: String,
    pub categories: Vec<String>,
    pub max_results: usize,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ArticlesResponse {
    articles: Vec<RawArticle>,
}

#[derive(Debug, Deserialize)]
struct RawArticle {
    #[serde(default)]
    id: Option<String>,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    source: Option<RawSource>,
    #[serde(alias = "publishedAt")]
    published_at: DateTime<Utc>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// News provider client
pub struct NewsClient {
    inner: ProviderClient,
    profiles: HashMap<String, SourceProfile>,
}

impl NewsClient {
    pub fn new(inner: ProviderClient, profiles: HashMap<String, SourceProfile>) -> Self {
        Self { inner, profiles }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    pub fn client(&self) -> &ProviderClient {
        &self.inner
    }

    /// Search for articles matching the query. Responses are cached per
    /// query under the provider's tag so a provider refresh can invalidate
    /// its entries in one call.
    pub async fn search(
        &self,
        query: &NewsQuery,
        cancel: Option<CancelToken>,
    ) -> Result<Vec<ContentItem>> {
        let mut params = vec![("q".to_string(), query.query.clone())];
        if query.max_results > 0 {
            params.push(("page_size".to_string(), query.max_results.to_string()));
        }
        if let Some(category) = query.categories.first() {
            params.push(("category".to_string(), category.clone()));
        }
        if let Some(from) = query.from {
            params.push(("from".to_string(), from.to_rfc3339()));
        }
        if let Some(to) = query.to {
            params.push(("to".to_string(), to.to_rfc3339()));
        }

        let request = TransportRequest::get("/v2/search").with_params(params);
        let options = RequestOptions {
            use_cache: true,
            cache_key: None,
            cache_tags: vec![
                "news".to_string(),
                format!("provider:{}", self.inner.id()),
            ],
            skip_rate_limit: false,
            cancel,
        };

        let response = self.inner.request(&request, &options).await?;
        let parsed: ArticlesResponse = serde_json::from_value(response.value).map_err(|e| {
            GatewayError::Provider(ClassifiedError {
                kind: ErrorKind::UnknownProvider,
                provider: self.inner.id().to_string(),
                retryable: false,
                http_status: None,
                severity: Severity::Low,
                retry_after: None,
                detail: format!("article decode: {}", e),
            })
        })?;

        Ok(parsed
            .articles
            .into_iter()
            .map(|raw| self.normalize(raw))
            .collect())
    }

    fn normalize(&self, raw: RawArticle) -> ContentItem {
        let source_id = raw
            .source
            .as_ref()
            .and_then(|s| s.id.clone().or_else(|| s.name.clone()))
            .unwrap_or_else(|| "unknown".to_string())
            .to_lowercase();

        let profile = self
            .profiles
            .get(&source_id)
            .cloned()
            .unwrap_or_default();

        let body = raw
            .content
            .or(raw.description)
            .unwrap_or_default();

        ContentItem {
            id: raw
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            title: raw.title,
            body,
            source_id,
            published_at: raw.published_at,
            credibility_score: profile.credibility,
            bias_label: profile.bias_label,
            bias_score: profile.bias_score,
            relevance_score: 0.0,
            category: raw.category.unwrap_or_else(|| "general".to_string()),
            tags: raw.tags,
            url: raw.url,
        }
    }
}
