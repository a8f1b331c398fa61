//! Provider client façade
//!
//! Every outbound call goes through the same sequence: cache check, rate
//! limit, circuit breaker, concurrency cap, transport with retry, then
//! classification and cache/metrics bookkeeping. Concrete provider clients
//! ([`llm::LlmClient`], [`news::NewsClient`]) only translate domain requests
//! into provider payloads; no resilience logic lives in them.

pub mod llm;
pub mod news;

use crate::cache::CacheManager;
use crate::classify::{ErrorClassifier, ProviderHealth, ProviderStatus};
use crate::config::ProviderConfig;
use crate::error::{GatewayError, RawError, Result};
use crate::metrics::METRICS;
use crate::models::RequestMetrics;
use crate::ratelimit::RateLimiter;
use crate::retry::breaker::CircuitBreaker;
use crate::retry::{CancelToken, RetryPolicy};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error};

/// Idempotent-read or mutating call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Transport-level request shape
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub endpoint: String,
    pub method: Method,
    pub params: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl TransportRequest {
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: Method::Get,
            params: Vec::new(),
            body: None,
        }
    }

    pub fn post(endpoint: impl Into<String>, body: Value) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: Method::Post,
            params: Vec::new(),
            body: Some(body),
        }
    }

    pub fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        self.params = params;
        self
    }
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub use_cache: bool,
    pub cache_key: Option<String>,
    pub cache_tags: Vec<String>,
    pub skip_rate_limit: bool,
    pub cancel: Option<CancelToken>,
}

impl RequestOptions {
    pub fn cached(tags: Vec<String>) -> Self {
        Self {
            use_cache: true,
            cache_tags: tags,
            ..Default::default()
        }
    }
}

/// Raw wire call, implemented per provider protocol
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn execute(&self, request: &TransportRequest) -> std::result::Result<Value, RawError>;
    /// Lightweight reachability probe
    async fn ping(&self) -> std::result::Result<(), RawError>;
}

/// Successful façade response
#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub value: Value,
    pub cached: bool,
    pub latency: Duration,
}

/// Health report for one provider client
#[derive(Debug, Clone)]
pub struct ClientHealth {
    pub provider: String,
    pub status: ProviderStatus,
    pub latency_ms: u64,
    pub error_rate: f64,
    pub recommendations: Vec<String>,
}

/// Resilience façade around one provider transport
pub struct ProviderClient {
    id: String,
    config: ProviderConfig,
    transport: Arc<dyn ProviderTransport>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<CacheManager>,
    classifier: Arc<ErrorClassifier>,
    retry: RetryPolicy,
    semaphore: Arc<Semaphore>,
    metrics: Mutex<RequestMetrics>,
}

impl ProviderClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        config: ProviderConfig,
        transport: Arc<dyn ProviderTransport>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        cache: Arc<CacheManager>,
        classifier: Arc<ErrorClassifier>,
    ) -> Self {
        let id = id.into();
        limiter.register(&id, config.rate_limit.clone());
        let retry = RetryPolicy::new(config.retry.clone());
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            id,
            config,
            transport,
            limiter,
            breaker,
            cache,
            classifier,
            retry,
            semaphore,
            metrics: Mutex::new(RequestMetrics::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Execute one request through the full resilience chain
    pub async fn request(
        &self,
        request: &TransportRequest,
        options: &RequestOptions,
    ) -> Result<ClientResponse> {
        if !self.config.enabled {
            return Err(GatewayError::ProviderDisabled(self.id.clone()));
        }

        let start = Instant::now();
        let cacheable =
            options.use_cache && self.config.cache.enabled && request.method == Method::Get;
        let cache_key = options
            .cache_key
            .clone()
            .unwrap_or_else(|| Self::default_cache_key(&self.id, request));

        if cacheable {
            if let Some(value) = self.cache.get(&cache_key).await {
                debug!(provider = %self.id, key = %cache_key, "cache hit");
                return Ok(ClientResponse {
                    value,
                    cached: true,
                    latency: start.elapsed(),
                });
            }
        }

        if !options.skip_rate_limit {
            let decision = self.limiter.check_and_consume(&self.id);
            if !decision.allowed {
                return Err(GatewayError::RateLimited {
                    provider: self.id.clone(),
                    retry_after: decision.retry_after,
                });
            }
        }

        if self.breaker.try_acquire(&self.id).is_err() {
            METRICS.circuit_open.with_label_values(&[&self.id]).inc();
            error!(provider = %self.id, "circuit open, rejecting request");
            return Err(GatewayError::CircuitOpen(self.id.clone()));
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        let transport = Arc::clone(&self.transport);
        let classifier = Arc::clone(&self.classifier);
        let breaker = Arc::clone(&self.breaker);
        let provider = self.id.clone();
        let req = request.clone();

        let outcome = self
            .retry
            .execute(&self.id, options.cancel.as_ref(), move || {
                let transport = Arc::clone(&transport);
                let classifier = Arc::clone(&classifier);
                let breaker = Arc::clone(&breaker);
                let provider = provider.clone();
                let req = req.clone();
                async move {
                    match transport.execute(&req).await {
                        Ok(value) => {
                            breaker.mark_success(&provider);
                            Ok(value)
                        }
                        Err(raw) => {
                            let classified = classifier.classify(&provider, &raw);
                            classifier.track(&classified);
                            breaker.mark_failure(&provider);
                            Err(classified)
                        }
                    }
                }
            })
            .await;

        let latency = start.elapsed();
        METRICS
            .provider_request_duration
            .with_label_values(&[&self.id])
            .observe(latency.as_secs_f64());

        match outcome {
            Ok(value) => {
                METRICS.record_provider_request(&self.id, true);
                self.metrics
                    .lock()
                    .unwrap()
                    .record(true, latency.as_millis() as f64);

                if cacheable {
                    self.cache
                        .set(
                            &cache_key,
                            value.clone(),
                            self.config.cache.ttl(),
                            &options.cache_tags,
                        )
                        .await;
                }

                Ok(ClientResponse {
                    value,
                    cached: false,
                    latency,
                })
            }
            Err(err) => {
                METRICS.record_provider_request(&self.id, false);
                self.metrics
                    .lock()
                    .unwrap()
                    .record(false, latency.as_millis() as f64);
                Err(err)
            }
        }
    }

    /// Lightweight reachability probe plus recent error statistics
    pub async fn health_check(&self) -> ClientHealth {
        let start = Instant::now();
        let ping = self.transport.ping().await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let ProviderHealth {
            status,
            error_rate,
            recommendations,
        } = self.classifier.provider_health(&self.id);

        let status = if ping.is_err() {
            ProviderStatus::Unhealthy
        } else {
            status
        };

        ClientHealth {
            provider: self.id.clone(),
            status,
            latency_ms,
            error_rate,
            recommendations,
        }
    }

    /// Snapshot of running request metrics
    pub fn request_metrics(&self) -> RequestMetrics {
        *self.metrics.lock().unwrap()
    }

    /// Add provider cost to the running totals
    pub fn record_cost(&self, cost_usd: f64) {
        if self.config.cost_tracking && cost_usd > 0.0 {
            self.metrics.lock().unwrap().total_cost_usd += cost_usd;
            METRICS.record_cost(&self.id, cost_usd);
        }
    }

    fn default_cache_key(id: &str, request: &TransportRequest) -> String {
        let mut key = format!("{}:{}", id, request.endpoint);
        for (name, value) in &request.params {
            key.push_str(&format!(":{}={}", name, value));
        }
        key
    }
}

/// Generic HTTP transport shared by all concrete providers
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    async fn execute(&self, request: &TransportRequest) -> std::result::Result<Value, RawError> {
        let url = format!("{}{}", self.base_url, request.endpoint);

        let mut req = match request.method {
            Method::Get => self.client.get(&url).query(&request.params),
            Method::Post => {
                let mut builder = self.client.post(&url);
                if let Some(body) = &request.body {
                    builder = builder.json(body);
                }
                builder
            }
        };
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req.send().await.map_err(|e| RawError::Network {
            detail: e.to_string(),
            timeout: e.is_timeout(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unreadable body".to_string());
            return Err(RawError::Http {
                status: status.as_u16(),
                body,
                retry_after_secs,
            });
        }

        response
            .json()
            .await
            .map_err(|e| RawError::InvalidResponse(e.to_string()))
    }

    async fn ping(&self) -> std::result::Result<(), RawError> {
        // Reachability only; an HTTP error status still means the host is up
        self.client
            .get(&self.base_url)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| RawError::Network {
                detail: e.to_string(),
                timeout: e.is_timeout(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderKind, RateLimitConfig, RetryConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport that fails a fixed number of times, then succeeds
    struct FlakyTransport {
        failures: usize,
        calls: AtomicUsize,
        raw: RawError,
    }

    impl FlakyTransport {
        fn failing_n(failures: usize, raw: RawError) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
                raw,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderTransport for FlakyTransport {
        async fn execute(
            &self,
            _request: &TransportRequest,
        ) -> std::result::Result<Value, RawError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.raw.clone())
            } else {
                Ok(json!({"ok": true}))
            }
        }

        async fn ping(&self) -> std::result::Result<(), RawError> {
            Ok(())
        }
    }

    fn test_config() -> ProviderConfig {
        let mut config = ProviderConfig::new(ProviderKind::News);
        config.retry = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        };
        config
    }

    fn build_client(config: ProviderConfig, transport: Arc<dyn ProviderTransport>) -> ProviderClient {
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        ProviderClient::new(
            "test-prov",
            config,
            transport,
            Arc::new(RateLimiter::new()),
            breaker,
            Arc::new(CacheManager::new()),
            Arc::new(ErrorClassifier::new()),
        )
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let transport = Arc::new(FlakyTransport::failing_n(
            2,
            RawError::Network {
                detail: "reset".to_string(),
                timeout: false,
            },
        ));
        let client = build_client(test_config(), transport.clone());

        let response = client
            .request(&TransportRequest::get("/x"), &RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(response.value, json!({"ok": true}));
        assert!(!response.cached);
        assert_eq!(transport.calls(), 3);
        assert_eq!(client.request_metrics().success_count, 1);
    }

    #[tokio::test]
    async fn test_auth_failure_not_retried() {
        let transport = Arc::new(FlakyTransport::failing_n(
            10,
            RawError::Http {
                status: 401,
                body: "bad key".to_string(),
                retry_after_secs: None,
            },
        ));
        let client = build_client(test_config(), transport.clone());

        let err = client
            .request(&TransportRequest::get("/x"), &RequestOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Provider(e) if !e.retryable));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_transport() {
        let transport = Arc::new(FlakyTransport::failing_n(
            0,
            RawError::Validation("unused".to_string()),
        ));
        let client = build_client(test_config(), transport.clone());
        let options = RequestOptions::cached(vec![]);
        let request = TransportRequest::get("/articles");

        let first = client.request(&request, &options).await.unwrap();
        assert!(!first.cached);
        let second = client.request(&request, &options).await.unwrap();
        assert!(second.cached);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_denial_is_fast() {
        let mut config = test_config();
        config.rate_limit = RateLimitConfig {
            per_minute: Some(1),
            ..Default::default()
        };
        let transport = Arc::new(FlakyTransport::failing_n(
            0,
            RawError::Validation("unused".to_string()),
        ));
        let client = build_client(config, transport.clone());

        client
            .request(&TransportRequest::get("/x"), &RequestOptions::default())
            .await
            .unwrap();
        let err = client
            .request(&TransportRequest::get("/x"), &RequestOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::RateLimited { .. }));
        // Denied before the transport was touched
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_and_rejects_without_network() {
        let mut config = test_config();
        config.retry.max_attempts = 1;
        config.breaker.failure_threshold = 2;
        let transport = Arc::new(FlakyTransport::failing_n(
            usize::MAX,
            RawError::Http {
                status: 503,
                body: "down".to_string(),
                retry_after_secs: None,
            },
        ));
        let client = build_client(config, transport.clone());

        for _ in 0..2 {
            let _ = client
                .request(&TransportRequest::get("/x"), &RequestOptions::default())
                .await;
        }
        let calls_before = transport.calls();

        let err = client
            .request(&TransportRequest::get("/x"), &RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen(_)));
        assert_eq!(transport.calls(), calls_before);
    }

    #[tokio::test]
    async fn test_disabled_provider_rejected() {
        let mut config = test_config();
        config.enabled = false;
        let transport = Arc::new(FlakyTransport::failing_n(
            0,
            RawError::Validation("unused".to_string()),
        ));
        let client = build_client(config, transport);

        let err = client
            .request(&TransportRequest::get("/x"), &RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ProviderDisabled(_)));
    }

    #[tokio::test]
    async fn test_health_check_reports_status() {
        let transport = Arc::new(FlakyTransport::failing_n(
            0,
            RawError::Validation("unused".to_string()),
        ));
        let client = build_client(test_config(), transport);

        let health = client.health_check().await;
        assert_eq!(health.provider, "test-prov");
        assert_eq!(health.status, ProviderStatus::Healthy);
    }

    #[tokio::test]
    async fn test_cost_recording() {
        let transport = Arc::new(FlakyTransport::failing_n(
            0,
            RawError::Validation("unused".to_string()),
        ));
        let client = build_client(test_config(), transport);
        client.record_cost(0.25);
        client.record_cost(0.5);
        assert!((client.request_metrics().total_cost_usd - 0.75).abs() < 1e-9);
    }
}
