//! Token-bucket rate limiting with multi-window quotas
//!
//! Buckets refill lazily on access, never from a background timer. Every
//! configured window (second/minute/hour/day) must allow a request
//! independently; the decision reports the most restrictive retry hint.
//! Callers get an immediate allow/deny and implement their own waiting.

use crate::config::RateLimitConfig;
use crate::metrics::METRICS;
use dashmap::DashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Quota window granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    Second,
    Minute,
    Hour,
    Day,
}

impl Window {
    fn duration(&self) -> Duration {
        match self {
            Window::Second => Duration::from_secs(1),
            Window::Minute => Duration::from_secs(60),
            Window::Hour => Duration::from_secs(3600),
            Window::Day => Duration::from_secs(86_400),
        }
    }
}

/// One token bucket. Invariant: `0 <= tokens <= capacity`.
#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_ms: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(limit: u32, window: Window, burst: u32) -> Self {
        // Burst headroom only applies to the tightest window
        let extra = if window == Window::Second { burst } else { 0 };
        let capacity = (limit + extra) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_ms: limit as f64 / window.duration().as_millis() as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.duration_since(self.last_refill).as_millis() as f64;
        if elapsed_ms > 0.0 {
            self.tokens = (self.tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn has(&self, n: f64) -> bool {
        self.tokens >= n
    }

    fn take(&mut self, n: f64) {
        self.tokens = (self.tokens - n).max(0.0);
    }

    fn put_back(&mut self, n: f64) {
        self.tokens = (self.tokens + n).min(self.capacity);
    }

    /// Time until `n` tokens will be available at the current refill rate
    fn time_until(&self, n: f64) -> Duration {
        if self.tokens >= n {
            return Duration::ZERO;
        }
        let missing = n - self.tokens;
        Duration::from_millis((missing / self.refill_per_ms).ceil() as u64)
    }
}

#[derive(Debug)]
struct KeyState {
    buckets: Vec<Bucket>,
    last_access: Instant,
}

impl KeyState {
    fn from_config(config: &RateLimitConfig) -> Self {
        let mut buckets = Vec::new();
        if let Some(limit) = config.per_second {
            buckets.push(Bucket::new(limit, Window::Second, config.burst));
        }
        if let Some(limit) = config.per_minute {
            buckets.push(Bucket::new(limit, Window::Minute, config.burst));
        }
        if let Some(limit) = config.per_hour {
            buckets.push(Bucket::new(limit, Window::Hour, config.burst));
        }
        if let Some(limit) = config.per_day {
            buckets.push(Bucket::new(limit, Window::Day, config.burst));
        }
        Self {
            buckets,
            last_access: Instant::now(),
        }
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    /// Minimum remaining tokens across configured windows
    pub tokens_remaining: u64,
    /// Most restrictive wait across denying windows, when denied
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            tokens_remaining: u64::MAX,
            retry_after: None,
        }
    }
}

const DEFAULT_IDLE_GC: Duration = Duration::from_secs(300);

/// Token-bucket rate limiter keyed by caller key (usually provider id)
pub struct RateLimiter {
    configs: DashMap<String, RateLimitConfig>,
    states: DashMap<String, Mutex<KeyState>>,
    idle_gc: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            configs: DashMap::new(),
            states: DashMap::new(),
            idle_gc: DEFAULT_IDLE_GC,
        }
    }

    pub fn with_idle_gc(mut self, idle_gc: Duration) -> Self {
        self.idle_gc = idle_gc;
        self
    }

    /// Register quota windows for a key. Unregistered keys are unlimited.
    pub fn register(&self, key: &str, config: RateLimitConfig) {
        if !config.is_unlimited() {
            self.configs.insert(key.to_string(), config);
        }
    }

    /// Check all configured windows for the key and consume one token from
    /// each when all allow. Denial consumes nothing.
    pub fn check_and_consume(&self, key: &str) -> RateDecision {
        let decision = self.consume_n(key, 1.0);
        METRICS.record_rate_limit(key, decision.allowed);
        decision
    }

    /// Pre-allocate `n` tokens before starting expensive work
    pub fn reserve(&self, key: &str, n: u32) -> RateDecision {
        self.consume_n(key, n as f64)
    }

    /// Return previously reserved tokens, e.g. on cancellation
    pub fn release(&self, key: &str, n: u32) {
        if let Some(state) = self.states.get(key) {
            let mut state = state.lock().unwrap();
            state.last_access = Instant::now();
            for bucket in state.buckets.iter_mut() {
                bucket.put_back(n as f64);
            }
        }
    }

    fn consume_n(&self, key: &str, n: f64) -> RateDecision {
        let config = match self.configs.get(key) {
            Some(c) => c.clone(),
            None => return RateDecision::unlimited(),
        };

        let state = self
            .states
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(KeyState::from_config(&config)));
        let mut state = state.lock().unwrap();

        let now = Instant::now();
        state.last_access = now;
        for bucket in state.buckets.iter_mut() {
            bucket.refill(now);
        }

        // All windows must allow before any consumes (logical AND)
        let denied: Vec<&Bucket> = state.buckets.iter().filter(|b| !b.has(n)).collect();
        if !denied.is_empty() {
            let retry_after = denied
                .iter()
                .map(|b| b.time_until(n))
                .max()
                .unwrap_or(Duration::ZERO);
            let remaining = state
                .buckets
                .iter()
                .map(|b| b.tokens.floor() as u64)
                .min()
                .unwrap_or(0);
            return RateDecision {
                allowed: false,
                tokens_remaining: remaining,
                retry_after: Some(retry_after),
            };
        }

        for bucket in state.buckets.iter_mut() {
            bucket.take(n);
        }
        let remaining = state
            .buckets
            .iter()
            .map(|b| b.tokens.floor() as u64)
            .min()
            .unwrap_or(u64::MAX);

        RateDecision {
            allowed: true,
            tokens_remaining: remaining,
            retry_after: None,
        }
    }

    /// Drop bucket state for keys idle past the inactivity window. Quota
    /// configuration survives; a purged key rebuilds full buckets on next use.
    pub fn purge_idle(&self) {
        let cutoff = self.idle_gc;
        self.states.retain(|_, state| {
            let state = state.lock().unwrap();
            state.last_access.elapsed() < cutoff
        });
    }

    /// Number of keys with live bucket state
    pub fn active_keys(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minute_config(limit: u32) -> RateLimitConfig {
        RateLimitConfig {
            per_minute: Some(limit),
            ..Default::default()
        }
    }

    #[test]
    fn test_unregistered_key_is_unlimited() {
        let limiter = RateLimiter::new();
        for _ in 0..100 {
            assert!(limiter.check_and_consume("anything").allowed);
        }
    }

    #[test]
    fn test_token_conservation() {
        // Per-minute refill is negligible over the test duration, so exactly
        // `capacity` calls may pass.
        let limiter = RateLimiter::new();
        limiter.register("prov", minute_config(5));

        let allowed = (0..20)
            .filter(|_| limiter.check_and_consume("prov").allowed)
            .count();
        assert_eq!(allowed, 5);
    }

    #[test]
    fn test_denial_reports_retry_after() {
        let limiter = RateLimiter::new();
        limiter.register("prov", minute_config(1));

        assert!(limiter.check_and_consume("prov").allowed);
        let denied = limiter.check_and_consume("prov");
        assert!(!denied.allowed);
        let wait = denied.retry_after.unwrap();
        assert!(wait > Duration::ZERO);
        // One token at 1/minute refill takes about a minute
        assert!(wait <= Duration::from_secs(61));
    }

    #[test]
    fn test_multi_window_and_semantics() {
        let limiter = RateLimiter::new();
        limiter.register(
            "prov",
            RateLimitConfig {
                per_second: Some(100),
                per_minute: Some(2),
                ..Default::default()
            },
        );

        assert!(limiter.check_and_consume("prov").allowed);
        assert!(limiter.check_and_consume("prov").allowed);
        // Second window still has plenty, but the minute window is empty
        assert!(!limiter.check_and_consume("prov").allowed);
    }

    #[test]
    fn test_denial_consumes_nothing() {
        let limiter = RateLimiter::new();
        limiter.register("prov", minute_config(2));

        assert!(limiter.check_and_consume("prov").allowed);
        assert!(limiter.check_and_consume("prov").allowed);
        let before = limiter.check_and_consume("prov");
        let after = limiter.check_and_consume("prov");
        assert!(!before.allowed);
        assert!(!after.allowed);
        assert_eq!(before.tokens_remaining, after.tokens_remaining);
    }

    #[test]
    fn test_reserve_and_release() {
        let limiter = RateLimiter::new();
        limiter.register("prov", minute_config(5));

        assert!(limiter.reserve("prov", 5).allowed);
        assert!(!limiter.check_and_consume("prov").allowed);

        limiter.release("prov", 5);
        assert!(limiter.check_and_consume("prov").allowed);
    }

    #[test]
    fn test_reserve_more_than_capacity_denied() {
        let limiter = RateLimiter::new();
        limiter.register("prov", minute_config(3));
        assert!(!limiter.reserve("prov", 4).allowed);
        // Nothing was consumed by the failed reserve
        assert!(limiter.reserve("prov", 3).allowed);
    }

    #[test]
    fn test_idle_gc_purges_state() {
        let limiter = RateLimiter::new().with_idle_gc(Duration::from_millis(50));
        limiter.register("prov", minute_config(5));

        limiter.check_and_consume("prov");
        assert_eq!(limiter.active_keys(), 1);

        std::thread::sleep(Duration::from_millis(80));
        limiter.purge_idle();
        assert_eq!(limiter.active_keys(), 0);

        // Quota config survives the purge
        assert!(limiter.check_and_consume("prov").allowed);
        assert_eq!(limiter.active_keys(), 1);
    }

    #[test]
    fn test_per_second_refill() {
        let limiter = RateLimiter::new();
        limiter.register(
            "prov",
            RateLimitConfig {
                per_second: Some(10),
                ..Default::default()
            },
        );

        while limiter.check_and_consume("prov").allowed {}
        std::thread::sleep(Duration::from_millis(250));
        // About 2.5 tokens refilled
        assert!(limiter.check_and_consume("prov").allowed);
        assert!(limiter.check_and_consume("prov").allowed);
    }
}
