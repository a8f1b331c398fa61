//! Error classification and per-provider failure tracking
//!
//! Raw transport errors become a [`ClassifiedError`] exactly once, at the
//! boundary where they are caught. The classifier also keeps a rolling
//! per-(provider, code) frequency window: severity escalates as the same
//! failure repeats, independent of the error's intrinsic class.

use crate::error::{ClassifiedError, ErrorKind, RawError, Severity};
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Provider health derived from recent error frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health report for one provider
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub status: ProviderStatus,
    /// Recent errors per minute over the rolling window
    pub error_rate: f64,
    pub recommendations: Vec<String>,
}

const ROLLING_WINDOW: Duration = Duration::from_secs(3600);
const UNHEALTHY_THRESHOLD: usize = 10;

/// Maps raw transport errors to the closed taxonomy and tracks frequency
pub struct ErrorClassifier {
    /// (provider, code) -> recent occurrence timestamps, pruned past the window
    counters: DashMap<(String, String), Vec<Instant>>,
    window: Duration,
    unhealthy_threshold: usize,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            window: ROLLING_WINDOW,
            unhealthy_threshold: UNHEALTHY_THRESHOLD,
        }
    }

    /// Shrink the rolling window (used by tests)
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Classify a raw transport error. Construction happens once; the result
    /// is immutable thereafter.
    pub fn classify(&self, provider: &str, raw: &RawError) -> ClassifiedError {
        let (kind, retryable, base_severity, http_status, retry_after) = match raw {
            RawError::Http { status, retry_after_secs, .. } => match status {
                401 | 403 => (ErrorKind::Authentication, false, Severity::High, Some(*status), None),
                402 => (ErrorKind::QuotaExceeded, false, Severity::High, Some(*status), None),
                429 => (
                    ErrorKind::RateLimit,
                    true,
                    Severity::Medium,
                    Some(*status),
                    retry_after_secs.map(Duration::from_secs),
                ),
                500..=599 => (ErrorKind::TransientNetwork, true, Severity::Low, Some(*status), None),
                400 | 422 => (ErrorKind::Validation, false, Severity::Low, Some(*status), None),
                _ => (ErrorKind::UnknownProvider, false, Severity::Low, Some(*status), None),
            },
            RawError::Network { timeout, .. } => {
                let sev = if *timeout { Severity::Medium } else { Severity::Low };
                (ErrorKind::TransientNetwork, true, sev, None, None)
            }
            RawError::InvalidResponse(_) => {
                (ErrorKind::UnknownProvider, false, Severity::Low, None, None)
            }
            RawError::Validation(_) => (ErrorKind::Validation, false, Severity::Low, None, None),
        };

        let code = Self::error_code(raw);
        let recent = self.recent_count(provider, &code);
        let severity = Self::escalate(base_severity, recent);

        ClassifiedError {
            kind,
            provider: provider.to_string(),
            retryable,
            http_status,
            severity,
            retry_after,
            detail: Self::detail(raw),
        }
    }

    /// Record a classified error in the rolling window
    pub fn track(&self, err: &ClassifiedError) {
        let code = err
            .http_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| err.kind.as_str().to_string());
        let key = (err.provider.clone(), code);
        let now = Instant::now();
        let cutoff = self.window;

        let mut entry = self.counters.entry(key).or_default();
        entry.push(now);
        entry.retain(|t| t.elapsed() < cutoff);
    }

    /// Aggregate recent errors into a health report with remediation hints
    pub fn provider_health(&self, provider: &str) -> ProviderHealth {
        let mut total = 0usize;
        let mut codes: Vec<String> = Vec::new();

        for entry in self.counters.iter() {
            let (prov, code) = entry.key();
            if prov != provider {
                continue;
            }
            let recent = entry.value().iter().filter(|t| t.elapsed() < self.window).count();
            if recent > 0 {
                total += recent;
                codes.push(code.clone());
            }
        }

        let status = if total == 0 {
            ProviderStatus::Healthy
        } else if total < self.unhealthy_threshold {
            ProviderStatus::Degraded
        } else {
            ProviderStatus::Unhealthy
        };

        ProviderHealth {
            status,
            error_rate: total as f64 / (self.window.as_secs_f64() / 60.0),
            recommendations: Self::recommendations(&codes, status),
        }
    }

    fn recent_count(&self, provider: &str, code: &str) -> usize {
        self.counters
            .get(&(provider.to_string(), code.to_string()))
            .map(|ts| ts.iter().filter(|t| t.elapsed() < self.window).count())
            .unwrap_or(0)
    }

    /// Severity grows with in-window repeats: 3+ bumps one level, 10+ two,
    /// capped at High (Critical stays reserved for intrinsic class)
    fn escalate(base: Severity, recent: usize) -> Severity {
        if base >= Severity::High {
            return base;
        }
        let bumps = if recent >= 10 {
            2
        } else if recent >= 3 {
            1
        } else {
            0
        };
        match (base, bumps) {
            (s, 0) => s,
            (Severity::Low, 1) => Severity::Medium,
            (Severity::Low, _) => Severity::High,
            (Severity::Medium, _) => Severity::High,
            (s, _) => s,
        }
    }

    fn error_code(raw: &RawError) -> String {
        match raw {
            RawError::Http { status, .. } => status.to_string(),
            RawError::Network { timeout: true, .. } => "timeout".to_string(),
            RawError::Network { .. } => "connection".to_string(),
            RawError::InvalidResponse(_) => "invalid_response".to_string(),
            RawError::Validation(_) => "validation".to_string(),
        }
    }

    fn detail(raw: &RawError) -> String {
        match raw {
            RawError::Http { status, body, .. } => format!("HTTP {}: {}", status, body),
            RawError::Network { detail, timeout } => {
                if *timeout {
                    format!("timeout: {}", detail)
                } else {
                    format!("network: {}", detail)
                }
            }
            RawError::InvalidResponse(detail) => format!("invalid response: {}", detail),
            RawError::Validation(detail) => format!("validation: {}", detail),
        }
    }

    fn recommendations(codes: &[String], status: ProviderStatus) -> Vec<String> {
        let mut out = Vec::new();
        if codes.iter().any(|c| c == "401" || c == "403") {
            out.push("rotate or verify the API key".to_string());
        }
        if codes.iter().any(|c| c == "429") {
            out.push("reduce request rate or raise the provider tier".to_string());
        }
        if codes.iter().any(|c| c == "402") {
            out.push("raise the billing quota or fail over to a backup provider".to_string());
        }
        if codes
            .iter()
            .any(|c| c == "timeout" || c == "connection" || c.starts_with('5'))
            && status == ProviderStatus::Unhealthy
        {
            out.push("fail over to a backup provider until upstream recovers".to_string());
        }
        out
    }
}
