//! Gateway error taxonomy
//!
//! Raw transport failures are converted exactly once, at the boundary where
//! they are caught, into a [`ClassifiedError`] by the classifier. Everything
//! above the transport works with the closed [`GatewayError`] enum.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Error severity, escalated by the classifier as repeats accumulate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Closed error class taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Authentication,
    RateLimit,
    QuotaExceeded,
    TransientNetwork,
    Validation,
    UnknownProvider,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::Validation => "validation",
            ErrorKind::UnknownProvider => "unknown_provider",
        }
    }
}

/// A provider failure after classification. Immutable once constructed.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{provider}: {} ({detail})", kind.as_str())]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub provider: String,
    pub retryable: bool,
    pub http_status: Option<u16>,
    pub severity: Severity,
    /// Backoff hint parsed from provider response metadata, when present
    pub retry_after: Option<Duration>,
    pub detail: String,
}

/// Raw failure shape produced by transports, before classification
#[derive(Debug, Clone)]
pub enum RawError {
    Http {
        status: u16,
        body: String,
        /// Parsed Retry-After header, seconds
        retry_after_secs: Option<u64>,
    },
    Network {
        detail: String,
        timeout: bool,
    },
    InvalidResponse(String),
    Validation(String),
}

/// Top-level gateway error
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("provider {0} is disabled")]
    ProviderDisabled(String),

    #[error("circuit open for provider {0}")]
    CircuitOpen(String),

    #[error("rate limited for {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error(transparent)]
    Provider(#[from] ClassifiedError),

    #[error("all providers failed ({})", .0.len())]
    AllProvidersFailed(Vec<ClassifiedError>),

    #[error("daily budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether retrying the same call could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Provider(e) => e.retryable,
            GatewayError::RateLimited { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
