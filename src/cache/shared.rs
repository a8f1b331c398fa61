//! Shared external cache tier
//!
//! The shared tier survives process restarts and is shared across instances
//! (a Redis-like store in production). It is assumed to provide its own
//! atomicity for single-key operations.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Shared store failure
#[derive(Debug, Clone, thiserror::Error)]
#[error("shared store error: {0}")]
pub struct StoreError(pub String);

/// External key-value tier with per-key TTL
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
}

/// In-memory [`SharedStore`] implementation.
///
/// Stands in for the external store in tests and single-process deployments;
/// `set_failing` simulates store outage for degraded-mode tests.
#[derive(Default)]
pub struct InMemorySharedStore {
    entries: DashMap<String, (Value, Instant)>,
    failing: AtomicBool,
}

impl InMemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail until cleared
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SharedStore for InMemorySharedStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.check_available()?;
        // Guard from `get` must be released before removing the expired entry
        let expired = match self.entries.get(key) {
            Some(entry) if entry.1 > Instant::now() => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError> {
        self.check_available()?;
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}
