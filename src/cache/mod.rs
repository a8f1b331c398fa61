//! Two-tier response cache with TTL and tag-based bulk invalidation
//!
//! Reads check the shared external tier first and fall back to the local
//! in-process tier on miss or store unavailability. Writes land in both tiers
//! when the shared store is reachable, local-only otherwise. Local entries are
//! evicted lazily on read and proactively by a scheduled sweep, so memory
//! stays bounded under low read traffic.

pub mod shared;

use crate::metrics::METRICS;
use dashmap::DashMap;
use serde_json::Value;
pub use shared::{InMemorySharedStore, SharedStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Local tier entry
#[derive(Debug, Clone)]
struct LocalEntry {
    value: Value,
    expires_at: Instant,
    tags: Vec<String>,
}

/// Cache tier health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheHealth {
    /// Both tiers operational
    Healthy,
    /// Only the local tier is working
    Degraded,
}

/// Local tier statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
}

/// Two-tier cache manager
pub struct CacheManager {
    local: DashMap<String, LocalEntry>,
    /// tag -> key -> entry expiry. Kept consistent with entries: removed
    /// together on delete, delete_by_tag, and sweep.
    tags: DashMap<String, HashMap<String, Instant>>,
    shared: Option<Arc<dyn SharedStore>>,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheManager {
    /// Local-tier-only cache
    pub fn new() -> Self {
        Self {
            local: DashMap::new(),
            tags: DashMap::new(),
            shared: None,
        }
    }

    /// Cache backed by a shared external store
    pub fn with_shared_store(store: Arc<dyn SharedStore>) -> Self {
        Self {
            local: DashMap::new(),
            tags: DashMap::new(),
            shared: Some(store),
        }
    }

    /// Look up a key, shared tier first
    pub async fn get(&self, key: &str) -> Option<Value> {
        if let Some(store) = &self.shared {
            match store.get(key).await {
                Ok(Some(value)) => {
                    METRICS.record_cache_lookup(true);
                    return Some(value);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("shared cache tier unavailable on read: {}", e);
                }
            }
        }

        let hit = self.get_local(key);
        METRICS.record_cache_lookup(hit.is_some());
        hit
    }

    fn get_local(&self, key: &str) -> Option<Value> {
        if let Some(entry) = self.local.get(key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        // Expired, remove it
        self.remove_local(key);
        None
    }

    /// Store a value in both tiers with a TTL and optional tags
    pub async fn set(&self, key: &str, value: Value, ttl: Duration, tags: &[String]) {
        let expires_at = Instant::now() + ttl;

        // Drop the previous entry first so its tag registrations don't
        // outlive it
        self.remove_local(key);
        self.local.insert(
            key.to_string(),
            LocalEntry {
                value: value.clone(),
                expires_at,
                tags: tags.to_vec(),
            },
        );
        for tag in tags {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string(), expires_at);
        }

        if let Some(store) = &self.shared {
            if let Err(e) = store.set(key, value, ttl).await {
                warn!("shared cache tier unavailable on write, local only: {}", e);
                METRICS.cache_degraded.inc();
            }
        }
    }

    /// Remove a key from both tiers
    pub async fn delete(&self, key: &str) {
        self.remove_local(key);
        if let Some(store) = &self.shared {
            if let Err(e) = store.delete(key).await {
                warn!("shared cache tier unavailable on delete: {}", e);
            }
        }
    }

    /// Remove every key registered under a tag, plus the tag index entry
    pub async fn delete_by_tag(&self, tag: &str) {
        let keys: Vec<String> = self
            .tags
            .remove(tag)
            .map(|(_, members)| members.into_keys().collect())
            .unwrap_or_default();

        debug!("invalidating {} entries tagged {}", keys.len(), tag);
        for key in keys {
            // Full removal, so the key is also deregistered from any other
            // tags it was stored under
            self.remove_local(&key);
            if let Some(store) = &self.shared {
                if let Err(e) = store.delete(&key).await {
                    warn!("shared cache tier unavailable on tag delete: {}", e);
                }
            }
        }
    }

    /// Whether a key is currently visible in either tier
    pub async fn exists(&self, key: &str) -> bool {
        if let Some(store) = &self.shared {
            if let Ok(Some(_)) = store.get(key).await {
                return true;
            }
        }
        self.local
            .get(key)
            .map(|e| e.expires_at > Instant::now())
            .unwrap_or(false)
    }

    /// Healthy only when the shared tier answers a ping
    pub async fn health_check(&self) -> CacheHealth {
        match &self.shared {
            Some(store) if store.ping().await.is_ok() => CacheHealth::Healthy,
            _ => CacheHealth::Degraded,
        }
    }

    fn remove_local(&self, key: &str) {
        if let Some((_, entry)) = self.local.remove(key) {
            for tag in &entry.tags {
                if let Some(mut members) = self.tags.get_mut(tag) {
                    members.remove(key);
                }
            }
        }
    }

    /// Evict expired local entries and prune the tag index
    pub fn sweep_local(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .local
            .iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.key().clone())
            .collect();
        for key in &expired {
            self.remove_local(key);
        }

        self.tags.retain(|_, members| {
            members.retain(|_, expires_at| *expires_at > now);
            !members.is_empty()
        });

        if !expired.is_empty() {
            debug!("cache sweep evicted {} expired entries", expired.len());
        }
    }

    /// Local tier statistics
    pub fn local_stats(&self) -> CacheStats {
        let now = Instant::now();
        let total = self.local.len();
        let valid = self
            .local
            .iter()
            .filter(|e| e.expires_at > now)
            .count();
        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
        }
    }

    /// Start the periodic local-tier sweep. The returned handle owns the
    /// task; dropping or shutting it down stops the sweep.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweepHandle {
        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                cache.sweep_local();
            }
        });
        SweepHandle { handle }
    }
}

/// Owned handle for the background sweep task
pub struct SweepHandle {
    handle: JoinHandle<()>,
}

impl SweepHandle {
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::shared::InMemorySharedStore;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_and_get_local_only() {
        let cache = CacheManager::new();
        cache
            .set("k", json!("v"), Duration::from_secs(60), &[])
            .await;
        assert_eq!(cache.get("k").await, Some(json!("v")));
        assert!(cache.exists("k").await);
    }

    #[tokio::test]
    async fn test_ttl_visibility_boundary() {
        let cache = CacheManager::new();
        cache
            .set("k", json!("v"), Duration::from_millis(80), &[])
            .await;

        // Well inside the TTL
        assert_eq!(cache.get("k").await, Some(json!("v")));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(!cache.exists("k").await);
    }

    #[tokio::test]
    async fn test_tag_invalidation_completeness() {
        let cache = CacheManager::new();
        let tags = vec!["a".to_string()];
        cache
            .set("k1", json!(1), Duration::from_secs(60), &tags)
            .await;
        cache
            .set("k2", json!(2), Duration::from_secs(60), &tags)
            .await;
        cache
            .set("k3", json!(3), Duration::from_secs(60), &["b".to_string()])
            .await;

        cache.delete_by_tag("a").await;

        assert!(!cache.exists("k1").await);
        assert!(!cache.exists("k2").await);
        assert!(cache.exists("k3").await);
    }

    #[tokio::test]
    async fn test_delete_prunes_tag_index() {
        let cache = CacheManager::new();
        cache
            .set("k1", json!(1), Duration::from_secs(60), &["a".to_string()])
            .await;
        cache.delete("k1").await;

        // Re-adding and invalidating by tag must not touch unrelated keys
        cache
            .set("k2", json!(2), Duration::from_secs(60), &[])
            .await;
        cache.delete_by_tag("a").await;
        assert!(cache.exists("k2").await);
        assert!(!cache.exists("k1").await);
    }

    #[tokio::test]
    async fn test_multi_tag_delete_deregisters_other_tags() {
        let cache = CacheManager::new();
        cache
            .set(
                "k",
                json!(1),
                Duration::from_secs(60),
                &["a".to_string(), "b".to_string()],
            )
            .await;
        cache.delete_by_tag("a").await;

        // The entry is gone from "b" as well, so a later untagged value
        // under the same key must survive invalidating "b"
        cache
            .set("k", json!(2), Duration::from_secs(60), &[])
            .await;
        cache.delete_by_tag("b").await;
        assert_eq!(cache.get("k").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_tag_registration() {
        let cache = CacheManager::new();
        cache
            .set("k", json!(1), Duration::from_secs(60), &["a".to_string()])
            .await;
        cache
            .set("k", json!(2), Duration::from_secs(60), &["b".to_string()])
            .await;

        // The old tag no longer reaches the entry, the new one does
        cache.delete_by_tag("a").await;
        assert_eq!(cache.get("k").await, Some(json!(2)));
        cache.delete_by_tag("b").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_shared_tier_read_first() {
        let store = Arc::new(InMemorySharedStore::new());
        let cache = CacheManager::with_shared_store(store.clone());

        // Value present only in the shared tier, as after a process restart
        store
            .set("k", json!("shared"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await, Some(json!("shared")));
    }

    #[tokio::test]
    async fn test_degraded_write_falls_back_to_local() {
        let store = Arc::new(InMemorySharedStore::new());
        let cache = CacheManager::with_shared_store(store.clone());

        store.set_failing(true);
        cache
            .set("k", json!("v"), Duration::from_secs(60), &[])
            .await;

        assert_eq!(cache.health_check().await, CacheHealth::Degraded);
        // Read still served from the local tier
        assert_eq!(cache.get("k").await, Some(json!("v")));

        store.set_failing(false);
        assert_eq!(cache.health_check().await, CacheHealth::Healthy);
    }

    #[tokio::test]
    async fn test_local_only_reports_degraded() {
        let cache = CacheManager::new();
        assert_eq!(cache.health_check().await, CacheHealth::Degraded);
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired() {
        let cache = CacheManager::new();
        cache
            .set("old", json!(1), Duration::from_millis(20), &["t".to_string()])
            .await;
        cache
            .set("new", json!(2), Duration::from_secs(60), &["t".to_string()])
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.sweep_local();

        let stats = cache.local_stats();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.expired_entries, 0);
        // Tag index pruned along with the entry
        let members: usize = cache.tags.get("t").map(|m| m.len()).unwrap_or(0);
        assert_eq!(members, 1);
    }

    #[tokio::test]
    async fn test_sweeper_task_runs() {
        let cache = Arc::new(CacheManager::new());
        cache
            .set("k", json!(1), Duration::from_millis(20), &[])
            .await;

        let handle = cache.spawn_sweeper(Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(cache.local_stats().total_entries, 0);
        handle.shutdown();
    }
}
