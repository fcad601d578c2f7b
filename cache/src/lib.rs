//! Typed key→value cache with per-family TTLs and tagged invalidation.
//!
//! Three families are recognized, each with its own default TTL: `vector_hits`
//! (dense/lexical retrieval results, ~2h), `rerank_score` (cross-encoder scores,
//! ~30min), and `answer` (final generated answers, ~10min). Every write is
//! associated with a tag (`collection:<name>`); invalidating a tag evicts every key
//! written under it, which is how the indexer drops stale hits after a mutation.
//!
//! The backing store (in-process here; a remote cache server in a production
//! deployment) can be unreachable. When it is, every operation degrades to a no-op
//! instead of failing the caller — a cold cache is always correct, just slower.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use moka::future::Cache as MokaCache;
use moka::Expiry;

/// Default TTL for the `vector_hits` family: dense/lexical retrieval results.
pub const VECTOR_HITS_TTL: Duration = Duration::from_secs(2 * 60 * 60);
/// Default TTL for the `rerank_score` family: cross-encoder pairwise scores.
pub const RERANK_SCORE_TTL: Duration = Duration::from_secs(30 * 60);
/// Default TTL for the `answer` family: fully generated answers.
pub const ANSWER_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    ttl: Duration,
}

struct TtlExpiry;

impl<V> Expiry<String, Entry<V>> for TtlExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry<V>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// One cache family: a typed key→value store with a default TTL and a tag index
/// supporting bulk invalidation.
#[derive(Clone)]
pub struct TypedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    name: &'static str,
    default_ttl: Duration,
    inner: MokaCache<String, Entry<V>>,
    tags: Arc<DashMap<String, HashSet<String>>>,
    reachable: Arc<std::sync::atomic::AtomicBool>,
}

impl<V> TypedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, default_ttl: Duration, max_capacity: u64) -> Self {
        let inner = MokaCache::builder()
            .max_capacity(max_capacity)
            .expire_after(TtlExpiry)
            .build();
        Self {
            name,
            default_ttl,
            inner,
            tags: Arc::new(DashMap::new()),
            reachable: Arc::new(std::sync::atomic::AtomicBool::new(true)),
        }
    }

    /// Mark the backing store unreachable/reachable; while unreachable every
    /// operation degrades to a no-op rather than erroring.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable
            .store(reachable, std::sync::atomic::Ordering::Relaxed);
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        if !self.is_reachable() {
            tracing::debug!(cache = self.name, "cache unreachable, get is a no-op");
            return None;
        }
        self.inner.get(key).await.map(|e| e.value)
    }

    /// Insert `value` under `key`, tagging it with `tag` (typically
    /// `collection:<name>`) and expiring after `ttl` (falling back to the family
    /// default when `None`).
    pub async fn set(&self, key: impl Into<String>, value: V, tag: impl Into<String>, ttl: Option<Duration>) {
        if !self.is_reachable() {
            tracing::debug!(cache = self.name, "cache unreachable, set is a no-op");
            return;
        }
        let key = key.into();
        let tag = tag.into();
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.tags
            .entry(tag)
            .or_default()
            .insert(key.clone());
        self.inner.insert(key, Entry { value, ttl }).await;
    }

    /// Evict every key ever written under `tag`. Last-writer-wins: a key rewritten
    /// under a different tag after this call is not retroactively affected.
    pub async fn invalidate_tag(&self, tag: &str) {
        if !self.is_reachable() {
            tracing::debug!(cache = self.name, tag, "cache unreachable, invalidate_tag is a no-op");
            return;
        }
        if let Some((_, keys)) = self.tags.remove(tag) {
            for key in keys {
                self.inner.invalidate(&key).await;
            }
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

/// Collection-scoped tag helper: `collection:<name>`.
pub fn collection_tag(collection: &str) -> String {
    format!("collection:{collection}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let cache: TypedCache<i32> = TypedCache::new("test", Duration::from_secs(60), 100);
        cache.set("k1", 42, collection_tag("c1"), None).await;
        assert_eq!(cache.get("k1").await, Some(42));
    }

    #[tokio::test]
    async fn invalidate_tag_evicts_all_tagged_keys() {
        let cache: TypedCache<i32> = TypedCache::new("test", Duration::from_secs(60), 100);
        cache.set("k1", 1, collection_tag("c1"), None).await;
        cache.set("k2", 2, collection_tag("c1"), None).await;
        cache.set("k3", 3, collection_tag("c2"), None).await;
        cache.invalidate_tag(&collection_tag("c1")).await;
        cache.inner.run_pending_tasks().await;
        assert_eq!(cache.get("k1").await, None);
        assert_eq!(cache.get("k2").await, None);
        assert_eq!(cache.get("k3").await, Some(3));
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_silent_noop() {
        let cache: TypedCache<i32> = TypedCache::new("test", Duration::from_secs(60), 100);
        cache.set("k1", 1, collection_tag("c1"), None).await;
        cache.set_reachable(false);
        assert_eq!(cache.get("k1").await, None);
        cache.set_reachable(true);
        assert_eq!(cache.get("k1").await, Some(1));
    }
}
