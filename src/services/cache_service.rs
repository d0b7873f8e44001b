use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::config::CacheConfig;

/// Cache pools with independent TTLs. Keys are namespaced per pool so
/// targeted invalidation can sweep one class of entries without touching
/// the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePool {
    Pods,
    Streams,
    SingleRecords,
    RecordLists,
}

impl CachePool {
    fn prefix(&self) -> &'static str {
        match self {
            CachePool::Pods => "pod",
            CachePool::Streams => "stream",
            CachePool::SingleRecords => "record",
            CachePool::RecordLists => "record_list",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[async_trait]
pub trait CacheAdapter: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Duration);
    async fn delete(&self, key: &str);
    /// Remove every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str);
    async fn clear(&self);
    async fn entry_count(&self) -> usize;
}

// ---------------------------------------------------------------------------
// In-memory adapter (default)
// ---------------------------------------------------------------------------

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Bounded in-process cache. Expired entries are dropped lazily on access;
/// when the bound is hit the soonest-expiring entry is evicted.
pub struct InMemoryCacheAdapter {
    entries: RwLock<HashMap<String, Entry>>,
    max_entries: usize,
}

impl InMemoryCacheAdapter {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }
}

#[async_trait]
impl CacheAdapter for InMemoryCacheAdapter {
    async fn get(&self, key: &str) -> Option<String> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(e) if e.expires_at > Instant::now() => return Some(e.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: drop it under the write lock.
        self.entries.write().await.remove(key);
        None
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            let now = Instant::now();
            entries.retain(|_, e| e.expires_at > now);
            if entries.len() >= self.max_entries {
                if let Some(victim) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&victim);
                }
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    async fn delete_prefix(&self, prefix: &str) {
        self.entries
            .write()
            .await
            .retain(|k, _| !k.starts_with(prefix));
    }

    async fn clear(&self) {
        self.entries.write().await.clear();
    }

    async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

// ---------------------------------------------------------------------------
// Redis adapter
// ---------------------------------------------------------------------------

pub struct RedisCacheAdapter {
    redis: redis::aio::ConnectionManager,
}

impl RedisCacheAdapter {
    pub fn new(redis: redis::aio::ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl CacheAdapter for RedisCacheAdapter {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.redis.clone();
        conn.get::<_, Option<String>>(key).await.ok().flatten()
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let mut conn = self.redis.clone();
        let _ = conn
            .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await;
    }

    async fn delete(&self, key: &str) {
        let mut conn = self.redis.clone();
        let _ = conn.del::<_, ()>(key).await;
    }

    async fn delete_prefix(&self, prefix: &str) {
        let mut conn = self.redis.clone();
        let pattern = format!("{}*", prefix);
        let keys: Vec<String> = match redis::cmd("KEYS").arg(&pattern).query_async(&mut conn).await
        {
            Ok(keys) => keys,
            Err(_) => return,
        };
        if !keys.is_empty() {
            let _ = conn.del::<_, ()>(keys).await;
        }
    }

    async fn clear(&self) {
        let mut conn = self.redis.clone();
        let _ = redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await;
    }

    async fn entry_count(&self) -> usize {
        let mut conn = self.redis.clone();
        redis::cmd("DBSIZE")
            .query_async::<i64>(&mut conn)
            .await
            .map(|n| n as usize)
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// CacheService
// ---------------------------------------------------------------------------

/// Write-through cache over a pluggable adapter. A `None` adapter turns
/// every operation into a no-op so call sites never branch on whether
/// caching is enabled.
#[derive(Clone)]
pub struct CacheService {
    adapter: Option<Arc<dyn CacheAdapter>>,
    config: CacheConfig,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl CacheService {
    pub fn new(adapter: Option<Arc<dyn CacheAdapter>>, config: CacheConfig) -> Self {
        Self {
            adapter,
            config,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn disabled(&self) -> bool {
        self.adapter.is_none()
    }

    fn ttl_for(&self, pool: CachePool) -> Duration {
        let secs = match pool {
            CachePool::Pods => self.config.pod_ttl_secs,
            CachePool::Streams => self.config.stream_ttl_secs,
            CachePool::SingleRecords => self.config.record_ttl_secs,
            CachePool::RecordLists => self.config.list_ttl_secs,
        };
        Duration::from_secs(secs)
    }

    fn full_key(pool: CachePool, key: &str) -> String {
        format!("{}:{}", pool.prefix(), key)
    }

    pub async fn get<T: DeserializeOwned>(&self, pool: CachePool, key: &str) -> Option<T> {
        let adapter = self.adapter.as_ref()?;
        match adapter.get(&Self::full_key(pool, key)).await {
            Some(raw) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                serde_json::from_str(&raw).ok()
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, pool: CachePool, key: &str, value: &T) {
        let Some(adapter) = self.adapter.as_ref() else {
            return;
        };
        let Ok(raw) = serde_json::to_string(value) else {
            return;
        };
        adapter
            .set(&Self::full_key(pool, key), raw, self.ttl_for(pool))
            .await;
    }

    pub async fn delete(&self, pool: CachePool, key: &str) {
        if let Some(adapter) = self.adapter.as_ref() {
            adapter.delete(&Self::full_key(pool, key)).await;
        }
    }

    pub async fn delete_prefix(&self, pool: CachePool, prefix: &str) {
        if let Some(adapter) = self.adapter.as_ref() {
            adapter.delete_prefix(&Self::full_key(pool, prefix)).await;
        }
    }

    pub async fn clear(&self) {
        if let Some(adapter) = self.adapter.as_ref() {
            adapter.clear().await;
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = match self.adapter.as_ref() {
            Some(a) => a.entry_count().await,
            None => 0,
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }

    /// Cache-aside helper: get from cache or fetch and cache.
    pub async fn get_or_set<T, F, Fut>(
        &self,
        pool: CachePool,
        key: &str,
        fetch: F,
    ) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        if let Some(cached) = self.get::<T>(pool, key).await {
            return Ok(cached);
        }
        let value = fetch().await?;
        self.set(pool, key, &value).await;
        Ok(value)
    }

    // -----------------------------------------------------------------
    // Targeted invalidation, always after the authoritative write commits
    // -----------------------------------------------------------------

    /// Pod changed or deleted: flush the pod entry, every stream in the
    /// pod, and all dependent record/list entries.
    pub async fn invalidate_pod(&self, pod: &str) {
        self.delete(CachePool::Pods, pod).await;
        self.delete_prefix(CachePool::Pods, "domain:").await;
        self.delete_prefix(CachePool::Streams, &format!("{}:", pod)).await;
        self.delete_prefix(CachePool::SingleRecords, &format!("{}:", pod))
            .await;
        self.delete_prefix(CachePool::RecordLists, &format!("{}:", pod))
            .await;
    }

    /// Stream created/deleted: flush the stream entry (and its subtree on
    /// delete) plus the stream's record and list entries.
    pub async fn invalidate_stream(&self, pod: &str, stream_id: &str, path: &str) {
        self.delete(CachePool::Streams, &keys::stream(pod, path)).await;
        self.delete_prefix(CachePool::Streams, &format!("{}:{}/", pod, path))
            .await;
        self.delete_prefix(CachePool::SingleRecords, &format!("{}:{}:", pod, stream_id))
            .await;
        self.delete_prefix(CachePool::RecordLists, &format!("{}:{}:", pod, stream_id))
            .await;
    }

    /// Record appended/deleted/purged: flush the name's entry and every
    /// list view of the stream.
    pub async fn invalidate_record(&self, pod: &str, stream_id: &str, name: &str) {
        self.delete(CachePool::SingleRecords, &keys::record(pod, stream_id, name))
            .await;
        self.delete_prefix(CachePool::RecordLists, &format!("{}:{}:", pod, stream_id))
            .await;
    }
}

/// Cache key generators
pub mod keys {
    pub fn pod(name: &str) -> String {
        name.to_string()
    }

    pub fn domain(host: &str) -> String {
        format!("domain:{}", host)
    }

    pub fn stream(pod: &str, path: &str) -> String {
        format!("{}:{}", pod, path)
    }

    pub fn record(pod: &str, stream_id: &str, name: &str) -> String {
        format!("{}:{}:{}", pod, stream_id, name)
    }

    pub fn record_list(pod: &str, stream_id: &str, variant: &str) -> String {
        format!("{}:{}:{}", pod, stream_id, variant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheAdapterKind, CacheConfig};

    fn test_config() -> CacheConfig {
        CacheConfig {
            adapter: CacheAdapterKind::InMemory,
            max_entries: 4,
            pod_ttl_secs: 60,
            stream_ttl_secs: 60,
            record_ttl_secs: 60,
            list_ttl_secs: 60,
        }
    }

    fn service() -> CacheService {
        CacheService::new(
            Some(Arc::new(InMemoryCacheAdapter::new(4))),
            test_config(),
        )
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let cache = service();
        cache.set(CachePool::Pods, "alice", &"v1".to_string()).await;
        let got: Option<String> = cache.get(CachePool::Pods, "alice").await;
        assert_eq!(got, Some("v1".to_string()));
    }

    #[tokio::test]
    async fn test_pools_are_namespaced() {
        let cache = service();
        cache.set(CachePool::Pods, "k", &1i32).await;
        cache.set(CachePool::Streams, "k", &2i32).await;
        assert_eq!(cache.get::<i32>(CachePool::Pods, "k").await, Some(1));
        assert_eq!(cache.get::<i32>(CachePool::Streams, "k").await, Some(2));
    }

    #[tokio::test]
    async fn test_expired_entries_miss() {
        let adapter = InMemoryCacheAdapter::new(4);
        adapter
            .set("k", "v".to_string(), Duration::from_millis(0))
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(adapter.get("k").await, None);
    }

    #[tokio::test]
    async fn test_bound_evicts() {
        let adapter = InMemoryCacheAdapter::new(2);
        adapter.set("a", "1".into(), Duration::from_secs(60)).await;
        adapter.set("b", "2".into(), Duration::from_secs(60)).await;
        adapter.set("c", "3".into(), Duration::from_secs(60)).await;
        assert_eq!(adapter.entry_count().await, 2);
    }

    #[tokio::test]
    async fn test_prefix_invalidation() {
        let cache = service();
        cache
            .set(CachePool::RecordLists, "alice:s1:list", &1i32)
            .await;
        cache
            .set(CachePool::RecordLists, "alice:s2:list", &2i32)
            .await;
        cache.delete_prefix(CachePool::RecordLists, "alice:s1:").await;
        assert_eq!(
            cache.get::<i32>(CachePool::RecordLists, "alice:s1:list").await,
            None
        );
        assert_eq!(
            cache.get::<i32>(CachePool::RecordLists, "alice:s2:list").await,
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_record_invalidation_flushes_lists() {
        let cache = service();
        cache
            .set(CachePool::SingleRecords, &keys::record("alice", "s1", "r"), &1i32)
            .await;
        cache
            .set(CachePool::RecordLists, &keys::record_list("alice", "s1", "list:0:10"), &2i32)
            .await;
        cache.invalidate_record("alice", "s1", "r").await;
        assert_eq!(
            cache
                .get::<i32>(CachePool::SingleRecords, &keys::record("alice", "s1", "r"))
                .await,
            None
        );
        assert_eq!(
            cache
                .get::<i32>(CachePool::RecordLists, &keys::record_list("alice", "s1", "list:0:10"))
                .await,
            None
        );
    }

    #[tokio::test]
    async fn test_stats_count_hits_and_misses() {
        let cache = service();
        cache.set(CachePool::Pods, "a", &1i32).await;
        let _ = cache.get::<i32>(CachePool::Pods, "a").await;
        let _ = cache.get::<i32>(CachePool::Pods, "absent").await;
        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_is_noop() {
        let cache = CacheService::new(None, test_config());
        cache.set(CachePool::Pods, "a", &1i32).await;
        assert_eq!(cache.get::<i32>(CachePool::Pods, "a").await, None);
        assert!(cache.disabled());
    }
}
