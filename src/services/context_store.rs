//! Tenant-scoped context store with LRU caching and batched writes.
//!
//! The authoritative data is a `tenant → namespace → key → value` map
//! owned by exactly one kernel. The LRU cache is a bounded projection of
//! that map, never the source of truth. With batching on, writes stage in
//! a queue that flushes on a debounce interval or on pause/complete;
//! reads always consult the staged queue before the cache.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

/// Configuration for the context store.
#[derive(Debug, Clone)]
pub struct ContextStoreConfig {
    /// Maximum LRU cache entries.
    pub cache_size: usize,
    /// Stage writes instead of applying them immediately.
    pub enable_batching: bool,
    /// Debounce interval for staged-write flushes.
    pub update_debounce_ms: u64,
}

impl Default for ContextStoreConfig {
    fn default() -> Self {
        Self {
            cache_size: 1_000,
            enable_batching: false,
            update_debounce_ms: 250,
        }
    }
}

/// Cache statistics exposed for tests and status surfaces.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextCacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Strict least-recently-used cache keyed by flattened context paths.
///
/// Eviction order is by last access; both reads and writes refresh an
/// entry's recency.
struct LruCache {
    capacity: usize,
    entries: HashMap<String, (Value, u64)>,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            clock: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn get(&mut self, key: &str) -> Option<Value> {
        self.clock += 1;
        let clock = self.clock;
        match self.entries.get_mut(key) {
            Some((value, stamp)) => {
                *stamp = clock;
                self.hits += 1;
                Some(value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn put(&mut self, key: String, value: Value) {
        self.clock += 1;
        let clock = self.clock;
        self.entries.insert(key, (value, clock));
        while self.entries.len() > self.capacity {
            self.evict_lru();
        }
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn evict_lru(&mut self) -> Option<String> {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, (_, stamp))| *stamp)
            .map(|(k, _)| k.clone())?;
        self.entries.remove(&oldest);
        self.evictions += 1;
        Some(oldest)
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn stats(&self) -> ContextCacheStats {
        ContextCacheStats {
            entries: self.entries.len(),
            capacity: self.capacity,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

#[derive(Debug, Clone)]
struct StagedWrite {
    tenant: String,
    namespace: String,
    key: String,
    value: Option<Value>,
}

struct StoreInner {
    data: HashMap<String, BTreeMap<String, BTreeMap<String, Value>>>,
    cache: LruCache,
    staged: VecDeque<StagedWrite>,
    last_flush: Instant,
}

/// Context store statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextStoreStats {
    pub tenants: usize,
    pub total_entries: usize,
    pub staged_writes: usize,
    pub cache: ContextCacheStats,
}

fn cache_key(tenant: &str, namespace: &str, key: &str) -> String {
    format!("{tenant}\u{1}{namespace}\u{1}{key}")
}

/// Tenant-scoped KV store backing kernel context.
pub struct ContextStore {
    config: ContextStoreConfig,
    inner: RwLock<StoreInner>,
}

impl ContextStore {
    pub fn new(config: ContextStoreConfig) -> Self {
        let cache_size = config.cache_size;
        Self {
            config,
            inner: RwLock::new(StoreInner {
                data: HashMap::new(),
                cache: LruCache::new(cache_size),
                staged: VecDeque::new(),
                last_flush: Instant::now(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ContextStoreConfig::default())
    }

    /// Write a value. With batching on, the write stages until the next
    /// flush; the cache is updated immediately so reads stay coherent.
    pub async fn set(&self, tenant: &str, namespace: &str, key: &str, value: Value) {
        let mut inner = self.inner.write().await;
        inner.cache.put(cache_key(tenant, namespace, key), value.clone());
        if self.config.enable_batching {
            inner.staged.push_back(StagedWrite {
                tenant: tenant.to_string(),
                namespace: namespace.to_string(),
                key: key.to_string(),
                value: Some(value),
            });
            self.maybe_flush_locked(&mut inner);
        } else {
            Self::apply(&mut inner.data, tenant, namespace, key, Some(value));
        }
    }

    /// Read a value: staged queue first, then cache, then the
    /// authoritative map (populating the cache on the way out).
    pub async fn get(&self, tenant: &str, namespace: &str, key: &str) -> Option<Value> {
        let mut inner = self.inner.write().await;

        if self.config.enable_batching {
            if let Some(staged) = inner
                .staged
                .iter()
                .rev()
                .find(|w| w.tenant == tenant && w.namespace == namespace && w.key == key)
            {
                return staged.value.clone();
            }
        }

        let ck = cache_key(tenant, namespace, key);
        if let Some(value) = inner.cache.get(&ck) {
            return Some(value);
        }

        let value = inner
            .data
            .get(tenant)
            .and_then(|ns| ns.get(namespace))
            .and_then(|kv| kv.get(key))
            .cloned();
        if let Some(ref v) = value {
            inner.cache.put(ck, v.clone());
        }
        value
    }

    /// Delete a key. Stages a tombstone when batching is on.
    pub async fn delete(&self, tenant: &str, namespace: &str, key: &str) {
        let mut inner = self.inner.write().await;
        inner.cache.remove(&cache_key(tenant, namespace, key));
        if self.config.enable_batching {
            inner.staged.push_back(StagedWrite {
                tenant: tenant.to_string(),
                namespace: namespace.to_string(),
                key: key.to_string(),
                value: None,
            });
        } else {
            Self::apply(&mut inner.data, tenant, namespace, key, None);
        }
    }

    /// Atomic read-modify-write increment. The store lock is held for the
    /// whole cycle, so concurrent increments never lose updates.
    pub async fn increment(&self, tenant: &str, namespace: &str, key: &str, delta: i64) -> i64 {
        let mut inner = self.inner.write().await;

        let staged_value = if self.config.enable_batching {
            inner
                .staged
                .iter()
                .rev()
                .find(|w| w.tenant == tenant && w.namespace == namespace && w.key == key)
                .and_then(|w| w.value.clone())
        } else {
            None
        };
        let current = staged_value
            .or_else(|| {
                inner
                    .data
                    .get(tenant)
                    .and_then(|ns| ns.get(namespace))
                    .and_then(|kv| kv.get(key))
                    .cloned()
            })
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        let next = current + delta;
        let value = Value::from(next);
        inner.cache.put(cache_key(tenant, namespace, key), value.clone());
        if self.config.enable_batching {
            inner.staged.push_back(StagedWrite {
                tenant: tenant.to_string(),
                namespace: namespace.to_string(),
                key: key.to_string(),
                value: Some(value),
            });
        } else {
            Self::apply(&mut inner.data, tenant, namespace, key, Some(value));
        }
        next
    }

    fn apply(
        data: &mut HashMap<String, BTreeMap<String, BTreeMap<String, Value>>>,
        tenant: &str,
        namespace: &str,
        key: &str,
        value: Option<Value>,
    ) {
        match value {
            Some(v) => {
                data.entry(tenant.to_string())
                    .or_default()
                    .entry(namespace.to_string())
                    .or_default()
                    .insert(key.to_string(), v);
            }
            None => {
                if let Some(ns) = data.get_mut(tenant) {
                    if let Some(kv) = ns.get_mut(namespace) {
                        kv.remove(key);
                    }
                }
            }
        }
    }

    fn maybe_flush_locked(&self, inner: &mut StoreInner) {
        if inner.last_flush.elapsed() >= Duration::from_millis(self.config.update_debounce_ms) {
            Self::flush_locked(inner);
        }
    }

    fn flush_locked(inner: &mut StoreInner) {
        let staged: Vec<StagedWrite> = inner.staged.drain(..).collect();
        let count = staged.len();
        for write in staged {
            Self::apply(
                &mut inner.data,
                &write.tenant,
                &write.namespace,
                &write.key,
                write.value,
            );
        }
        inner.last_flush = Instant::now();
        if count > 0 {
            debug!(count, "flushed staged context writes");
        }
    }

    /// Apply all staged writes now. Called on pause/complete.
    pub async fn flush(&self) {
        let mut inner = self.inner.write().await;
        Self::flush_locked(&mut inner);
    }

    /// Spawn the periodic flusher; abort the handle on shutdown.
    pub fn start_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let interval = Duration::from_millis(store.config.update_debounce_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                store.flush().await;
            }
        })
    }

    /// Snapshot projection of one tenant's authoritative map. Staged
    /// writes are flushed first so the projection is complete.
    pub async fn project_tenant(&self, tenant: &str) -> BTreeMap<String, BTreeMap<String, Value>> {
        let mut inner = self.inner.write().await;
        Self::flush_locked(&mut inner);
        inner.data.get(tenant).cloned().unwrap_or_default()
    }

    /// Replace one tenant's map wholesale (resume path) and clear the
    /// cache so stale projections cannot leak across the swap.
    pub async fn restore_tenant(
        &self,
        tenant: &str,
        data: BTreeMap<String, BTreeMap<String, Value>>,
    ) {
        let mut inner = self.inner.write().await;
        inner.staged.retain(|w| w.tenant != tenant);
        inner.data.insert(tenant.to_string(), data);
        inner.cache.clear();
    }

    /// Manually evict the least-recently-used cache entry. Test hook.
    pub async fn evict_lru(&self) -> Option<String> {
        let mut inner = self.inner.write().await;
        inner.cache.evict_lru()
    }

    /// Clear the cache, leaving authoritative data intact.
    pub async fn clear_cache(&self) {
        let mut inner = self.inner.write().await;
        inner.cache.clear();
    }

    pub async fn cache_stats(&self) -> ContextCacheStats {
        let inner = self.inner.read().await;
        inner.cache.stats()
    }

    pub async fn stats(&self) -> ContextStoreStats {
        let inner = self.inner.read().await;
        ContextStoreStats {
            tenants: inner.data.len(),
            total_entries: inner
                .data
                .values()
                .flat_map(|ns| ns.values())
                .map(BTreeMap::len)
                .sum(),
            staged_writes: inner.staged.len(),
            cache: inner.cache.stats(),
        }
    }
}
