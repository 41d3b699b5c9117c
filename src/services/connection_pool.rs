use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::models::{ConnectionConfig, DbResult};
use crate::services::database::{AdapterFactory, DatabaseAdapter};
use crate::services::retry::{RetryPolicy, RetryService};

pub const DEFAULT_CACHE_MAX_SIZE: usize = 10;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_CACHE_IDLE_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct PoolCacheConfig {
    pub max_size: usize,
    pub sweep_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolCacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_CACHE_MAX_SIZE,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_CACHE_IDLE_TIMEOUT_SECS),
        }
    }
}

/// One connected adapter and its usage bookkeeping
#[derive(Clone)]
pub struct CachedAdapterEntry {
    pub key: String,
    pub adapter: Arc<dyn DatabaseAdapter>,
    pub last_used: Instant,
    pub use_count: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    /// LRU overflow, idle sweep and dead-entry removals
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheInner {
    entries: Mutex<HashMap<String, CachedAdapterEntry>>,
    /// Serializes creation per key so concurrent first use builds one pool
    creation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    factory: Arc<dyn AdapterFactory>,
    config: PoolCacheConfig,
    bootstrap: RetryPolicy,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Keyed cache of connected adapters with LRU overflow eviction and a
/// background idle sweep.
///
/// Pools are always closed outside the map lock, exactly once per removed
/// entry. Dropping the cache stops the sweep but does not close pools; call
/// [`clear_all`](Self::clear_all) for an orderly shutdown. Entries created
/// after `clear_all` are no longer swept.
pub struct ConnectionPoolCache {
    inner: Arc<CacheInner>,
    shutdown: CancellationToken,
}

impl ConnectionPoolCache {
    /// Must be called inside a Tokio runtime for the idle sweep to run
    pub fn new(factory: Arc<dyn AdapterFactory>, config: PoolCacheConfig, bootstrap: RetryPolicy) -> Self {
        let inner = Arc::new(CacheInner {
            entries: Mutex::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
            factory,
            config,
            bootstrap,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        });
        let shutdown = CancellationToken::new();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(sweep_loop(inner.clone(), shutdown.clone()));
            }
            Err(_) => tracing::warn!("No Tokio runtime; idle pool sweep is disabled"),
        }

        Self { inner, shutdown }
    }

    pub fn config(&self) -> &PoolCacheConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &Arc<dyn AdapterFactory> {
        &self.inner.factory
    }

    /// Connected adapter for `config`, creating and bootstrapping one on a
    /// miss
    pub async fn get(&self, config: ConnectionConfig) -> DbResult<Arc<dyn DatabaseAdapter>> {
        let key = config.cache_key();
        if let Some(adapter) = self.inner.lookup(&key).await {
            return Ok(adapter);
        }

        let lock = self.inner.creation_lock(&key).await;
        let created = {
            let _creating = lock.lock().await;
            // Another task may have finished creating it while we waited
            match self.inner.lookup(&key).await {
                Some(adapter) => Ok(adapter),
                None => self.inner.create(&key, config).await,
            }
        };
        self.inner.release_creation_lock(&key, lock).await;
        created
    }

    /// Remove and close the entry for `config`. Returns whether one existed.
    pub async fn invalidate(&self, config: &ConnectionConfig) -> bool {
        self.invalidate_key(&config.cache_key()).await
    }

    pub async fn invalidate_key(&self, key: &str) -> bool {
        let removed = self.inner.entries.lock().await.remove(key);
        match removed {
            Some(entry) => {
                close_entry(entry, "invalidated").await;
                true
            }
            None => false,
        }
    }

    /// Stop the idle sweep and close every cached pool. Returns the number
    /// closed.
    pub async fn clear_all(&self) -> usize {
        self.shutdown.cancel();
        let drained: Vec<_> = self.inner.entries.lock().await.drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            close_entry(entry, "cleared").await;
        }
        if count > 0 {
            tracing::info!("Cleared {} cached connection pools", count);
        }
        count
    }

    /// Close entries unused for longer than the idle timeout
    pub async fn evict_idle(&self) -> usize {
        self.inner.evict_idle().await
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of the cached entries, most recently used first
    pub async fn entries(&self) -> Vec<CachedAdapterEntry> {
        let mut entries: Vec<_> = self.inner.entries.lock().await.values().cloned().collect();
        entries.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        entries
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len().await,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ConnectionPoolCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl CacheInner {
    /// Hit path. Entries whose adapter is no longer connected are removed
    /// and closed, and count as a miss.
    async fn lookup(&self, key: &str) -> Option<Arc<dyn DatabaseAdapter>> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(key)?;

        if entry.adapter.is_connected().await {
            entry.last_used = Instant::now();
            entry.use_count += 1;
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Using cached adapter for {} (use_count: {})", key, entry.use_count);
            return Some(entry.adapter.clone());
        }

        let dead = entries.remove(key);
        drop(entries);
        if let Some(dead) = dead {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            close_entry(dead, "no longer connected").await;
        }
        None
    }

    async fn creation_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.creation_locks
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    async fn release_creation_lock(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.creation_locks.lock().await;
        // Only the map and this task still hold it: nobody is waiting
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(key);
        }
    }

    async fn create(&self, key: &str, config: ConnectionConfig) -> DbResult<Arc<dyn DatabaseAdapter>> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        let adapter = self.factory.create(config)?;

        let retry = RetryService::new(self.bootstrap.clone());
        let outcome = retry.run("create_pool", || adapter.create_pool()).await;
        if let Err(err) = outcome.into_result() {
            tracing::error!("Failed to create {} pool for {}: {}", adapter.dialect(), key, err);
            if let Err(close_err) = adapter.close_pool().await {
                tracing::warn!("Error closing failed pool for {}: {}", key, close_err);
            }
            return Err(err);
        }

        let now = Instant::now();
        let entry = CachedAdapterEntry {
            key: key.to_string(),
            adapter: adapter.clone(),
            last_used: now,
            use_count: 1,
        };

        let evicted = {
            let mut entries = self.entries.lock().await;
            let evicted = if entries.len() >= self.config.max_size && !entries.contains_key(key) {
                let oldest = entries
                    .values()
                    .min_by_key(|e| e.last_used)
                    .map(|e| e.key.clone());
                oldest.and_then(|oldest| entries.remove(&oldest))
            } else {
                None
            };
            entries.insert(key.to_string(), entry);
            evicted
        };

        tracing::info!("Cached new {} adapter for {}", adapter.dialect(), key);
        if let Some(evicted) = evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            close_entry(evicted, "least recently used").await;
        }

        Ok(adapter)
    }

    async fn evict_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let expired: Vec<CachedAdapterEntry> = {
            let mut entries = self.entries.lock().await;
            let keys: Vec<String> = entries
                .values()
                .filter(|e| e.last_used.elapsed() > idle_timeout)
                .map(|e| e.key.clone())
                .collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };

        let count = expired.len();
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
        for entry in expired {
            close_entry(entry, "idle").await;
        }
        count
    }
}

async fn close_entry(entry: CachedAdapterEntry, reason: &str) {
    tracing::info!(
        "Evicting {} adapter for {} ({}, used {} times)",
        entry.adapter.dialect(),
        entry.key,
        reason,
        entry.use_count
    );
    if let Err(e) = entry.adapter.close_pool().await {
        tracing::warn!("Error closing pool for {}: {}", entry.key, e);
    }
}

async fn sweep_loop(inner: Arc<CacheInner>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(inner.config.sweep_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let evicted = inner.evict_idle().await;
                if evicted > 0 {
                    tracing::debug!("Idle sweep closed {} pools", evicted);
                }
            }
        }
    }
    tracing::debug!("Idle pool sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        codes, BoxError, ConnectionSettings, DatabaseError, Dialect, ErrorKind, FactoryError, QueryResult,
        SchemaInfo, SchemaOptions, ServerInfo,
    };
    use crate::services::database::{AdapterState, PoolSlot};
    use async_trait::async_trait;
    use std::str::FromStr;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct Counters {
        created: AtomicU32,
        opens: AtomicU32,
        closes: AtomicU32,
        /// Upcoming create_pool calls that fail
        failures: AtomicU32,
    }

    struct FakeAdapter {
        settings: ConnectionSettings,
        slot: PoolSlot<()>,
        counters: Arc<Counters>,
        permanent_failure: bool,
    }

    #[async_trait]
    impl DatabaseAdapter for FakeAdapter {
        fn dialect(&self) -> Dialect {
            self.settings.dialect
        }

        fn settings(&self) -> &ConnectionSettings {
            &self.settings
        }

        async fn state(&self) -> AdapterState {
            self.slot.state().await
        }

        async fn create_pool(&self) -> DbResult<()> {
            self.slot
                .open(|| async {
                    self.counters.opens.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    if self.permanent_failure {
                        return Err(DatabaseError::config("bad credentials file"));
                    }
                    let failing = self.counters.failures.load(Ordering::SeqCst);
                    if failing > 0 {
                        self.counters.failures.store(failing - 1, Ordering::SeqCst);
                        return Err(DatabaseError::connection("refused").with_code(codes::CONNECTION_REFUSED));
                    }
                    Ok(())
                })
                .await
        }

        async fn close_pool(&self) -> DbResult<()> {
            if self.slot.close().await.is_some() {
                self.counters.closes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn probe(&self) -> DbResult<ServerInfo> {
            Ok(ServerInfo {
                server_version: "fake 1.0".into(),
                database: self.settings.database.clone(),
            })
        }

        async fn get_schema(&self, _options: &SchemaOptions) -> DbResult<SchemaInfo> {
            Ok(SchemaInfo::default())
        }

        async fn execute_with_timeout(&self, _sql: &str, _timeout_secs: u64) -> DbResult<QueryResult> {
            Ok(QueryResult::new(vec![], vec![], 0))
        }

        fn enforce_row_limit(&self, sql: &str, _max_rows: u64) -> String {
            sql.to_string()
        }

        fn timeout_sql(&self, _timeout_secs: u64) -> Option<String> {
            None
        }

        fn quote_identifier(&self, identifier: &str) -> String {
            identifier.to_string()
        }

        fn validate_query(&self, _sql: &str) -> DbResult<()> {
            Ok(())
        }

        fn sanitize_query(&self, sql: &str) -> String {
            sql.to_string()
        }

        fn map_error(&self, err: BoxError) -> DatabaseError {
            DatabaseError::query(err.to_string())
        }
    }

    struct FakeFactory {
        counters: Arc<Counters>,
    }

    impl AdapterFactory for FakeFactory {
        fn create(&self, config: ConnectionConfig) -> Result<Arc<dyn DatabaseAdapter>, FactoryError> {
            let dialect = Dialect::from_str(&config.dialect).map_err(FactoryError::UnsupportedDialect)?;
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeAdapter {
                settings: ConnectionSettings::file(dialect, config.database.clone()),
                slot: PoolSlot::new(),
                counters: self.counters.clone(),
                permanent_failure: config.database == "broken",
            }))
        }
    }

    fn cache(max_size: usize) -> (ConnectionPoolCache, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let factory = Arc::new(FakeFactory {
            counters: counters.clone(),
        });
        let config = PoolCacheConfig {
            max_size,
            ..Default::default()
        };
        (ConnectionPoolCache::new(factory, config, RetryPolicy::pool_bootstrap()), counters)
    }

    fn db(name: &str) -> ConnectionConfig {
        ConnectionConfig::new("sqlite", name)
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_returns_same_adapter() {
        let (cache, counters) = cache(10);

        let first = cache.get(db("a")).await.unwrap();
        let second = cache.get(db("a")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_connected().await);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);

        let stats = cache.stats().await;
        assert_eq!((stats.size, stats.hits, stats.misses), (1, 1, 1));
        assert_eq!(stats.hit_ratio(), 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_first_use_creates_once() {
        let (cache, counters) = cache(10);
        let cache = Arc::new(cache);

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get(db("shared")).await })
            })
            .collect();

        let adapters: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
        assert!(adapters.iter().all(|a| Arc::ptr_eq(a, &adapters[0])));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_overflow_evicts_exactly_one() {
        let (cache, counters) = cache(2);

        let a = cache.get(db("a")).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        let b = cache.get(db("b")).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.get(db("a")).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.get(db("c")).await.unwrap();

        assert_eq!(cache.len().await, 2);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(b.state().await, AdapterState::Closed);
        assert!(a.is_connected().await);
        assert_eq!(cache.stats().await.evictions, 1);

        let keys: Vec<_> = cache.entries().await.into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![db("c").cache_key(), db("a").cache_key()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_entry_is_recreated() {
        let (cache, counters) = cache(10);

        let first = cache.get(db("a")).await.unwrap();
        first.close_pool().await.unwrap();

        let second = cache.get(db("a")).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_connected().await);
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweep_closes_unused_pools() {
        let (cache, counters) = cache(10);
        let adapter = cache.get(db("a")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(cache.len().await, 1);

        // The sweep after 300s of inactivity runs at t=360s
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(cache.len().await, 0);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.state().await, AdapterState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_keeps_recent_entries() {
        let (cache, _) = cache(10);
        cache.get(db("old")).await.unwrap();
        tokio::time::advance(Duration::from_secs(250)).await;
        cache.get(db("recent")).await.unwrap();
        tokio::time::advance(Duration::from_secs(51)).await;

        assert_eq!(cache.evict_idle().await, 1);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.entries().await[0].key, db("recent").cache_key());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_is_retried() {
        let (cache, counters) = cache(10);
        counters.failures.store(2, Ordering::SeqCst);

        let adapter = cache.get(db("flaky")).await.unwrap();
        assert!(adapter.is_connected().await);
        assert_eq!(counters.opens.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_not_cached() {
        let (cache, counters) = cache(10);

        let Err(err) = cache.get(db("broken")).await else {
            panic!("bootstrap of a broken database succeeded");
        };
        assert_eq!(err.kind, ErrorKind::Config);
        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty().await);

        let Err(err) = cache.get(ConnectionConfig::new("oracle", "x")).await else {
            panic!("unsupported dialect was accepted");
        };
        assert_eq!(err.kind, ErrorKind::UnsupportedOperation);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_clear_all() {
        let (cache, counters) = cache(10);
        cache.get(db("a")).await.unwrap();
        cache.get(db("b")).await.unwrap();

        assert!(cache.invalidate(&db("a")).await);
        assert!(!cache.invalidate(&db("a")).await);
        assert_eq!(cache.clear_all().await, 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_stops_the_sweep() {
        let (cache, counters) = cache(10);
        cache.get(db("a")).await.unwrap();
        assert_eq!(cache.clear_all().await, 1);

        let b = cache.get(db("b")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(400)).await;

        assert_eq!(cache.len().await, 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(b.state().await, AdapterState::Connected);
    }
}
