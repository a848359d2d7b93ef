mod backend;
pub use backend::{CacheBackend, CacheError};

mod entry;
pub use entry::CacheEntry;

pub mod keys;
pub use keys::CacheTier;

mod memory;
pub use memory::MemoryCache;

mod redis;
pub use self::redis::RedisCache;


use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;
use pulsarboard_core::{Clock, DataSource};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::gateway_metrics::{
    CACHE_COALESCED_TOTAL, CACHE_ERRORS_TOTAL, CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL,
};
use crate::upstream::UpstreamError;

/// TTL per [`CacheTier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTtls {
    pub lists: Duration,
    pub stats: Duration,
    pub config: Duration,
}

impl CacheTtls {
    pub fn ttl(&self, tier: CacheTier) -> Duration {
        match tier {
            CacheTier::List => self.lists,
            CacheTier::Stats => self.stats,
            CacheTier::Config => self.config,
        }
    }
}

impl Default for CacheTtls {
    fn default() -> Self {
        CacheTtls {
            lists: Duration::from_secs(10),
            stats: Duration::from_secs(5),
            config: Duration::from_secs(300),
        }
    }
}

/// Result of [`CacheStore::get_or_load`].
#[derive(Debug, Clone)]
pub struct Loaded {
    pub entry: CacheEntry,
    /// `Cache` on a fresh hit, `Live` when this call started or joined a load.
    pub source: DataSource,
}

type LoadResult = Result<CacheEntry, UpstreamError>;
type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

/// A load registered under its key until it finishes or the key is invalidated.
struct InFlight {
    id: u64,
    load: SharedLoad,
    // set when the key is invalidated while the load runs; its result must
    // not reach the cache
    invalidated: Arc<AtomicBool>,
}

type InFlightMap = DashMap<String, InFlight>;

/// Unregisters a load when its task ends, panics included.
struct InFlightGuard {
    inflight: Arc<InFlightMap>,
    key: String,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inflight.remove_if(&self.key, |_, load| load.id == self.id);
    }
}

/// Cache-aside store with TTL tiers, prefix invalidation and per-key request
/// coalescing.
///
/// Backend failures never reach callers: reads degrade to a miss and writes
/// are logged and dropped.
///
/// Invalidation also detaches matching in-flight loads: later callers start a
/// new load, and the detached one never writes its result.
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    ttls: CacheTtls,
    stale_retention: Duration,
    inflight: Arc<InFlightMap>,
    next_load_id: AtomicU64,
}

impl CacheStore {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
        ttls: CacheTtls,
        stale_retention: Duration,
    ) -> Self {
        CacheStore {
            backend,
            clock,
            ttls,
            stale_retention,
            inflight: Arc::new(DashMap::new()),
            next_load_id: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self, tier: CacheTier) -> Duration {
        self.ttls.ttl(tier)
    }

    /// Fresh entry for `key`, or `None` on miss, expiry or backend failure.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        self.get_stale(key).await.filter(|entry| entry.is_fresh(now))
    }

    /// Any retained entry for `key`, expired or not.
    pub async fn get_stale(&self, key: &str) -> Option<CacheEntry> {
        match self.backend.get(key).await {
            Ok(entry) => entry,
            Err(err) => {
                counter!(CACHE_ERRORS_TOTAL.name, "op" => "get").increment(1);
                warn!(key = %key, error = %err, "cache read failed, treating as miss");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: Value, tier: CacheTier) {
        self.set_with_ttl(key, value, self.ttl(tier)).await
    }

    pub async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) {
        let entry = CacheEntry::new(value, self.clock.now(), ttl);
        store(self.backend.as_ref(), key, &entry, ttl + self.stale_retention).await;
    }

    /// Drop an exact key, or every key under a `prefix*` pattern.
    pub async fn invalidate(&self, key_or_prefix: &str) {
        self.detach_loads(|key| keys::matches(key_or_prefix, key));
        let result = match keys::as_prefix(key_or_prefix) {
            Some(prefix) => self.backend.delete_prefix(prefix).await.map(|_| ()),
            None => self.backend.delete(key_or_prefix).await,
        };
        match result {
            Ok(()) => debug!(pattern = %key_or_prefix, "cache invalidated"),
            Err(err) => {
                counter!(CACHE_ERRORS_TOTAL.name, "op" => "invalidate").increment(1);
                warn!(pattern = %key_or_prefix, error = %err, "cache invalidation failed");
            }
        }
    }

    pub async fn invalidate_tenant(&self, tenant: &str) {
        for pattern in keys::tenant_invalidations(tenant) {
            self.invalidate(&pattern).await;
        }
    }

    pub async fn invalidate_namespace(&self, tenant: &str, namespace: &str) {
        for pattern in keys::namespace_invalidations(tenant, namespace) {
            self.invalidate(&pattern).await;
        }
    }

    pub async fn invalidate_topic(&self, tenant: &str, namespace: &str, topic: &str) {
        for pattern in keys::topic_invalidations(tenant, namespace, topic) {
            self.invalidate(&pattern).await;
        }
    }

    pub async fn clear(&self) {
        self.detach_loads(|_| true);
        if let Err(err) = self.backend.clear().await {
            counter!(CACHE_ERRORS_TOTAL.name, "op" => "clear").increment(1);
            warn!(error = %err, "cache clear failed");
        }
    }

    // Runs before the backend delete, so a load that stored its result
    // before seeing the flag has that write removed by the delete.
    fn detach_loads(&self, covered: impl Fn(&str) -> bool) {
        self.inflight.retain(|key, load| {
            if covered(key) {
                load.invalidated.store(true, Ordering::SeqCst);
                debug!(key = %key, "in-flight load detached by invalidation");
                false
            } else {
                true
            }
        });
    }

    /// Return the fresh entry for `key`, or load it once no matter how many
    /// callers miss concurrently.
    ///
    /// The load runs in its own task: a caller that stops waiting (timeout,
    /// disconnect) detaches without cancelling it for the other waiters. The
    /// in-flight marker is removed only after the result is in the cache, so a
    /// later caller either joins the load or hits the fresh entry. A load that
    /// panics fails its waiters and frees the key for the next caller.
    pub async fn get_or_load<F, Fut>(&self, key: &str, ttl: Duration, loader: F) -> Result<Loaded, UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, UpstreamError>> + Send + 'static,
    {
        if let Some(entry) = self.get(key).await {
            counter!(CACHE_HITS_TOTAL.name).increment(1);
            return Ok(Loaded {
                entry,
                source: DataSource::Cache,
            });
        }

        let (shared, start) = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                counter!(CACHE_COALESCED_TOTAL.name).increment(1);
                (occupied.get().load.clone(), None)
            }
            Entry::Vacant(vacant) => {
                counter!(CACHE_MISSES_TOTAL.name).increment(1);
                let id = self.next_load_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel::<LoadResult>();
                let shared: SharedLoad = async move {
                    rx.await
                        .unwrap_or_else(|_| Err(UpstreamError::Unavailable("cache load abandoned".to_string())))
                }
                .boxed()
                .shared();
                let invalidated = Arc::new(AtomicBool::new(false));
                vacant.insert(InFlight {
                    id,
                    load: shared.clone(),
                    invalidated: invalidated.clone(),
                });
                (shared, Some((id, tx, invalidated)))
            }
        };

        // spawned after the map guard is released
        if let Some((id, tx, invalidated)) = start {
            let guard = InFlightGuard {
                inflight: self.inflight.clone(),
                key: key.to_string(),
                id,
            };
            let load = loader();
            let backend = self.backend.clone();
            let clock = self.clock.clone();
            let retain = ttl + self.stale_retention;
            tokio::spawn(async move {
                let result = match load.await {
                    Ok(value) => {
                        let entry = CacheEntry::new(value, clock.now(), ttl);
                        if !invalidated.load(Ordering::SeqCst) {
                            store(backend.as_ref(), &guard.key, &entry, retain).await;
                            if invalidated.load(Ordering::SeqCst) {
                                discard(backend.as_ref(), &guard.key).await;
                            }
                        }
                        Ok(entry)
                    }
                    Err(err) => Err(err),
                };
                drop(guard);
                let _ = tx.send(result);
            });
        }

        shared.await.map(|entry| Loaded {
            entry,
            source: DataSource::Live,
        })
    }

    /// Number of keys with a load in flight.
    pub fn loads_in_flight(&self) -> usize {
        self.inflight.len()
    }
}

async fn discard(backend: &dyn CacheBackend, key: &str) {
    if let Err(err) = backend.delete(key).await {
        counter!(CACHE_ERRORS_TOTAL.name, "op" => "invalidate").increment(1);
        warn!(key = %key, error = %err, "unable to drop result of an invalidated load");
    }
}

async fn store(backend: &dyn CacheBackend, key: &str, entry: &CacheEntry, retain: Duration) {
    if let Err(err) = backend.set(key, entry, retain).await {
        counter!(CACHE_ERRORS_TOTAL.name, "op" => "set").increment(1);
        warn!(key = %key, error = %err, "cache write failed");
    }
}
