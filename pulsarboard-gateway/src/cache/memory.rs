use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use std::time::{Duration, Instant};

use super::backend::{CacheBackend, CacheError};
use super::entry::CacheEntry;

#[derive(Debug, Clone)]
struct Stored {
    entry: CacheEntry,
    retain: Duration,
}

struct RetainExpiry;

impl Expiry<String, Stored> for RetainExpiry {
    fn expire_after_create(&self, _key: &String, value: &Stored, _created_at: Instant) -> Option<Duration> {
        Some(value.retain)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Stored,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.retain)
    }
}

/// In-process cache backend on moka, bounded by entry count.
#[derive(Clone)]
pub struct MemoryCache {
    cache: Cache<String, Stored>,
}

impl MemoryCache {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(RetainExpiry)
            .build();
        MemoryCache { cache }
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.cache.get(key).await.map(|stored| stored.entry))
    }

    async fn set(&self, key: &str, entry: &CacheEntry, retain: Duration) -> Result<(), CacheError> {
        self.cache
            .insert(
                key.to_string(),
                Stored {
                    entry: entry.clone(),
                    retain,
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let doomed: Vec<String> = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| String::clone(&key))
            .collect();
        for key in &doomed {
            self.cache.invalidate(key).await;
        }
        Ok(doomed.len() as u64)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.cache.invalidate_all();
        Ok(())
    }
}
