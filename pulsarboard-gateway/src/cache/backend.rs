use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use super::entry::CacheEntry;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache entry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key/value storage behind [`CacheStore`](super::CacheStore).
///
/// `retain` is how long the backend must keep the entry physically; it is
/// longer than the entry's TTL so expired values stay available as fallbacks.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    async fn set(&self, key: &str, entry: &CacheEntry, retain: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Delete every key starting with `prefix`, returning how many went.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;
}
