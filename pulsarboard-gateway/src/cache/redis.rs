use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use std::future::Future;
use std::time::Duration;
use tracing::info;

use super::backend::{CacheBackend, CacheError};
use super::entry::CacheEntry;

const KEY_NAMESPACE: &str = "pulsarboard:";
const SCAN_BATCH: usize = 500;

/// Shared cache backend on Redis.
///
/// Keys are namespaced so `clear` only touches this service's entries. Prefix
/// deletes walk the keyspace with SCAN, never KEYS.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisCache {
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        info!("connected to redis cache");
        Ok(RedisCache { conn, op_timeout })
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, RedisError>>,
    {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result.map_err(unavailable),
            Err(_) => Err(CacheError::Unavailable("redis operation timed out".to_string())),
        }
    }

    async fn delete_matching(&self, pattern: String) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = self
                .bounded(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;
            if !keys.is_empty() {
                let removed: u64 = self.bounded(conn.del(&keys)).await?;
                deleted += removed;
            }
            if next == 0 {
                return Ok(deleted);
            }
            cursor = next;
        }
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = self.bounded(conn.get(namespaced(key))).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, entry: &CacheEntry, retain: Duration) -> Result<(), CacheError> {
        let payload = serde_json::to_string(entry)?;
        let mut conn = self.conn.clone();
        let seconds = retain.as_secs().max(1);
        let _: () = self
            .bounded(conn.set_ex(namespaced(key), payload, seconds))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: u64 = self.bounded(conn.del(namespaced(key))).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        self.delete_matching(format!("{}*", escape_glob(&namespaced(prefix))))
            .await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.delete_matching(format!("{}*", KEY_NAMESPACE)).await?;
        Ok(())
    }
}

fn namespaced(key: &str) -> String {
    format!("{}{}", KEY_NAMESPACE, key)
}

// SCAN MATCH treats these as glob syntax
fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn unavailable(err: RedisError) -> CacheError {
    CacheError::Unavailable(err.to_string())
}
