//! Redis cache backend
//!
//! Entries carry native key TTLs, so expiry needs no sweeping here. Prefix
//! invalidation walks the keyspace with SCAN before issuing one DEL.

use std::time::Duration;

use async_trait::async_trait;
use log::info;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::cache::{Cache, CacheError};

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError(err.to_string())
    }
}

/// Redis cache backend over a shared connection manager
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    /// Connect to the endpoint, for example `redis://cache.example:6379`
    pub async fn connect(endpoint: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(endpoint)?;
        let manager = ConnectionManager::new(client).await?;
        info!("cache backend ready, endpoint: {}", endpoint);
        Ok(Self { manager })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.manager.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .set_ex(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let pattern = format!("{}*", prefix);
        let keys: Vec<String> = {
            let mut iter: redis::AsyncIter<'_, String> = conn.scan_match(pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        if !keys.is_empty() {
            let _: () = conn.del(keys).await?;
        }
        Ok(())
    }
}
