//! Read-through, write-invalidate cache in front of the metadata tier
//!
//! The cache is best effort: failures reading or writing it degrade
//! silently to the backend and are logged. Keys are prefixed by entity tag
//! so a store's record and query entries can be invalidated wholesale when
//! any record in it mutates.

pub mod memory_cache;
pub mod redis_cache;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::error::StoreError;
use crate::metadata::{query, MetadataStore, STORE_INFO_TYPE, STORE_STATS_TYPE};
use crate::model::{
    MetadataRow, Properties, RecordQuery, RecordRow, RecordUpdate, StoreList, StorePage, StoreRow,
};

/// Failure inside the cache tier. Never propagated past the cache layer.
#[derive(Debug, Error)]
#[error("cache error: {0}")]
pub struct CacheError(pub String);

/// Trait defining the cache backend interface
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Delete every key under `prefix`
    async fn delete_prefix(&self, prefix: &str) -> Result<(), CacheError>;
}

/// Cache key of a store row
pub fn store_key(store_id: &str) -> String {
    format!("store:{}", store_id)
}

/// Cache key of a record row
pub fn record_key(store_id: &str, record_id: &str) -> String {
    format!("record:{}#{}", store_id, record_id)
}

/// Prefix of every record key of a store
pub fn record_key_prefix(store_id: &str) -> String {
    format!("record:{}#", store_id)
}

/// Cache key of a query result set
pub fn query_key(store_id: &str, fingerprint: &str) -> String {
    format!("records:{}:{}", store_id, fingerprint)
}

/// Prefix of every query result key of a store
pub fn query_key_prefix(store_id: &str) -> String {
    format!("records:{}:", store_id)
}

/// Cache key of a typed metadata row
pub fn metadata_key(metadata_type: &str, metadata_id: &str) -> String {
    format!("metadata:{}:{}", metadata_type, metadata_id)
}

/// Metadata store wrapper adding the cache tier.
///
/// Reads load through the cache with the configured TTL; every mutation
/// invalidates the affected keys after the backend write and before the
/// call returns, so a reader inside the same process never observes the
/// pre-mutation value through the cache.
pub struct CacheLayer {
    inner: Arc<dyn MetadataStore>,
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl CacheLayer {
    /// Wrap `inner` with a cache holding entries for `ttl`
    pub fn new(inner: Arc<dyn MetadataStore>, cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }

    async fn load_cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!("cache entry for key: {} is unreadable: {}", key, err);
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!("cache read failed for key: {}: {}", key, err);
                None
            }
        }
    }

    async fn store_cached<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                if let Err(err) = self.cache.set(key, &bytes, self.ttl).await {
                    warn!("cache write failed for key: {}: {}", key, err);
                }
            }
            Err(err) => warn!("cache serialization failed for key: {}: {}", key, err),
        }
    }

    async fn invalidate(&self, keys: &[String]) {
        for key in keys {
            if let Err(err) = self.cache.delete(key).await {
                warn!("cache invalidation failed for key: {}: {}", key, err);
            }
        }
    }

    async fn invalidate_prefix(&self, prefix: &str) {
        if let Err(err) = self.cache.delete_prefix(prefix).await {
            warn!("cache invalidation failed for prefix: {}: {}", prefix, err);
        }
    }

    /// Record mutations drop the record entry, the store's whole query
    /// result keyspace, and the derived counter row.
    async fn invalidate_record(&self, store_id: &str, record_id: &str) {
        self.invalidate(&[
            record_key(store_id, record_id),
            metadata_key(STORE_STATS_TYPE, store_id),
        ])
        .await;
        self.invalidate_prefix(&query_key_prefix(store_id)).await;
    }
}

#[async_trait]
impl MetadataStore for CacheLayer {
    async fn create_store(&self, store: StoreRow) -> Result<StoreRow, StoreError> {
        let created = self.inner.create_store(store).await?;
        self.invalidate(&[
            store_key(&created.store_id),
            metadata_key(STORE_INFO_TYPE, &created.store_id),
        ])
        .await;
        Ok(created)
    }

    async fn get_store(&self, store_id: &str) -> Result<StoreRow, StoreError> {
        let key = store_key(store_id);
        if let Some(store) = self.load_cached::<StoreRow>(&key).await {
            return Ok(store);
        }
        let store = self.inner.get_store(store_id).await?;
        self.store_cached(&key, &store).await;
        Ok(store)
    }

    async fn list_stores(&self, page: StorePage) -> Result<StoreList, StoreError> {
        self.inner.list_stores(page).await
    }

    async fn delete_store(&self, store_id: &str) -> Result<(), StoreError> {
        self.inner.delete_store(store_id).await?;
        self.invalidate(&[
            store_key(store_id),
            metadata_key(STORE_INFO_TYPE, store_id),
            metadata_key(STORE_STATS_TYPE, store_id),
        ])
        .await;
        self.invalidate_prefix(&record_key_prefix(store_id)).await;
        self.invalidate_prefix(&query_key_prefix(store_id)).await;
        Ok(())
    }

    async fn create_record(&self, record: RecordRow) -> Result<RecordRow, StoreError> {
        let created = self.inner.create_record(record).await?;
        self.invalidate_record(&created.store_id, &created.record_id)
            .await;
        Ok(created)
    }

    async fn get_record(&self, store_id: &str, record_id: &str) -> Result<RecordRow, StoreError> {
        let key = record_key(store_id, record_id);
        if let Some(record) = self.load_cached::<RecordRow>(&key).await {
            return Ok(record);
        }
        let record = self.inner.get_record(store_id, record_id).await?;
        self.store_cached(&key, &record).await;
        Ok(record)
    }

    async fn update_record(
        &self,
        store_id: &str,
        record_id: &str,
        update: RecordUpdate,
    ) -> Result<RecordRow, StoreError> {
        let updated = self.inner.update_record(store_id, record_id, update).await?;
        self.invalidate_record(store_id, record_id).await;
        Ok(updated)
    }

    async fn delete_record(&self, store_id: &str, record_id: &str) -> Result<(), StoreError> {
        self.inner.delete_record(store_id, record_id).await?;
        self.invalidate_record(store_id, record_id).await;
        Ok(())
    }

    async fn query_records(
        &self,
        store_id: &str,
        query: RecordQuery,
    ) -> Result<Vec<RecordRow>, StoreError> {
        let key = query_key(store_id, &query::fingerprint(store_id, &query));
        if let Some(records) = self.load_cached::<Vec<RecordRow>>(&key).await {
            return Ok(records);
        }
        let records = self.inner.query_records(store_id, query).await?;
        self.store_cached(&key, &records).await;
        Ok(records)
    }

    async fn get_metadata(
        &self,
        metadata_type: &str,
        metadata_id: &str,
    ) -> Result<MetadataRow, StoreError> {
        let key = metadata_key(metadata_type, metadata_id);
        if let Some(row) = self.load_cached::<MetadataRow>(&key).await {
            return Ok(row);
        }
        let row = self.inner.get_metadata(metadata_type, metadata_id).await?;
        self.store_cached(&key, &row).await;
        Ok(row)
    }

    async fn set_metadata(
        &self,
        metadata_type: &str,
        metadata_id: &str,
        payload: Properties,
    ) -> Result<(), StoreError> {
        self.inner
            .set_metadata(metadata_type, metadata_id, payload)
            .await?;
        self.invalidate(&[metadata_key(metadata_type, metadata_id)])
            .await;
        Ok(())
    }

    async fn delete_metadata(
        &self,
        metadata_type: &str,
        metadata_id: &str,
    ) -> Result<(), StoreError> {
        self.inner
            .delete_metadata(metadata_type, metadata_id)
            .await?;
        self.invalidate(&[metadata_key(metadata_type, metadata_id)])
            .await;
        Ok(())
    }

    async fn query_metadata(&self, metadata_type: &str) -> Result<Vec<MetadataRow>, StoreError> {
        self.inner.query_metadata(metadata_type).await
    }
}
