//! Metadata tier abstraction
//!
//! One contract over two very different backend models: a key-value table
//! service with global secondary indexes (DynamoDB) and a document
//! collection service (MongoDB). Higher layers only ever see this trait and
//! the shared error taxonomy; pagination tokens, conditional-write failures,
//! and uniqueness semantics of the concrete tiers never leak upward.

pub mod document_store;
pub mod dynamo_store;
pub mod mock_store;
pub mod query;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::model::{
    MetadataRow, Properties, RecordQuery, RecordRow, RecordUpdate, StoreList, StorePage, StoreRow,
};

/// Metadata type of the companion row describing a store
pub const STORE_INFO_TYPE: &str = "store_info";

/// Metadata type of the per-store counters row
pub const STORE_STATS_TYPE: &str = "store_stats";

/// Cascade deletes remove records in batches of at most this many rows
pub const DELETE_BATCH_SIZE: usize = 25;

/// Page cap applied to store listing when the caller does not set one
pub const DEFAULT_STORE_PAGE_SIZE: u32 = 100;

/// Payload of the `store_info` companion row
pub fn store_info_payload(store: &StoreRow) -> Properties {
    let mut payload = Properties::new();
    payload.insert("store_id".to_string(), Value::String(store.store_id.clone()));
    payload.insert("name".to_string(), Value::String(store.name.clone()));
    payload.insert("created_at".to_string(), Value::Number(store.created_at.into()));
    payload
}

/// Payload of the `store_stats` companion row
pub fn store_stats_payload(record_count: i64) -> Properties {
    let mut payload = Properties::new();
    payload.insert("record_count".to_string(), Value::Number(record_count.into()));
    payload
}

/// Read the record count out of a `store_stats` payload, defaulting to zero
pub fn record_count_from_stats(payload: &Properties) -> i64 {
    payload
        .get("record_count")
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// Uniform contract for stores, records, and typed metadata rows.
///
/// Semantics every backend must provide:
///
/// - `create_store` fails with `AlreadyExists` when the id is taken and
///   writes a best-effort `store_info` companion row.
/// - `create_record` verifies the parent store first (`NotFound`), inserts
///   conditionally (`AlreadyExists` on a lost race), and bumps the
///   `store_stats` record count with last-writer-wins semantics. The count
///   is approximate and is never read on the request path.
/// - `update_record` writes only the present fields of the update and fails
///   with `NotFound` when the record is gone.
/// - `delete_store` removes the store row first, then cascades over the
///   records in batches of [`DELETE_BATCH_SIZE`] and removes the companion
///   rows; failures after the store row is gone degrade to warnings.
/// - `delete_record` and `delete_metadata` are unconditional and idempotent.
/// - `query_metadata` returns every row of a type with its `metadata_id`
///   injected into the payload.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_store(&self, store: StoreRow) -> Result<StoreRow, StoreError>;

    async fn get_store(&self, store_id: &str) -> Result<StoreRow, StoreError>;

    async fn list_stores(&self, page: StorePage) -> Result<StoreList, StoreError>;

    async fn delete_store(&self, store_id: &str) -> Result<(), StoreError>;

    async fn create_record(&self, record: RecordRow) -> Result<RecordRow, StoreError>;

    async fn get_record(&self, store_id: &str, record_id: &str) -> Result<RecordRow, StoreError>;

    async fn update_record(
        &self,
        store_id: &str,
        record_id: &str,
        update: RecordUpdate,
    ) -> Result<RecordRow, StoreError>;

    async fn delete_record(&self, store_id: &str, record_id: &str) -> Result<(), StoreError>;

    async fn query_records(
        &self,
        store_id: &str,
        query: RecordQuery,
    ) -> Result<Vec<RecordRow>, StoreError>;

    async fn get_metadata(
        &self,
        metadata_type: &str,
        metadata_id: &str,
    ) -> Result<MetadataRow, StoreError>;

    async fn set_metadata(
        &self,
        metadata_type: &str,
        metadata_id: &str,
        payload: Properties,
    ) -> Result<(), StoreError>;

    async fn delete_metadata(&self, metadata_type: &str, metadata_id: &str)
        -> Result<(), StoreError>;

    async fn query_metadata(&self, metadata_type: &str) -> Result<Vec<MetadataRow>, StoreError>;
}
