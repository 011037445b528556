//! Blob tier abstraction
//!
//! Streams opaque bytes to and from the object store. Objects are keyed by
//! (store, record, name) under the deterministic key
//! `{store_id}/{record_id}/{blob_name}`; nothing here touches record
//! metadata, that coupling belongs to the service layer.

pub mod mock_store;
pub mod s3_store;

use std::fmt;
use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::StoreError;

/// Streaming byte body moving through the blob tier
pub type BlobBody = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

/// A streaming download together with its known size
pub struct BlobDownload {
    pub body: BlobBody,
    pub size: u64,
}

impl fmt::Debug for BlobDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobDownload")
            .field("size", &self.size)
            .finish()
    }
}

/// Object key of a blob within the bucket
pub fn object_key(store_id: &str, record_id: &str, blob_name: &str) -> String {
    format!("{}/{}/{}", store_id, record_id, blob_name)
}

/// Prefix under which every blob of a record lives
pub fn object_prefix(store_id: &str, record_id: &str) -> String {
    format!("{}/{}/", store_id, record_id)
}

/// Trait defining the blob storage interface
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `body` for a blob, returning the number of bytes written.
    /// `size` is passed through to the backend when known; unknown-length
    /// bodies stream with multipart semantics and bounded memory.
    async fn put(
        &self,
        store_id: &str,
        record_id: &str,
        blob_name: &str,
        body: BlobBody,
        size: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Open a streaming reader for a blob together with its known size
    async fn get(
        &self,
        store_id: &str,
        record_id: &str,
        blob_name: &str,
    ) -> Result<BlobDownload, StoreError>;

    /// List the blob names stored under a record's prefix
    async fn list(&self, store_id: &str, record_id: &str) -> Result<Vec<String>, StoreError>;

    /// Delete a blob. Deleting an absent object succeeds; cascade paths
    /// depend on that.
    async fn delete(
        &self,
        store_id: &str,
        record_id: &str,
        blob_name: &str,
    ) -> Result<(), StoreError>;
}
