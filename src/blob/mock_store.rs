//! Mock implementation of BlobStore for testing

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use crate::blob::{object_key, object_prefix, BlobBody, BlobDownload, BlobStore};
use crate::error::StoreError;

/// In-memory blob backend for tests
pub struct MockBlobStore {
    objects: Arc<Mutex<BTreeMap<String, Bytes>>>,
    fail_puts: AtomicBool,
}

impl MockBlobStore {
    /// Create a new empty mock store
    pub fn new() -> Self {
        Self {
            objects: Arc::new(Mutex::new(BTreeMap::new())),
            fail_puts: AtomicBool::new(false),
        }
    }

    /// Number of objects currently held
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Whether an object exists for the given blob coordinates
    pub fn contains(&self, store_id: &str, record_id: &str, blob_name: &str) -> bool {
        self.objects
            .lock()
            .unwrap()
            .contains_key(&object_key(store_id, record_id, blob_name))
    }

    /// Make every following put fail with `Unavailable`
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }
}

impl Default for MockBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MockBlobStore {
    async fn put(
        &self,
        store_id: &str,
        record_id: &str,
        blob_name: &str,
        mut body: BlobBody,
        _size: Option<u64>,
    ) -> Result<u64, StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("blob backend down".to_string()));
        }
        let mut buffer = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk =
                chunk.map_err(|err| StoreError::Internal(format!("read upload body: {}", err)))?;
            buffer.extend_from_slice(&chunk);
        }
        let written = buffer.len() as u64;
        self.objects
            .lock()
            .unwrap()
            .insert(object_key(store_id, record_id, blob_name), Bytes::from(buffer));
        Ok(written)
    }

    async fn get(
        &self,
        store_id: &str,
        record_id: &str,
        blob_name: &str,
    ) -> Result<BlobDownload, StoreError> {
        let key = object_key(store_id, record_id, blob_name);
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("blob {}", key)))?;
        let size = bytes.len() as u64;
        let body: BlobBody = Box::pin(futures::stream::iter(vec![Ok(bytes)]));
        Ok(BlobDownload { body, size })
    }

    async fn list(&self, store_id: &str, record_id: &str) -> Result<Vec<String>, StoreError> {
        let prefix = object_prefix(store_id, record_id);
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .map(str::to_string)
            .collect())
    }

    async fn delete(
        &self,
        store_id: &str,
        record_id: &str,
        blob_name: &str,
    ) -> Result<(), StoreError> {
        self.objects
            .lock()
            .unwrap()
            .remove(&object_key(store_id, record_id, blob_name));
        Ok(())
    }
}
