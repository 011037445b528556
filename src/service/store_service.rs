//! Store orchestration service
//!
//! Store deletion cascades across both tiers: every record's objects are
//! removed from the blob tier best effort before the metadata cascade runs,
//! so the object tier never keeps data for a store whose rows are gone.

use std::sync::Arc;

use log::{info, warn};

use crate::blob::BlobStore;
use crate::error::StoreError;
use crate::metadata::MetadataStore;
use crate::model::{MetadataRow, Properties, RecordQuery, StoreList, StorePage, StoreRow};
use crate::service::validate_id;

/// Service owning store lifecycle and the generic metadata endpoint
pub struct StoreService {
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
}

impl StoreService {
    /// Create a new store service with injected backends
    pub fn new(metadata: Arc<dyn MetadataStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { metadata, blobs }
    }

    /// Create a store, failing with `AlreadyExists` when the id is taken
    pub async fn create_store(&self, store_id: &str, name: &str) -> Result<StoreRow, StoreError> {
        validate_id("store_id", store_id)?;
        let store = self.metadata.create_store(StoreRow::new(store_id, name)).await?;
        info!("created store: {}", store.store_id);
        Ok(store)
    }

    pub async fn get_store(&self, store_id: &str) -> Result<StoreRow, StoreError> {
        validate_id("store_id", store_id)?;
        self.metadata.get_store(store_id).await
    }

    pub async fn list_stores(&self, page: StorePage) -> Result<StoreList, StoreError> {
        self.metadata.list_stores(page).await
    }

    /// Delete a store with its records and their blobs. Object cleanup is
    /// best effort; stragglers are reclaimed on the next delete.
    pub async fn delete_store(&self, store_id: &str) -> Result<(), StoreError> {
        validate_id("store_id", store_id)?;

        match self
            .metadata
            .query_records(store_id, RecordQuery::default())
            .await
        {
            Ok(records) => {
                for record in &records {
                    self.delete_record_objects(store_id, &record.record_id).await;
                }
            }
            Err(err) => warn!(
                "delete_store {}: record enumeration for blob cleanup failed: {}",
                store_id, err
            ),
        }

        self.metadata.delete_store(store_id).await?;
        info!("deleted store: {}", store_id);
        Ok(())
    }

    /// Remove every object stored under a record's prefix, which also
    /// sweeps orphans whose names fell out of the record's blob key set.
    async fn delete_record_objects(&self, store_id: &str, record_id: &str) {
        let names = match self.blobs.list(store_id, record_id).await {
            Ok(names) => names,
            Err(err) => {
                warn!(
                    "delete_store {}: blob listing failed for record: {}: {}",
                    store_id, record_id, err
                );
                return;
            }
        };
        for name in names {
            if let Err(err) = self.blobs.delete(store_id, record_id, &name).await {
                warn!(
                    "delete_store {}: blob delete failed for record: {}, blob: {}: {}",
                    store_id, record_id, name, err
                );
            }
        }
    }

    pub async fn get_metadata(
        &self,
        metadata_type: &str,
        metadata_id: &str,
    ) -> Result<MetadataRow, StoreError> {
        validate_id("metadata_type", metadata_type)?;
        validate_id("metadata_id", metadata_id)?;
        self.metadata.get_metadata(metadata_type, metadata_id).await
    }

    pub async fn set_metadata(
        &self,
        metadata_type: &str,
        metadata_id: &str,
        payload: Properties,
    ) -> Result<(), StoreError> {
        validate_id("metadata_type", metadata_type)?;
        validate_id("metadata_id", metadata_id)?;
        self.metadata
            .set_metadata(metadata_type, metadata_id, payload)
            .await
    }

    pub async fn delete_metadata(
        &self,
        metadata_type: &str,
        metadata_id: &str,
    ) -> Result<(), StoreError> {
        validate_id("metadata_type", metadata_type)?;
        validate_id("metadata_id", metadata_id)?;
        self.metadata
            .delete_metadata(metadata_type, metadata_id)
            .await
    }

    pub async fn query_metadata(
        &self,
        metadata_type: &str,
    ) -> Result<Vec<MetadataRow>, StoreError> {
        validate_id("metadata_type", metadata_type)?;
        self.metadata.query_metadata(metadata_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::mock_store::MockBlobStore;
    use crate::blob::{BlobBody, BlobStore};
    use crate::metadata::mock_store::MockMetadataStore;
    use crate::model::RecordRow;
    use bytes::Bytes;

    fn body_from(bytes: &'static [u8]) -> BlobBody {
        Box::pin(futures::stream::iter(vec![Ok(Bytes::from_static(bytes))]))
    }

    fn service() -> (Arc<MockMetadataStore>, Arc<MockBlobStore>, StoreService) {
        let metadata = Arc::new(MockMetadataStore::new());
        let blobs = Arc::new(MockBlobStore::new());
        let service = StoreService::new(metadata.clone(), blobs.clone());
        (metadata, blobs, service)
    }

    #[tokio::test]
    async fn test_create_store_rejects_bad_ids() {
        let (_, _, service) = service();
        assert!(matches!(
            service.create_store("", "S").await.unwrap_err(),
            StoreError::Invalid(_)
        ));
        assert!(service.create_store("a#b", "S").await.is_err());
    }

    #[tokio::test]
    async fn test_create_then_recreate_conflicts() {
        let (_, _, service) = service();
        service.create_store("s1", "S1").await.unwrap();
        assert_eq!(service.get_store("s1").await.unwrap().name, "S1");
        assert!(matches!(
            service.create_store("s1", "S1").await.unwrap_err(),
            StoreError::AlreadyExists(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_store_cascades_to_blobs() {
        let (metadata, blobs, service) = service();
        service.create_store("s1", "S1").await.unwrap();
        metadata
            .create_record(RecordRow::new("s1", "r1"))
            .await
            .unwrap();
        blobs
            .put("s1", "r1", "save.dat", body_from(b"x"), None)
            .await
            .unwrap();

        service.delete_store("s1").await.unwrap();

        assert!(service.get_store("s1").await.is_err());
        assert!(metadata.get_record("s1", "r1").await.is_err());
        assert!(!blobs.contains("s1", "r1", "save.dat"));
    }

    #[tokio::test]
    async fn test_delete_missing_store_is_idempotent() {
        let (_, _, service) = service();
        service.delete_store("nope").await.unwrap();
    }
}
