//! Record and blob orchestration service
//!
//! Owns the one place in the engine that compensates across tiers: a blob
//! upload whose record update fails deletes the just-written object before
//! surfacing the error. Blob deletion removes the object first; when the
//! following record update fails the divergence is accepted and re-upload is
//! the recovery path.

use std::sync::Arc;

use log::{info, warn};

use crate::blob::{BlobBody, BlobDownload, BlobStore};
use crate::error::StoreError;
use crate::metadata::MetadataStore;
use crate::model::{Properties, RecordQuery, RecordRow, RecordUpdate};
use crate::service::{validate_blob_name, validate_id};

/// Fields accepted when creating a record. Blob keys may announce uploads
/// that follow later; a record naming a blob whose object does not exist
/// yet is legal and means the upload is pending.
#[derive(Debug, Clone, Default)]
pub struct NewRecord {
    pub record_id: String,
    pub owner_id: Option<String>,
    pub game_id: Option<String>,
    pub tags: Vec<String>,
    pub properties: Properties,
    pub blob_keys: Vec<String>,
}

/// Service owning record lifecycle and the blob coupling
pub struct RecordService {
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
}

impl RecordService {
    /// Create a new record service with injected backends
    pub fn new(metadata: Arc<dyn MetadataStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { metadata, blobs }
    }

    pub async fn create_record(
        &self,
        store_id: &str,
        new_record: NewRecord,
    ) -> Result<RecordRow, StoreError> {
        validate_id("store_id", store_id)?;
        validate_id("record_id", &new_record.record_id)?;
        for blob_name in &new_record.blob_keys {
            validate_blob_name(blob_name)?;
        }

        let mut record = RecordRow::new(store_id, &new_record.record_id);
        record.owner_id = new_record.owner_id.unwrap_or_default();
        record.game_id = new_record.game_id.unwrap_or_default();
        record.tags = new_record.tags;
        record.properties = new_record.properties;
        record.blob_keys = new_record.blob_keys;
        record.resolve_indexed_fields();

        let record = self.metadata.create_record(record).await?;
        info!("created record: {}", record.concat_key());
        Ok(record)
    }

    pub async fn get_record(
        &self,
        store_id: &str,
        record_id: &str,
    ) -> Result<RecordRow, StoreError> {
        validate_id("store_id", store_id)?;
        validate_id("record_id", record_id)?;
        self.metadata.get_record(store_id, record_id).await
    }

    pub async fn update_record(
        &self,
        store_id: &str,
        record_id: &str,
        update: RecordUpdate,
    ) -> Result<RecordRow, StoreError> {
        validate_id("store_id", store_id)?;
        validate_id("record_id", record_id)?;
        if let Some(blob_keys) = &update.blob_keys {
            for blob_name in blob_keys {
                validate_blob_name(blob_name)?;
            }
        }
        self.metadata.update_record(store_id, record_id, update).await
    }

    /// Delete a record and, best effort, the objects its blob key set
    /// names. Deleting an absent record succeeds.
    pub async fn delete_record(&self, store_id: &str, record_id: &str) -> Result<(), StoreError> {
        validate_id("store_id", store_id)?;
        validate_id("record_id", record_id)?;

        match self.metadata.get_record(store_id, record_id).await {
            Ok(record) => {
                for blob_name in &record.blob_keys {
                    if let Err(err) = self.blobs.delete(store_id, record_id, blob_name).await {
                        warn!(
                            "delete_record {}: blob delete failed for blob: {}: {}",
                            record.concat_key(),
                            blob_name,
                            err
                        );
                    }
                }
            }
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        self.metadata.delete_record(store_id, record_id).await?;
        info!("deleted record: {}#{}", store_id, record_id);
        Ok(())
    }

    pub async fn query_records(
        &self,
        store_id: &str,
        query: RecordQuery,
    ) -> Result<Vec<RecordRow>, StoreError> {
        validate_id("store_id", store_id)?;
        self.metadata.query_records(store_id, query).await
    }

    /// Upload a blob and bring the record's blob key set into agreement.
    /// When the record update fails the just-written object is deleted and
    /// the call fails; the object tier never keeps bytes no record names.
    pub async fn upload_blob(
        &self,
        store_id: &str,
        record_id: &str,
        blob_name: &str,
        body: BlobBody,
        size: Option<u64>,
    ) -> Result<u64, StoreError> {
        validate_id("store_id", store_id)?;
        validate_id("record_id", record_id)?;
        validate_blob_name(blob_name)?;

        let written = self
            .blobs
            .put(store_id, record_id, blob_name, body, size)
            .await?;

        if let Err(err) = self.attach_blob_key(store_id, record_id, blob_name).await {
            if let Err(rollback_err) = self.blobs.delete(store_id, record_id, blob_name).await {
                warn!(
                    "upload rollback failed for blob: {}/{}/{}: {}",
                    store_id, record_id, blob_name, rollback_err
                );
            }
            return Err(err);
        }

        info!(
            "uploaded blob: {}/{}/{}, size: {}",
            store_id, record_id, blob_name, written
        );
        Ok(written)
    }

    async fn attach_blob_key(
        &self,
        store_id: &str,
        record_id: &str,
        blob_name: &str,
    ) -> Result<(), StoreError> {
        let mut record = self.metadata.get_record(store_id, record_id).await?;
        if !record.add_blob_key(blob_name) {
            return Ok(());
        }
        self.metadata
            .update_record(
                store_id,
                record_id,
                RecordUpdate {
                    blob_keys: Some(record.blob_keys),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    pub async fn download_blob(
        &self,
        store_id: &str,
        record_id: &str,
        blob_name: &str,
    ) -> Result<BlobDownload, StoreError> {
        validate_id("store_id", store_id)?;
        validate_id("record_id", record_id)?;
        validate_blob_name(blob_name)?;
        self.blobs.get(store_id, record_id, blob_name).await
    }

    /// List the blob names stored for a record. The record must exist; the
    /// object tier answers, since blob keys may name pending uploads.
    pub async fn list_blobs(
        &self,
        store_id: &str,
        record_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        validate_id("store_id", store_id)?;
        validate_id("record_id", record_id)?;
        self.metadata.get_record(store_id, record_id).await?;
        self.blobs.list(store_id, record_id).await
    }

    /// Delete a blob. The object goes first; a failure detaching the name
    /// from the record is accepted with a warning because the bytes are
    /// already gone and re-upload is the recovery path.
    pub async fn delete_blob(
        &self,
        store_id: &str,
        record_id: &str,
        blob_name: &str,
    ) -> Result<(), StoreError> {
        validate_id("store_id", store_id)?;
        validate_id("record_id", record_id)?;
        validate_blob_name(blob_name)?;

        self.blobs.delete(store_id, record_id, blob_name).await?;

        match self.metadata.get_record(store_id, record_id).await {
            Ok(mut record) => {
                if record.remove_blob_key(blob_name) {
                    if let Err(err) = self
                        .metadata
                        .update_record(
                            store_id,
                            record_id,
                            RecordUpdate {
                                blob_keys: Some(record.blob_keys),
                                ..Default::default()
                            },
                        )
                        .await
                    {
                        warn!(
                            "blob key detach failed for blob: {}/{}/{}: {}",
                            store_id, record_id, blob_name, err
                        );
                    }
                }
            }
            Err(StoreError::NotFound(_)) => {}
            Err(err) => warn!(
                "record read failed after blob delete for blob: {}/{}/{}: {}",
                store_id, record_id, blob_name, err
            ),
        }
        Ok(())
    }
}
