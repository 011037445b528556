//! MongoDB implementation of MetadataStore
//!
//! Collections `stores`, `records`, and `metadata`. Existence checks run a
//! count query before the insert; the window between count and insert is
//! closed by the unique compound index on `{store_id, record_id}` (and on
//! `{store_id}` / `{metadata_type, metadata_id}`), whose duplicate-key
//! failures map to `AlreadyExists`. The compound indexes
//! `{owner_id, concat_key}` and `{game_id, concat_key}` back the planner's
//! index strategies; all of them are created at connect time.

use async_trait::async_trait;
use futures::TryStreamExt;
use log::{info, warn};
use mongodb::bson::{doc, Bson};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};

use crate::config::DocumentConfig;
use crate::error::StoreError;
use crate::metadata::{
    query, record_count_from_stats, store_info_payload, store_stats_payload, MetadataStore,
    DEFAULT_STORE_PAGE_SIZE, DELETE_BATCH_SIZE, STORE_INFO_TYPE, STORE_STATS_TYPE,
};
use crate::model::{
    concat_key, concat_key_prefix, MetadataRow, Properties, RecordQuery, RecordRow, RecordUpdate,
    StoreList, StorePage, StoreRow,
};

#[derive(Debug, Serialize, Deserialize)]
struct StoreDoc {
    store_id: String,
    name: String,
    created_at: i64,
    updated_at: i64,
}

impl StoreDoc {
    fn from_row(store: &StoreRow) -> Self {
        Self {
            store_id: store.store_id.clone(),
            name: store.name.clone(),
            created_at: store.created_at,
            updated_at: store.updated_at,
        }
    }

    fn into_row(self) -> StoreRow {
        StoreRow {
            store_id: self.store_id,
            name: self.name,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordDoc {
    store_id: String,
    record_id: String,
    concat_key: String,
    #[serde(default)]
    owner_id: String,
    #[serde(default)]
    game_id: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    properties: Properties,
    #[serde(default)]
    blob_keys: Vec<String>,
    created_at: i64,
    updated_at: i64,
}

impl RecordDoc {
    fn from_row(record: &RecordRow) -> Self {
        Self {
            store_id: record.store_id.clone(),
            record_id: record.record_id.clone(),
            concat_key: record.concat_key(),
            owner_id: record.owner_id.clone(),
            game_id: record.game_id.clone(),
            tags: record.tags.clone(),
            properties: record.properties.clone(),
            blob_keys: record.blob_keys.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    fn into_row(self) -> RecordRow {
        RecordRow {
            store_id: self.store_id,
            record_id: self.record_id,
            owner_id: self.owner_id,
            game_id: self.game_id,
            tags: self.tags,
            properties: self.properties,
            blob_keys: self.blob_keys,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataDoc {
    metadata_type: String,
    metadata_id: String,
    #[serde(default)]
    payload: Properties,
}

/// MongoDB metadata backend
pub struct DocumentMetadataStore {
    stores: Collection<StoreDoc>,
    records: Collection<RecordDoc>,
    metadata: Collection<MetadataDoc>,
}

fn classify_mongo_error(err: mongodb::error::Error, what: &str) -> StoreError {
    match err.kind.as_ref() {
        ErrorKind::ServerSelection { .. } | ErrorKind::Io(_) => {
            StoreError::Unavailable(format!("{}: {}", what, err))
        }
        _ => StoreError::Internal(format!("{}: {}", what, err)),
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        _ => false,
    }
}

fn to_bson_payload(payload: &Properties, what: &str) -> Result<Bson, StoreError> {
    mongodb::bson::to_bson(payload)
        .map_err(|err| StoreError::Internal(format!("serialize {}: {}", what, err)))
}

impl DocumentMetadataStore {
    /// Connect to the configured endpoint and prepare the collections. The
    /// compound indexes are created here so the planner strategies stay
    /// efficient and uniqueness is enforced at the schema layer.
    pub async fn connect(
        config: &DocumentConfig,
        password: Option<String>,
    ) -> Result<Self, StoreError> {
        let mut options = mongodb::options::ClientOptions::parse(&config.endpoint)
            .await
            .map_err(|err| classify_mongo_error(err, "parse endpoint"))?;
        if let Some(username) = config.username.clone() {
            let mut credential = mongodb::options::Credential::default();
            credential.username = Some(username);
            credential.password = password;
            options.credential = Some(credential);
        }
        let client = Client::with_options(options)
            .map_err(|err| classify_mongo_error(err, "connect"))?;
        let database = client.database(&config.database);

        let store = Self {
            stores: database.collection("stores"),
            records: database.collection("records"),
            metadata: database.collection("metadata"),
        };
        store.ensure_indexes().await?;
        info!("document backend ready, database: {}", config.database);
        Ok(store)
    }

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let unique = IndexOptions::builder().unique(true).build();

        self.stores
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "store_id": 1 })
                    .options(unique.clone())
                    .build(),
            )
            .await
            .map_err(|err| classify_mongo_error(err, "create store index"))?;

        for model in [
            IndexModel::builder()
                .keys(doc! { "store_id": 1, "record_id": 1 })
                .options(unique.clone())
                .build(),
            IndexModel::builder()
                .keys(doc! { "owner_id": 1, "concat_key": 1 })
                .build(),
            IndexModel::builder()
                .keys(doc! { "game_id": 1, "concat_key": 1 })
                .build(),
        ] {
            self.records
                .create_index(model)
                .await
                .map_err(|err| classify_mongo_error(err, "create record index"))?;
        }

        self.metadata
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "metadata_type": 1, "metadata_id": 1 })
                    .options(unique)
                    .build(),
            )
            .await
            .map_err(|err| classify_mongo_error(err, "create metadata index"))?;
        Ok(())
    }

    /// Range filter selecting every concat key of one store. The upper
    /// bound replaces the trailing `#` with the next code point.
    fn concat_range(store_id: &str) -> mongodb::bson::Document {
        doc! {
            "$gte": concat_key_prefix(store_id),
            "$lt": format!("{}$", store_id),
        }
    }

    async fn bump_record_count(&self, store_id: &str, delta: i64) {
        let current = match self.get_metadata(STORE_STATS_TYPE, store_id).await {
            Ok(row) => record_count_from_stats(&row.payload),
            Err(StoreError::NotFound(_)) => 0,
            Err(err) => {
                warn!("store_stats read failed for store: {}: {}", store_id, err);
                return;
            }
        };
        if let Err(err) = self
            .set_metadata(STORE_STATS_TYPE, store_id, store_stats_payload(current + delta))
            .await
        {
            warn!("store_stats write failed for store: {}: {}", store_id, err);
        }
    }
}

#[async_trait]
impl MetadataStore for DocumentMetadataStore {
    async fn create_store(&self, store: StoreRow) -> Result<StoreRow, StoreError> {
        let existing = self
            .stores
            .count_documents(doc! { "store_id": &store.store_id })
            .await
            .map_err(|err| classify_mongo_error(err, "create store"))?;
        if existing > 0 {
            return Err(StoreError::AlreadyExists(format!("store {}", store.store_id)));
        }

        // A concurrent create can slip between the count and the insert;
        // the unique index turns that race into a duplicate-key error.
        if let Err(err) = self.stores.insert_one(StoreDoc::from_row(&store)).await {
            if is_duplicate_key(&err) {
                return Err(StoreError::AlreadyExists(format!("store {}", store.store_id)));
            }
            return Err(classify_mongo_error(err, "create store"));
        }

        if let Err(err) = self
            .set_metadata(STORE_INFO_TYPE, &store.store_id, store_info_payload(&store))
            .await
        {
            warn!("store_info write failed for store: {}: {}", store.store_id, err);
        }
        Ok(store)
    }

    async fn get_store(&self, store_id: &str) -> Result<StoreRow, StoreError> {
        self.stores
            .find_one(doc! { "store_id": store_id })
            .await
            .map_err(|err| classify_mongo_error(err, "get store"))?
            .map(StoreDoc::into_row)
            .ok_or_else(|| StoreError::NotFound(format!("store {}", store_id)))
    }

    async fn list_stores(&self, page: StorePage) -> Result<StoreList, StoreError> {
        let cap = page.limit.unwrap_or(DEFAULT_STORE_PAGE_SIZE).max(1);
        let filter = match page.page_token.as_deref() {
            Some(token) => {
                let bytes = hex::decode(token)
                    .map_err(|_| StoreError::Invalid("malformed page token".to_string()))?;
                let last_id = String::from_utf8(bytes)
                    .map_err(|_| StoreError::Invalid("malformed page token".to_string()))?;
                doc! { "store_id": { "$gt": last_id } }
            }
            None => doc! {},
        };

        let mut cursor = self
            .stores
            .find(filter)
            .sort(doc! { "store_id": 1 })
            .limit(cap as i64)
            .await
            .map_err(|err| classify_mongo_error(err, "list stores"))?;

        let mut stores = Vec::new();
        while let Some(store) = cursor
            .try_next()
            .await
            .map_err(|err| classify_mongo_error(err, "list stores"))?
        {
            stores.push(store.into_row());
        }

        let next_page_token = if stores.len() == cap as usize {
            stores.last().map(|store| hex::encode(&store.store_id))
        } else {
            None
        };
        Ok(StoreList {
            stores,
            next_page_token,
        })
    }

    async fn delete_store(&self, store_id: &str) -> Result<(), StoreError> {
        self.stores
            .delete_one(doc! { "store_id": store_id })
            .await
            .map_err(|err| classify_mongo_error(err, "delete store"))?;

        // Cascade over the records in bounded batches; once the store row
        // is gone failures only warrant warnings.
        loop {
            let mut cursor = match self
                .records
                .find(doc! { "store_id": store_id })
                .limit(DELETE_BATCH_SIZE as i64)
                .await
            {
                Ok(cursor) => cursor,
                Err(err) => {
                    warn!("delete_store {}: record enumeration failed: {}", store_id, err);
                    break;
                }
            };

            let mut record_ids = Vec::new();
            loop {
                match cursor.try_next().await {
                    Ok(Some(record)) => record_ids.push(record.record_id),
                    Ok(None) => break,
                    Err(err) => {
                        warn!("delete_store {}: record cursor failed: {}", store_id, err);
                        break;
                    }
                }
            }
            if record_ids.is_empty() {
                break;
            }

            if let Err(err) = self
                .records
                .delete_many(doc! { "store_id": store_id, "record_id": { "$in": &record_ids } })
                .await
            {
                warn!("delete_store {}: record batch delete failed: {}", store_id, err);
                break;
            }
        }

        for metadata_type in [STORE_INFO_TYPE, STORE_STATS_TYPE] {
            if let Err(err) = self.delete_metadata(metadata_type, store_id).await {
                warn!(
                    "delete_store {}: companion {} cleanup failed: {}",
                    store_id, metadata_type, err
                );
            }
        }
        Ok(())
    }

    async fn create_record(&self, mut record: RecordRow) -> Result<RecordRow, StoreError> {
        self.get_store(&record.store_id).await?;
        record.resolve_indexed_fields();

        let existing = self
            .records
            .count_documents(doc! {
                "store_id": &record.store_id,
                "record_id": &record.record_id,
            })
            .await
            .map_err(|err| classify_mongo_error(err, "create record"))?;
        if existing > 0 {
            return Err(StoreError::AlreadyExists(format!("record {}", record.concat_key())));
        }

        if let Err(err) = self.records.insert_one(RecordDoc::from_row(&record)).await {
            if is_duplicate_key(&err) {
                return Err(StoreError::AlreadyExists(format!("record {}", record.concat_key())));
            }
            return Err(classify_mongo_error(err, "create record"));
        }

        self.bump_record_count(&record.store_id, 1).await;
        Ok(record)
    }

    async fn get_record(&self, store_id: &str, record_id: &str) -> Result<RecordRow, StoreError> {
        self.records
            .find_one(doc! { "store_id": store_id, "record_id": record_id })
            .await
            .map_err(|err| classify_mongo_error(err, "get record"))?
            .map(RecordDoc::into_row)
            .ok_or_else(|| StoreError::NotFound(format!("record {}", concat_key(store_id, record_id))))
    }

    async fn update_record(
        &self,
        store_id: &str,
        record_id: &str,
        update: RecordUpdate,
    ) -> Result<RecordRow, StoreError> {
        let mut record = self.get_record(store_id, record_id).await?;
        update.apply_to(&mut record);

        let result = self
            .records
            .replace_one(
                doc! { "store_id": store_id, "record_id": record_id },
                RecordDoc::from_row(&record),
            )
            .await
            .map_err(|err| classify_mongo_error(err, "update record"))?;
        if result.matched_count == 0 {
            return Err(StoreError::NotFound(format!(
                "record {}",
                concat_key(store_id, record_id)
            )));
        }
        Ok(record)
    }

    async fn delete_record(&self, store_id: &str, record_id: &str) -> Result<(), StoreError> {
        let result = self
            .records
            .delete_one(doc! { "store_id": store_id, "record_id": record_id })
            .await
            .map_err(|err| classify_mongo_error(err, "delete record"))?;
        if result.deleted_count > 0 {
            self.bump_record_count(store_id, -1).await;
        }
        Ok(())
    }

    async fn query_records(
        &self,
        store_id: &str,
        query: RecordQuery,
    ) -> Result<Vec<RecordRow>, StoreError> {
        if query::is_empty_result(&query) {
            return Ok(Vec::new());
        }

        let filter = match query::plan(&query) {
            query::QueryStrategy::GameIdIndex(game_id) => doc! {
                "game_id": game_id,
                "concat_key": Self::concat_range(store_id),
            },
            query::QueryStrategy::OwnerIdIndex(owner_id) => doc! {
                "owner_id": owner_id,
                "concat_key": Self::concat_range(store_id),
            },
            query::QueryStrategy::PrimaryKey => doc! { "store_id": store_id },
        };

        let mut find = self.records.find(filter);
        if let Some(limit) = query.limit {
            find = find.limit(limit as i64);
        }
        let mut cursor = find
            .await
            .map_err(|err| classify_mongo_error(err, "query records"))?;

        let mut records = Vec::new();
        while let Some(record) = cursor
            .try_next()
            .await
            .map_err(|err| classify_mongo_error(err, "query records"))?
        {
            records.push(record.into_row());
        }

        Ok(records
            .into_iter()
            .filter(|record| query::matches_post_filters(record, &query))
            .collect())
    }

    async fn get_metadata(
        &self,
        metadata_type: &str,
        metadata_id: &str,
    ) -> Result<MetadataRow, StoreError> {
        self.metadata
            .find_one(doc! { "metadata_type": metadata_type, "metadata_id": metadata_id })
            .await
            .map_err(|err| classify_mongo_error(err, "get metadata"))?
            .map(|doc| MetadataRow {
                metadata_type: doc.metadata_type,
                metadata_id: doc.metadata_id,
                payload: doc.payload,
            })
            .ok_or_else(|| {
                StoreError::NotFound(format!("metadata {}/{}", metadata_type, metadata_id))
            })
    }

    async fn set_metadata(
        &self,
        metadata_type: &str,
        metadata_id: &str,
        payload: Properties,
    ) -> Result<(), StoreError> {
        let payload = to_bson_payload(&payload, "metadata payload")?;
        self.metadata
            .update_one(
                doc! { "metadata_type": metadata_type, "metadata_id": metadata_id },
                doc! { "$set": { "payload": payload } },
            )
            .upsert(true)
            .await
            .map_err(|err| classify_mongo_error(err, "set metadata"))?;
        Ok(())
    }

    async fn delete_metadata(
        &self,
        metadata_type: &str,
        metadata_id: &str,
    ) -> Result<(), StoreError> {
        self.metadata
            .delete_one(doc! { "metadata_type": metadata_type, "metadata_id": metadata_id })
            .await
            .map_err(|err| classify_mongo_error(err, "delete metadata"))?;
        Ok(())
    }

    async fn query_metadata(&self, metadata_type: &str) -> Result<Vec<MetadataRow>, StoreError> {
        let mut cursor = self
            .metadata
            .find(doc! { "metadata_type": metadata_type })
            .await
            .map_err(|err| classify_mongo_error(err, "query metadata"))?;

        let mut rows = Vec::new();
        while let Some(doc) = cursor
            .try_next()
            .await
            .map_err(|err| classify_mongo_error(err, "query metadata"))?
        {
            let mut payload = doc.payload;
            payload.insert(
                "metadata_id".to_string(),
                serde_json::Value::String(doc.metadata_id.clone()),
            );
            rows.push(MetadataRow {
                metadata_type: doc.metadata_type,
                metadata_id: doc.metadata_id,
                payload,
            });
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_doc_round_trip() {
        let mut record = RecordRow::new("s1", "r1");
        record.owner_id = "o1".to_string();
        record.tags = vec!["a".to_string()];
        record
            .properties
            .insert("level".to_string(), serde_json::Value::Number(7.into()));
        record.resolve_indexed_fields();

        let doc = RecordDoc::from_row(&record);
        assert_eq!(doc.concat_key, "s1#r1");
        assert_eq!(doc.into_row(), record);
    }

    #[test]
    fn test_concat_range_bounds() {
        let range = DocumentMetadataStore::concat_range("s1");
        assert_eq!(range.get_str("$gte").unwrap(), "s1#");
        assert_eq!(range.get_str("$lt").unwrap(), "s1$");
    }
}
