//! DynamoDB implementation of MetadataStore
//!
//! Table layout:
//!
//! - `stores` with hash key `store_id`
//! - `records` with composite key (`store_id`, `record_id`) and the global
//!   secondary indexes `OwnerIDIndex` (`owner_id`, `concat_key`) and
//!   `GameIDIndex` (`game_id`, `concat_key`), both projecting all attributes
//! - `metadata` with composite key (`metadata_type`, `metadata_id`)
//!
//! Creates use `attribute_not_exists` conditions, updates `attribute_exists`;
//! cascade deletes run batched write requests capped at 25 items. Record
//! properties travel as a JSON string attribute; the owner/game columns are
//! written only when non-empty so the sparse indexes skip unindexed rows.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::types::{AttributeValue, DeleteRequest, ReturnValue, WriteRequest};
use aws_sdk_dynamodb::Client;
use log::warn;

use crate::config::DynamoConfig;
use crate::error::StoreError;
use crate::metadata::{
    query, record_count_from_stats, store_info_payload, store_stats_payload, MetadataStore,
    DEFAULT_STORE_PAGE_SIZE, DELETE_BATCH_SIZE, STORE_INFO_TYPE, STORE_STATS_TYPE,
};
use crate::model::{
    concat_key, concat_key_prefix, MetadataRow, Properties, RecordQuery, RecordRow, RecordUpdate,
    StoreList, StorePage, StoreRow,
};

const OWNER_ID_INDEX: &str = "OwnerIDIndex";
const GAME_ID_INDEX: &str = "GameIDIndex";

/// DynamoDB metadata backend
pub struct DynamoMetadataStore {
    client: Client,
    stores_table: String,
    records_table: String,
    metadata_table: String,
}

impl DynamoMetadataStore {
    /// Create a backend over a pre-built client and the configured tables
    pub fn new(client: Client, config: &DynamoConfig) -> Self {
        Self {
            client,
            stores_table: config.stores_table.clone(),
            records_table: config.records_table.clone(),
            metadata_table: config.metadata_table.clone(),
        }
    }

    /// Last-writer-wins adjustment of the per-store record counter. The
    /// counter is derived state; failures degrade to a warning.
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

    /// Delete one batch of record keys, reporting failures as warnings
    async fn delete_record_batch(&self, store_id: &str, chunk: &[(String, String)]) {
        let mut requests = Vec::with_capacity(chunk.len());
        for (sid, rid) in chunk {
            let mut key = HashMap::new();
            key.insert("store_id".to_string(), AttributeValue::S(sid.clone()));
            key.insert("record_id".to_string(), AttributeValue::S(rid.clone()));
            match DeleteRequest::builder().set_key(Some(key)).build() {
                Ok(delete) => requests.push(WriteRequest::builder().delete_request(delete).build()),
                Err(err) => warn!("delete_store {}: bad delete request: {}", store_id, err),
            }
        }
        if requests.is_empty() {
            return;
        }
        match self
            .client
            .batch_write_item()
            .request_items(self.records_table.clone(), requests)
            .send()
            .await
        {
            Ok(output) => {
                let unprocessed = output
                    .unprocessed_items()
                    .map(|items| items.values().map(Vec::len).sum::<usize>())
                    .unwrap_or(0);
                if unprocessed > 0 {
                    warn!(
                        "delete_store {}: {} record deletions left unprocessed",
                        store_id, unprocessed
                    );
                }
            }
            Err(err) => warn!("delete_store {}: record batch delete failed: {}", store_id, err),
        }
    }
}

fn classify_sdk_error<E>(err: SdkError<E>, what: &str) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            StoreError::Unavailable(format!("{}: {}", what, err))
        }
        _ => StoreError::Internal(format!("{}: {}", what, err)),
    }
}

fn get_s(item: &HashMap<String, AttributeValue>, name: &str) -> String {
    item.get(name)
        .and_then(|value| value.as_s().ok())
        .cloned()
        .unwrap_or_default()
}

fn get_n(item: &HashMap<String, AttributeValue>, name: &str) -> i64 {
    item.get(name)
        .and_then(|value| value.as_n().ok())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn get_string_list(item: &HashMap<String, AttributeValue>, name: &str) -> Vec<String> {
    item.get(name)
        .and_then(|value| value.as_l().ok())
        .map(|values| {
            values
                .iter()
                .filter_map(|value| value.as_s().ok().cloned())
                .collect()
        })
        .unwrap_or_default()
}

fn string_list(values: &[String]) -> AttributeValue {
    AttributeValue::L(values.iter().cloned().map(AttributeValue::S).collect())
}

fn store_to_item(store: &StoreRow) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    item.insert("store_id".to_string(), AttributeValue::S(store.store_id.clone()));
    item.insert("name".to_string(), AttributeValue::S(store.name.clone()));
    item.insert(
        "created_at".to_string(),
        AttributeValue::N(store.created_at.to_string()),
    );
    item.insert(
        "updated_at".to_string(),
        AttributeValue::N(store.updated_at.to_string()),
    );
    item
}

fn item_to_store(item: &HashMap<String, AttributeValue>) -> StoreRow {
    StoreRow {
        store_id: get_s(item, "store_id"),
        name: get_s(item, "name"),
        created_at: get_n(item, "created_at"),
        updated_at: get_n(item, "updated_at"),
    }
}

fn record_to_item(record: &RecordRow) -> Result<HashMap<String, AttributeValue>, StoreError> {
    let properties = serde_json::to_string(&record.properties)
        .map_err(|err| StoreError::Internal(format!("serialize properties: {}", err)))?;

    let mut item = HashMap::new();
    item.insert("store_id".to_string(), AttributeValue::S(record.store_id.clone()));
    item.insert("record_id".to_string(), AttributeValue::S(record.record_id.clone()));
    item.insert("concat_key".to_string(), AttributeValue::S(record.concat_key()));
    // The sparse secondary indexes only pick up rows that carry the hash
    // attribute, so empty columns are omitted rather than written blank.
    if !record.owner_id.is_empty() {
        item.insert("owner_id".to_string(), AttributeValue::S(record.owner_id.clone()));
    }
    if !record.game_id.is_empty() {
        item.insert("game_id".to_string(), AttributeValue::S(record.game_id.clone()));
    }
    item.insert("tags".to_string(), string_list(&record.tags));
    item.insert("properties".to_string(), AttributeValue::S(properties));
    item.insert("blob_keys".to_string(), string_list(&record.blob_keys));
    item.insert(
        "created_at".to_string(),
        AttributeValue::N(record.created_at.to_string()),
    );
    item.insert(
        "updated_at".to_string(),
        AttributeValue::N(record.updated_at.to_string()),
    );
    Ok(item)
}

fn item_to_record(item: &HashMap<String, AttributeValue>) -> RecordRow {
    let properties: Properties = item
        .get("properties")
        .and_then(|value| value.as_s().ok())
        .and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or_default();

    RecordRow {
        store_id: get_s(item, "store_id"),
        record_id: get_s(item, "record_id"),
        owner_id: get_s(item, "owner_id"),
        game_id: get_s(item, "game_id"),
        tags: get_string_list(item, "tags"),
        properties,
        blob_keys: get_string_list(item, "blob_keys"),
        created_at: get_n(item, "created_at"),
        updated_at: get_n(item, "updated_at"),
    }
}

fn item_to_metadata(item: &HashMap<String, AttributeValue>) -> MetadataRow {
    let payload: Properties = item
        .get("payload")
        .and_then(|value| value.as_s().ok())
        .and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or_default();
    MetadataRow {
        metadata_type: get_s(item, "metadata_type"),
        metadata_id: get_s(item, "metadata_id"),
        payload,
    }
}

fn metadata_key(metadata_type: &str, metadata_id: &str) -> HashMap<String, AttributeValue> {
    let mut key = HashMap::new();
    key.insert(
        "metadata_type".to_string(),
        AttributeValue::S(metadata_type.to_string()),
    );
    key.insert(
        "metadata_id".to_string(),
        AttributeValue::S(metadata_id.to_string()),
    );
    key
}

#[async_trait]
impl MetadataStore for DynamoMetadataStore {
    async fn create_store(&self, store: StoreRow) -> Result<StoreRow, StoreError> {
        let result = self
            .client
            .put_item()
            .table_name(&self.stores_table)
            .set_item(Some(store_to_item(&store)))
            .condition_expression("attribute_not_exists(store_id)")
            .send()
            .await;
        if let Err(err) = result {
            if err
                .as_service_error()
                .map_or(false, |e| e.is_conditional_check_failed_exception())
            {
                return Err(StoreError::AlreadyExists(format!("store {}", store.store_id)));
            }
            return Err(classify_sdk_error(err, "create store"));
        }

        // The store row is authoritative; the descriptor row is derived
        // state and its failure only warrants a warning.
        if let Err(err) = self
            .set_metadata(STORE_INFO_TYPE, &store.store_id, store_info_payload(&store))
            .await
        {
            warn!("store_info write failed for store: {}: {}", store.store_id, err);
        }
        Ok(store)
    }

    async fn get_store(&self, store_id: &str) -> Result<StoreRow, StoreError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.stores_table)
            .key("store_id", AttributeValue::S(store_id.to_string()))
            .send()
            .await
            .map_err(|err| classify_sdk_error(err, "get store"))?;
        output
            .item()
            .map(item_to_store)
            .ok_or_else(|| StoreError::NotFound(format!("store {}", store_id)))
    }

    async fn list_stores(&self, page: StorePage) -> Result<StoreList, StoreError> {
        let cap = page.limit.unwrap_or(DEFAULT_STORE_PAGE_SIZE).max(1);
        let mut request = self
            .client
            .scan()
            .table_name(&self.stores_table)
            .limit(cap as i32);
        if let Some(token) = page.page_token.as_deref() {
            let bytes = hex::decode(token)
                .map_err(|_| StoreError::Invalid("malformed page token".to_string()))?;
            let last_id = String::from_utf8(bytes)
                .map_err(|_| StoreError::Invalid("malformed page token".to_string()))?;
            let mut start_key = HashMap::new();
            start_key.insert("store_id".to_string(), AttributeValue::S(last_id));
            request = request.set_exclusive_start_key(Some(start_key));
        }

        let output = request
            .send()
            .await
            .map_err(|err| classify_sdk_error(err, "list stores"))?;
        let stores = output.items().iter().map(item_to_store).collect();
        let next_page_token = output
            .last_evaluated_key()
            .and_then(|key| key.get("store_id"))
            .and_then(|value| value.as_s().ok())
            .map(hex::encode);
        Ok(StoreList {
            stores,
            next_page_token,
        })
    }

    async fn delete_store(&self, store_id: &str) -> Result<(), StoreError> {
        // The store row goes first. Once it is gone the operation succeeds
        // even if parts of the cascade fail; orphans are reclaimed on the
        // next delete.
        self.client
            .delete_item()
            .table_name(&self.stores_table)
            .key("store_id", AttributeValue::S(store_id.to_string()))
            .send()
            .await
            .map_err(|err| classify_sdk_error(err, "delete store"))?;

        let mut start_key: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let mut request = self
                .client
                .query()
                .table_name(&self.records_table)
                .key_condition_expression("store_id = :s")
                .expression_attribute_values(":s", AttributeValue::S(store_id.to_string()))
                .projection_expression("store_id, record_id");
            if let Some(key) = start_key.take() {
                request = request.set_exclusive_start_key(Some(key));
            }
            let output = match request.send().await {
                Ok(output) => output,
                Err(err) => {
                    warn!("delete_store {}: record enumeration failed: {}", store_id, err);
                    break;
                }
            };

            let keys: Vec<(String, String)> = output
                .items()
                .iter()
                .map(|item| (get_s(item, "store_id"), get_s(item, "record_id")))
                .collect();
            for chunk in keys.chunks(DELETE_BATCH_SIZE) {
                self.delete_record_batch(store_id, chunk).await;
            }

            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
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

        let result = self
            .client
            .put_item()
            .table_name(&self.records_table)
            .set_item(Some(record_to_item(&record)?))
            .condition_expression("attribute_not_exists(store_id)")
            .send()
            .await;
        if let Err(err) = result {
            if err
                .as_service_error()
                .map_or(false, |e| e.is_conditional_check_failed_exception())
            {
                return Err(StoreError::AlreadyExists(format!("record {}", record.concat_key())));
            }
            return Err(classify_sdk_error(err, "create record"));
        }

        self.bump_record_count(&record.store_id, 1).await;
        Ok(record)
    }

    async fn get_record(&self, store_id: &str, record_id: &str) -> Result<RecordRow, StoreError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.records_table)
            .key("store_id", AttributeValue::S(store_id.to_string()))
            .key("record_id", AttributeValue::S(record_id.to_string()))
            .send()
            .await
            .map_err(|err| classify_sdk_error(err, "get record"))?;
        output
            .item()
            .map(item_to_record)
            .ok_or_else(|| StoreError::NotFound(format!("record {}", concat_key(store_id, record_id))))
    }

    async fn update_record(
        &self,
        store_id: &str,
        record_id: &str,
        update: RecordUpdate,
    ) -> Result<RecordRow, StoreError> {
        // Read, apply the present fields, and write back conditioned on the
        // row still existing. Concurrent updates resolve last-writer-wins.
        let mut record = self.get_record(store_id, record_id).await?;
        update.apply_to(&mut record);

        let result = self
            .client
            .put_item()
            .table_name(&self.records_table)
            .set_item(Some(record_to_item(&record)?))
            .condition_expression("attribute_exists(store_id)")
            .send()
            .await;
        if let Err(err) = result {
            if err
                .as_service_error()
                .map_or(false, |e| e.is_conditional_check_failed_exception())
            {
                return Err(StoreError::NotFound(format!(
                    "record {}",
                    concat_key(store_id, record_id)
                )));
            }
            return Err(classify_sdk_error(err, "update record"));
        }
        Ok(record)
    }

    async fn delete_record(&self, store_id: &str, record_id: &str) -> Result<(), StoreError> {
        let output = self
            .client
            .delete_item()
            .table_name(&self.records_table)
            .key("store_id", AttributeValue::S(store_id.to_string()))
            .key("record_id", AttributeValue::S(record_id.to_string()))
            .return_values(ReturnValue::AllOld)
            .send()
            .await
            .map_err(|err| classify_sdk_error(err, "delete record"))?;
        if output.attributes().is_some_and(|attrs| !attrs.is_empty()) {
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

        let mut records = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let mut request = match query::plan(&query) {
                query::QueryStrategy::GameIdIndex(game_id) => self
                    .client
                    .query()
                    .table_name(&self.records_table)
                    .index_name(GAME_ID_INDEX)
                    .key_condition_expression("game_id = :g AND begins_with(concat_key, :p)")
                    .expression_attribute_values(":g", AttributeValue::S(game_id.to_string()))
                    .expression_attribute_values(
                        ":p",
                        AttributeValue::S(concat_key_prefix(store_id)),
                    ),
                query::QueryStrategy::OwnerIdIndex(owner_id) => self
                    .client
                    .query()
                    .table_name(&self.records_table)
                    .index_name(OWNER_ID_INDEX)
                    .key_condition_expression("owner_id = :o AND begins_with(concat_key, :p)")
                    .expression_attribute_values(":o", AttributeValue::S(owner_id.to_string()))
                    .expression_attribute_values(
                        ":p",
                        AttributeValue::S(concat_key_prefix(store_id)),
                    ),
                query::QueryStrategy::PrimaryKey => self
                    .client
                    .query()
                    .table_name(&self.records_table)
                    .key_condition_expression("store_id = :s")
                    .expression_attribute_values(":s", AttributeValue::S(store_id.to_string())),
            };
            if let Some(limit) = query.limit {
                request = request.limit(limit as i32);
            }
            if let Some(key) = start_key.take() {
                request = request.set_exclusive_start_key(Some(key));
            }

            let output = request
                .send()
                .await
                .map_err(|err| classify_sdk_error(err, "query records"))?;
            records.extend(output.items().iter().map(item_to_record));

            // A set limit is a page cap: one backend page, filtered below.
            if query.limit.is_some() {
                break;
            }
            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
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
        let output = self
            .client
            .get_item()
            .table_name(&self.metadata_table)
            .set_key(Some(metadata_key(metadata_type, metadata_id)))
            .send()
            .await
            .map_err(|err| classify_sdk_error(err, "get metadata"))?;
        output
            .item()
            .map(item_to_metadata)
            .ok_or_else(|| StoreError::NotFound(format!("metadata {}/{}", metadata_type, metadata_id)))
    }

    async fn set_metadata(
        &self,
        metadata_type: &str,
        metadata_id: &str,
        payload: Properties,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(&payload)
            .map_err(|err| StoreError::Internal(format!("serialize metadata: {}", err)))?;
        let mut item = metadata_key(metadata_type, metadata_id);
        item.insert("payload".to_string(), AttributeValue::S(json));
        self.client
            .put_item()
            .table_name(&self.metadata_table)
            .set_item(Some(item))
            .send()
            .await
            .map_err(|err| classify_sdk_error(err, "set metadata"))?;
        Ok(())
    }

    async fn delete_metadata(
        &self,
        metadata_type: &str,
        metadata_id: &str,
    ) -> Result<(), StoreError> {
        self.client
            .delete_item()
            .table_name(&self.metadata_table)
            .set_key(Some(metadata_key(metadata_type, metadata_id)))
            .send()
            .await
            .map_err(|err| classify_sdk_error(err, "delete metadata"))?;
        Ok(())
    }

    async fn query_metadata(&self, metadata_type: &str) -> Result<Vec<MetadataRow>, StoreError> {
        let mut rows = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let mut request = self
                .client
                .query()
                .table_name(&self.metadata_table)
                .key_condition_expression("metadata_type = :t")
                .expression_attribute_values(":t", AttributeValue::S(metadata_type.to_string()));
            if let Some(key) = start_key.take() {
                request = request.set_exclusive_start_key(Some(key));
            }
            let output = request
                .send()
                .await
                .map_err(|err| classify_sdk_error(err, "query metadata"))?;
            rows.extend(output.items().iter().map(|item| {
                let mut row = item_to_metadata(item);
                row.payload.insert(
                    "metadata_id".to_string(),
                    serde_json::Value::String(row.metadata_id.clone()),
                );
                row
            }));
            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> RecordRow {
        let mut record = RecordRow::new("s1", "r1");
        record.owner_id = "o1".to_string();
        record.game_id = "g1".to_string();
        record.tags = vec!["a".to_string(), "b".to_string()];
        record.blob_keys = vec!["save.dat".to_string()];
        record
            .properties
            .insert("level".to_string(), serde_json::Value::Number(7.into()));
        record.resolve_indexed_fields();
        record
    }

    #[test]
    fn test_record_marshalling_round_trip() {
        let record = sample_record();
        let item = record_to_item(&record).unwrap();
        assert_eq!(
            item.get("concat_key").unwrap().as_s().unwrap(),
            &"s1#r1".to_string()
        );
        let back = item_to_record(&item);
        assert_eq!(back, record);
    }

    #[test]
    fn test_empty_index_columns_are_omitted() {
        let record = RecordRow::new("s1", "r1");
        let item = record_to_item(&record).unwrap();
        assert!(!item.contains_key("owner_id"));
        assert!(!item.contains_key("game_id"));
        let back = item_to_record(&item);
        assert_eq!(back.owner_id, "");
        assert_eq!(back.game_id, "");
    }

    #[test]
    fn test_store_marshalling_round_trip() {
        let store = StoreRow::new("s1", "Saves");
        let back = item_to_store(&store_to_item(&store));
        assert_eq!(back, store);
    }
}
