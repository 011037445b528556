//! Wire types for the HTTP surface
//!
//! Bodies use snake_case fields; timestamps are RFC 3339 strings on the
//! wire and epoch seconds internally.

use serde::{Deserialize, Serialize};

use crate::model::{Properties, RecordQuery, RecordRow, RecordUpdate, StoreList, StoreRow};
use crate::service::record_service::NewRecord;

/// Render an internal epoch-seconds timestamp for the wire
pub fn rfc3339(secs: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
pub struct CreateStoreRequest {
    pub store_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct StoreResponse {
    pub store_id: String,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<StoreRow> for StoreResponse {
    fn from(store: StoreRow) -> Self {
        Self {
            store_id: store.store_id,
            name: store.name,
            created_at: rfc3339(store.created_at),
            updated_at: rfc3339(store.updated_at),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListStoresParams {
    pub limit: Option<u32>,
    pub page_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListStoresResponse {
    pub stores: Vec<StoreResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

impl From<StoreList> for ListStoresResponse {
    fn from(list: StoreList) -> Self {
        Self {
            stores: list.stores.into_iter().map(StoreResponse::from).collect(),
            next_page_token: list.next_page_token,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRecordRequest {
    pub record_id: String,
    pub owner_id: Option<String>,
    pub game_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub blob_keys: Vec<String>,
}

impl From<CreateRecordRequest> for NewRecord {
    fn from(request: CreateRecordRequest) -> Self {
        Self {
            record_id: request.record_id,
            owner_id: request.owner_id,
            game_id: request.game_id,
            tags: request.tags,
            properties: request.properties,
            blob_keys: request.blob_keys,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateRecordRequest {
    pub owner_id: Option<String>,
    pub game_id: Option<String>,
    pub tags: Option<Vec<String>>,
    pub properties: Option<Properties>,
    pub blob_keys: Option<Vec<String>>,
}

impl From<UpdateRecordRequest> for RecordUpdate {
    fn from(request: UpdateRecordRequest) -> Self {
        Self {
            owner_id: request.owner_id,
            game_id: request.game_id,
            tags: request.tags,
            properties: request.properties,
            blob_keys: request.blob_keys,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecordResponse {
    pub store_id: String,
    pub record_id: String,
    pub concat_key: String,
    pub owner_id: String,
    pub game_id: String,
    pub tags: Vec<String>,
    pub properties: Properties,
    pub blob_keys: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<RecordRow> for RecordResponse {
    fn from(record: RecordRow) -> Self {
        let concat_key = record.concat_key();
        Self {
            store_id: record.store_id,
            record_id: record.record_id,
            concat_key,
            owner_id: record.owner_id,
            game_id: record.game_id,
            tags: record.tags,
            properties: record.properties,
            blob_keys: record.blob_keys,
            created_at: rfc3339(record.created_at),
            updated_at: rfc3339(record.updated_at),
        }
    }
}

/// Query string of the record query endpoint. `tags` is comma separated so
/// older clients stay compatible with plain query strings.
#[derive(Debug, Deserialize)]
pub struct QueryRecordsParams {
    pub owner_id: Option<String>,
    pub game_id: Option<String>,
    pub tags: Option<String>,
    pub limit: Option<u32>,
}

impl From<QueryRecordsParams> for RecordQuery {
    fn from(params: QueryRecordsParams) -> Self {
        let tags = params
            .tags
            .map(|tags| {
                tags.split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            owner_id: params.owner_id,
            game_id: params.game_id,
            tags,
            limit: params.limit,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QueryRecordsResponse {
    pub records: Vec<RecordResponse>,
}

#[derive(Debug, Serialize)]
pub struct BlobUploadResponse {
    pub store_id: String,
    pub record_id: String,
    pub blob_name: String,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct ListBlobsResponse {
    pub blob_names: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MetadataResponse {
    pub metadata_type: String,
    pub metadata_id: String,
    pub payload: Properties,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3339_rendering() {
        assert_eq!(rfc3339(0), "1970-01-01T00:00:00Z");
        assert_eq!(rfc3339(1704067200), "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_query_params_tag_splitting() {
        let params = QueryRecordsParams {
            owner_id: None,
            game_id: None,
            tags: Some("a, b,,c".to_string()),
            limit: Some(5),
        };
        let query = RecordQuery::from(params);
        assert_eq!(query.tags, vec!["a", "b", "c"]);
        assert_eq!(query.limit, Some(5));
    }

    #[test]
    fn test_record_response_carries_concat_key() {
        let record = RecordRow::new("s1", "r1");
        let response = RecordResponse::from(record);
        assert_eq!(response.concat_key, "s1#r1");
    }
}
