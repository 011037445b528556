//! Mock implementation of MetadataStore for testing
//!
//! Keeps the full contract semantics in process memory, including the
//! companion typed-metadata rows, so service and gateway tests exercise the
//! same behavior the cloud backends provide. Failure-injection toggles let
//! tests drive the partial-failure interleavings.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::warn;

use crate::error::StoreError;
use crate::metadata::{
    query, store_info_payload, store_stats_payload, MetadataStore, DEFAULT_STORE_PAGE_SIZE,
    DELETE_BATCH_SIZE, STORE_INFO_TYPE, STORE_STATS_TYPE,
};
use crate::model::{
    MetadataRow, Properties, RecordQuery, RecordRow, RecordUpdate, StoreList, StorePage, StoreRow,
};

#[derive(Default)]
struct MockState {
    stores: BTreeMap<String, StoreRow>,
    records: BTreeMap<(String, String), RecordRow>,
    metadata: BTreeMap<(String, String), Properties>,
}

/// In-memory metadata backend for tests
pub struct MockMetadataStore {
    state: Arc<Mutex<MockState>>,
    fail_record_updates: AtomicBool,
}

impl MockMetadataStore {
    /// Create a new empty mock store
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            fail_record_updates: AtomicBool::new(false),
        }
    }

    /// Clear all data from the store (useful for test cleanup)
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.stores.clear();
        state.records.clear();
        state.metadata.clear();
    }

    /// Number of stores currently held
    pub fn store_count(&self) -> usize {
        self.state.lock().unwrap().stores.len()
    }

    /// Number of records currently held for a store
    pub fn record_count(&self, store_id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .records
            .keys()
            .filter(|(sid, _)| sid == store_id)
            .count()
    }

    /// Make every following record update fail with `Conflict`
    pub fn fail_record_updates(&self, fail: bool) {
        self.fail_record_updates.store(fail, Ordering::SeqCst);
    }

    fn bump_record_count(state: &mut MockState, store_id: &str, delta: i64) {
        let key = (STORE_STATS_TYPE.to_string(), store_id.to_string());
        let current = state
            .metadata
            .get(&key)
            .map(crate::metadata::record_count_from_stats)
            .unwrap_or(0);
        state.metadata.insert(key, store_stats_payload(current + delta));
    }
}

impl Default for MockMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MockMetadataStore {
    async fn create_store(&self, store: StoreRow) -> Result<StoreRow, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.stores.contains_key(&store.store_id) {
            return Err(StoreError::AlreadyExists(format!("store {}", store.store_id)));
        }
        let info = store_info_payload(&store);
        state
            .metadata
            .insert((STORE_INFO_TYPE.to_string(), store.store_id.clone()), info);
        state.stores.insert(store.store_id.clone(), store.clone());
        Ok(store)
    }

    async fn get_store(&self, store_id: &str) -> Result<StoreRow, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .stores
            .get(store_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("store {}", store_id)))
    }

    async fn list_stores(&self, page: StorePage) -> Result<StoreList, StoreError> {
        let state = self.state.lock().unwrap();
        let cap = page.limit.unwrap_or(DEFAULT_STORE_PAGE_SIZE).max(1) as usize;
        let after = match page.page_token.as_deref() {
            Some(token) => {
                let bytes = hex::decode(token)
                    .map_err(|_| StoreError::Invalid("malformed page token".to_string()))?;
                let last_id = String::from_utf8(bytes)
                    .map_err(|_| StoreError::Invalid("malformed page token".to_string()))?;
                Some(last_id)
            }
            None => None,
        };

        let stores: Vec<StoreRow> = state
            .stores
            .values()
            .filter(|store| match &after {
                Some(last) => store.store_id > *last,
                None => true,
            })
            .take(cap)
            .cloned()
            .collect();

        let next_page_token = if stores.len() == cap {
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
        let mut state = self.state.lock().unwrap();
        state.stores.remove(store_id);

        // Cascade over the records in bounded batches, mirroring the batch
        // limit the table backends operate under.
        loop {
            let batch: Vec<(String, String)> = state
                .records
                .keys()
                .filter(|(sid, _)| sid == store_id)
                .take(DELETE_BATCH_SIZE)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            for key in batch {
                state.records.remove(&key);
            }
        }

        state
            .metadata
            .remove(&(STORE_INFO_TYPE.to_string(), store_id.to_string()));
        state
            .metadata
            .remove(&(STORE_STATS_TYPE.to_string(), store_id.to_string()));
        Ok(())
    }

    async fn create_record(&self, mut record: RecordRow) -> Result<RecordRow, StoreError> {
        record.resolve_indexed_fields();
        let mut state = self.state.lock().unwrap();
        if !state.stores.contains_key(&record.store_id) {
            return Err(StoreError::NotFound(format!("store {}", record.store_id)));
        }
        let key = (record.store_id.clone(), record.record_id.clone());
        if state.records.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!(
                "record {}",
                record.concat_key()
            )));
        }
        state.records.insert(key, record.clone());
        Self::bump_record_count(&mut state, &record.store_id, 1);
        Ok(record)
    }

    async fn get_record(&self, store_id: &str, record_id: &str) -> Result<RecordRow, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .records
            .get(&(store_id.to_string(), record_id.to_string()))
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!("record {}", crate::model::concat_key(store_id, record_id)))
            })
    }

    async fn update_record(
        &self,
        store_id: &str,
        record_id: &str,
        update: RecordUpdate,
    ) -> Result<RecordRow, StoreError> {
        if self.fail_record_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Conflict(format!(
                "record {}",
                crate::model::concat_key(store_id, record_id)
            )));
        }
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .get_mut(&(store_id.to_string(), record_id.to_string()))
            .ok_or_else(|| {
                StoreError::NotFound(format!("record {}", crate::model::concat_key(store_id, record_id)))
            })?;
        update.apply_to(record);
        Ok(record.clone())
    }

    async fn delete_record(&self, store_id: &str, record_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let removed = state
            .records
            .remove(&(store_id.to_string(), record_id.to_string()));
        if removed.is_some() {
            Self::bump_record_count(&mut state, store_id, -1);
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
        let state = self.state.lock().unwrap();

        // Walk the rows the chosen strategy would return from an index, cap
        // them at the page limit, then apply the in-memory filters.
        let strategy = query::plan(&query);
        let candidates: Vec<RecordRow> = state
            .records
            .values()
            .filter(|record| record.store_id == store_id)
            .filter(|record| match &strategy {
                query::QueryStrategy::GameIdIndex(game_id) => record.game_id == *game_id,
                query::QueryStrategy::OwnerIdIndex(owner_id) => record.owner_id == *owner_id,
                query::QueryStrategy::PrimaryKey => true,
            })
            .take(query.limit.map(|n| n as usize).unwrap_or(usize::MAX))
            .cloned()
            .collect();

        Ok(candidates
            .into_iter()
            .filter(|record| query::matches_post_filters(record, &query))
            .collect())
    }

    async fn get_metadata(
        &self,
        metadata_type: &str,
        metadata_id: &str,
    ) -> Result<MetadataRow, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .metadata
            .get(&(metadata_type.to_string(), metadata_id.to_string()))
            .cloned()
            .map(|payload| MetadataRow {
                metadata_type: metadata_type.to_string(),
                metadata_id: metadata_id.to_string(),
                payload,
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
        let mut state = self.state.lock().unwrap();
        state
            .metadata
            .insert((metadata_type.to_string(), metadata_id.to_string()), payload);
        Ok(())
    }

    async fn delete_metadata(
        &self,
        metadata_type: &str,
        metadata_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state
            .metadata
            .remove(&(metadata_type.to_string(), metadata_id.to_string()))
            .is_none()
        {
            warn!(
                "delete_metadata: no row for type: {}, id: {}",
                metadata_type, metadata_id
            );
        }
        Ok(())
    }

    async fn query_metadata(&self, metadata_type: &str) -> Result<Vec<MetadataRow>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .metadata
            .iter()
            .filter(|((mtype, _), _)| mtype == metadata_type)
            .map(|((mtype, mid), payload)| {
                let mut payload = payload.clone();
                payload.insert(
                    "metadata_id".to_string(),
                    serde_json::Value::String(mid.clone()),
                );
                MetadataRow {
                    metadata_type: mtype.clone(),
                    metadata_id: mid.clone(),
                    payload,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::record_count_from_stats;

    fn record(store_id: &str, record_id: &str, owner: &str, game: &str, tags: &[&str]) -> RecordRow {
        let mut row = RecordRow::new(store_id, record_id);
        row.owner_id = owner.to_string();
        row.game_id = game.to_string();
        row.tags = tags.iter().map(|t| t.to_string()).collect();
        row.resolve_indexed_fields();
        row
    }

    #[tokio::test]
    async fn test_store_crud_and_companion_rows() {
        let store = MockMetadataStore::new();

        let created = store.create_store(StoreRow::new("s1", "S1")).await.unwrap();
        assert_eq!(created.store_id, "s1");
        assert_eq!(store.get_store("s1").await.unwrap().name, "S1");

        // Companion descriptor row is written alongside the store row.
        let info = store.get_metadata(STORE_INFO_TYPE, "s1").await.unwrap();
        assert_eq!(
            info.payload.get("name"),
            Some(&serde_json::Value::String("S1".to_string()))
        );

        let err = store.create_store(StoreRow::new("s1", "S1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        store.delete_store("s1").await.unwrap();
        assert!(matches!(
            store.get_store("s1").await.unwrap_err(),
            StoreError::NotFound(_)
        ));
        assert!(store.get_metadata(STORE_INFO_TYPE, "s1").await.is_err());
    }

    #[tokio::test]
    async fn test_create_record_requires_parent_store() {
        let store = MockMetadataStore::new();
        let err = store
            .create_record(record("missing", "r1", "", "", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.record_count("missing"), 0);
    }

    #[tokio::test]
    async fn test_record_crud_and_stats() {
        let store = MockMetadataStore::new();
        store.create_store(StoreRow::new("s1", "S1")).await.unwrap();

        store
            .create_record(record("s1", "r1", "o1", "g1", &["a", "b"]))
            .await
            .unwrap();
        let err = store
            .create_record(record("s1", "r1", "o1", "g1", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        let stats = store.get_metadata(STORE_STATS_TYPE, "s1").await.unwrap();
        assert_eq!(record_count_from_stats(&stats.payload), 1);

        let fetched = store.get_record("s1", "r1").await.unwrap();
        assert_eq!(fetched.concat_key(), "s1#r1");
        assert_eq!(fetched.owner_id, "o1");

        let updated = store
            .update_record(
                "s1",
                "r1",
                RecordUpdate {
                    owner_id: Some("o9".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.owner_id, "o9");

        store.delete_record("s1", "r1").await.unwrap();
        assert!(store.get_record("s1", "r1").await.is_err());
        let stats = store.get_metadata(STORE_STATS_TYPE, "s1").await.unwrap();
        assert_eq!(record_count_from_stats(&stats.payload), 0);

        // Unconditional delete stays idempotent.
        store.delete_record("s1", "r1").await.unwrap();
    }

    #[tokio::test]
    async fn test_same_record_id_in_two_stores_is_two_records() {
        let store = MockMetadataStore::new();
        store.create_store(StoreRow::new("s1", "S1")).await.unwrap();
        store.create_store(StoreRow::new("s2", "S2")).await.unwrap();

        store.create_record(record("s1", "r1", "", "", &[])).await.unwrap();
        store.create_record(record("s2", "r1", "", "", &[])).await.unwrap();

        assert_eq!(store.get_record("s1", "r1").await.unwrap().concat_key(), "s1#r1");
        assert_eq!(store.get_record("s2", "r1").await.unwrap().concat_key(), "s2#r1");
    }

    #[tokio::test]
    async fn test_query_records_strategies() {
        let store = MockMetadataStore::new();
        store.create_store(StoreRow::new("s1", "S1")).await.unwrap();
        store
            .create_record(record("s1", "r1", "o1", "g1", &["a"]))
            .await
            .unwrap();
        store
            .create_record(record("s1", "r2", "o1", "g2", &["b"]))
            .await
            .unwrap();
        store
            .create_record(record("s1", "r3", "o2", "g1", &[]))
            .await
            .unwrap();

        let by_game = store
            .query_records(
                "s1",
                RecordQuery {
                    game_id: Some("g1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let mut ids: Vec<&str> = by_game.iter().map(|r| r.record_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["r1", "r3"]);

        let by_owner = store
            .query_records(
                "s1",
                RecordQuery {
                    owner_id: Some("o1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let mut ids: Vec<&str> = by_owner.iter().map(|r| r.record_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["r1", "r2"]);

        // Both filters set: game wins the index, owner is re-checked in memory.
        let both = store
            .query_records(
                "s1",
                RecordQuery {
                    owner_id: Some("o1".to_string()),
                    game_id: Some("g1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].record_id, "r1");

        let by_tag = store
            .query_records(
                "s1",
                RecordQuery {
                    tags: vec!["a".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].record_id, "r1");

        let capped = store
            .query_records(
                "s1",
                RecordQuery {
                    limit: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(capped.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_creates_have_one_winner() {
        let store = Arc::new(MockMetadataStore::new());

        let a = store.clone();
        let b = store.clone();
        let (first, second) = tokio::join!(
            a.create_store(StoreRow::new("s2", "S2")),
            b.create_store(StoreRow::new("s2", "S2")),
        );

        let winners = [first.is_ok(), second.is_ok()];
        assert_eq!(winners.iter().filter(|ok| **ok).count(), 1);
        let loser = if first.is_err() { first } else { second };
        assert!(matches!(loser.unwrap_err(), StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_metadata_crud_and_query_injection() {
        let store = MockMetadataStore::new();
        let mut payload = Properties::new();
        payload.insert("level".to_string(), serde_json::Value::Number(3.into()));

        store.set_metadata("progress", "p1", payload.clone()).await.unwrap();
        // Repeated writes with the same payload stay idempotent.
        store.set_metadata("progress", "p1", payload.clone()).await.unwrap();

        let row = store.get_metadata("progress", "p1").await.unwrap();
        assert_eq!(row.payload, payload);

        let rows = store.query_metadata("progress").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].payload.get("metadata_id"),
            Some(&serde_json::Value::String("p1".to_string()))
        );

        store.delete_metadata("progress", "p1").await.unwrap();
        assert!(store.get_metadata("progress", "p1").await.is_err());
        // Deleting again is a warning, not an error.
        store.delete_metadata("progress", "p1").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_stores_pagination() {
        let store = MockMetadataStore::new();
        for i in 0..5 {
            store
                .create_store(StoreRow::new(format!("s{}", i), format!("S{}", i)))
                .await
                .unwrap();
        }

        let first = store
            .list_stores(StorePage {
                limit: Some(2),
                page_token: None,
            })
            .await
            .unwrap();
        assert_eq!(first.stores.len(), 2);
        let token = first.next_page_token.clone().unwrap();

        let second = store
            .list_stores(StorePage {
                limit: Some(2),
                page_token: Some(token),
            })
            .await
            .unwrap();
        assert_eq!(second.stores.len(), 2);
        assert_ne!(first.stores[0].store_id, second.stores[0].store_id);

        let ids: Vec<&str> = first
            .stores
            .iter()
            .chain(second.stores.iter())
            .map(|s| s.store_id.as_str())
            .collect();
        assert_eq!(ids, vec!["s0", "s1", "s2", "s3"]);
    }
}
