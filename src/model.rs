//! Core data model: stores, records, and typed metadata rows
//!
//! Timestamps are epoch seconds internally; the API layer renders them as
//! RFC 3339 strings on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Property bag attached to records and typed metadata rows
pub type Properties = serde_json::Map<String, Value>;

/// Current wall-clock time at second precision
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Derive the range key used by the secondary indexes
pub fn concat_key(store_id: &str, record_id: &str) -> String {
    format!("{}#{}", store_id, record_id)
}

/// Prefix matching every concat key of a store
pub fn concat_key_prefix(store_id: &str) -> String {
    format!("{}#", store_id)
}

/// A top-level namespace owning a set of records
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreRow {
    pub store_id: String,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl StoreRow {
    /// Create a new store row with current timestamps
    pub fn new(store_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = now_secs();
        Self {
            store_id: store_id.into(),
            name: name.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A row within a store carrying properties, tags, and named blob references
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecordRow {
    pub store_id: String,
    pub record_id: String,
    pub owner_id: String,
    pub game_id: String,
    pub tags: Vec<String>,
    pub properties: Properties,
    pub blob_keys: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RecordRow {
    /// Create a new record row with current timestamps and derived columns
    pub fn new(store_id: impl Into<String>, record_id: impl Into<String>) -> Self {
        let now = now_secs();
        let mut record = Self {
            store_id: store_id.into(),
            record_id: record_id.into(),
            created_at: now,
            updated_at: now,
            ..Default::default()
        };
        record.resolve_indexed_fields();
        record
    }

    /// The range key of this record on the secondary indexes
    pub fn concat_key(&self) -> String {
        concat_key(&self.store_id, &self.record_id)
    }

    /// Reconcile the owner/game fields of a freshly supplied record with
    /// their `properties` copies. A non-empty top-level value is copied
    /// into `properties` first; the `properties` copy is then
    /// authoritative for the indexed columns. Only valid on input rows,
    /// where the top-level fields are caller-supplied; updates to stored
    /// rows go through [`RecordUpdate::apply_to`] instead.
    pub fn resolve_indexed_fields(&mut self) {
        if !self.owner_id.is_empty() {
            self.properties
                .insert("owner_id".to_string(), Value::String(self.owner_id.clone()));
        }
        if !self.game_id.is_empty() {
            self.properties
                .insert("game_id".to_string(), Value::String(self.game_id.clone()));
        }
        self.derive_indexed_columns();
    }

    /// Refresh the indexed columns from their authoritative `properties`
    /// copies. A column only changes when the copy is a non-empty string.
    pub fn derive_indexed_columns(&mut self) {
        if let Some(Value::String(owner)) = self.properties.get("owner_id") {
            if !owner.is_empty() {
                self.owner_id = owner.clone();
            }
        }
        if let Some(Value::String(game)) = self.properties.get("game_id") {
            if !game.is_empty() {
                self.game_id = game.clone();
            }
        }
    }

    /// Whether `blob_name` appears in the authoritative blob key set
    pub fn has_blob_key(&self, blob_name: &str) -> bool {
        self.blob_keys.iter().any(|name| name == blob_name)
    }

    /// Add `blob_name` to the blob key set; returns false when already present
    pub fn add_blob_key(&mut self, blob_name: &str) -> bool {
        if self.has_blob_key(blob_name) {
            return false;
        }
        self.blob_keys.push(blob_name.to_string());
        true
    }

    /// Remove `blob_name` from the blob key set; returns false when absent
    pub fn remove_blob_key(&mut self, blob_name: &str) -> bool {
        let before = self.blob_keys.len();
        self.blob_keys.retain(|name| name != blob_name);
        self.blob_keys.len() != before
    }
}

/// Partial record mutation. Only present fields are written; `updated_at`
/// always advances.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecordUpdate {
    pub owner_id: Option<String>,
    pub game_id: Option<String>,
    pub tags: Option<Vec<String>>,
    pub properties: Option<Properties>,
    pub blob_keys: Option<Vec<String>>,
}

impl RecordUpdate {
    /// Apply this update to an existing row, advancing `updated_at` and
    /// re-deriving the indexed columns. Only owner/game values supplied by
    /// this update are copied into `properties`; the stored row's
    /// top-level fields never flow back, so a properties-only update wins
    /// over whatever the row held before.
    pub fn apply_to(&self, record: &mut RecordRow) {
        if let Some(tags) = &self.tags {
            record.tags = tags.clone();
        }
        if let Some(properties) = &self.properties {
            record.properties = properties.clone();
        }
        if let Some(blob_keys) = &self.blob_keys {
            record.blob_keys = blob_keys.clone();
        }
        if let Some(owner_id) = &self.owner_id {
            record.owner_id = owner_id.clone();
            if !owner_id.is_empty() {
                record
                    .properties
                    .insert("owner_id".to_string(), Value::String(owner_id.clone()));
            }
        }
        if let Some(game_id) = &self.game_id {
            record.game_id = game_id.clone();
            if !game_id.is_empty() {
                record
                    .properties
                    .insert("game_id".to_string(), Value::String(game_id.clone()));
            }
        }
        record.derive_indexed_columns();
        record.updated_at = now_secs();
    }
}

/// A generic (type, id) row used by the engine for derived state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataRow {
    pub metadata_type: String,
    pub metadata_id: String,
    pub payload: Properties,
}

/// Query over the records of one store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordQuery {
    pub owner_id: Option<String>,
    pub game_id: Option<String>,
    pub tags: Vec<String>,
    pub limit: Option<u32>,
}

/// Page request for store listing
#[derive(Debug, Clone, Default)]
pub struct StorePage {
    pub limit: Option<u32>,
    pub page_token: Option<String>,
}

/// One page of stores with an opaque continuation token
#[derive(Debug, Clone, Default)]
pub struct StoreList {
    pub stores: Vec<StoreRow>,
    pub next_page_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_key_derivation() {
        let record = RecordRow::new("s1", "r1");
        assert_eq!(record.concat_key(), "s1#r1");
        assert_eq!(concat_key("s1", "r1"), "s1#r1");
        assert_eq!(concat_key_prefix("s1"), "s1#");
    }

    #[test]
    fn test_resolve_indexed_fields_from_properties() {
        let mut record = RecordRow::new("s1", "r1");
        record
            .properties
            .insert("owner_id".to_string(), Value::String("o1".to_string()));
        record
            .properties
            .insert("game_id".to_string(), Value::String("g1".to_string()));
        record.resolve_indexed_fields();

        assert_eq!(record.owner_id, "o1");
        assert_eq!(record.game_id, "g1");
    }

    #[test]
    fn test_resolve_indexed_fields_top_level_wins_when_both_differ() {
        let mut record = RecordRow::new("s1", "r1");
        record.owner_id = "top".to_string();
        record
            .properties
            .insert("owner_id".to_string(), Value::String("prop".to_string()));
        record.resolve_indexed_fields();

        // The top-level value is copied into properties first, then the
        // properties copy drives the indexed column.
        assert_eq!(
            record.properties.get("owner_id"),
            Some(&Value::String("top".to_string()))
        );
        assert_eq!(record.owner_id, "top");
    }

    #[test]
    fn test_resolve_indexed_fields_ignores_empty_and_non_string() {
        let mut record = RecordRow::new("s1", "r1");
        record
            .properties
            .insert("owner_id".to_string(), Value::String(String::new()));
        record
            .properties
            .insert("game_id".to_string(), Value::Number(7.into()));
        record.resolve_indexed_fields();

        assert_eq!(record.owner_id, "");
        assert_eq!(record.game_id, "");
    }

    #[test]
    fn test_blob_key_set_operations() {
        let mut record = RecordRow::new("s1", "r1");
        assert!(record.add_blob_key("save.dat"));
        assert!(!record.add_blob_key("save.dat"));
        assert!(record.has_blob_key("save.dat"));
        assert!(record.remove_blob_key("save.dat"));
        assert!(!record.remove_blob_key("save.dat"));
        assert!(record.blob_keys.is_empty());
    }

    #[test]
    fn test_record_update_applies_present_fields_only() {
        let mut record = RecordRow::new("s1", "r1");
        record.tags = vec!["a".to_string()];
        record.updated_at = 0;

        let update = RecordUpdate {
            owner_id: Some("o9".to_string()),
            tags: None,
            ..Default::default()
        };
        update.apply_to(&mut record);

        assert_eq!(record.owner_id, "o9");
        assert_eq!(record.tags, vec!["a".to_string()]);
        assert!(record.updated_at > 0);
        assert_eq!(
            record.properties.get("owner_id"),
            Some(&Value::String("o9".to_string()))
        );
    }

    #[test]
    fn test_record_update_properties_drive_indexed_columns() {
        let mut record = RecordRow::new("s1", "r1");
        let mut properties = Properties::new();
        properties.insert("owner_id".to_string(), Value::String("o2".to_string()));

        let update = RecordUpdate {
            properties: Some(properties),
            ..Default::default()
        };
        update.apply_to(&mut record);

        assert_eq!(record.owner_id, "o2");
    }

    #[test]
    fn test_properties_only_update_overrides_prior_owner() {
        // The stored row already carries an indexed owner column.
        let mut record = RecordRow::new("s1", "r1");
        record.owner_id = "o1".to_string();
        record.resolve_indexed_fields();
        assert_eq!(record.owner_id, "o1");

        // An update supplying only properties must win over the stored
        // top-level value; nothing from the old row flows back.
        let mut properties = Properties::new();
        properties.insert("owner_id".to_string(), Value::String("o9".to_string()));
        let update = RecordUpdate {
            properties: Some(properties),
            ..Default::default()
        };
        update.apply_to(&mut record);

        assert_eq!(record.owner_id, "o9");
        assert_eq!(
            record.properties.get("owner_id"),
            Some(&Value::String("o9".to_string()))
        );
    }

    #[test]
    fn test_record_update_top_level_wins_when_both_supplied() {
        let mut record = RecordRow::new("s1", "r1");
        record.game_id = "g1".to_string();
        record.resolve_indexed_fields();

        // When one update carries both forms and they differ, the
        // top-level value is copied into properties before the indexed
        // column is derived.
        let mut properties = Properties::new();
        properties.insert("game_id".to_string(), Value::String("prop".to_string()));
        let update = RecordUpdate {
            game_id: Some("top".to_string()),
            properties: Some(properties),
            ..Default::default()
        };
        update.apply_to(&mut record);

        assert_eq!(record.game_id, "top");
        assert_eq!(
            record.properties.get("game_id"),
            Some(&Value::String("top".to_string()))
        );
    }
}
