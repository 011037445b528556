//! Query planning for record lookups
//!
//! The planner picks exactly one index strategy per query shape; everything
//! the chosen index cannot answer is filtered in memory after the backend
//! round trip. The canonical fingerprint of a query doubles as the cache
//! subkey for its result set.

use crate::model::{RecordQuery, RecordRow};

/// Index strategy chosen for one query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStrategy<'a> {
    /// Query the game id index, range-keyed by the store's concat prefix
    GameIdIndex(&'a str),
    /// Query the owner id index, range-keyed by the store's concat prefix
    OwnerIdIndex(&'a str),
    /// Primary-key query returning every record of the store
    PrimaryKey,
}

/// Pick the strategy for `query`. When both owner and game filters are set
/// the game id index wins.
pub fn plan(query: &RecordQuery) -> QueryStrategy<'_> {
    if let Some(game_id) = query.game_id.as_deref().filter(|id| !id.is_empty()) {
        return QueryStrategy::GameIdIndex(game_id);
    }
    if let Some(owner_id) = query.owner_id.as_deref().filter(|id| !id.is_empty()) {
        return QueryStrategy::OwnerIdIndex(owner_id);
    }
    QueryStrategy::PrimaryKey
}

/// Whether the query can be answered without contacting the backend at all
pub fn is_empty_result(query: &RecordQuery) -> bool {
    query.limit == Some(0)
}

/// Apply the filters the index did not answer. Every requested tag must be
/// present on the record; owner and game filters are re-checked so a row
/// projected from an index never slips through with a stale column.
pub fn matches_post_filters(record: &RecordRow, query: &RecordQuery) -> bool {
    if let Some(owner_id) = query.owner_id.as_deref().filter(|id| !id.is_empty()) {
        if record.owner_id != owner_id {
            return false;
        }
    }
    if let Some(game_id) = query.game_id.as_deref().filter(|id| !id.is_empty()) {
        if record.game_id != game_id {
            return false;
        }
    }
    query
        .tags
        .iter()
        .all(|tag| record.tags.iter().any(|have| have == tag))
}

/// Deterministic hash of the normalized query, used as the cache subkey.
/// Tags are sorted so equivalent queries share a fingerprint.
pub fn fingerprint(store_id: &str, query: &RecordQuery) -> String {
    let mut tags = query.tags.clone();
    tags.sort();
    let canonical = format!(
        "store={};owner={};game={};tags={};limit={}",
        store_id,
        query.owner_id.as_deref().unwrap_or(""),
        query.game_id.as_deref().unwrap_or(""),
        tags.join(","),
        query.limit.map(|n| n.to_string()).unwrap_or_default(),
    );
    format!("{:x}", md5::compute(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner: &str, game: &str, tags: &[&str]) -> RecordRow {
        let mut row = RecordRow::new("s1", "r1");
        row.owner_id = owner.to_string();
        row.game_id = game.to_string();
        row.tags = tags.iter().map(|t| t.to_string()).collect();
        row
    }

    #[test]
    fn test_plan_priority_order() {
        let both = RecordQuery {
            owner_id: Some("o1".to_string()),
            game_id: Some("g1".to_string()),
            ..Default::default()
        };
        assert_eq!(plan(&both), QueryStrategy::GameIdIndex("g1"));

        let owner_only = RecordQuery {
            owner_id: Some("o1".to_string()),
            ..Default::default()
        };
        assert_eq!(plan(&owner_only), QueryStrategy::OwnerIdIndex("o1"));

        let neither = RecordQuery::default();
        assert_eq!(plan(&neither), QueryStrategy::PrimaryKey);
    }

    #[test]
    fn test_plan_treats_empty_filters_as_unset() {
        let query = RecordQuery {
            owner_id: Some(String::new()),
            game_id: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(plan(&query), QueryStrategy::PrimaryKey);
    }

    #[test]
    fn test_limit_zero_short_circuits() {
        let query = RecordQuery {
            limit: Some(0),
            ..Default::default()
        };
        assert!(is_empty_result(&query));
        assert!(!is_empty_result(&RecordQuery::default()));
    }

    #[test]
    fn test_post_filters_require_tag_subset() {
        let query = RecordQuery {
            tags: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        };
        assert!(matches_post_filters(&record("", "", &["a", "b", "c"]), &query));
        assert!(!matches_post_filters(&record("", "", &["a"]), &query));
    }

    #[test]
    fn test_post_filters_recheck_owner_and_game() {
        let query = RecordQuery {
            owner_id: Some("o1".to_string()),
            game_id: Some("g1".to_string()),
            ..Default::default()
        };
        assert!(matches_post_filters(&record("o1", "g1", &[]), &query));
        assert!(!matches_post_filters(&record("o2", "g1", &[]), &query));
        assert!(!matches_post_filters(&record("o1", "g2", &[]), &query));
    }

    #[test]
    fn test_fingerprint_is_order_insensitive_for_tags() {
        let a = RecordQuery {
            tags: vec!["x".to_string(), "y".to_string()],
            ..Default::default()
        };
        let b = RecordQuery {
            tags: vec!["y".to_string(), "x".to_string()],
            ..Default::default()
        };
        assert_eq!(fingerprint("s1", &a), fingerprint("s1", &b));
    }

    #[test]
    fn test_fingerprint_changes_with_query_shape() {
        let base = RecordQuery::default();
        let with_owner = RecordQuery {
            owner_id: Some("o1".to_string()),
            ..Default::default()
        };
        let with_limit = RecordQuery {
            limit: Some(5),
            ..Default::default()
        };
        let fp = |q: &RecordQuery| fingerprint("s1", q);
        assert_ne!(fp(&base), fp(&with_owner));
        assert_ne!(fp(&base), fp(&with_limit));
        assert_ne!(fingerprint("s1", &base), fingerprint("s2", &base));
    }
}
