//! Service layer coupling the metadata, blob, and cache tiers
//!
//! The services own the semantics the API promises across tiers: announced
//! blobs, upload rollback, cascade deletes, and cache invalidation ordering.
//! Handlers never talk to a backend directly.

pub mod record_service;
pub mod store_service;

use std::future::Future;
use std::time::Duration;

use crate::error::StoreError;

/// Install the request-scoped identifiers into the logging context
pub fn set_request_context(store_id: &str, record_id: Option<&str>) {
    log_mdc::insert("store", store_id);
    if let Some(record_id) = record_id {
        log_mdc::insert("record", record_id);
    } else {
        log_mdc::remove("record");
    }
}

/// Run `fut` under the request deadline. On expiry the in-flight backend
/// call is dropped and the caller sees `DeadlineExceeded`; partial effects
/// may persist and the rollback rules of the blob path apply.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::DeadlineExceeded),
    }
}

/// Reject ids that are empty or would corrupt derived keys
pub fn validate_id(kind: &str, id: &str) -> Result<(), StoreError> {
    if id.is_empty() {
        return Err(StoreError::Invalid(format!("{} must not be empty", kind)));
    }
    if id.contains('#') || id.contains('/') {
        return Err(StoreError::Invalid(format!(
            "{} must not contain '#' or '/'",
            kind
        )));
    }
    Ok(())
}

/// Reject blob names that are empty or would escape the record's key prefix
pub fn validate_blob_name(blob_name: &str) -> Result<(), StoreError> {
    if blob_name.is_empty() {
        return Err(StoreError::Invalid("blob_name must not be empty".to_string()));
    }
    if blob_name.contains('/') {
        return Err(StoreError::Invalid(
            "blob_name must not contain '/'".to_string(),
        ));
    }
    Ok(())
}
