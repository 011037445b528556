//! Error taxonomy shared by every tier
//!
//! Backend failures are classified into `StoreError` at the metadata, blob,
//! and cache boundaries. The gateway maps the same taxonomy onto HTTP status
//! codes and gRPC codes so callers never see backend-specific errors.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

/// Error kinds surfaced by the storage engine
#[derive(Debug, Error)]
pub enum StoreError {
    /// The addressed entity does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// A conditional insert lost because the entity already exists
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Malformed input rejected before any backend call
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// A conditional write failed because of a concurrent mutation
    #[error("conflicting write: {0}")]
    Conflict(String),

    /// The backend could not be reached
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The request deadline expired while a backend call was in flight
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Short machine-readable code carried in error bodies
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::AlreadyExists(_) => "ALREADY_EXISTS",
            StoreError::Invalid(_) => "INVALID_ARGUMENT",
            StoreError::Conflict(_) => "ABORTED",
            StoreError::Unavailable(_) => "UNAVAILABLE",
            StoreError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StoreError::Internal(_) => "INTERNAL",
        }
    }
}

/// Failure response body. Never echoes request bodies or stack traces.
#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

impl ResponseError for StoreError {
    fn status_code(&self) -> StatusCode {
        match self {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::AlreadyExists(_) => StatusCode::CONFLICT,
            StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            StoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            code: self.code(),
            message: self.to_string(),
        })
    }
}

impl From<StoreError> for tonic::Status {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::NotFound(_) => tonic::Status::not_found(message),
            StoreError::AlreadyExists(_) => tonic::Status::already_exists(message),
            StoreError::Invalid(_) => tonic::Status::invalid_argument(message),
            StoreError::Conflict(_) => tonic::Status::aborted(message),
            StoreError::Unavailable(_) => tonic::Status::unavailable(message),
            StoreError::DeadlineExceeded => tonic::Status::deadline_exceeded(message),
            StoreError::Internal(_) => tonic::Status::internal(message),
        }
    }
}
