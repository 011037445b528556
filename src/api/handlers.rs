//! HTTP request handlers
//!
//! Handlers marshal wire types into service calls and map the shared error
//! taxonomy onto status codes through `ResponseError`. Blob bodies stream in
//! both directions; per-request memory stays bounded regardless of blob
//! size.

use std::io;

use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use bytes::Bytes;
use futures::StreamExt;
use log::debug;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::types::{
    BlobUploadResponse, CreateRecordRequest, CreateStoreRequest, ListBlobsResponse,
    ListStoresParams, ListStoresResponse, MetadataResponse, QueryRecordsParams,
    QueryRecordsResponse, RecordResponse, StoreResponse, UpdateRecordRequest,
};
use crate::app_state::AppState;
use crate::blob::BlobBody;
use crate::error::StoreError;
use crate::model::{Properties, RecordQuery, StorePage};
use crate::service::{set_request_context, with_deadline};

/// Liveness probe. Answers without touching any backend.
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain").body("ok")
}

pub async fn create_store(
    state: web::Data<AppState>,
    body: web::Json<CreateStoreRequest>,
) -> Result<HttpResponse, StoreError> {
    let request = body.into_inner();
    set_request_context(&request.store_id, None);
    let store = with_deadline(
        state.request_timeout(),
        state.store_service.create_store(&request.store_id, &request.name),
    )
    .await?;
    Ok(HttpResponse::Ok().json(StoreResponse::from(store)))
}

pub async fn list_stores(
    state: web::Data<AppState>,
    params: web::Query<ListStoresParams>,
) -> Result<HttpResponse, StoreError> {
    let params = params.into_inner();
    let list = with_deadline(
        state.request_timeout(),
        state.store_service.list_stores(StorePage {
            limit: params.limit,
            page_token: params.page_token,
        }),
    )
    .await?;
    Ok(HttpResponse::Ok().json(ListStoresResponse::from(list)))
}

pub async fn get_store(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, StoreError> {
    let store_id = path.into_inner();
    set_request_context(&store_id, None);
    let store = with_deadline(
        state.request_timeout(),
        state.store_service.get_store(&store_id),
    )
    .await?;
    Ok(HttpResponse::Ok().json(StoreResponse::from(store)))
}

pub async fn delete_store(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, StoreError> {
    let store_id = path.into_inner();
    set_request_context(&store_id, None);
    with_deadline(
        state.request_timeout(),
        state.store_service.delete_store(&store_id),
    )
    .await?;
    Ok(HttpResponse::Ok().finish())
}

pub async fn create_record(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<CreateRecordRequest>,
) -> Result<HttpResponse, StoreError> {
    let store_id = path.into_inner();
    let request = body.into_inner();
    set_request_context(&store_id, Some(&request.record_id));
    let record = with_deadline(
        state.request_timeout(),
        state.record_service.create_record(&store_id, request.into()),
    )
    .await?;
    Ok(HttpResponse::Ok().json(RecordResponse::from(record)))
}

pub async fn query_records(
    state: web::Data<AppState>,
    path: web::Path<String>,
    params: web::Query<QueryRecordsParams>,
) -> Result<HttpResponse, StoreError> {
    let store_id = path.into_inner();
    set_request_context(&store_id, None);
    let query = RecordQuery::from(params.into_inner());
    let records = with_deadline(
        state.request_timeout(),
        state.record_service.query_records(&store_id, query),
    )
    .await?;
    Ok(HttpResponse::Ok().json(QueryRecordsResponse {
        records: records.into_iter().map(RecordResponse::from).collect(),
    }))
}

pub async fn get_record(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, StoreError> {
    let (store_id, record_id) = path.into_inner();
    set_request_context(&store_id, Some(&record_id));
    let record = with_deadline(
        state.request_timeout(),
        state.record_service.get_record(&store_id, &record_id),
    )
    .await?;
    Ok(HttpResponse::Ok().json(RecordResponse::from(record)))
}

pub async fn update_record(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<UpdateRecordRequest>,
) -> Result<HttpResponse, StoreError> {
    let (store_id, record_id) = path.into_inner();
    set_request_context(&store_id, Some(&record_id));
    let record = with_deadline(
        state.request_timeout(),
        state
            .record_service
            .update_record(&store_id, &record_id, body.into_inner().into()),
    )
    .await?;
    Ok(HttpResponse::Ok().json(RecordResponse::from(record)))
}

pub async fn delete_record(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, StoreError> {
    let (store_id, record_id) = path.into_inner();
    set_request_context(&store_id, Some(&record_id));
    with_deadline(
        state.request_timeout(),
        state.record_service.delete_record(&store_id, &record_id),
    )
    .await?;
    Ok(HttpResponse::Ok().finish())
}

pub async fn list_blobs(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, StoreError> {
    let (store_id, record_id) = path.into_inner();
    set_request_context(&store_id, Some(&record_id));
    let blob_names = with_deadline(
        state.request_timeout(),
        state.record_service.list_blobs(&store_id, &record_id),
    )
    .await?;
    Ok(HttpResponse::Ok().json(ListBlobsResponse { blob_names }))
}

pub async fn upload_blob(
    state: web::Data<AppState>,
    path: web::Path<(String, String, String)>,
    mut payload: web::Payload,
    request: HttpRequest,
) -> Result<HttpResponse, StoreError> {
    let (store_id, record_id, blob_name) = path.into_inner();
    set_request_context(&store_id, Some(&record_id));

    let size = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    debug!(
        "upload blob: {}/{}/{}, declared size: {:?}",
        store_id, record_id, blob_name, size
    );

    // Bridge the connection-bound payload stream into a channel the blob
    // tier can consume; the small channel bound keeps memory flat while the
    // backend applies backpressure.
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, io::Error>>(8);
    let forward = async move {
        while let Some(chunk) = payload.next().await {
            let item = chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()));
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    };
    let body: BlobBody = Box::pin(ReceiverStream::new(rx));
    let upload = with_deadline(
        state.request_timeout(),
        state
            .record_service
            .upload_blob(&store_id, &record_id, &blob_name, body, size),
    );

    let (_, written) = futures::join!(forward, upload);
    let written = written?;
    Ok(HttpResponse::Ok().json(BlobUploadResponse {
        store_id,
        record_id,
        blob_name,
        size: written,
    }))
}

pub async fn download_blob(
    state: web::Data<AppState>,
    path: web::Path<(String, String, String)>,
) -> Result<HttpResponse, StoreError> {
    let (store_id, record_id, blob_name) = path.into_inner();
    set_request_context(&store_id, Some(&record_id));
    let download = with_deadline(
        state.request_timeout(),
        state
            .record_service
            .download_blob(&store_id, &record_id, &blob_name),
    )
    .await?;
    Ok(HttpResponse::Ok()
        .content_type("application/octet-stream")
        .no_chunking(download.size)
        .streaming(download.body))
}

pub async fn delete_blob(
    state: web::Data<AppState>,
    path: web::Path<(String, String, String)>,
) -> Result<HttpResponse, StoreError> {
    let (store_id, record_id, blob_name) = path.into_inner();
    set_request_context(&store_id, Some(&record_id));
    with_deadline(
        state.request_timeout(),
        state
            .record_service
            .delete_blob(&store_id, &record_id, &blob_name),
    )
    .await?;
    Ok(HttpResponse::Ok().finish())
}

pub async fn get_metadata(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, StoreError> {
    let (metadata_type, metadata_id) = path.into_inner();
    let row = with_deadline(
        state.request_timeout(),
        state.store_service.get_metadata(&metadata_type, &metadata_id),
    )
    .await?;
    Ok(HttpResponse::Ok().json(MetadataResponse {
        metadata_type: row.metadata_type,
        metadata_id: row.metadata_id,
        payload: row.payload,
    }))
}

pub async fn set_metadata(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<Properties>,
) -> Result<HttpResponse, StoreError> {
    let (metadata_type, metadata_id) = path.into_inner();
    with_deadline(
        state.request_timeout(),
        state
            .store_service
            .set_metadata(&metadata_type, &metadata_id, body.into_inner()),
    )
    .await?;
    Ok(HttpResponse::Ok().finish())
}

pub async fn delete_metadata(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, StoreError> {
    let (metadata_type, metadata_id) = path.into_inner();
    with_deadline(
        state.request_timeout(),
        state
            .store_service
            .delete_metadata(&metadata_type, &metadata_id),
    )
    .await?;
    Ok(HttpResponse::Ok().finish())
}
