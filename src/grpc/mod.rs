//! gRPC surface of the gateway
//!
//! The same operations as the HTTP surface, served over the generated
//! service on the gRPC port. Blob upload is a client-streaming call whose
//! first message carries the header, download a server-streaming call that
//! answers with a header followed by content chunks. The shared error
//! taxonomy maps onto gRPC codes through `From<StoreError> for Status`.

pub mod pb {
    tonic::include_proto!("opensaves");
}

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use crate::app_state::AppState;
use crate::blob::BlobBody;
use crate::error::StoreError;
use crate::model::{
    Properties, RecordQuery, RecordRow, RecordUpdate, StorePage, StoreRow,
};
use crate::service::record_service::NewRecord;
use crate::service::{set_request_context, with_deadline};
use pb::open_saves_server::{OpenSaves, OpenSavesServer};

/// gRPC service implementation over the shared services
pub struct OpenSavesApi {
    state: AppState,
}

impl OpenSavesApi {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

/// Serve the gRPC surface until the process stops
pub async fn serve(state: AppState, addr: SocketAddr) -> Result<(), tonic::transport::Error> {
    Server::builder()
        .add_service(OpenSavesServer::new(OpenSavesApi::new(state)))
        .serve(addr)
        .await
}

fn store_to_pb(store: StoreRow) -> pb::Store {
    pb::Store {
        store_id: store.store_id,
        name: store.name,
        created_at: store.created_at,
        updated_at: store.updated_at,
    }
}

fn record_to_pb(record: RecordRow) -> Result<pb::Record, Status> {
    let properties_json = serde_json::to_string(&record.properties)
        .map_err(|err| Status::internal(format!("serialize properties: {}", err)))?;
    Ok(pb::Record {
        concat_key: record.concat_key(),
        store_id: record.store_id,
        record_id: record.record_id,
        owner_id: record.owner_id,
        game_id: record.game_id,
        tags: record.tags,
        properties_json,
        blob_keys: record.blob_keys,
        created_at: record.created_at,
        updated_at: record.updated_at,
    })
}

fn parse_properties(json: &str) -> Result<Properties, StoreError> {
    if json.is_empty() {
        return Ok(Properties::new());
    }
    serde_json::from_str(json)
        .map_err(|err| StoreError::Invalid(format!("properties_json: {}", err)))
}

fn update_from_pb(request: &pb::UpdateRecordRequest) -> Result<RecordUpdate, StoreError> {
    let properties = match request.properties_json.as_deref() {
        Some(json) => Some(parse_properties(json)?),
        None => None,
    };
    Ok(RecordUpdate {
        owner_id: request.owner_id.clone(),
        game_id: request.game_id.clone(),
        tags: request.update_tags.then(|| request.tags.clone()),
        properties,
        blob_keys: request.update_blob_keys.then(|| request.blob_keys.clone()),
    })
}

#[tonic::async_trait]
impl OpenSaves for OpenSavesApi {
    async fn create_store(
        &self,
        request: Request<pb::CreateStoreRequest>,
    ) -> Result<Response<pb::Store>, Status> {
        let request = request.into_inner();
        set_request_context(&request.store_id, None);
        let store = with_deadline(
            self.state.request_timeout(),
            self.state
                .store_service
                .create_store(&request.store_id, &request.name),
        )
        .await?;
        Ok(Response::new(store_to_pb(store)))
    }

    async fn get_store(
        &self,
        request: Request<pb::GetStoreRequest>,
    ) -> Result<Response<pb::Store>, Status> {
        let request = request.into_inner();
        set_request_context(&request.store_id, None);
        let store = with_deadline(
            self.state.request_timeout(),
            self.state.store_service.get_store(&request.store_id),
        )
        .await?;
        Ok(Response::new(store_to_pb(store)))
    }

    async fn list_stores(
        &self,
        request: Request<pb::ListStoresRequest>,
    ) -> Result<Response<pb::ListStoresResponse>, Status> {
        let request = request.into_inner();
        let page = StorePage {
            limit: (request.limit > 0).then_some(request.limit),
            page_token: (!request.page_token.is_empty()).then(|| request.page_token.clone()),
        };
        let list = with_deadline(
            self.state.request_timeout(),
            self.state.store_service.list_stores(page),
        )
        .await?;
        Ok(Response::new(pb::ListStoresResponse {
            stores: list.stores.into_iter().map(store_to_pb).collect(),
            next_page_token: list.next_page_token.unwrap_or_default(),
        }))
    }

    async fn delete_store(
        &self,
        request: Request<pb::DeleteStoreRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let request = request.into_inner();
        set_request_context(&request.store_id, None);
        with_deadline(
            self.state.request_timeout(),
            self.state.store_service.delete_store(&request.store_id),
        )
        .await?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn create_record(
        &self,
        request: Request<pb::CreateRecordRequest>,
    ) -> Result<Response<pb::Record>, Status> {
        let request = request.into_inner();
        set_request_context(&request.store_id, Some(&request.record_id));
        let new_record = NewRecord {
            record_id: request.record_id,
            owner_id: (!request.owner_id.is_empty()).then(|| request.owner_id.clone()),
            game_id: (!request.game_id.is_empty()).then(|| request.game_id.clone()),
            tags: request.tags,
            properties: parse_properties(&request.properties_json)?,
            blob_keys: request.blob_keys,
        };
        let record = with_deadline(
            self.state.request_timeout(),
            self.state
                .record_service
                .create_record(&request.store_id, new_record),
        )
        .await?;
        Ok(Response::new(record_to_pb(record)?))
    }

    async fn get_record(
        &self,
        request: Request<pb::GetRecordRequest>,
    ) -> Result<Response<pb::Record>, Status> {
        let request = request.into_inner();
        set_request_context(&request.store_id, Some(&request.record_id));
        let record = with_deadline(
            self.state.request_timeout(),
            self.state
                .record_service
                .get_record(&request.store_id, &request.record_id),
        )
        .await?;
        Ok(Response::new(record_to_pb(record)?))
    }

    async fn update_record(
        &self,
        request: Request<pb::UpdateRecordRequest>,
    ) -> Result<Response<pb::Record>, Status> {
        let request = request.into_inner();
        set_request_context(&request.store_id, Some(&request.record_id));
        let update = update_from_pb(&request)?;
        let record = with_deadline(
            self.state.request_timeout(),
            self.state
                .record_service
                .update_record(&request.store_id, &request.record_id, update),
        )
        .await?;
        Ok(Response::new(record_to_pb(record)?))
    }

    async fn delete_record(
        &self,
        request: Request<pb::DeleteRecordRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let request = request.into_inner();
        set_request_context(&request.store_id, Some(&request.record_id));
        with_deadline(
            self.state.request_timeout(),
            self.state
                .record_service
                .delete_record(&request.store_id, &request.record_id),
        )
        .await?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn query_records(
        &self,
        request: Request<pb::QueryRecordsRequest>,
    ) -> Result<Response<pb::QueryRecordsResponse>, Status> {
        let request = request.into_inner();
        set_request_context(&request.store_id, None);
        let query = RecordQuery {
            owner_id: request.owner_id,
            game_id: request.game_id,
            tags: request.tags,
            limit: request.limit,
        };
        let records = with_deadline(
            self.state.request_timeout(),
            self.state
                .record_service
                .query_records(&request.store_id, query),
        )
        .await?;
        let records = records
            .into_iter()
            .map(record_to_pb)
            .collect::<Result<Vec<_>, Status>>()?;
        Ok(Response::new(pb::QueryRecordsResponse { records }))
    }

    async fn create_blob(
        &self,
        request: Request<Streaming<pb::CreateBlobRequest>>,
    ) -> Result<Response<pb::BlobSummary>, Status> {
        let mut stream = request.into_inner();
        let first = stream
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("missing blob header"))?;
        let header = match first.request {
            Some(pb::create_blob_request::Request::Header(header)) => header,
            _ => {
                return Err(Status::invalid_argument(
                    "first message must carry the blob header",
                ))
            }
        };
        set_request_context(&header.store_id, Some(&header.record_id));

        let body: BlobBody = Box::pin(stream.map(|message| match message {
            Ok(pb::CreateBlobRequest {
                request: Some(pb::create_blob_request::Request::Content(content)),
            }) => Ok(Bytes::from(content)),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected header in blob content stream",
            )),
            Err(status) => Err(io::Error::new(io::ErrorKind::Other, status.to_string())),
        }));

        let size = (header.size > 0).then_some(header.size);
        let written = with_deadline(
            self.state.request_timeout(),
            self.state.record_service.upload_blob(
                &header.store_id,
                &header.record_id,
                &header.blob_name,
                body,
                size,
            ),
        )
        .await?;
        Ok(Response::new(pb::BlobSummary {
            store_id: header.store_id,
            record_id: header.record_id,
            blob_name: header.blob_name,
            size: written,
        }))
    }

    type GetBlobStream = Pin<Box<dyn Stream<Item = Result<pb::GetBlobResponse, Status>> + Send>>;

    async fn get_blob(
        &self,
        request: Request<pb::GetBlobRequest>,
    ) -> Result<Response<Self::GetBlobStream>, Status> {
        let request = request.into_inner();
        set_request_context(&request.store_id, Some(&request.record_id));
        let download = with_deadline(
            self.state.request_timeout(),
            self.state.record_service.download_blob(
                &request.store_id,
                &request.record_id,
                &request.blob_name,
            ),
        )
        .await?;

        let header = pb::GetBlobResponse {
            response: Some(pb::get_blob_response::Response::Header(pb::BlobHeader {
                store_id: request.store_id,
                record_id: request.record_id,
                blob_name: request.blob_name,
                size: download.size,
            })),
        };
        let content = download.body.map(|chunk| {
            chunk
                .map(|bytes| pb::GetBlobResponse {
                    response: Some(pb::get_blob_response::Response::Content(bytes.to_vec())),
                })
                .map_err(|err| Status::internal(format!("read blob: {}", err)))
        });
        let stream = futures::stream::once(async move { Ok(header) }).chain(content);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn list_blobs(
        &self,
        request: Request<pb::ListBlobsRequest>,
    ) -> Result<Response<pb::ListBlobsResponse>, Status> {
        let request = request.into_inner();
        set_request_context(&request.store_id, Some(&request.record_id));
        let blob_names = with_deadline(
            self.state.request_timeout(),
            self.state
                .record_service
                .list_blobs(&request.store_id, &request.record_id),
        )
        .await?;
        Ok(Response::new(pb::ListBlobsResponse { blob_names }))
    }

    async fn delete_blob(
        &self,
        request: Request<pb::DeleteBlobRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let request = request.into_inner();
        set_request_context(&request.store_id, Some(&request.record_id));
        with_deadline(
            self.state.request_timeout(),
            self.state.record_service.delete_blob(
                &request.store_id,
                &request.record_id,
                &request.blob_name,
            ),
        )
        .await?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn get_metadata(
        &self,
        request: Request<pb::GetMetadataRequest>,
    ) -> Result<Response<pb::Metadata>, Status> {
        let request = request.into_inner();
        let row = with_deadline(
            self.state.request_timeout(),
            self.state
                .store_service
                .get_metadata(&request.metadata_type, &request.metadata_id),
        )
        .await?;
        let payload_json = serde_json::to_string(&row.payload)
            .map_err(|err| Status::internal(format!("serialize payload: {}", err)))?;
        Ok(Response::new(pb::Metadata {
            metadata_type: row.metadata_type,
            metadata_id: row.metadata_id,
            payload_json,
        }))
    }

    async fn set_metadata(
        &self,
        request: Request<pb::SetMetadataRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let request = request.into_inner();
        let payload = parse_properties(&request.payload_json)?;
        with_deadline(
            self.state.request_timeout(),
            self.state
                .store_service
                .set_metadata(&request.metadata_type, &request.metadata_id, payload),
        )
        .await?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn delete_metadata(
        &self,
        request: Request<pb::DeleteMetadataRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let request = request.into_inner();
        with_deadline(
            self.state.request_timeout(),
            self.state
                .store_service
                .delete_metadata(&request.metadata_type, &request.metadata_id),
        )
        .await?;
        Ok(Response::new(pb::Empty {}))
    }
}
