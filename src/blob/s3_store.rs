//! S3 implementation of BlobStore
//!
//! Uploads never buffer more than one part in memory: bodies that fit in a
//! single part go up with one `PutObject`, larger or unknown-length bodies
//! stream through a multipart upload with 5 MiB parts. Failed multipart
//! uploads are aborted so the bucket holds no dangling part sets.

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::BytesMut;
use futures::StreamExt;
use log::{debug, warn};
use tokio_util::io::ReaderStream;

use crate::blob::{object_key, object_prefix, BlobBody, BlobDownload, BlobStore};
use crate::error::StoreError;

/// Multipart part size; also the upload buffering bound per request
const PART_SIZE: usize = 5 * 1024 * 1024;

/// S3 blob backend
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    /// Create a backend over a pre-built client and bucket
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        mut buffer: BytesMut,
        mut body: BlobBody,
    ) -> Result<u64, StoreError> {
        let mut parts = Vec::new();
        let mut part_number = 1i32;
        let mut written = 0u64;
        let mut finished = false;

        while !finished || !buffer.is_empty() {
            while !finished && buffer.len() < PART_SIZE {
                match body.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(err)) => {
                        return Err(StoreError::Internal(format!("read upload body: {}", err)))
                    }
                    None => finished = true,
                }
            }
            let take = buffer.len().min(PART_SIZE);
            if take == 0 {
                break;
            }
            let part = buffer.split_to(take).freeze();
            written += part.len() as u64;

            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send()
                .await
                .map_err(|err| classify_sdk_error(err, "upload blob part"))?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| classify_sdk_error(err, "complete blob upload"))?;
        Ok(written)
    }

    async fn put_multipart(
        &self,
        key: &str,
        buffer: BytesMut,
        body: BlobBody,
    ) -> Result<u64, StoreError> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| classify_sdk_error(err, "start blob upload"))?;
        let upload_id = create
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StoreError::Internal("multipart upload id missing".to_string()))?;

        match self.upload_parts(key, &upload_id, buffer, body).await {
            Ok(written) => Ok(written),
            Err(err) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("abort of blob upload failed for key: {}: {}", key, abort_err);
                }
                Err(err)
            }
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

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(
        &self,
        store_id: &str,
        record_id: &str,
        blob_name: &str,
        mut body: BlobBody,
        size: Option<u64>,
    ) -> Result<u64, StoreError> {
        let key = object_key(store_id, record_id, blob_name);

        // Bodies announced larger than one part skip the probe and stream
        // straight into the multipart path.
        if size.map_or(false, |s| s > PART_SIZE as u64) {
            return self.put_multipart(&key, BytesMut::new(), body).await;
        }

        // Probe the body up to one part. A body that ends inside the probe
        // goes up as a single object with its exact length.
        let mut buffer = BytesMut::new();
        loop {
            if buffer.len() > PART_SIZE {
                return self.put_multipart(&key, buffer, body).await;
            }
            match body.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    return Err(StoreError::Internal(format!("read upload body: {}", err)))
                }
                None => break,
            }
        }

        let written = buffer.len() as u64;
        debug!("put blob key: {}, size: {}", key, written);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_length(written as i64)
            .body(ByteStream::from(buffer.freeze()))
            .send()
            .await
            .map_err(|err| classify_sdk_error(err, "put blob"))?;
        Ok(written)
    }

    async fn get(
        &self,
        store_id: &str,
        record_id: &str,
        blob_name: &str,
    ) -> Result<BlobDownload, StoreError> {
        let key = object_key(store_id, record_id, blob_name);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().map_or(false, |e| e.is_no_such_key()) {
                    StoreError::NotFound(format!("blob {}", key))
                } else {
                    classify_sdk_error(err, "get blob")
                }
            })?;

        let size = output.content_length().unwrap_or(0).max(0) as u64;
        let body: BlobBody = Box::pin(ReaderStream::new(output.body.into_async_read()));
        Ok(BlobDownload { body, size })
    }

    async fn list(&self, store_id: &str, record_id: &str) -> Result<Vec<String>, StoreError> {
        let prefix = object_prefix(store_id, record_id);
        let mut names = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);
            if let Some(continuation) = token.take() {
                request = request.continuation_token(continuation);
            }
            let output = request
                .send()
                .await
                .map_err(|err| classify_sdk_error(err, "list blobs"))?;
            names.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter_map(|key| key.strip_prefix(prefix.as_str()))
                    .filter(|name| !name.is_empty())
                    .map(str::to_string),
            );
            match output.next_continuation_token() {
                Some(continuation) => token = Some(continuation.to_string()),
                None => break,
            }
        }
        Ok(names)
    }

    async fn delete(
        &self,
        store_id: &str,
        record_id: &str,
        blob_name: &str,
    ) -> Result<(), StoreError> {
        let key = object_key(store_id, record_id, blob_name);
        // Deleting an absent object succeeds, which keeps this idempotent
        // without a preceding existence check.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| classify_sdk_error(err, "delete blob"))?;
        Ok(())
    }
}
