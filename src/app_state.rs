//! Application state management
//!
//! Builds the configured backends once at startup and injects them into the
//! services, following the dependency injection pattern. Backend client
//! handles are initialized here and shared safely across request handlers.

use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::blob::mock_store::MockBlobStore;
use crate::blob::s3_store::S3BlobStore;
use crate::blob::BlobStore;
use crate::cache::memory_cache::MemoryCache;
use crate::cache::redis_cache::RedisCache;
use crate::cache::{Cache, CacheLayer};
use crate::config::{self, AppConfig, BlobBackend, MetadataBackend};
use crate::error::StoreError;
use crate::metadata::document_store::DocumentMetadataStore;
use crate::metadata::dynamo_store::DynamoMetadataStore;
use crate::metadata::mock_store::MockMetadataStore;
use crate::metadata::MetadataStore;
use crate::service::record_service::RecordService;
use crate::service::store_service::StoreService;

/// Application state containing all services and their dependencies
#[derive(Clone)]
pub struct AppState {
    pub store_service: Arc<StoreService>,
    pub record_service: Arc<RecordService>,
    pub config: AppConfig,
}

impl AppState {
    /// Create application state from configuration, performing the backend
    /// handshakes. Any failure here aborts the bootstrap.
    pub async fn from_config(config: AppConfig) -> Result<Self, StoreError> {
        let aws = load_aws_config(&config).await;

        let metadata: Arc<dyn MetadataStore> = match config.metadata.backend {
            MetadataBackend::DynamoDb => {
                info!(
                    "using dynamodb metadata backend, tables: {}/{}/{}",
                    config.metadata.dynamo.stores_table,
                    config.metadata.dynamo.records_table,
                    config.metadata.dynamo.metadata_table
                );
                Arc::new(DynamoMetadataStore::new(
                    aws_sdk_dynamodb::Client::new(&aws),
                    &config.metadata.dynamo,
                ))
            }
            MetadataBackend::MongoDb => {
                let document = config.metadata.document.as_ref().ok_or_else(|| {
                    StoreError::Invalid(
                        "mongodb backend selected without document configuration".to_string(),
                    )
                })?;
                info!("using mongodb metadata backend, endpoint: {}", document.endpoint);
                let password = match &document.password_parameter {
                    Some(parameter) => Some(
                        config::fetch_parameter(parameter)
                            .await
                            .map_err(|err| StoreError::Unavailable(err.to_string()))?,
                    ),
                    None => None,
                };
                Arc::new(DocumentMetadataStore::connect(document, password).await?)
            }
            MetadataBackend::Mock => {
                info!("using mock metadata backend");
                Arc::new(MockMetadataStore::new())
            }
        };

        let metadata = if config.cache.enabled {
            let cache: Arc<dyn Cache> = match &config.cache.endpoint {
                Some(endpoint) => Arc::new(
                    RedisCache::connect(endpoint)
                        .await
                        .map_err(|err| StoreError::Unavailable(err.to_string()))?,
                ),
                None => {
                    info!("no cache endpoint configured, using in-process cache");
                    let cache = Arc::new(MemoryCache::new());
                    let _ = cache.spawn_sweeper(config.cache.sweep_interval());
                    cache
                }
            };
            Arc::new(CacheLayer::new(metadata, cache, config.cache.ttl())) as Arc<dyn MetadataStore>
        } else {
            info!("cache tier disabled");
            metadata
        };

        let blobs: Arc<dyn BlobStore> = match config.blob.backend {
            BlobBackend::S3 => {
                if config.blob.bucket.is_empty() {
                    return Err(StoreError::Invalid(
                        "blob.bucket is required for the s3 backend".to_string(),
                    ));
                }
                info!("using s3 blob backend, bucket: {}", config.blob.bucket);
                Arc::new(S3BlobStore::new(
                    aws_sdk_s3::Client::new(&aws),
                    &config.blob.bucket,
                ))
            }
            BlobBackend::Mock => {
                info!("using mock blob backend");
                Arc::new(MockBlobStore::new())
            }
        };

        let store_service = Arc::new(StoreService::new(metadata.clone(), blobs.clone()));
        let record_service = Arc::new(RecordService::new(metadata, blobs));

        info!("application state initialized");
        Ok(Self {
            store_service,
            record_service,
            config,
        })
    }

    /// Create application state for testing with mock backends behind an
    /// in-process cache layer
    pub fn new_for_testing() -> Self {
        let metadata: Arc<dyn MetadataStore> = Arc::new(CacheLayer::new(
            Arc::new(MockMetadataStore::new()),
            Arc::new(MemoryCache::new()),
            Duration::from_secs(3600),
        ));
        let blobs: Arc<dyn BlobStore> = Arc::new(MockBlobStore::new());

        let store_service = Arc::new(StoreService::new(metadata.clone(), blobs.clone()));
        let record_service = Arc::new(RecordService::new(metadata, blobs));

        Self {
            store_service,
            record_service,
            config: testing_config(),
        }
    }

    /// The per-request deadline from configuration
    pub fn request_timeout(&self) -> Duration {
        self.config.server.request_timeout()
    }
}

async fn load_aws_config(config: &AppConfig) -> aws_config::SdkConfig {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &config.region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }
    loader.load().await
}

fn testing_config() -> AppConfig {
    let yaml = "metadata:\n  backend: mock\nblob:\n  backend: mock\n";
    serde_yaml::from_str(yaml).expect("testing config is well formed")
}
