//! Application configuration
//!
//! A YAML document loaded once at process start, either from the remote
//! parameter source (SSM Parameter Store, default path `/open-saves/config`)
//! or from a local file when `--config` points at one. Unknown keys are
//! ignored; missing required keys fail the bootstrap with a nonzero exit.

use std::fs;
use std::path::Path;
use std::time::Duration;

use aws_config::BehaviorVersion;
use clap::Parser;
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default parameter path of the configuration document
pub const DEFAULT_CONFIG_PARAMETER: &str = "/open-saves/config";

/// Command line of the server binary
#[derive(Debug, Parser)]
#[command(name = "open-saves", about = "Game-data persistence service")]
pub struct Cli {
    /// Configuration source: an SSM parameter path or a local file path
    #[arg(long)]
    pub config: Option<String>,

    /// log4rs configuration file
    #[arg(long, default_value = "server_log.yaml")]
    pub log_config: String,
}

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("parse config document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("parameter source: {0}")]
    Parameter(String),
}

/// Metadata backend types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackend {
    DynamoDb,
    MongoDb,
    Mock,
}

/// Blob backend types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlobBackend {
    S3,
    Mock,
}

impl Default for BlobBackend {
    fn default() -> Self {
        BlobBackend::S3
    }
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// AWS region for the cloud backends; the default provider chain
    /// applies when unset
    #[serde(default)]
    pub region: Option<String>,
    /// Metadata tier configuration
    pub metadata: MetadataTierConfig,
    /// Blob tier configuration
    pub blob: BlobConfig,
    /// Cache tier configuration
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// HTTP port
    pub http_port: u16,
    /// gRPC port
    pub grpc_port: u16,
    /// Number of worker threads
    pub workers: usize,
    /// Maximum buffered payload size in bytes for non-streaming bodies
    pub max_payload_size: u64,
    /// Per-request deadline in seconds
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            grpc_port: 8081,
            workers: 4,
            max_payload_size: 33554432, // 32MB
            request_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    /// The request deadline as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Metadata tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataTierConfig {
    /// Metadata backend type
    pub backend: MetadataBackend,
    /// Table addressing for the key-value backend
    #[serde(default)]
    pub dynamo: DynamoConfig,
    /// Endpoint addressing for the document backend
    #[serde(default)]
    pub document: Option<DocumentConfig>,
}

/// Table names of the key-value backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamoConfig {
    pub stores_table: String,
    pub records_table: String,
    pub metadata_table: String,
}

impl Default for DynamoConfig {
    fn default() -> Self {
        Self {
            stores_table: "stores".to_string(),
            records_table: "records".to_string(),
            metadata_table: "metadata".to_string(),
        }
    }
}

/// Addressing of the document backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentConfig {
    /// Connection string, for example `mongodb://docdb.example:27017`
    pub endpoint: String,
    /// Database name
    #[serde(default = "default_database")]
    pub database: String,
    /// Optional username
    #[serde(default)]
    pub username: Option<String>,
    /// Parameter path holding the password secret
    #[serde(default)]
    pub password_parameter: Option<String>,
}

fn default_database() -> String {
    "open_saves".to_string()
}

/// Blob tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    /// Blob backend type
    #[serde(default)]
    pub backend: BlobBackend,
    /// Bucket name, required for the object-store backend
    #[serde(default)]
    pub bucket: String,
}

/// Cache tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether the cache tier runs at all
    pub enabled: bool,
    /// Cache endpoint, for example `redis://cache.example:6379`; when
    /// unset an in-process cache serves the same contract
    pub endpoint: Option<String>,
    /// Entry time to live in seconds
    pub ttl_secs: u64,
    /// Expiry sweep interval of the in-process cache in seconds
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            ttl_secs: 3600,
            sweep_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    /// The entry TTL as a duration
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.max(1))
    }

    /// The sweep interval as a duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl AppConfig {
    /// Load the configuration document from a local file or the parameter
    /// source, whichever `source` addresses.
    pub async fn load(source: &str) -> Result<Self, ConfigError> {
        let text = if Path::new(source).exists() {
            info!("loading configuration from file: {}", source);
            fs::read_to_string(source)?
        } else {
            info!("loading configuration from parameter: {}", source);
            fetch_parameter(source).await?
        };
        let config: AppConfig = serde_yaml::from_str(&text)?;
        Ok(config)
    }
}

/// Fetch one parameter value from the remote parameter source
pub async fn fetch_parameter(name: &str) -> Result<String, ConfigError> {
    let shared = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let client = aws_sdk_ssm::Client::new(&shared);
    let output = client
        .get_parameter()
        .name(name)
        .with_decryption(true)
        .send()
        .await
        .map_err(|err| ConfigError::Parameter(format!("get {}: {}", name, err)))?;
    output
        .parameter()
        .and_then(|parameter| parameter.value())
        .map(str::to_string)
        .ok_or_else(|| ConfigError::Parameter(format!("parameter {} has no value", name)))
}
