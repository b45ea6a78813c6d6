//! Webservice client that uploads stored samples.
//!
//! Each producer's samples are posted in batches to
//! `<webservice_server>/<producer>/insert`. The sequence number of the last
//! uploaded sample is kept per producer in the settings store, so an upload
//! interrupted half-way resumes where it stopped.

use crate::orchestrator::{SyncError, SyncService, SyncedProducer};
use crate::settings::{keys, SettingsStore};
use crate::storage::{SampleReader, StoredSample};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Setting key, scoped by producer, holding the last uploaded sample sequence.
pub const SYNC_WATERMARK: &str = "sync_watermark";

/// Samples per upload request.
pub const DEFAULT_UPLOAD_BATCH: usize = 1_000;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL of the collection endpoint
    pub server: String,
    pub device_id: String,
    pub study_id: Option<String>,
    pub timeout: Duration,
}

impl GatewayConfig {
    pub fn new(server: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            device_id: device_id.into(),
            study_id: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Build from `webservice_server`, `device_id` and `study_id`.
    pub fn from_settings(settings: &SettingsStore) -> Result<Self, GatewayError> {
        let server = settings.get(keys::WEBSERVICE_SERVER, None);
        if server.trim().is_empty() {
            return Err(GatewayError::Config("webservice_server is not set".to_string()));
        }
        let device_id = settings.get(keys::DEVICE_ID, None);
        if device_id.is_empty() {
            return Err(GatewayError::Config("device_id is not set".to_string()));
        }
        let study_id = settings.get(keys::STUDY_ID, None);

        Ok(Self {
            study_id: (!study_id.is_empty()).then_some(study_id),
            ..Self::new(server.trim(), device_id)
        })
    }

    /// Get the base URL without a trailing slash.
    pub fn url(&self) -> &str {
        self.server.trim_end_matches('/')
    }

    /// Get the insert endpoint for one producer.
    pub fn insert_url(&self, producer: &str) -> String {
        format!("{}/{}/insert", self.url(), producer)
    }
}

/// Gateway client error types.
#[derive(Debug)]
pub enum GatewayError {
    /// Configuration error
    Config(String),
    /// Network/HTTP error
    Network(String),
    /// Server returned an error response
    Server { status: u16, message: String },
    /// JSON serialization error
    Serialization(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Config(msg) => write!(f, "Gateway config error: {msg}"),
            GatewayError::Network(msg) => write!(f, "Gateway network error: {msg}"),
            GatewayError::Server { status, message } => {
                write!(f, "Gateway server error ({status}): {message}")
            }
            GatewayError::Serialization(msg) => write!(f, "Gateway serialization error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<GatewayError> for SyncError {
    fn from(e: GatewayError) -> Self {
        SyncError(e.to_string())
    }
}

/// Body of one insert request.
#[derive(Debug, Clone, Serialize)]
pub struct UploadPayload {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub study_id: Option<String>,
    pub producer: String,
    pub samples: Vec<UploadRow>,
    pub meta: UploadMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadRow {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadMeta {
    pub source: String,
    pub version: String,
    pub sample_count: usize,
}

impl UploadPayload {
    pub fn new(config: &GatewayConfig, producer: &str, samples: &[StoredSample]) -> Self {
        Self {
            device_id: config.device_id.clone(),
            study_id: config.study_id.clone(),
            producer: producer.to_string(),
            samples: samples
                .iter()
                .map(|s| UploadRow {
                    timestamp: s.timestamp,
                    data: s.payload.clone(),
                })
                .collect(),
            meta: UploadMeta {
                source: "context-sensor-agent".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                sample_count: samples.len(),
            },
        }
    }
}

/// Endpoint response to an insert.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadResponse {
    /// Rows the server stored, when it reports them
    #[serde(default)]
    pub accepted: Option<usize>,
}

/// Async client for the collection endpoint.
pub struct GatewayClient {
    config: GatewayConfig,
    client: reqwest::Client,
}

impl GatewayClient {
    /// Create a new gateway client.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Test connection to the endpoint.
    pub async fn test_connection(&self) -> Result<bool, GatewayError> {
        let response = self
            .client
            .get(self.config.url())
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }

    /// Upload one batch of a producer's samples.
    pub async fn upload(
        &self,
        producer: &str,
        samples: &[StoredSample],
    ) -> Result<UploadResponse, GatewayError> {
        if samples.is_empty() {
            return Err(GatewayError::Config("No samples to upload".to_string()));
        }

        let payload = UploadPayload::new(&self.config, producer, samples);
        let response = self
            .client
            .post(self.config.insert_url(producer))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GatewayError::Server {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        if body.trim().is_empty() {
            return Ok(UploadResponse::default());
        }
        serde_json::from_str(&body).map_err(|e| GatewayError::Serialization(e.to_string()))
    }
}

/// Blocking gateway client for use in synchronous contexts.
pub struct BlockingGatewayClient {
    inner: GatewayClient,
    runtime: tokio::runtime::Runtime,
}

impl BlockingGatewayClient {
    /// Create a new blocking gateway client.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to create runtime: {e}")))?;

        Ok(Self {
            inner: GatewayClient::new(config)?,
            runtime,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        self.inner.config()
    }

    /// Test connection to the endpoint.
    pub fn test_connection(&self) -> Result<bool, GatewayError> {
        self.runtime.block_on(self.inner.test_connection())
    }

    /// Upload one batch of a producer's samples.
    pub fn upload(
        &self,
        producer: &str,
        samples: &[StoredSample],
    ) -> Result<UploadResponse, GatewayError> {
        self.runtime.block_on(self.inner.upload(producer, samples))
    }
}

/// Destination for one producer's batch of samples.
pub trait SampleUploader {
    fn upload(&self, producer: &str, samples: &[StoredSample])
        -> Result<UploadResponse, GatewayError>;
}

impl SampleUploader for BlockingGatewayClient {
    fn upload(
        &self,
        producer: &str,
        samples: &[StoredSample],
    ) -> Result<UploadResponse, GatewayError> {
        BlockingGatewayClient::upload(self, producer, samples)
    }
}

/// Opens an uploader for the configuration read at the start of a sync.
pub type Connector =
    Box<dyn Fn(GatewayConfig) -> Result<Box<dyn SampleUploader>, GatewayError> + Send + Sync>;

fn connect_http(config: GatewayConfig) -> Result<Box<dyn SampleUploader>, GatewayError> {
    Ok(Box::new(BlockingGatewayClient::new(config)?))
}

/// [`SyncService`] uploading everything stored after each producer's watermark.
///
/// The endpoint is read from the settings at every sync, so a changed
/// `webservice_server` takes effect on the next run.
pub struct GatewaySync {
    settings: SettingsStore,
    samples: Arc<dyn SampleReader>,
    connector: Connector,
    batch_size: usize,
}

impl GatewaySync {
    pub fn new(settings: SettingsStore, samples: Arc<dyn SampleReader>) -> Self {
        Self {
            settings,
            samples,
            connector: Box::new(connect_http),
            batch_size: DEFAULT_UPLOAD_BATCH,
        }
    }

    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sequence number of the last uploaded sample for `producer`, 0 when
    /// nothing was uploaded.
    pub fn watermark(&self, producer: &str) -> i64 {
        self.settings
            .get(SYNC_WATERMARK, Some(producer))
            .parse()
            .unwrap_or(0)
    }

    fn sync_producer(
        &self,
        uploader: &dyn SampleUploader,
        producer: &str,
    ) -> Result<usize, SyncError> {
        let mut uploaded = 0;
        loop {
            let batch = self
                .samples
                .samples_after(producer, self.watermark(producer), self.batch_size)
                .map_err(|e| SyncError(e.to_string()))?;
            let Some(last) = batch.last() else {
                break;
            };

            uploader.upload(producer, &batch)?;
            self.settings
                .set(SYNC_WATERMARK, &last.seq.to_string(), Some(producer));
            uploaded += batch.len();
            debug!(producer, rows = batch.len(), through = last.seq, "batch uploaded");

            if batch.len() < self.batch_size {
                break;
            }
        }
        Ok(uploaded)
    }
}

impl SyncService for GatewaySync {
    fn sync(&self) -> Result<Vec<SyncedProducer>, SyncError> {
        let config = GatewayConfig::from_settings(&self.settings)?;
        debug!(server = %config.url(), "sync starting");
        let uploader = (self.connector)(config)?;

        let producers = self
            .samples
            .producers()
            .map_err(|e| SyncError(e.to_string()))?;

        let mut done = Vec::new();
        for producer in producers {
            match self.sync_producer(uploader.as_ref(), &producer) {
                Ok(rows) => {
                    if rows > 0 {
                        info!(producer = %producer, rows, "producer synced");
                    }
                    done.push(SyncedProducer {
                        through_seq: self.watermark(&producer),
                        producer,
                    });
                }
                Err(e) => warn!(producer = %producer, error = %e, "producer sync failed"),
            }
        }
        Ok(done)
    }
}
