use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::Level;

use super::{ConfigError, ConfigResult};
use crate::logging::LoggingConfig;
use crate::multimodal::{DEFAULT_MAX_EMBEDDING_BYTES, EmbeddingLayout};
use crate::multimodal::media::MediaConnectorConfig;

/// Which worker variant serves requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Accepts handoff requests and decodes them.
    Decode,
    /// Accepts client requests; prefills, optionally splitting off decode.
    PrefillDecode,
}

impl WorkerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerMode::Decode => "decode",
            WorkerMode::PrefillDecode => "prefill_decode",
        }
    }
}

/// Media fetching settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Hosts media URLs may point at (None = any host)
    #[serde(default)]
    pub allowed_domains: Option<Vec<String>>,
    /// Root directory local media files must live under (None = local files disabled)
    #[serde(default)]
    pub allowed_local_media_path: Option<PathBuf>,
    /// Fetch timeout in seconds
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            allowed_domains: None,
            allowed_local_media_path: None,
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

/// Main worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Served model name; also selects the embedding layout unless overridden
    pub model: String,
    /// Worker variant
    pub mode: WorkerMode,
    /// Split prefill and decode across workers (prefill_decode mode only)
    #[serde(default)]
    pub is_prefill_worker: bool,
    /// Decode workers receiving handoff requests
    #[serde(default)]
    pub decode_worker_urls: Vec<String>,
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bound on reaching a decode worker and receiving its response headers, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Bound on a single remote-memory read, in seconds
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    /// How long consumed transfer handles are remembered, in seconds
    #[serde(default = "default_handle_retention_secs")]
    pub handle_retention_secs: u64,
    /// Largest remotely read embedding buffer accepted, in bytes
    #[serde(default = "default_max_embedding_bytes")]
    pub max_embedding_bytes: usize,
    /// Outputs buffered per request before backpressure applies
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,
    /// Explicit embedding layout (None = derive from the model name)
    #[serde(default)]
    pub embedding_layout: Option<EmbeddingLayout>,
    #[serde(default)]
    pub media: MediaConfig,
    /// Log level (None = info)
    #[serde(default)]
    pub log_level: Option<String>,
    /// Log directory (None = stdout only)
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub log_json: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    30000
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_transfer_timeout_secs() -> u64 {
    30
}

fn default_handle_retention_secs() -> u64 {
    3600
}

fn default_max_embedding_bytes() -> usize {
    DEFAULT_MAX_EMBEDDING_BYTES
}

fn default_stream_buffer_size() -> usize {
    32
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            mode: WorkerMode::PrefillDecode,
            is_prefill_worker: false,
            decode_worker_urls: Vec::new(),
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            handle_retention_secs: default_handle_retention_secs(),
            max_embedding_bytes: default_max_embedding_bytes(),
            stream_buffer_size: default_stream_buffer_size(),
            embedding_layout: None,
            media: MediaConfig::default(),
            log_level: None,
            log_dir: None,
            log_json: false,
        }
    }
}

impl WorkerConfig {
    pub fn new(model: impl Into<String>, mode: WorkerMode) -> Self {
        Self {
            model: model.into(),
            mode,
            ..Default::default()
        }
    }

    /// Split mode: prefill locally, decode on a remote worker.
    pub fn enable_disagg(&self) -> bool {
        self.mode == WorkerMode::PrefillDecode && self.is_prefill_worker
    }

    pub fn embedding_layout(&self) -> EmbeddingLayout {
        self.embedding_layout
            .unwrap_or_else(|| EmbeddingLayout::for_model(&self.model))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn handle_retention(&self) -> Duration {
        Duration::from_secs(self.handle_retention_secs)
    }

    pub fn media_connector_config(&self) -> MediaConnectorConfig {
        MediaConnectorConfig {
            allowed_domains: self.media.allowed_domains.clone(),
            allowed_local_media_path: self.media.allowed_local_media_path.clone(),
            fetch_timeout: Duration::from_secs(self.media.fetch_timeout_secs),
        }
    }

    pub fn log_level(&self) -> ConfigResult<Level> {
        match self.log_level.as_deref() {
            None => Ok(Level::INFO),
            Some(level) => level.parse().map_err(|_| ConfigError::InvalidValue {
                field: "log_level".to_string(),
                value: level.to_string(),
                reason: "Must be one of trace, debug, info, warn, error".to_string(),
            }),
        }
    }

    pub fn logging_config(&self) -> ConfigResult<LoggingConfig> {
        Ok(LoggingConfig {
            level: self.log_level()?,
            json_format: self.log_json,
            log_dir: self.log_dir.clone(),
            ..Default::default()
        })
    }
}
