use std::path::PathBuf;

use clap::Parser;

use super::*;
use crate::multimodal::EmbeddingLayout;

/// Command-line arguments for binaries that embed a worker.
#[derive(Parser, Debug, Clone)]
#[command(name = "sgl-mm-disagg", about = "Multimodal prefill/decode worker")]
pub struct WorkerArgs {
    /// Served model name
    #[arg(long)]
    pub model: String,

    /// Worker variant
    #[arg(long, value_enum, default_value_t = WorkerMode::PrefillDecode)]
    pub mode: WorkerMode,

    /// Prefill locally and hand decode off to a decode worker
    #[arg(long, default_value_t = false)]
    pub is_prefill_worker: bool,

    /// Decode worker URLs (repeatable)
    #[arg(long = "decode-worker", num_args = 0..)]
    pub decode_worker_urls: Vec<String>,

    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 30000)]
    pub port: u16,

    /// Bound on reaching a decode worker and receiving its headers, in seconds
    #[arg(long, default_value_t = 600)]
    pub request_timeout_secs: u64,

    /// Bound on one remote-memory read, in seconds
    #[arg(long, default_value_t = 30)]
    pub transfer_timeout_secs: u64,

    /// How long consumed transfer handles are remembered, in seconds
    #[arg(long, default_value_t = 3600)]
    pub handle_retention_secs: u64,

    /// Largest remotely read embedding buffer accepted, in bytes
    #[arg(long, default_value_t = crate::multimodal::DEFAULT_MAX_EMBEDDING_BYTES)]
    pub max_embedding_bytes: usize,

    #[arg(long, default_value_t = 32)]
    pub stream_buffer_size: usize,

    /// Override the embedding layout chosen from the model name
    #[arg(long, value_parser = ["numeric_array", "embedding_tensor"])]
    pub embedding_layout: Option<String>,

    /// Hosts media URLs may point at
    #[arg(long, num_args = 0..)]
    pub allowed_domains: Option<Vec<String>>,

    /// Root directory for local media files
    #[arg(long)]
    pub allowed_local_media_path: Option<PathBuf>,

    #[arg(long, default_value_t = 10)]
    pub media_fetch_timeout_secs: u64,

    #[arg(long, default_value = "info", value_parser = ["trace", "debug", "info", "warn", "error"])]
    pub log_level: String,

    /// Directory for daily-rotated log files
    #[arg(long)]
    pub log_dir: Option<String>,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
}

impl WorkerArgs {
    pub fn into_config(self) -> ConfigResult<WorkerConfig> {
        let embedding_layout = match self.embedding_layout.as_deref() {
            None => None,
            Some("numeric_array") => Some(EmbeddingLayout::NumericArray),
            Some("embedding_tensor") => Some(EmbeddingLayout::EmbeddingTensor),
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    field: "embedding_layout".to_string(),
                    value: other.to_string(),
                    reason: "Must be numeric_array or embedding_tensor".to_string(),
                });
            }
        };

        let config = WorkerConfig {
            model: self.model,
            mode: self.mode,
            is_prefill_worker: self.is_prefill_worker,
            decode_worker_urls: self.decode_worker_urls,
            host: self.host,
            port: self.port,
            request_timeout_secs: self.request_timeout_secs,
            transfer_timeout_secs: self.transfer_timeout_secs,
            handle_retention_secs: self.handle_retention_secs,
            max_embedding_bytes: self.max_embedding_bytes,
            stream_buffer_size: self.stream_buffer_size,
            embedding_layout,
            media: MediaConfig {
                allowed_domains: self.allowed_domains,
                allowed_local_media_path: self.allowed_local_media_path,
                fetch_timeout_secs: self.media_fetch_timeout_secs,
            },
            log_level: Some(self.log_level),
            log_dir: self.log_dir,
            log_json: self.log_json,
        };
        config.validate()?;
        Ok(config)
    }
}
