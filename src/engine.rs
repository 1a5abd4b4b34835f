//! Interface to the local inference engine.
//!
//! The engine owns sampling, batching and KV storage. A worker holds one
//! shared instance for its lifetime and only ever invokes it.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use thiserror::Error;

use crate::io_struct::{SamplingControls, TransferParams};
use crate::multimodal::MultimodalPayload;
use crate::output::{CompletionOutput, RequestMetrics};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine rejected request {request_id}: {reason}")]
    Rejected { request_id: String, reason: String },
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("engine is shutting down")]
    Shutdown,
}

/// Prompt handed to the engine for one generation call.
#[derive(Debug)]
pub struct EnginePrompt {
    pub prompt_token_ids: Vec<u32>,
    pub multi_modal_data: Option<MultimodalPayload>,
}

/// One partial result as produced by the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutput {
    pub request_id: String,
    pub prompt: Option<String>,
    /// Prompt ids after template expansion, which may differ in length from
    /// the submitted ids when multimodal placeholders are expanded.
    pub prompt_token_ids: Vec<u32>,
    pub prompt_logprobs: Option<Value>,
    pub outputs: Vec<CompletionOutput>,
    pub finished: bool,
    pub metrics: Option<RequestMetrics>,
    pub transfer_params: Option<TransferParams>,
}

pub type EngineStream = Pin<Box<dyn Stream<Item = Result<EngineOutput, EngineError>> + Send>>;

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Start one generation call. Results arrive in generation order and the
    /// last one has `finished` set.
    async fn generate(
        &self,
        prompt: EnginePrompt,
        sampling: SamplingControls,
        request_id: &str,
    ) -> Result<EngineStream, EngineError>;

    /// Abandon an in-flight generation call.
    async fn abort(&self, request_id: &str) -> Result<(), EngineError>;

    async fn reset_prefix_cache(&self) -> Result<(), EngineError>;
}
