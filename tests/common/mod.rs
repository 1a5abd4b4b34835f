// Shared mock collaborators for the integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::{Map, json};

use sgl_mm_disagg::dispatch::{DecodeWorkerClient, DispatchError, RemoteDispatcher};
use sgl_mm_disagg::engine::{EngineError, EngineOutput, EnginePrompt, EngineStream, InferenceEngine};
use sgl_mm_disagg::io_struct::{KV_TRANSFER_PARAMS_KEY, SamplingControls, TransferHandle, TransferParams};
use sgl_mm_disagg::multimodal::media::{MediaConnector, MediaConnectorConfig};
use sgl_mm_disagg::multimodal::transfer::{
    Descriptor, ReadOperation, RemoteMemoryConnector, TransferError,
};
use sgl_mm_disagg::multimodal::{EmbeddingLayout, Materializer};
use sgl_mm_disagg::error::WorkerResult;
use sgl_mm_disagg::output::{CanonicalOutput, CompletionOutput, OutputStream};

/// Token the mock engine splices in for each multimodal placeholder.
pub const IMAGE_TOKEN: u32 = 151655;
pub const EXPANDED_IMAGE_TOKENS: usize = 4;

/// One observed `generate` call.
#[derive(Debug, Clone)]
pub struct GenerateCall {
    pub request_id: String,
    pub prompt_token_ids: Vec<u32>,
    pub sampling: SamplingControls,
    pub multimodal_fields: Option<Vec<&'static str>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineBehavior {
    /// Emit every partial result and finish.
    Complete,
    /// Emit one partial result, then fail.
    FailAfterFirst,
    /// Emit one partial result, then never finish.
    Stall,
    /// Emit every result after waiting this long for each.
    Paced(Duration),
}

/// Engine that produces one token per partial result and records every call.
pub struct MockEngine {
    pub calls: Mutex<Vec<GenerateCall>>,
    pub aborts: Mutex<Vec<String>>,
    pub resets: AtomicUsize,
    pub fail_reset: AtomicBool,
    /// Whether a prefill asked to export KV state returns transfer params
    pub exports: AtomicBool,
    pub tokens: usize,
    pub behavior: EngineBehavior,
}

impl MockEngine {
    pub fn new(tokens: usize) -> Arc<Self> {
        Self::with_behavior(tokens, EngineBehavior::Complete)
    }

    pub fn with_behavior(tokens: usize, behavior: EngineBehavior) -> Arc<Self> {
        Arc::new(MockEngine {
            calls: Mutex::new(Vec::new()),
            aborts: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
            fail_reset: AtomicBool::new(false),
            exports: AtomicBool::new(true),
            tokens,
            behavior,
        })
    }

    pub fn calls(&self) -> Vec<GenerateCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn aborts(&self) -> Vec<String> {
        self.aborts.lock().unwrap().clone()
    }

    pub async fn wait_for_abort(&self) -> Vec<String> {
        for _ in 0..100 {
            let aborts = self.aborts();
            if !aborts.is_empty() {
                return aborts;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Vec::new()
    }
}

fn expand_prompt(prompt: &EnginePrompt) -> Vec<u32> {
    let mut ids = prompt.prompt_token_ids.clone();
    if prompt.multi_modal_data.is_some() {
        let at = ids.len().min(1);
        ids.splice(at..at, std::iter::repeat_n(IMAGE_TOKEN, EXPANDED_IMAGE_TOKENS));
    }
    ids
}

fn wants_export(sampling: &SamplingControls) -> bool {
    sampling.extra_args.get(KV_TRANSFER_PARAMS_KEY) == Some(&json!({"do_remote_decode": true}))
}

pub fn exported_params(request_id: &str) -> TransferParams {
    let mut params = Map::new();
    params.insert("do_remote_prefill".to_string(), json!(true));
    params.insert("remote_engine_id".to_string(), json!("prefill-0"));
    params.insert("remote_block_ids".to_string(), json!([7, 8, 9]));
    params.insert("remote_request_id".to_string(), json!(request_id));
    TransferParams::new(params)
}

#[async_trait]
impl InferenceEngine for MockEngine {
    async fn generate(
        &self,
        prompt: EnginePrompt,
        sampling: SamplingControls,
        request_id: &str,
    ) -> Result<EngineStream, EngineError> {
        let prompt_token_ids = expand_prompt(&prompt);
        self.calls.lock().unwrap().push(GenerateCall {
            request_id: request_id.to_string(),
            prompt_token_ids: prompt_token_ids.clone(),
            sampling: sampling.clone(),
            multimodal_fields: prompt
                .multi_modal_data
                .as_ref()
                .map(|p| p.field_names().to_vec()),
        });

        let budget = sampling.max_tokens.map(|m| m as usize).unwrap_or(self.tokens);
        let tokens = budget.min(self.tokens).max(1);
        let export = wants_export(&sampling) && self.exports.load(Ordering::SeqCst);

        let mut results: Vec<Result<EngineOutput, EngineError>> = Vec::new();
        for i in 0..tokens {
            let finished = i + 1 == tokens;
            results.push(Ok(EngineOutput {
                request_id: request_id.to_string(),
                prompt: None,
                prompt_token_ids: prompt_token_ids.clone(),
                prompt_logprobs: None,
                outputs: vec![CompletionOutput {
                    index: 0,
                    text: format!("t{}", i),
                    token_ids: vec![1000 + i as u32],
                    cumulative_logprob: Some(-0.5 * (i + 1) as f64),
                    logprobs: None,
                    finish_reason: finished.then(|| "length".to_string()),
                    stop_reason: None,
                }],
                finished,
                metrics: None,
                transfer_params: (finished && export).then(|| exported_params(request_id)),
            }));
        }

        let stream = match self.behavior {
            EngineBehavior::Complete => stream::iter(results).boxed(),
            EngineBehavior::FailAfterFirst => stream::iter(results.into_iter().take(1))
                .chain(stream::once(async {
                    Err(EngineError::Generation("CUDA error: device-side assert".to_string()))
                }))
                .boxed(),
            EngineBehavior::Stall => stream::iter(results.into_iter().take(1))
                .chain(stream::pending())
                .boxed(),
            EngineBehavior::Paced(delay) => stream::iter(results)
                .then(move |item| async move {
                    tokio::time::sleep(delay).await;
                    item
                })
                .boxed(),
        };
        Ok(stream)
    }

    async fn abort(&self, request_id: &str) -> Result<(), EngineError> {
        self.aborts.lock().unwrap().push(request_id.to_string());
        Ok(())
    }

    async fn reset_prefix_cache(&self) -> Result<(), EngineError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if self.fail_reset.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferBehavior {
    /// Fill the buffer with this byte and complete.
    Fill(u8),
    /// The remote side goes away before completion.
    Abort,
    /// Completion never arrives.
    Hang,
}

/// Remote-memory connector that counts reads.
pub struct MockConnector {
    pub reads: Mutex<Vec<TransferHandle>>,
    pub behavior: TransferBehavior,
}

impl MockConnector {
    pub fn new(behavior: TransferBehavior) -> Arc<Self> {
        Arc::new(MockConnector {
            reads: Mutex::new(Vec::new()),
            behavior,
        })
    }

    pub fn read_count(&self) -> usize {
        self.reads.lock().unwrap().len()
    }
}

struct MockRead {
    destination: Descriptor,
    behavior: TransferBehavior,
}

#[async_trait]
impl ReadOperation for MockRead {
    async fn wait_for_completion(mut self: Box<Self>) -> Result<Descriptor, TransferError> {
        match self.behavior {
            TransferBehavior::Fill(byte) => {
                tokio::task::yield_now().await;
                self.destination.as_mut_slice().fill(byte);
                Ok(self.destination)
            }
            TransferBehavior::Abort => Err(TransferError::Aborted("remote peer closed".to_string())),
            TransferBehavior::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl RemoteMemoryConnector for MockConnector {
    async fn begin_read(
        &self,
        handle: &TransferHandle,
        destination: Descriptor,
    ) -> Result<Box<dyn ReadOperation>, TransferError> {
        self.reads.lock().unwrap().push(handle.clone());
        Ok(Box::new(MockRead {
            destination,
            behavior: self.behavior,
        }))
    }
}

/// Sets a flag when the stream holding it is dropped.
pub struct DropFlag(pub Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Decode worker that refuses the first `failures` dispatches.
pub struct MockDecodeClient {
    pub url: String,
    pub failures: AtomicUsize,
    pub payloads: Mutex<Vec<serde_json::Value>>,
    pub tokens: usize,
    pub stall: bool,
    pub stream_dropped: Arc<AtomicBool>,
}

impl MockDecodeClient {
    pub fn new(url: &str, failures: usize, tokens: usize) -> Arc<Self> {
        Arc::new(MockDecodeClient {
            url: url.to_string(),
            failures: AtomicUsize::new(failures),
            payloads: Mutex::new(Vec::new()),
            tokens,
            stall: false,
            stream_dropped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn stalling(url: &str) -> Arc<Self> {
        Arc::new(MockDecodeClient {
            url: url.to_string(),
            failures: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
            tokens: 1,
            stall: true,
            stream_dropped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn calls(&self) -> usize {
        self.payloads.lock().unwrap().len()
    }

    pub fn payloads(&self) -> Vec<serde_json::Value> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl DecodeWorkerClient for MockDecodeClient {
    fn url(&self) -> &str {
        &self.url
    }

    async fn dispatch(&self, payload: String) -> Result<OutputStream, DispatchError> {
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        self.payloads.lock().unwrap().push(value.clone());

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DispatchError::Unavailable {
                worker: self.url.clone(),
                reason: "connection refused".to_string(),
            });
        }

        let request_id = value["request_id"].as_str().unwrap_or_default().to_string();
        let prompt_token_ids: Vec<u32> =
            serde_json::from_value(value["tokenized_prompt"].clone()).unwrap_or_default();
        let outputs: Vec<WorkerResult<CanonicalOutput>> = (0..self.tokens)
            .map(|i| {
                let finished = i + 1 == self.tokens && !self.stall;
                Ok(CanonicalOutput {
                    request_id: request_id.clone(),
                    prompt: None,
                    prompt_token_ids: prompt_token_ids.clone(),
                    prompt_logprobs: None,
                    outputs: vec![CompletionOutput {
                        index: 0,
                        text: format!("d{}", i),
                        token_ids: vec![2000 + i as u32],
                        cumulative_logprob: None,
                        logprobs: None,
                        finish_reason: finished.then(|| "stop".to_string()),
                        stop_reason: None,
                    }],
                    finished,
                    metrics: None,
                    transfer_params: None,
                })
            })
            .collect();

        let flag = DropFlag(self.stream_dropped.clone());
        let tail: BoxStream<'static, WorkerResult<CanonicalOutput>> = if self.stall {
            stream::pending().boxed()
        } else {
            stream::empty().boxed()
        };
        let stream = stream::iter(outputs).chain(tail).map(move |item| {
            let _ = &flag;
            item
        });
        Ok(stream.boxed())
    }
}

pub fn pool(clients: &[&Arc<MockDecodeClient>]) -> RemoteDispatcher {
    RemoteDispatcher::new(
        clients
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn DecodeWorkerClient>)
            .collect(),
    )
}

pub fn materializer(layout: EmbeddingLayout, connector: Arc<dyn RemoteMemoryConnector>) -> Materializer {
    let media = MediaConnector::new(reqwest::Client::new(), MediaConnectorConfig::default()).unwrap();
    Materializer::new(
        layout,
        media,
        connector,
        Duration::from_secs(3600),
        Duration::from_millis(200),
    )
}

pub async fn wait_for(flag: &AtomicBool) -> bool {
    for _ in 0..100 {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
