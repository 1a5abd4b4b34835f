//! Request handlers for the two worker variants.
//!
//! Both variants share one contract: take a request in any accepted
//! representation and return a stream of canonical outputs that ends with a
//! finished record or an error. The variant is fixed when the worker is built.

use std::{future::Future, sync::Arc};

use anyhow::Context as _;
use async_trait::async_trait;
use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, error, info, info_span};

use crate::config::{WorkerConfig, WorkerMode};
use crate::dispatch::RemoteDispatcher;
use crate::engine::InferenceEngine;
use crate::error::{WorkerError, WorkerResult};
use crate::handoff::{build_handoff, prepare_prefill};
use crate::io_struct::{GenerationRequest, RequestEnvelope};
use crate::multimodal::{Materializer, media::MediaConnector, transfer::RemoteMemoryConnector};
use crate::output::{CanonicalOutput, FinishGuard, OutputStream};
use crate::stage::{RequestLifecycle, RequestState, StageExecutor};

type OutputSender = mpsc::Sender<WorkerResult<CanonicalOutput>>;

/// Result of the cache-reset side channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheResetStatus {
    pub status: String,
    pub message: String,
}

impl CacheResetStatus {
    pub fn success() -> Self {
        CacheResetStatus {
            status: "success".to_string(),
            message: "KV cache cleared".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        CacheResetStatus {
            status: "error".to_string(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

#[async_trait]
pub trait WorkerHandler: Send + Sync {
    /// Serve one request. Dropping the returned stream cancels the request,
    /// including any engine call or decode stream it has in flight.
    fn generate(&self, request: RequestEnvelope) -> OutputStream;

    /// Reset the engine's prefix cache.
    async fn clear_kv_blocks(&self) -> CacheResetStatus;

    fn worker_type(&self) -> &'static str;
}

async fn reset_cache(executor: &StageExecutor) -> CacheResetStatus {
    match executor.engine().reset_prefix_cache().await {
        Ok(()) => {
            info!("Prefix cache reset");
            CacheResetStatus::success()
        }
        Err(e) => {
            error!("Failed to reset prefix cache: {}", e);
            CacheResetStatus::error(e.to_string())
        }
    }
}

fn rejected(err: WorkerError) -> OutputStream {
    error!("Rejected request: {}", err);
    stream::once(async move { Err(err) }).boxed()
}

/// Run `pipeline` on its own task and expose what it sends as a stream.
///
/// The task stops as soon as the receiving side is dropped, which drops every
/// stream the pipeline holds.
fn spawn_request<F, Fut>(buffer_size: usize, span: tracing::Span, pipeline: F) -> OutputStream
where
    F: FnOnce(OutputSender) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    let watcher = tx.clone();
    let pipeline = pipeline(tx);
    tokio::spawn(
        async move {
            tokio::select! {
                _ = pipeline => {}
                _ = watcher.closed() => {
                    debug!("Caller disconnected, cancelling request");
                }
            }
        }
        .instrument(span),
    );
    ReceiverStream::new(rx).boxed()
}

/// Forward outputs to the caller until the first error, which is returned.
async fn forward<S>(mut outputs: S, tx: &OutputSender) -> WorkerResult<()>
where
    S: Stream<Item = WorkerResult<CanonicalOutput>> + Unpin,
{
    while let Some(item) = outputs.next().await {
        let output = item?;
        if tx.send(Ok(output)).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Record the outcome and deliver a failure as the stream's last element.
async fn conclude(lifecycle: &mut RequestLifecycle, result: WorkerResult<()>, tx: &OutputSender) {
    match result {
        Ok(()) if tx.is_closed() => {}
        Ok(()) => lifecycle.finish(),
        Err(err) => {
            lifecycle.fail(&err);
            let _ = tx.send(Err(err)).await;
        }
    }
}

fn engine_unterminated(request_id: &str) -> WorkerError {
    WorkerError::EngineFailure(format!(
        "generation for {} ended before a finished result",
        request_id
    ))
}

/// Decode-only worker: serves handoff requests produced by a prefill worker.
pub struct DecodeWorkerHandler {
    executor: StageExecutor,
    stream_buffer_size: usize,
}

impl DecodeWorkerHandler {
    pub fn new(executor: StageExecutor, stream_buffer_size: usize) -> Self {
        DecodeWorkerHandler {
            executor,
            stream_buffer_size,
        }
    }

    async fn decode(
        executor: StageExecutor,
        request: GenerationRequest,
        lifecycle: &mut RequestLifecycle,
        tx: &OutputSender,
    ) -> WorkerResult<()> {
        if !request.multimodal_input().is_none() {
            return Err(WorkerError::malformed(
                "multimodal_input",
                "decode workers take requests whose multimodal input was consumed by prefill",
            ));
        }
        lifecycle.advance(RequestState::Decoding);
        debug!(
            "Decode request {}: {:?}",
            request.request_id(),
            request.sampling_controls()
        );

        let results = executor
            .run(
                request.request_id(),
                request.tokenized_prompt().to_vec(),
                None,
                request.sampling_controls().clone(),
            )
            .await?;
        let outputs = results.map(|r| r.map(CanonicalOutput::from));
        forward(
            FinishGuard::new(outputs, engine_unterminated(request.request_id())),
            tx,
        )
        .await
    }
}

#[async_trait]
impl WorkerHandler for DecodeWorkerHandler {
    fn generate(&self, request: RequestEnvelope) -> OutputStream {
        let request = match request.normalize() {
            Ok(request) => request,
            Err(err) => return rejected(err),
        };
        let span = info_span!("generate", request_id = %request.request_id(), mode = "decode");
        let executor = self.executor.clone();
        spawn_request(self.stream_buffer_size, span, move |tx| async move {
            let mut lifecycle = RequestLifecycle::new(request.request_id());
            let result = Self::decode(executor, request, &mut lifecycle, &tx).await;
            conclude(&mut lifecycle, result, &tx).await;
        })
    }

    async fn clear_kv_blocks(&self) -> CacheResetStatus {
        reset_cache(&self.executor).await
    }

    fn worker_type(&self) -> &'static str {
        WorkerMode::Decode.as_str()
    }
}

/// Prefill worker that either decodes locally or hands off to a decode worker.
pub struct PrefillDecodeWorkerHandler {
    executor: StageExecutor,
    materializer: Arc<Materializer>,
    dispatcher: Option<Arc<RemoteDispatcher>>,
    stream_buffer_size: usize,
}

impl PrefillDecodeWorkerHandler {
    /// Split mode is active exactly when a dispatcher is supplied.
    pub fn new(
        executor: StageExecutor,
        materializer: Materializer,
        dispatcher: Option<RemoteDispatcher>,
        stream_buffer_size: usize,
    ) -> Self {
        PrefillDecodeWorkerHandler {
            executor,
            materializer: Arc::new(materializer),
            dispatcher: dispatcher.map(Arc::new),
            stream_buffer_size,
        }
    }

    pub fn is_split(&self) -> bool {
        self.dispatcher.is_some()
    }

    async fn serve(
        executor: StageExecutor,
        materializer: Arc<Materializer>,
        dispatcher: Option<Arc<RemoteDispatcher>>,
        request: GenerationRequest,
        lifecycle: &mut RequestLifecycle,
        tx: &OutputSender,
    ) -> WorkerResult<()> {
        let request_id = request.request_id();

        lifecycle.advance(RequestState::Materializing);
        let payload = materializer.materialize(request.multimodal_input()).await?;

        lifecycle.advance(RequestState::Prefilling);
        let Some(dispatcher) = dispatcher else {
            let results = executor
                .run(
                    request_id,
                    request.tokenized_prompt().to_vec(),
                    payload,
                    request.sampling_controls().clone(),
                )
                .await?;
            let outputs = results.map(|r| r.map(CanonicalOutput::from));
            return forward(FinishGuard::new(outputs, engine_unterminated(request_id)), tx).await;
        };

        let prefill_sampling = prepare_prefill(request.sampling_controls());
        debug!("Prefill request {}: {:?}", request_id, prefill_sampling);
        let prefill_final = executor
            .run(
                request_id,
                request.tokenized_prompt().to_vec(),
                payload,
                prefill_sampling,
            )
            .await?
            .last()
            .await?;

        lifecycle.advance(RequestState::HandingOff);
        let handoff = build_handoff(&request, &prefill_final)?;

        lifecycle.advance(RequestState::Decoding);
        let remote = dispatcher.dispatch(handoff).await?;
        forward(remote, tx).await
    }
}

#[async_trait]
impl WorkerHandler for PrefillDecodeWorkerHandler {
    fn generate(&self, request: RequestEnvelope) -> OutputStream {
        let request = match request.normalize() {
            Ok(request) => request,
            Err(err) => return rejected(err),
        };
        let mode = if self.is_split() { "prefill" } else { "prefill_decode" };
        let span = info_span!("generate", request_id = %request.request_id(), mode);
        let executor = self.executor.clone();
        let materializer = self.materializer.clone();
        let dispatcher = self.dispatcher.clone();
        spawn_request(self.stream_buffer_size, span, move |tx| async move {
            let mut lifecycle = RequestLifecycle::new(request.request_id());
            let result = Self::serve(
                executor,
                materializer,
                dispatcher,
                request,
                &mut lifecycle,
                &tx,
            )
            .await;
            conclude(&mut lifecycle, result, &tx).await;
        })
    }

    async fn clear_kv_blocks(&self) -> CacheResetStatus {
        reset_cache(&self.executor).await
    }

    fn worker_type(&self) -> &'static str {
        WorkerMode::PrefillDecode.as_str()
    }
}

/// Build the handler variant selected by `config`.
pub fn build_handler(
    config: &WorkerConfig,
    engine: Arc<dyn InferenceEngine>,
    connector: Arc<dyn RemoteMemoryConnector>,
) -> anyhow::Result<Arc<dyn WorkerHandler>> {
    config.validate()?;
    let executor = StageExecutor::new(engine);

    let handler: Arc<dyn WorkerHandler> = match config.mode {
        WorkerMode::Decode => {
            info!("Building decode worker for {}", config.model);
            Arc::new(DecodeWorkerHandler::new(executor, config.stream_buffer_size))
        }
        WorkerMode::PrefillDecode => {
            let media_client = reqwest::Client::builder()
                .build()
                .context("Failed to build media HTTP client")?;
            let media = MediaConnector::new(media_client, config.media_connector_config())
                .context("Failed to build media connector")?;
            let layout = config.embedding_layout();
            let materializer = Materializer::new(
                layout,
                media,
                connector,
                config.handle_retention(),
                config.transfer_timeout(),
            )
            .with_max_embedding_bytes(config.max_embedding_bytes);

            let dispatcher = if config.enable_disagg() {
                let client = reqwest::Client::builder()
                    .connect_timeout(config.request_timeout())
                    .build()
                    .context("Failed to build decode dispatch HTTP client")?;
                Some(RemoteDispatcher::from_urls(
                    &config.decode_worker_urls,
                    client,
                    config.request_timeout(),
                ))
            } else {
                None
            };

            info!(
                "Building prefill worker for {} (layout: {:?}, split: {}, decode workers: {})",
                config.model,
                layout,
                dispatcher.is_some(),
                config.decode_worker_urls.len()
            );
            Arc::new(PrefillDecodeWorkerHandler::new(
                executor,
                materializer,
                dispatcher,
                config.stream_buffer_size,
            ))
        }
    };
    Ok(handler)
}
