//! One generation pass against the local engine.

use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::Stream;
use tracing::{debug, error, warn};

use crate::engine::{EnginePrompt, EngineOutput, EngineStream, InferenceEngine};
use crate::error::{WorkerError, WorkerResult};
use crate::io_struct::SamplingControls;
use crate::multimodal::MultimodalPayload;

/// Per-request lifecycle.
///
/// Decode-only workers go straight from `Created` to `Decoding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Materializing,
    Prefilling,
    HandingOff,
    Decoding,
    Done,
    Terminated,
    Failed,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Terminated)
    }

    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        match (*self, next) {
            (Created, Materializing)
            | (Created, Decoding)
            | (Materializing, Prefilling)
            | (Prefilling, Done)
            | (Prefilling, HandingOff)
            | (HandingOff, Decoding)
            | (Decoding, Done)
            | (Done, Terminated)
            | (Failed, Terminated) => true,
            (Created | Materializing | Prefilling | HandingOff | Decoding, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Created => "CREATED",
            RequestState::Materializing => "MATERIALIZING",
            RequestState::Prefilling => "PREFILLING",
            RequestState::HandingOff => "HANDING_OFF",
            RequestState::Decoding => "DECODING",
            RequestState::Done => "DONE",
            RequestState::Terminated => "TERMINATED",
            RequestState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Tracks and logs the state of one request.
pub struct RequestLifecycle {
    request_id: String,
    state: RequestState,
}

impl RequestLifecycle {
    pub fn new(request_id: impl Into<String>) -> Self {
        RequestLifecycle {
            request_id: request_id.into(),
            state: RequestState::Created,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn advance(&mut self, next: RequestState) {
        if !self.state.can_transition_to(next) {
            error!(
                "Request {}: invalid state transition {} -> {}",
                self.request_id, self.state, next
            );
            return;
        }
        debug!("Request {}: {} -> {}", self.request_id, self.state, next);
        self.state = next;
    }

    pub fn fail(&mut self, err: &WorkerError) {
        error!("Request {} failed in {}: {}", self.request_id, self.state, err);
        self.advance(RequestState::Failed);
        self.advance(RequestState::Terminated);
    }

    pub fn finish(&mut self) {
        self.advance(RequestState::Done);
        self.advance(RequestState::Terminated);
    }
}

impl Drop for RequestLifecycle {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            debug!(
                "Request {} abandoned by caller in {}",
                self.request_id, self.state
            );
        }
    }
}

/// Engine result stream that abandons generation when dropped early.
///
/// Once the engine reports `finished` (or an error) the stream is exhausted
/// and dropping it is a no-op.
pub struct AbortOnDropStream {
    inner: EngineStream,
    request_id: String,
    engine: Arc<dyn InferenceEngine>,
    completed: bool,
}

impl AbortOnDropStream {
    pub fn new(inner: EngineStream, request_id: String, engine: Arc<dyn InferenceEngine>) -> Self {
        AbortOnDropStream {
            inner,
            request_id,
            engine,
            completed: false,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Drain the stream and return its final result.
    pub async fn last(mut self) -> WorkerResult<EngineOutput> {
        use futures::StreamExt;

        let mut last = None;
        while let Some(item) = self.next().await {
            last = Some(item?);
        }
        last.filter(|output| output.finished).ok_or_else(|| {
            WorkerError::EngineFailure(format!(
                "generation for {} ended before a finished result",
                self.request_id
            ))
        })
    }
}

impl Stream for AbortOnDropStream {
    type Item = WorkerResult<EngineOutput>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.completed {
            return Poll::Ready(None);
        }
        match self.inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(output))) => {
                if output.finished {
                    self.completed = true;
                }
                Poll::Ready(Some(Ok(output)))
            }
            Poll::Ready(Some(Err(err))) => {
                self.completed = true;
                Poll::Ready(Some(Err(err.into())))
            }
            Poll::Ready(None) => {
                self.completed = true;
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for AbortOnDropStream {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        let engine = self.engine.clone();
        let request_id = std::mem::take(&mut self.request_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    debug!(
                        "Stream dropped without completion for request {}, sending abort",
                        request_id
                    );
                    if let Err(e) = engine.abort(&request_id).await {
                        warn!(
                            "Failed to send abort on drop for request {}: {}",
                            request_id, e
                        );
                    }
                });
            }
            Err(_) => warn!(
                "No runtime available to abort request {} on drop",
                request_id
            ),
        }
    }
}

/// Drives single generation calls against the shared engine.
#[derive(Clone)]
pub struct StageExecutor {
    engine: Arc<dyn InferenceEngine>,
}

impl StageExecutor {
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        StageExecutor { engine }
    }

    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        &self.engine
    }

    /// Start one generation call. The payload is moved into the engine and
    /// released when the call ends.
    pub async fn run(
        &self,
        request_id: &str,
        prompt_token_ids: Vec<u32>,
        multi_modal_data: Option<MultimodalPayload>,
        sampling: SamplingControls,
    ) -> WorkerResult<AbortOnDropStream> {
        debug!(
            "Starting generation for {} ({} prompt tokens, multimodal: {:?})",
            request_id,
            prompt_token_ids.len(),
            multi_modal_data.as_ref().map(|p| p.field_names())
        );
        let prompt = EnginePrompt {
            prompt_token_ids,
            multi_modal_data,
        };
        let inner = self.engine.generate(prompt, sampling, request_id).await?;
        Ok(AbortOnDropStream::new(
            inner,
            request_id.to_string(),
            self.engine.clone(),
        ))
    }
}
