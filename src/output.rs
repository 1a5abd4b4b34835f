//! Canonical output schema shared by every execution path.
//!
//! Local engine results and records relayed from a decode worker both pass
//! through [`CanonicalOutput`] so that callers see one field set in one order
//! regardless of topology.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::EngineOutput;
use crate::error::{ErrorOutput, WorkerError, WorkerResult};
use crate::io_struct::TransferParams;

pub type OutputStream = Pin<Box<dyn Stream<Item = WorkerResult<CanonicalOutput>> + Send>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionOutput {
    pub index: u32,
    pub text: String,
    pub token_ids: Vec<u32>,
    pub cumulative_logprob: Option<f64>,
    pub logprobs: Option<Value>,
    pub finish_reason: Option<String>,
    pub stop_reason: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetrics {
    pub arrival_time: Option<f64>,
    pub first_scheduled_time: Option<f64>,
    pub first_token_time: Option<f64>,
    pub time_in_queue: Option<f64>,
    pub finished_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalOutput {
    pub request_id: String,
    pub prompt: Option<String>,
    pub prompt_token_ids: Vec<u32>,
    pub prompt_logprobs: Option<Value>,
    pub outputs: Vec<CompletionOutput>,
    pub finished: bool,
    pub metrics: Option<RequestMetrics>,
    pub transfer_params: Option<TransferParams>,
}

impl CanonicalOutput {
    /// Re-emit a record received from a decode worker field by field.
    pub fn normalize(remote: CanonicalOutput) -> Self {
        let CanonicalOutput {
            request_id,
            prompt,
            prompt_token_ids,
            prompt_logprobs,
            outputs,
            finished,
            metrics,
            transfer_params,
        } = remote;
        CanonicalOutput {
            request_id,
            prompt,
            prompt_token_ids,
            prompt_logprobs,
            outputs,
            finished,
            metrics,
            transfer_params: transfer_params.filter(|p| !p.is_empty()),
        }
    }

    /// Serialize as one newline-terminated transport record.
    pub fn to_wire_line(&self) -> WorkerResult<Bytes> {
        WireRecord::Output(self.clone()).to_line()
    }
}

impl From<EngineOutput> for CanonicalOutput {
    fn from(result: EngineOutput) -> Self {
        CanonicalOutput {
            request_id: result.request_id,
            prompt: result.prompt,
            prompt_token_ids: result.prompt_token_ids,
            prompt_logprobs: result.prompt_logprobs,
            outputs: result.outputs,
            finished: result.finished,
            metrics: result.metrics,
            transfer_params: result.transfer_params.filter(|p| !p.is_empty()),
        }
    }
}

/// One line of the transport stream: an output or a terminal error.
#[derive(Debug, Clone, PartialEq)]
pub enum WireRecord {
    Output(CanonicalOutput),
    Error(ErrorOutput),
}

impl WireRecord {
    pub fn to_line(&self) -> WorkerResult<Bytes> {
        let mut line = match self {
            WireRecord::Output(output) => serde_json::to_vec(output),
            WireRecord::Error(error) => serde_json::to_vec(&serde_json::json!({ "error": error })),
        }
        .map_err(|e| WorkerError::DecodeStreamFailed(format!("failed to encode record: {}", e)))?;
        line.push(b'\n');
        Ok(Bytes::from(line))
    }

    pub fn parse(line: &[u8]) -> WorkerResult<Self> {
        let mut value: Value = serde_json::from_slice(line)
            .map_err(|e| WorkerError::DecodeStreamFailed(format!("invalid record: {}", e)))?;
        if let Some(error) = value.as_object_mut().and_then(|o| o.remove("error")) {
            let error: ErrorOutput = serde_json::from_value(error)
                .map_err(|e| WorkerError::DecodeStreamFailed(format!("invalid error record: {}", e)))?;
            return Ok(WireRecord::Error(error));
        }
        let output: CanonicalOutput = serde_json::from_value(value)
            .map_err(|e| WorkerError::DecodeStreamFailed(format!("invalid output record: {}", e)))?;
        Ok(WireRecord::Output(output))
    }

    pub fn into_result(self) -> WorkerResult<CanonicalOutput> {
        match self {
            WireRecord::Output(output) => Ok(CanonicalOutput::normalize(output)),
            WireRecord::Error(error) => Err(error.into()),
        }
    }
}

impl From<&WorkerResult<CanonicalOutput>> for WireRecord {
    fn from(item: &WorkerResult<CanonicalOutput>) -> Self {
        match item {
            Ok(output) => WireRecord::Output(output.clone()),
            Err(err) => WireRecord::Error(err.to_output()),
        }
    }
}

/// Ends a stream right after its first `finished` record or first error.
///
/// If the inner stream runs dry before either, `unterminated` is emitted as a
/// final error so that consumers never mistake a truncated stream for a
/// complete one.
pub struct FinishGuard<S> {
    inner: S,
    unterminated: Option<WorkerError>,
    done: bool,
}

impl<S> FinishGuard<S> {
    pub fn new(inner: S, unterminated: WorkerError) -> Self {
        FinishGuard {
            inner,
            unterminated: Some(unterminated),
            done: false,
        }
    }
}

impl<S> Stream for FinishGuard<S>
where
    S: Stream<Item = WorkerResult<CanonicalOutput>> + Unpin,
{
    type Item = WorkerResult<CanonicalOutput>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(output))) => {
                if output.finished {
                    self.done = true;
                }
                Poll::Ready(Some(Ok(output)))
            }
            Poll::Ready(Some(Err(err))) => {
                self.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(self.unterminated.take().map(Err))
            }
        }
    }
}
