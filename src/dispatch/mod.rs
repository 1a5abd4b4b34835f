//! Forwarding of handoff requests to the decode worker pool.

pub mod http;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::handoff::HandoffRequest;
use crate::output::{FinishGuard, OutputStream};

pub use http::HttpDecodeClient;

/// Attempts per dispatch: the first try plus one retry on another worker.
const MAX_DISPATCH_ATTEMPTS: usize = 2;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Nothing was received from the worker; the request may be retried.
    #[error("decode worker {worker} is unavailable: {reason}")]
    Unavailable { worker: String, reason: String },
    /// The worker answered with an error before streaming any output.
    #[error(transparent)]
    Rejected(WorkerError),
}

/// One decode worker reachable over some request/response streaming transport.
#[async_trait]
pub trait DecodeWorkerClient: Send + Sync {
    fn url(&self) -> &str;

    async fn dispatch(&self, payload: String) -> Result<OutputStream, DispatchError>;
}

/// Round-robin dispatcher over the registered decode workers.
pub struct RemoteDispatcher {
    workers: Vec<Arc<dyn DecodeWorkerClient>>,
    counter: AtomicUsize,
}

impl RemoteDispatcher {
    pub fn new(workers: Vec<Arc<dyn DecodeWorkerClient>>) -> Self {
        RemoteDispatcher {
            workers,
            counter: AtomicUsize::new(0),
        }
    }

    /// HTTP decode workers, each bounded by `response_timeout` until headers arrive.
    pub fn from_urls(urls: &[String], client: reqwest::Client, response_timeout: Duration) -> Self {
        let workers = urls
            .iter()
            .map(|url| {
                Arc::new(
                    HttpDecodeClient::new(url.clone(), client.clone())
                        .with_response_timeout(response_timeout),
                ) as Arc<dyn DecodeWorkerClient>
            })
            .collect();
        Self::new(workers)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Workers to try for one dispatch: one round-robin slot, then the slot after it.
    fn attempt_order(&self) -> impl Iterator<Item = &Arc<dyn DecodeWorkerClient>> {
        let len = self.workers.len();
        let (start, attempts) = if len == 0 {
            (0, 0)
        } else {
            (self.counter.fetch_add(1, Ordering::Relaxed) % len, MAX_DISPATCH_ATTEMPTS)
        };
        (0..attempts).map(move |attempt| &self.workers[(start + attempt) % len])
    }

    /// Send the handoff to a decode worker and return its output stream.
    ///
    /// Only failures before the first byte are retried, once. A stream that
    /// breaks later surfaces its error to the caller.
    pub async fn dispatch(&self, handoff: HandoffRequest) -> WorkerResult<OutputStream> {
        let request_id = handoff.request_id().to_string();
        let payload = handoff.to_json()?;
        debug!("Decode request: {}", payload);

        let mut last_reason = "no decode workers registered".to_string();
        let mut attempts = 0;
        for worker in self.attempt_order() {
            attempts += 1;
            match worker.dispatch(payload.clone()).await {
                Ok(stream) => {
                    debug!(
                        "Dispatched {} to decode worker {} (attempt {})",
                        request_id,
                        worker.url(),
                        attempts
                    );
                    let unterminated = WorkerError::DecodeStreamFailed(format!(
                        "decode stream for {} ended before a finished record",
                        request_id
                    ));
                    return Ok(FinishGuard::new(stream, unterminated).boxed());
                }
                Err(DispatchError::Unavailable { worker, reason }) => {
                    warn!(
                        "Decode worker {} unavailable for {} (attempt {}): {}",
                        worker, request_id, attempts, reason
                    );
                    last_reason = reason;
                }
                Err(DispatchError::Rejected(err)) => return Err(err),
            }
        }

        Err(WorkerError::DispatchUnavailable {
            attempts,
            reason: last_reason,
        })
    }
}
