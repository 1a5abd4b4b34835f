use std::collections::VecDeque;
use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use reqwest::{StatusCode, header::CONTENT_TYPE};

use super::{DecodeWorkerClient, DispatchError};
use crate::error::{WorkerError, WorkerResult};
use crate::output::{CanonicalOutput, OutputStream, WireRecord};

/// Decode worker reached over HTTP, streaming newline-delimited records.
///
/// Only the wait for response headers is bounded; the body streams for as
/// long as the decode worker keeps producing.
#[derive(Debug, Clone)]
pub struct HttpDecodeClient {
    url: String,
    client: reqwest::Client,
    response_timeout: Option<Duration>,
}

impl HttpDecodeClient {
    pub fn new(url: String, client: reqwest::Client) -> Self {
        HttpDecodeClient {
            url: url.trim_end_matches('/').to_string(),
            client,
            response_timeout: None,
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn api_path(&self, api_path: &str) -> String {
        if api_path.starts_with('/') {
            format!("{}{}", self.url, api_path)
        } else {
            format!("{}/{}", self.url, api_path)
        }
    }

    fn unavailable(&self, reason: impl ToString) -> DispatchError {
        DispatchError::Unavailable {
            worker: self.url.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl DecodeWorkerClient for HttpDecodeClient {
    fn url(&self) -> &str {
        &self.url
    }

    async fn dispatch(&self, payload: String) -> Result<OutputStream, DispatchError> {
        let send = self
            .client
            .post(self.api_path("/generate"))
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .send();
        let resp = match self.response_timeout {
            Some(limit) => tokio::time::timeout(limit, send)
                .await
                .map_err(|_| self.unavailable(format!("no response within {:?}", limit)))?,
            None => send.await,
        }
        .map_err(|e| self.unavailable(e))?;

        let status = resp.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(self.unavailable(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            let body = resp.bytes().await.unwrap_or_default();
            let err = match WireRecord::parse(&body) {
                Ok(WireRecord::Error(error)) => error.into(),
                _ => WorkerError::DecodeStreamFailed(format!(
                    "decode worker {} returned HTTP {}",
                    self.url, status
                )),
            };
            return Err(DispatchError::Rejected(err));
        }

        Ok(decode_ndjson(resp.bytes_stream()))
    }
}

/// Splits a byte stream into lines regardless of chunk boundaries.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = line.trim_ascii();
            if !line.is_empty() {
                lines.push(line.to_vec());
            }
        }
        lines
    }

    /// Whatever trails the last newline, if anything.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim_ascii();
        (!rest.is_empty()).then(|| rest.to_vec())
    }
}

fn parse_line(line: &[u8]) -> WorkerResult<CanonicalOutput> {
    WireRecord::parse(line)?.into_result()
}

struct DecodeState<S> {
    body: S,
    decoder: LineDecoder,
    pending: VecDeque<WorkerResult<CanonicalOutput>>,
    done: bool,
}

/// Turn a newline-delimited record stream into canonical outputs.
pub fn decode_ndjson<S, E>(body: S) -> OutputStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: LineDecoder::default(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    for line in state.decoder.push(&chunk) {
                        state.pending.push_back(parse_line(&line));
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    state
                        .pending
                        .push_back(Err(WorkerError::DecodeStreamFailed(e.to_string())));
                }
                None => {
                    state.done = true;
                    if let Some(rest) = state.decoder.finish() {
                        state.pending.push_back(parse_line(&rest));
                    }
                }
            }
        }
    })
    .boxed()
}
