use std::time::Duration;

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineError;
use crate::multimodal::error::MediaConnectorError;
use crate::multimodal::transfer::TransferError;

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Every way a single generation request can fail.
///
/// Variants surface as the final element of a worker's output stream; they
/// are never retried except for [`WorkerError::DispatchUnavailable`], which is
/// only produced after the dispatcher's single retry is exhausted.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkerError {
    #[error("malformed request: field '{field}': {reason}")]
    MalformedRequest { field: String, reason: String },

    #[error("failed to fetch media: {0}")]
    MediaFetch(String),

    #[error("unsupported media: {0}")]
    UnsupportedMedia(String),

    #[error("remote memory read timed out after {0:?}")]
    TransferTimeout(Duration),

    #[error("remote memory read aborted: {0}")]
    TransferAborted(String),

    #[error("invalid transfer handle: {0}")]
    InvalidHandle(String),

    #[error("inference engine failure: {0}")]
    EngineFailure(String),

    #[error("prefill for request {request_id} finished without transfer params")]
    MissingHandoffState { request_id: String },

    #[error("no decode worker reachable after {attempts} attempt(s): {reason}")]
    DispatchUnavailable { attempts: usize, reason: String },

    #[error("decode stream failed: {0}")]
    DecodeStreamFailed(String),

    #[error("decode worker reported {kind}: {message}")]
    Remote { kind: String, message: String },
}

impl WorkerError {
    pub fn malformed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        WorkerError::MalformedRequest {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Stable tag used in serialized error records.
    pub fn kind(&self) -> &str {
        match self {
            WorkerError::MalformedRequest { .. } => "malformed_request",
            WorkerError::MediaFetch(_) => "media_fetch_error",
            WorkerError::UnsupportedMedia(_) => "unsupported_media_error",
            WorkerError::TransferTimeout(_) => "transfer_timeout",
            WorkerError::TransferAborted(_) => "transfer_aborted",
            WorkerError::InvalidHandle(_) => "invalid_handle",
            WorkerError::EngineFailure(_) => "engine_failure",
            WorkerError::MissingHandoffState { .. } => "missing_handoff_state",
            WorkerError::DispatchUnavailable { .. } => "dispatch_unavailable",
            WorkerError::DecodeStreamFailed(_) => "decode_stream_failed",
            WorkerError::Remote { kind, .. } => kind,
        }
    }

    pub fn to_output(&self) -> ErrorOutput {
        let message = match self {
            // Relay the decode worker's message as-is so the kind isn't repeated.
            WorkerError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorOutput {
            kind: self.kind().to_string(),
            message,
        }
    }
}

/// Serializable form of a [`WorkerError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorOutput {
    pub kind: String,
    pub message: String,
}

impl From<ErrorOutput> for WorkerError {
    fn from(output: ErrorOutput) -> Self {
        WorkerError::Remote {
            kind: output.kind,
            message: output.message,
        }
    }
}

impl From<MediaConnectorError> for WorkerError {
    fn from(err: MediaConnectorError) -> Self {
        if err.is_decode_failure() {
            WorkerError::UnsupportedMedia(err.to_string())
        } else {
            WorkerError::MediaFetch(err.to_string())
        }
    }
}

impl From<TransferError> for WorkerError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Timeout(after) => WorkerError::TransferTimeout(after),
            TransferError::InvalidHandle(handle) => WorkerError::InvalidHandle(handle),
            err @ TransferError::Unallocatable { .. } => {
                WorkerError::malformed("multimodal_input.shape", err.to_string())
            }
            other => WorkerError::TransferAborted(other.to_string()),
        }
    }
}

impl From<EngineError> for WorkerError {
    fn from(err: EngineError) -> Self {
        WorkerError::EngineFailure(err.to_string())
    }
}

impl ResponseError for WorkerError {
    fn status_code(&self) -> StatusCode {
        match self {
            WorkerError::MalformedRequest { .. } | WorkerError::InvalidHandle(_) => {
                StatusCode::BAD_REQUEST
            }
            WorkerError::UnsupportedMedia(_) => StatusCode::UNPROCESSABLE_ENTITY,
            WorkerError::DispatchUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            WorkerError::MediaFetch(_)
            | WorkerError::DecodeStreamFailed(_)
            | WorkerError::Remote { .. } => StatusCode::BAD_GATEWAY,
            WorkerError::TransferTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.to_output(),
        }))
    }
}
