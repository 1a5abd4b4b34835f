use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{WorkerError, WorkerResult};

/// Key under which cross-stage state travels in [`SamplingControls::extra_args`].
pub const KV_TRANSFER_PARAMS_KEY: &str = "kv_transfer_params";

/// Stale handle entry that must not reach the decode worker.
pub const SERIALIZED_REQUEST_KEY: &str = "serialized_request";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorDtype {
    Float16,
    BFloat16,
    Float32,
    UInt8,
}

impl TensorDtype {
    pub fn element_size(&self) -> usize {
        match self {
            TensorDtype::Float16 | TensorDtype::BFloat16 => 2,
            TensorDtype::Float32 => 4,
            TensorDtype::UInt8 => 1,
        }
    }

    /// Bytes needed for a tensor of `shape`, or None if that can't be allocated.
    pub fn byte_len(&self, shape: &[usize]) -> Option<usize> {
        shape
            .iter()
            .try_fold(self.element_size(), |acc, dim| acc.checked_mul(*dim))
            .filter(|len| *len <= isize::MAX as usize)
    }
}

/// Opaque token identifying one pending remote-memory read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferHandle(String);

impl TransferHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        TransferHandle(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MultimodalInput {
    #[default]
    None,
    MediaReference {
        url: String,
        media_kind: MediaKind,
    },
    RemoteEmbedding {
        handle: TransferHandle,
        shape: Vec<usize>,
        dtype: TensorDtype,
        /// Spatial grid descriptor (temporal, height, width) per image.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_grid_thw: Option<Vec<[u32; 3]>>,
    },
}

impl MultimodalInput {
    pub fn is_none(&self) -> bool {
        matches!(self, MultimodalInput::None)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingControls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub min_tokens: u32,
    /// Engine-specific overrides that are passed through untouched.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra_args: Map<String, Value>,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl SamplingControls {
    pub fn with_max_tokens(max_tokens: u32) -> Self {
        SamplingControls {
            max_tokens: Some(max_tokens),
            ..Default::default()
        }
    }
}

/// Engine-internal state carried across the prefill/decode boundary.
///
/// Only the orchestration layer reads it; its contents are passed through
/// verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferParams(Map<String, Value>);

impl TransferParams {
    pub fn new(params: Map<String, Value>) -> Self {
        TransferParams(params)
    }

    /// Marker attached to a prefill call so the engine exports its KV state.
    pub fn remote_decode_request() -> Self {
        let mut params = Map::new();
        params.insert("do_remote_decode".to_string(), Value::Bool(true));
        TransferParams(params)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// One inbound generation request after normalization.
///
/// Fields are only readable once constructed; derived requests are built as
/// new values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    request_id: String,
    tokenized_prompt: Vec<u32>,
    #[serde(default)]
    sampling_controls: SamplingControls,
    #[serde(default)]
    multimodal_input: MultimodalInput,
}

impl GenerationRequest {
    pub fn new(
        request_id: impl Into<String>,
        tokenized_prompt: Vec<u32>,
        sampling_controls: SamplingControls,
        multimodal_input: MultimodalInput,
    ) -> Self {
        GenerationRequest {
            request_id: request_id.into(),
            tokenized_prompt,
            sampling_controls,
            multimodal_input,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn tokenized_prompt(&self) -> &[u32] {
        &self.tokenized_prompt
    }

    pub fn sampling_controls(&self) -> &SamplingControls {
        &self.sampling_controls
    }

    pub fn multimodal_input(&self) -> &MultimodalInput {
        &self.multimodal_input
    }

    pub fn to_json(&self) -> WorkerResult<String> {
        serde_json::to_string(self).map_err(|e| WorkerError::malformed("<root>", e.to_string()))
    }

    fn validate(self) -> WorkerResult<Self> {
        if self.request_id.trim().is_empty() {
            return Err(WorkerError::malformed("request_id", "must not be empty"));
        }
        if self.tokenized_prompt.is_empty() {
            return Err(WorkerError::malformed(
                "tokenized_prompt",
                "must contain at least one token id",
            ));
        }

        let sampling = &self.sampling_controls;
        if let Some(max_tokens) = sampling.max_tokens {
            if max_tokens == 0 {
                return Err(WorkerError::malformed(
                    "sampling_controls.max_tokens",
                    "must be at least 1",
                ));
            }
            if sampling.min_tokens > max_tokens {
                return Err(WorkerError::malformed(
                    "sampling_controls.min_tokens",
                    format!("{} exceeds max_tokens {}", sampling.min_tokens, max_tokens),
                ));
            }
        }

        match &self.multimodal_input {
            MultimodalInput::None => {}
            MultimodalInput::MediaReference { url, .. } => {
                if url.trim().is_empty() {
                    return Err(WorkerError::malformed(
                        "multimodal_input.url",
                        "must not be empty",
                    ));
                }
            }
            MultimodalInput::RemoteEmbedding {
                handle,
                shape,
                dtype,
                ..
            } => {
                if handle.as_str().is_empty() {
                    return Err(WorkerError::malformed(
                        "multimodal_input.handle",
                        "must not be empty",
                    ));
                }
                if shape.is_empty() || shape.contains(&0) {
                    return Err(WorkerError::malformed(
                        "multimodal_input.shape",
                        format!("invalid tensor shape {:?}", shape),
                    ));
                }
                if dtype.byte_len(shape).is_none() {
                    return Err(WorkerError::malformed(
                        "multimodal_input.shape",
                        "tensor size overflows addressable memory",
                    ));
                }
            }
        }

        Ok(self)
    }

    fn from_untyped(value: Value) -> WorkerResult<Self> {
        let Value::Object(mut fields) = value else {
            return Err(WorkerError::malformed("<root>", "expected a JSON object"));
        };

        let request_id: String = take_required(&mut fields, "request_id")?;
        let tokenized_prompt: Vec<u32> = take_required(&mut fields, "tokenized_prompt")?;
        let sampling_controls: SamplingControls =
            take_optional(&mut fields, "sampling_controls")?.unwrap_or_default();
        let multimodal_input: MultimodalInput =
            take_optional(&mut fields, "multimodal_input")?.unwrap_or_default();

        Ok(GenerationRequest {
            request_id,
            tokenized_prompt,
            sampling_controls,
            multimodal_input,
        })
    }
}

fn take_optional<T: serde::de::DeserializeOwned>(
    fields: &mut Map<String, Value>,
    name: &str,
) -> WorkerResult<Option<T>> {
    match fields.remove(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| WorkerError::malformed(name, e.to_string())),
    }
}

fn take_required<T: serde::de::DeserializeOwned>(
    fields: &mut Map<String, Value>,
    name: &str,
) -> WorkerResult<T> {
    take_optional(fields, name)?.ok_or_else(|| WorkerError::malformed(name, "missing field"))
}

/// A request as it arrives at the worker boundary.
#[derive(Debug, Clone)]
pub enum RequestEnvelope {
    Typed(GenerationRequest),
    Text(String),
    Untyped(Value),
}

impl RequestEnvelope {
    /// Produce a validated [`GenerationRequest`], naming the first invalid
    /// field on failure.
    pub fn normalize(self) -> WorkerResult<GenerationRequest> {
        let request = match self {
            RequestEnvelope::Typed(request) => request,
            RequestEnvelope::Text(text) => {
                let value: Value = serde_json::from_str(&text)
                    .map_err(|e| WorkerError::malformed("<root>", e.to_string()))?;
                GenerationRequest::from_untyped(value)?
            }
            RequestEnvelope::Untyped(value) => GenerationRequest::from_untyped(value)?,
        };
        request.validate()
    }
}

impl From<GenerationRequest> for RequestEnvelope {
    fn from(request: GenerationRequest) -> Self {
        RequestEnvelope::Typed(request)
    }
}

impl From<String> for RequestEnvelope {
    fn from(text: String) -> Self {
        RequestEnvelope::Text(text)
    }
}

impl From<&str> for RequestEnvelope {
    fn from(text: &str) -> Self {
        RequestEnvelope::Text(text.to_string())
    }
}

impl From<Value> for RequestEnvelope {
    fn from(value: Value) -> Self {
        RequestEnvelope::Untyped(value)
    }
}
