//! Prefill-to-decode handoff in split mode.
//!
//! The prefill call is a state-export operation: it is limited to exactly one
//! output token and asked to export its KV state. The decode request is then
//! built once from the prefill's final result and never mutated afterwards.

use tracing::debug;

use crate::engine::EngineOutput;
use crate::error::{WorkerError, WorkerResult};
use crate::io_struct::{
    GenerationRequest, KV_TRANSFER_PARAMS_KEY, MultimodalInput, SERIALIZED_REQUEST_KEY,
    SamplingControls, TransferParams,
};

/// Sampling controls for the prefill call of a split request.
pub fn prepare_prefill(sampling: &SamplingControls) -> SamplingControls {
    let mut prefill = sampling.clone();
    prefill.extra_args.insert(
        KV_TRANSFER_PARAMS_KEY.to_string(),
        TransferParams::remote_decode_request().into_value(),
    );
    prefill.max_tokens = Some(1);
    prefill.min_tokens = 1;
    prefill
}

/// Decode-stage request derived from a completed prefill.
#[derive(Debug, Clone, PartialEq)]
pub struct HandoffRequest {
    request_id: String,
    prompt_token_ids: Vec<u32>,
    sampling_controls: SamplingControls,
    transfer_params: TransferParams,
}

impl HandoffRequest {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    pub fn sampling_controls(&self) -> &SamplingControls {
        &self.sampling_controls
    }

    pub fn transfer_params(&self) -> &TransferParams {
        &self.transfer_params
    }

    /// Wire form understood by decode workers: a plain request whose
    /// multimodal input is already consumed and whose extension map carries
    /// the transfer params.
    pub fn to_request(&self) -> GenerationRequest {
        let mut sampling = self.sampling_controls.clone();
        sampling.extra_args.insert(
            KV_TRANSFER_PARAMS_KEY.to_string(),
            self.transfer_params.clone().into_value(),
        );
        GenerationRequest::new(
            self.request_id.clone(),
            self.prompt_token_ids.clone(),
            sampling,
            MultimodalInput::None,
        )
    }

    pub fn to_json(&self) -> WorkerResult<String> {
        self.to_request().to_json()
    }
}

pub fn build_handoff(
    original: &GenerationRequest,
    prefill_final: &EngineOutput,
) -> WorkerResult<HandoffRequest> {
    let transfer_params = prefill_final
        .transfer_params
        .clone()
        .filter(|params| !params.is_empty())
        .ok_or_else(|| WorkerError::MissingHandoffState {
            request_id: original.request_id().to_string(),
        })?;

    let mut sampling_controls = original.sampling_controls().clone();
    sampling_controls.extra_args.remove(SERIALIZED_REQUEST_KEY);
    sampling_controls.extra_args.remove(KV_TRANSFER_PARAMS_KEY);

    debug!(
        "Handoff for {}: {} prompt tokens after prefill (submitted {})",
        original.request_id(),
        prefill_final.prompt_token_ids.len(),
        original.tokenized_prompt().len()
    );

    Ok(HandoffRequest {
        request_id: original.request_id().to_string(),
        prompt_token_ids: prefill_final.prompt_token_ids.clone(),
        sampling_controls,
        transfer_params,
    })
}
