mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::StreamExt;
use serde_json::json;

use common::{
    EXPANDED_IMAGE_TOKENS, EngineBehavior, IMAGE_TOKEN, MockConnector, MockDecodeClient,
    MockEngine, TransferBehavior, exported_params, materializer, pool, wait_for,
};
use sgl_mm_disagg::config::{WorkerConfig, WorkerMode};
use sgl_mm_disagg::engine::InferenceEngine;
use sgl_mm_disagg::error::{WorkerError, WorkerResult};
use sgl_mm_disagg::io_struct::{
    GenerationRequest, KV_TRANSFER_PARAMS_KEY, MultimodalInput, RequestEnvelope, SamplingControls,
    TensorDtype, TransferHandle,
};
use sgl_mm_disagg::multimodal::EmbeddingLayout;
use sgl_mm_disagg::multimodal::transfer::RemoteMemoryConnector;
use sgl_mm_disagg::output::CanonicalOutput;
use sgl_mm_disagg::stage::StageExecutor;
use sgl_mm_disagg::worker::{
    DecodeWorkerHandler, PrefillDecodeWorkerHandler, WorkerHandler, build_handler,
};

fn remote_embedding(handle: &str) -> MultimodalInput {
    MultimodalInput::RemoteEmbedding {
        handle: TransferHandle::new(handle),
        shape: vec![1, 256, 4096],
        dtype: TensorDtype::Float16,
        image_grid_thw: Some(vec![[1, 16, 16]]),
    }
}

fn request(request_id: &str, input: MultimodalInput) -> GenerationRequest {
    GenerationRequest::new(
        request_id,
        vec![1, 2, 3],
        SamplingControls::with_max_tokens(16),
        input,
    )
}

fn local_worker(engine: &Arc<MockEngine>, connector: &Arc<MockConnector>) -> PrefillDecodeWorkerHandler {
    PrefillDecodeWorkerHandler::new(
        StageExecutor::new(engine.clone()),
        materializer(EmbeddingLayout::EmbeddingTensor, connector.clone()),
        None,
        8,
    )
}

fn split_worker(
    engine: &Arc<MockEngine>,
    connector: &Arc<MockConnector>,
    decode: &[&Arc<MockDecodeClient>],
) -> PrefillDecodeWorkerHandler {
    PrefillDecodeWorkerHandler::new(
        StageExecutor::new(engine.clone()),
        materializer(EmbeddingLayout::EmbeddingTensor, connector.clone()),
        Some(pool(decode)),
        8,
    )
}

async fn collect(handler: &dyn WorkerHandler, request: impl Into<RequestEnvelope>) -> Vec<WorkerResult<CanonicalOutput>> {
    handler.generate(request.into()).collect().await
}

fn assert_terminated(items: &[WorkerResult<CanonicalOutput>]) {
    let last = items.last().expect("stream produced nothing");
    assert!(last.as_ref().unwrap().finished);
    assert!(items[..items.len() - 1]
        .iter()
        .all(|item| !item.as_ref().unwrap().finished));
}

#[tokio::test]
async fn test_local_request_without_multimodal_input() {
    let engine = MockEngine::new(4);
    let connector = MockConnector::new(TransferBehavior::Fill(1));
    let worker = local_worker(&engine, &connector);

    let items = collect(&worker, request("req-a", MultimodalInput::None)).await;
    assert_eq!(items.len(), 4);
    assert_terminated(&items);
    assert!(items.iter().all(|i| i.as_ref().unwrap().transfer_params.is_none()));

    let calls = engine.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].prompt_token_ids, vec![1, 2, 3]);
    assert!(calls[0].multimodal_fields.is_none());
    assert!(!calls[0].sampling.extra_args.contains_key(KV_TRANSFER_PARAMS_KEY));
    assert_eq!(calls[0].sampling.max_tokens, Some(16));
    assert_eq!(connector.read_count(), 0);
}

#[tokio::test]
async fn test_split_request_with_remote_embedding() {
    let engine = MockEngine::new(4);
    let connector = MockConnector::new(TransferBehavior::Fill(7));
    let decode = MockDecodeClient::new("http://decode-0", 0, 3);
    let worker = split_worker(&engine, &connector, &[&decode]);

    let items = collect(&worker, request("req-b", remote_embedding("h-b"))).await;
    assert_eq!(connector.read_count(), 1);

    let calls = engine.calls();
    assert_eq!(calls.len(), 1);
    let prefill = &calls[0];
    assert_eq!(prefill.sampling.max_tokens, Some(1));
    assert_eq!(prefill.sampling.min_tokens, 1);
    assert_eq!(
        prefill.sampling.extra_args[KV_TRANSFER_PARAMS_KEY],
        json!({"do_remote_decode": true})
    );
    assert_eq!(
        prefill.multimodal_fields,
        Some(vec!["image_embeds", "image_grid_thw"])
    );

    assert_eq!(decode.calls(), 1);
    let payload = &decode.payloads()[0];
    let expanded: Vec<u32> = serde_json::from_value(payload["tokenized_prompt"].clone()).unwrap();
    assert_eq!(expanded.len(), 3 + EXPANDED_IMAGE_TOKENS);
    assert!(expanded.contains(&IMAGE_TOKEN));
    assert_eq!(
        payload["sampling_controls"]["extra_args"][KV_TRANSFER_PARAMS_KEY],
        exported_params("req-b").into_value()
    );
    assert_eq!(payload["sampling_controls"]["max_tokens"], json!(16));
    assert_eq!(payload["multimodal_input"], json!({"type": "none"}));

    assert_eq!(items.len(), 3);
    assert_terminated(&items);
    let texts: Vec<_> = items
        .iter()
        .map(|i| i.as_ref().unwrap().outputs[0].text.clone())
        .collect();
    assert_eq!(texts, vec!["d0", "d1", "d2"]);
}

#[tokio::test]
async fn test_transfer_abort_skips_generation() {
    let engine = MockEngine::new(4);
    let connector = MockConnector::new(TransferBehavior::Abort);
    let decode = MockDecodeClient::new("http://decode-0", 0, 3);
    let worker = split_worker(&engine, &connector, &[&decode]);

    let items = collect(&worker, request("req-c", remote_embedding("h-c"))).await;
    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(WorkerError::TransferAborted(_))));
    assert!(engine.calls().is_empty());
    assert_eq!(decode.calls(), 0);
}

#[tokio::test]
async fn test_transfer_timeout_skips_generation() {
    let engine = MockEngine::new(4);
    let connector = MockConnector::new(TransferBehavior::Hang);
    let worker = local_worker(&engine, &connector);

    let items = collect(&worker, request("req-c2", remote_embedding("h-c2"))).await;
    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(WorkerError::TransferTimeout(_))));
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn test_dispatch_retries_once_on_another_worker() {
    let engine = MockEngine::new(4);
    let connector = MockConnector::new(TransferBehavior::Fill(1));
    let flaky = MockDecodeClient::new("http://decode-0", 1, 2);
    let healthy = MockDecodeClient::new("http://decode-1", 0, 2);
    let worker = split_worker(&engine, &connector, &[&flaky, &healthy]);

    let items = collect(&worker, request("req-d", MultimodalInput::None)).await;
    assert_eq!(items.len(), 2);
    assert_terminated(&items);
    assert_eq!((flaky.calls(), healthy.calls()), (1, 1));
    assert_eq!(engine.calls().len(), 1);
}

#[tokio::test]
async fn test_dispatch_gives_up_after_one_retry() {
    let engine = MockEngine::new(4);
    let connector = MockConnector::new(TransferBehavior::Fill(1));
    let a = MockDecodeClient::new("http://decode-0", 5, 2);
    let b = MockDecodeClient::new("http://decode-1", 5, 2);
    let worker = split_worker(&engine, &connector, &[&a, &b]);

    let items = collect(&worker, request("req-d2", MultimodalInput::None)).await;
    assert_eq!(items.len(), 1);
    assert!(matches!(
        items[0],
        Err(WorkerError::DispatchUnavailable { attempts: 2, .. })
    ));
    assert_eq!(a.calls() + b.calls(), 2);
}

#[tokio::test]
async fn test_one_prefill_and_one_decode_per_split_request() {
    let engine = MockEngine::new(4);
    let connector = MockConnector::new(TransferBehavior::Fill(3));
    let a = MockDecodeClient::new("http://decode-0", 0, 2);
    let b = MockDecodeClient::new("http://decode-1", 0, 2);
    let worker = Arc::new(split_worker(&engine, &connector, &[&a, &b]));

    let ids: Vec<String> = (0..6).map(|i| format!("req-{}", i)).collect();
    let runs = ids.iter().enumerate().map(|(i, id)| {
        let worker = worker.clone();
        let input = if i % 2 == 0 {
            remote_embedding(&format!("h-{}", i))
        } else {
            MultimodalInput::None
        };
        let request = request(id, input);
        async move { collect(worker.as_ref(), request).await }
    });
    for items in futures::future::join_all(runs).await {
        assert_terminated(&items);
    }

    let calls = engine.calls();
    let payloads: Vec<_> = a.payloads().into_iter().chain(b.payloads()).collect();
    for id in &ids {
        let prefills: Vec<_> = calls.iter().filter(|c| &c.request_id == id).collect();
        assert_eq!(prefills.len(), 1, "prefill calls for {}", id);
        assert_eq!(prefills[0].sampling.max_tokens, Some(1));
        assert_eq!(
            payloads.iter().filter(|p| p["request_id"] == json!(id)).count(),
            1,
            "decode dispatches for {}",
            id
        );
    }
    assert_eq!((a.calls(), b.calls()), (3, 3));
    assert_eq!(connector.read_count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_split_requests_avoid_dead_worker() {
    let engine = MockEngine::new(4);
    let connector = MockConnector::new(TransferBehavior::Fill(5));
    let dead = MockDecodeClient::new("http://decode-0", usize::MAX, 2);
    let live = MockDecodeClient::new("http://decode-1", 0, 2);
    let worker = Arc::new(split_worker(&engine, &connector, &[&dead, &live]));

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let worker = worker.clone();
            let request = request(&format!("req-mt-{}", i), remote_embedding(&format!("h-mt-{}", i)));
            tokio::spawn(async move { collect(worker.as_ref(), request).await })
        })
        .collect();
    for task in tasks {
        let items = task.await.unwrap();
        assert_terminated(&items);
        assert_eq!(items.len(), 2);
    }

    let calls = engine.calls();
    assert_eq!(calls.len(), 8);
    for i in 0..8 {
        let id = format!("req-mt-{}", i);
        assert_eq!(calls.iter().filter(|c| c.request_id == id).count(), 1);
        assert_eq!(
            live.payloads().iter().filter(|p| p["request_id"] == json!(id)).count(),
            1
        );
    }
    assert_eq!(live.calls(), 8);
    assert_eq!(dead.calls(), 4);
    assert_eq!(connector.read_count(), 8);
}

#[tokio::test]
async fn test_oversized_embedding_shapes_end_with_error() {
    let engine = MockEngine::new(4);
    let connector = MockConnector::new(TransferBehavior::Fill(1));
    let worker = local_worker(&engine, &connector);

    for (id, shape) in [("req-huge", vec![1usize << 62]), ("req-big", vec![1, 1 << 20, 4096])] {
        let input = MultimodalInput::RemoteEmbedding {
            handle: TransferHandle::new(format!("h-{}", id)),
            shape,
            dtype: TensorDtype::Float16,
            image_grid_thw: None,
        };
        let items = collect(&worker, request(id, input)).await;
        assert_eq!(items.len(), 1, "{}", id);
        assert!(matches!(
            &items[0],
            Err(WorkerError::MalformedRequest { field, .. }) if field == "multimodal_input.shape"
        ));
    }
    assert_eq!(connector.read_count(), 0);
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn test_missing_transfer_params_stops_before_dispatch() {
    let engine = MockEngine::new(4);
    engine.exports.store(false, Ordering::SeqCst);
    let connector = MockConnector::new(TransferBehavior::Fill(1));
    let decode = MockDecodeClient::new("http://decode-0", 0, 2);
    let worker = split_worker(&engine, &connector, &[&decode]);

    let items = collect(&worker, request("req-m", MultimodalInput::None)).await;
    assert_eq!(
        items,
        vec![Err(WorkerError::MissingHandoffState {
            request_id: "req-m".to_string()
        })]
    );
    assert_eq!(decode.calls(), 0);
}

#[tokio::test]
async fn test_reused_handle_is_rejected() {
    let engine = MockEngine::new(2);
    let connector = MockConnector::new(TransferBehavior::Fill(1));
    let worker = local_worker(&engine, &connector);

    let first = collect(&worker, request("req-h1", remote_embedding("h-same"))).await;
    assert_terminated(&first);
    let second = collect(&worker, request("req-h2", remote_embedding("h-same"))).await;
    assert!(matches!(&second[..], [Err(WorkerError::InvalidHandle(_))]));
    assert_eq!(connector.read_count(), 1);
    assert_eq!(engine.calls().len(), 1);
}

#[tokio::test]
async fn test_dtype_must_match_model_layout() {
    let engine = MockEngine::new(2);
    let connector = MockConnector::new(TransferBehavior::Fill(1));
    let worker = PrefillDecodeWorkerHandler::new(
        StageExecutor::new(engine.clone()),
        materializer(EmbeddingLayout::NumericArray, connector.clone()),
        None,
        8,
    );

    let items = collect(&worker, request("req-v", remote_embedding("h-v"))).await;
    assert!(matches!(
        &items[..],
        [Err(WorkerError::MalformedRequest { field, .. })] if field == "multimodal_input.dtype"
    ));
    assert_eq!(connector.read_count(), 0);
}

#[tokio::test]
async fn test_engine_failure_ends_stream_after_partial_output() {
    let engine = MockEngine::with_behavior(4, EngineBehavior::FailAfterFirst);
    let connector = MockConnector::new(TransferBehavior::Fill(1));
    let worker = local_worker(&engine, &connector);

    let items = collect(&worker, request("req-e", MultimodalInput::None)).await;
    assert_eq!(items.len(), 2);
    assert!(items[0].is_ok());
    assert!(matches!(items[1], Err(WorkerError::EngineFailure(_))));
}

#[tokio::test]
async fn test_malformed_request_never_starts() {
    let engine = MockEngine::new(2);
    let connector = MockConnector::new(TransferBehavior::Fill(1));
    let worker = local_worker(&engine, &connector);

    let items = collect(&worker, r#"{"tokenized_prompt": [1]}"#).await;
    assert!(matches!(
        &items[..],
        [Err(WorkerError::MalformedRequest { field, .. })] if field == "request_id"
    ));
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn test_dropping_local_stream_aborts_engine_call() {
    let engine = MockEngine::with_behavior(4, EngineBehavior::Stall);
    let connector = MockConnector::new(TransferBehavior::Fill(1));
    let worker = local_worker(&engine, &connector);

    let mut outputs = worker.generate(request("req-x", MultimodalInput::None).into());
    assert!(outputs.next().await.unwrap().is_ok());
    drop(outputs);

    assert_eq!(engine.wait_for_abort().await, vec!["req-x".to_string()]);
}

#[tokio::test]
async fn test_dropping_split_stream_drops_decode_stream() {
    let engine = MockEngine::new(4);
    let connector = MockConnector::new(TransferBehavior::Fill(1));
    let decode = MockDecodeClient::stalling("http://decode-0");
    let worker = split_worker(&engine, &connector, &[&decode]);

    let mut outputs = worker.generate(request("req-y", MultimodalInput::None).into());
    let first = outputs.next().await.unwrap().unwrap();
    assert!(!first.finished);
    assert!(!decode.stream_dropped.load(Ordering::SeqCst));
    drop(outputs);

    assert!(wait_for(&decode.stream_dropped).await);
    assert!(engine.aborts().is_empty());
}

#[tokio::test]
async fn test_decode_worker_serves_handoff_request() {
    let engine = MockEngine::new(3);
    let worker = DecodeWorkerHandler::new(StageExecutor::new(engine.clone()), 8);

    let handoff = json!({
        "request_id": "req-dec",
        "tokenized_prompt": [1, 9, 9, 2, 3],
        "sampling_controls": {
            "max_tokens": 16,
            "extra_args": {"kv_transfer_params": exported_params("req-dec").into_value()}
        },
        "multimodal_input": {"type": "none"}
    });
    let items = collect(&worker, handoff).await;
    assert_eq!(items.len(), 3);
    assert_terminated(&items);

    let calls = engine.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].prompt_token_ids, vec![1, 9, 9, 2, 3]);
    assert!(calls[0].multimodal_fields.is_none());
    assert_eq!(
        calls[0].sampling.extra_args[KV_TRANSFER_PARAMS_KEY],
        exported_params("req-dec").into_value()
    );
}

#[tokio::test]
async fn test_decode_worker_rejects_multimodal_input() {
    let engine = MockEngine::new(3);
    let worker = DecodeWorkerHandler::new(StageExecutor::new(engine.clone()), 8);

    let items = collect(&worker, request("req-dm", remote_embedding("h-dm"))).await;
    assert!(matches!(
        &items[..],
        [Err(WorkerError::MalformedRequest { field, .. })] if field == "multimodal_input"
    ));
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn test_clear_kv_blocks_reports_status() {
    let engine = MockEngine::new(1);
    let worker = DecodeWorkerHandler::new(StageExecutor::new(engine.clone()), 8);

    let status = worker.clear_kv_blocks().await;
    assert!(status.is_success());

    engine.fail_reset.store(true, Ordering::SeqCst);
    let status = worker.clear_kv_blocks().await;
    assert_eq!(status.status, "error");
    assert!(!status.message.is_empty());
    assert_eq!(engine.resets.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_build_handler_selects_variant() {
    let engine: Arc<dyn InferenceEngine> = MockEngine::new(1);
    let connector: Arc<dyn RemoteMemoryConnector> = MockConnector::new(TransferBehavior::Fill(1));

    let decode = build_handler(
        &WorkerConfig::new("Qwen2.5-VL-7B", WorkerMode::Decode),
        engine.clone(),
        connector.clone(),
    )
    .unwrap();
    assert_eq!(decode.worker_type(), "decode");

    let mut config = WorkerConfig::new("Qwen2.5-VL-7B", WorkerMode::PrefillDecode);
    config.is_prefill_worker = true;
    config.decode_worker_urls = vec!["http://127.0.0.1:1".to_string()];
    let prefill = build_handler(&config, engine.clone(), connector.clone()).unwrap();
    assert_eq!(prefill.worker_type(), "prefill_decode");

    config.decode_worker_urls.clear();
    assert!(build_handler(&config, engine, connector).is_err());
}
