//! End-to-end tests for InferenceEngine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tessera_llm::{
    AllocatorConfig, EngineConfig, Error, ErrorKind, InferenceEngine, ModelConfig, RequestChannel,
    RequestId, RequestInput, SamplingConfig, SchedulerConfig, StubLoader, Waiter,
};

fn engine_config(block_num: usize, block_token_num: usize) -> EngineConfig {
    EngineConfig {
        allocator: AllocatorConfig {
            block_token_num,
            block_size: 128,
            block_num,
            contiguous_bytes: 1 << 20,
        },
        scheduler: SchedulerConfig { max_batch_size: 8 },
        tensor_parallel_size: 1,
        pipeline_parallel_size: 1,
        models: vec![ModelConfig {
            name: "demo".to_string(),
            max_context_len: 1 << 20,
            eos_token_id: 0,
            vocab_size: 1000,
        }],
    }
}

fn request(req_id: RequestId, tokens: Vec<u32>, max_tokens: usize) -> RequestInput {
    RequestInput {
        req_id,
        model_name: "demo".to_string(),
        token_sequences: vec![tokens],
        sampling_configs: vec![SamplingConfig { max_tokens, ..Default::default() }],
        waiter: Arc::new(Waiter::new()),
    }
}

/// Wait until the ingestion thread has handed the request over.
fn wait_admitted(engine: &InferenceEngine, req_id: RequestId) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match engine.fetch_result(req_id) {
            Ok(_) => return,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                assert!(Instant::now() < deadline, "request {req_id} never admitted");
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}

#[test]
fn test_generation_through_channel() {
    let channel = Arc::new(RequestChannel::new());
    let engine = InferenceEngine::new(engine_config(4, 8), &StubLoader, channel.clone()).unwrap();
    engine.start().unwrap();

    channel.write(request(1, vec![1, 2, 3, 4, 5], 3)).unwrap();
    wait_admitted(&engine, 1);

    engine.stop().unwrap();
    assert_eq!(engine.fetch_result(1).unwrap(), vec![vec![6, 7, 8]]);
    assert_eq!(engine.allocator().free_block_count(), 4);
}

#[test]
fn test_stop_completes_inflight_generation() {
    let channel = Arc::new(RequestChannel::new());
    let engine = InferenceEngine::new(engine_config(8, 8), &StubLoader, channel.clone()).unwrap();
    engine.start().unwrap();

    channel.write(request(1, vec![1, 2], 30)).unwrap();
    wait_admitted(&engine, 1);

    // Stop drains: the full 30-token sequence is produced, not cut short.
    engine.stop().unwrap();
    let expected: Vec<u32> = (3..33).collect();
    assert_eq!(engine.fetch_result(1).unwrap(), vec![expected]);
}

#[test]
fn test_stop_is_idempotent() {
    let channel = Arc::new(RequestChannel::new());
    let engine = InferenceEngine::new(engine_config(4, 8), &StubLoader, channel).unwrap();
    engine.start().unwrap();
    engine.stop().unwrap();
    engine.stop().unwrap();
}

#[test]
fn test_start_is_idempotent() {
    let channel = Arc::new(RequestChannel::new());
    let engine = InferenceEngine::new(engine_config(4, 8), &StubLoader, channel).unwrap();
    engine.start().unwrap();
    engine.start().unwrap();
    engine.stop().unwrap();
}

#[test]
fn test_bad_request_does_not_stop_ingestion() {
    let channel = Arc::new(RequestChannel::new());
    let engine = InferenceEngine::new(engine_config(4, 8), &StubLoader, channel.clone()).unwrap();
    engine.start().unwrap();

    // Unknown model: logged and dropped by the ingestion loop.
    let mut bad = request(1, vec![1, 2], 4);
    bad.model_name = "missing".to_string();
    channel.write(bad).unwrap();

    // The next request still goes through.
    channel.write(request(2, vec![1, 2], 2)).unwrap();
    wait_admitted(&engine, 2);

    engine.stop().unwrap();
    assert_eq!(engine.fetch_result(2).unwrap(), vec![vec![3, 4]]);
    // The bad request never reached the batch manager.
    assert!(engine.fetch_result(1).is_err());
}

#[test]
fn test_handle_request_forwards_status() {
    let channel = Arc::new(RequestChannel::new());
    let engine = InferenceEngine::new(engine_config(4, 8), &StubLoader, channel).unwrap();

    let mut bad = request(1, vec![1], 4);
    bad.model_name = "missing".to_string();
    assert!(matches!(engine.handle_request(bad), Err(Error::ModelNotFound(_))));

    engine.handle_request(request(2, vec![1], 4)).unwrap();
    assert_eq!(engine.batch_manager().pending_count(), 1);
}

#[test]
fn test_streaming_through_engine() {
    let channel = Arc::new(RequestChannel::new());
    let engine = InferenceEngine::new(engine_config(4, 8), &StubLoader, channel.clone()).unwrap();
    engine.start().unwrap();

    channel.write(request(1, vec![10, 11], 4)).unwrap();
    wait_admitted(&engine, 1);

    let mut stream = engine.stream(1).unwrap();
    assert_eq!(stream.next_token(), Some(12));
    assert_eq!(stream.next_token(), Some(13));
    assert_eq!(stream.next_token(), Some(14));
    assert_eq!(stream.next_token(), Some(15));
    assert_eq!(stream.next_token(), None);
    assert_eq!(stream.next_token(), None);

    engine.stop().unwrap();
}

#[test]
fn test_two_requests_share_capacity() {
    let channel = Arc::new(RequestChannel::new());
    let engine = InferenceEngine::new(engine_config(8, 8), &StubLoader, channel.clone()).unwrap();
    engine.start().unwrap();

    channel.write(request(1, vec![1, 2], 5)).unwrap();
    channel.write(request(2, vec![100, 101], 5)).unwrap();
    wait_admitted(&engine, 1);
    wait_admitted(&engine, 2);

    engine.stop().unwrap();
    assert_eq!(engine.fetch_result(1).unwrap(), vec![vec![3, 4, 5, 6, 7]]);
    assert_eq!(engine.fetch_result(2).unwrap(), vec![vec![102, 103, 104, 105, 106]]);
    assert_eq!(engine.allocator().free_block_count(), 8);
}

#[test]
fn test_write_after_stop_fails() {
    let channel = Arc::new(RequestChannel::new());
    let engine = InferenceEngine::new(engine_config(4, 8), &StubLoader, channel.clone()).unwrap();
    engine.start().unwrap();
    engine.stop().unwrap();

    assert!(matches!(channel.write(request(1, vec![1], 4)), Err(Error::Terminated)));
}
