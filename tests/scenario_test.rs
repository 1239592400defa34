//! End-to-end scenarios mixing creation limits, busy rejection and release.

mod common;

use std::time::Duration;

use common::harness;
use gg_ctx::engine::{CallKind, CompletionParams, ContextParams, Script};
use gg_ctx::{OrchestratorError, RequestKind, RequestPayload};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_limit_busy_then_success() {
    let h = harness(Script::default());
    h.orchestrator.set_context_limit(1).unwrap();
    let c1 = h.create().await;

    let err = h
        .orchestrator
        .create_context(ContextParams::new("second.gguf"))
        .await
        .unwrap_err();
    assert_eq!(err, OrchestratorError::LimitReached { limit: 1 });
    assert_eq!(h.orchestrator.context_ids(), vec![c1]);

    h.engine.hold();
    let first = h
        .orchestrator
        .submit(
            c1,
            RequestKind::Completion,
            RequestPayload::Completion(CompletionParams::new("hi")),
        )
        .unwrap();
    assert!(h.wait_for_call(CallKind::CompleteStarted, 1).await);

    let err = h
        .orchestrator
        .complete(c1, CompletionParams::new("again"))
        .await
        .unwrap_err();
    assert_eq!(err, OrchestratorError::Busy(c1));
    // Rejected before any engine work started.
    assert_eq!(h.engine.count(CallKind::CompleteStarted), 1);

    h.engine.resume();
    first.result().await.unwrap();

    let third = h
        .orchestrator
        .complete(c1, CompletionParams::new("third"))
        .await
        .unwrap();
    assert_eq!(third.text, "Hello, world");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_release_all_drains_slow_contexts() {
    let h = harness(
        Script::default()
            .ignoring_stop()
            .with_token_delay(Duration::from_millis(20)),
    );
    let a = h.create().await;
    let b = h.create().await;

    let first = h
        .orchestrator
        .submit(
            a,
            RequestKind::Completion,
            RequestPayload::Completion(CompletionParams::new("a")),
        )
        .unwrap();
    let second = h
        .orchestrator
        .submit(
            b,
            RequestKind::Completion,
            RequestPayload::Completion(CompletionParams::new("b")),
        )
        .unwrap();
    assert!(h.wait_for_call(CallKind::CompleteStarted, 2).await);

    assert_eq!(h.orchestrator.release_all().await.unwrap(), 2);
    assert_eq!(h.engine.count(CallKind::CompleteFinished), 2);
    assert!(
        h.engine.last_position(CallKind::CompleteFinished).unwrap()
            < h.engine.position(CallKind::Release).unwrap()
    );
    assert!(h.orchestrator.context_ids().is_empty());

    // Both requests resolved with their full output.
    assert_eq!(first.result().await.unwrap().into_completion().unwrap().tokens_predicted, 3);
    assert_eq!(second.result().await.unwrap().into_completion().unwrap().tokens_predicted, 3);
}
