//! Global shutdown: release everything within a grace period, refuse new work.

mod common;

use std::time::Duration;

use common::harness;
use gg_ctx::engine::{CallKind, CompletionParams, ContextParams, Script};
use gg_ctx::{OrchestratorError, RequestKind, RequestPayload, ShutdownResult, ShutdownState};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_releases_every_context() {
    let h = harness(Script::default());
    h.create().await;
    h.create().await;
    h.orchestrator.set_context_limit(2).unwrap();

    let result = h.orchestrator.shutdown(Duration::from_secs(5)).await;
    assert_eq!(result, ShutdownResult::Complete);
    assert_eq!(h.engine.count(CallKind::Release), 2);

    let status = h.orchestrator.status();
    assert_eq!(status.state, ShutdownState::Stopped);
    assert!(status.contexts.is_empty());
    assert_eq!(status.context_limit, -1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_calls_after_shutdown_are_refused() {
    let h = harness(Script::default());
    let ctx = h.create().await;
    h.orchestrator.shutdown(Duration::from_secs(5)).await;

    assert_eq!(
        h.orchestrator
            .create_context(ContextParams::new("model.gguf"))
            .await
            .unwrap_err(),
        OrchestratorError::ShuttingDown
    );
    assert_eq!(
        h.orchestrator
            .submit(
                ctx,
                RequestKind::Completion,
                RequestPayload::Completion(CompletionParams::new("x"))
            )
            .unwrap_err(),
        OrchestratorError::ShuttingDown
    );
    assert_eq!(
        h.orchestrator.tokenize(ctx, "x").await.unwrap_err(),
        OrchestratorError::ShuttingDown
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_shutdown_is_noop() {
    let h = harness(Script::default());
    h.create().await;
    assert!(h.orchestrator.shutdown(Duration::from_secs(5)).await.is_complete());
    assert!(h.orchestrator.shutdown(Duration::from_secs(5)).await.is_complete());
    assert_eq!(h.engine.count(CallKind::Release), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_interrupts_running_work() {
    let h = harness(Script::default());
    let ctx = h.create().await;
    h.engine.hold();

    let handle = h
        .orchestrator
        .submit(
            ctx,
            RequestKind::Completion,
            RequestPayload::Completion(CompletionParams::new("x")),
        )
        .unwrap();
    assert!(h.wait_for_call(CallKind::CompleteStarted, 1).await);

    let result = h.orchestrator.shutdown(Duration::from_secs(5)).await;
    assert_eq!(result, ShutdownResult::Complete);
    let output = handle.result().await.unwrap().into_completion().unwrap();
    assert!(output.interrupted);
    h.engine.resume();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_reports_timeout_for_stuck_engine() {
    let h = harness(Script::default().ignoring_stop());
    let ctx = h.create().await;
    h.engine.hold();

    let handle = h
        .orchestrator
        .submit(
            ctx,
            RequestKind::Completion,
            RequestPayload::Completion(CompletionParams::new("x")),
        )
        .unwrap();
    assert!(h.wait_for_call(CallKind::CompleteStarted, 1).await);

    let started = std::time::Instant::now();
    let result = h.orchestrator.shutdown(Duration::from_millis(100)).await;
    assert!(matches!(result, ShutdownResult::Timeout { remaining } if remaining >= 1));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.orchestrator.status().state, ShutdownState::Stopped);
    assert_eq!(h.engine.count(CallKind::Release), 0);

    // The abandoned request still resolves once the engine returns.
    h.engine.resume();
    let resolved = tokio::time::timeout(Duration::from_secs(5), handle.result()).await;
    assert!(resolved.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_interrupts_loading_context() {
    let h = harness(Script::default().with_load(200, Duration::from_millis(5)));

    let orchestrator = h.orchestrator.clone();
    let create = tokio::spawn(async move {
        orchestrator
            .create_context(ContextParams::new("slow.gguf"))
            .await
    });
    for _ in 0..500 {
        if h.orchestrator.status().loading > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let result = h.orchestrator.shutdown(Duration::from_secs(5)).await;
    assert_eq!(result, ShutdownResult::Complete);
    assert!(matches!(
        create.await.unwrap(),
        Err(OrchestratorError::EngineInitFailed(_))
    ));
}
