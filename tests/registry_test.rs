//! Context registry behaviour through the orchestrator: ids, limit, lookup.

mod common;

use std::time::Duration;

use common::{harness, Harness};
use gg_ctx::engine::{ContextParams, Script};
use gg_ctx::{ContextId, OrchestratorError};

async fn wait_loading(h: &Harness, count: usize) {
    for _ in 0..500 {
        if h.orchestrator.status().loading >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("context never started loading");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_assigned_ids_are_distinct() {
    let h = harness(Script::default());
    let a = h.create().await;
    let b = h.create().await;
    assert_ne!(a, b);

    let mut ids = h.orchestrator.context_ids();
    ids.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_requested_id_is_used() {
    let h = harness(Script::default());
    let params = ContextParams {
        context_id: Some(ContextId(42)),
        ..ContextParams::new("file://models/a.gguf")
    };
    let info = h.orchestrator.create_context(params).await.unwrap();
    assert_eq!(info.context_id, ContextId(42));
    assert_eq!(info.model, "models/a.gguf");
    assert_eq!(h.orchestrator.context_info(ContextId(42)).unwrap(), info);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_id_rejected() {
    let h = harness(Script::default());
    let params = ContextParams {
        context_id: Some(ContextId(7)),
        ..ContextParams::new("model.gguf")
    };
    h.orchestrator.create_context(params.clone()).await.unwrap();

    let err = h.orchestrator.create_context(params).await.unwrap_err();
    assert_eq!(err, OrchestratorError::AlreadyExists(ContextId(7)));
    assert_eq!(h.orchestrator.context_ids().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_limit_enforced_and_freed_by_release() {
    let h = harness(Script::default());
    h.orchestrator.set_context_limit(1).unwrap();

    let first = h.create().await;
    let err = h
        .orchestrator
        .create_context(ContextParams::new("model.gguf"))
        .await
        .unwrap_err();
    assert_eq!(err, OrchestratorError::LimitReached { limit: 1 });

    h.orchestrator.release_context(first).await.unwrap();
    h.create().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_limit_zero_blocks_creation() {
    let h = harness(Script::default());
    h.orchestrator.set_context_limit(0).unwrap();
    let err = h
        .orchestrator
        .create_context(ContextParams::new("model.gguf"))
        .await
        .unwrap_err();
    assert_eq!(err, OrchestratorError::LimitReached { limit: 0 });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lowering_limit_never_evicts() {
    let h = harness(Script::default());
    h.create().await;
    h.create().await;

    h.orchestrator.set_context_limit(1).unwrap();
    assert_eq!(h.orchestrator.context_ids().len(), 2);
    assert!(h
        .orchestrator
        .create_context(ContextParams::new("model.gguf"))
        .await
        .is_err());

    h.orchestrator.set_context_limit(-1).unwrap();
    h.create().await;
    assert_eq!(h.orchestrator.context_ids().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_limit_rejected() {
    let h = harness(Script::default());
    let err = h.orchestrator.set_context_limit(-2).unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
    assert_eq!(h.orchestrator.status().context_limit, -1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loading_context_counts_toward_limit() {
    let h = harness(Script::default().with_load(50, Duration::from_millis(10)));
    h.orchestrator.set_context_limit(1).unwrap();

    let orchestrator = h.orchestrator.clone();
    let loading = tokio::spawn(async move {
        orchestrator
            .create_context(ContextParams::new("slow.gguf"))
            .await
    });
    wait_loading(&h, 1).await;

    let err = h
        .orchestrator
        .create_context(ContextParams::new("model.gguf"))
        .await
        .unwrap_err();
    assert_eq!(err, OrchestratorError::LimitReached { limit: 1 });

    loading.await.unwrap().unwrap();
    assert_eq!(h.orchestrator.status().loading, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_context_is_not_found() {
    let h = harness(Script::default());
    let missing = ContextId(999);
    assert_eq!(
        h.orchestrator.context_info(missing).unwrap_err(),
        OrchestratorError::NotFound(missing)
    );
    assert_eq!(
        h.orchestrator.tokenize(missing, "hello").await.unwrap_err(),
        OrchestratorError::NotFound(missing)
    );
    assert_eq!(
        h.orchestrator.stop(missing).unwrap_err(),
        OrchestratorError::NotFound(missing)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_params_rejected_before_reserving() {
    let h = harness(Script::default());
    h.orchestrator.set_context_limit(1).unwrap();

    let err = h
        .orchestrator
        .create_context(ContextParams::new("  "))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidArgument(_)));

    h.create().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_init_failure_frees_reservation() {
    let h = harness(Script {
        fail_init: Some("bad magic".into()),
        ..Script::default()
    });
    h.orchestrator.set_context_limit(1).unwrap();

    let params = ContextParams {
        context_id: Some(ContextId(3)),
        ..ContextParams::new("broken.gguf")
    };
    let err = h.orchestrator.create_context(params.clone()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::EngineInitFailed(_)));
    assert!(h.orchestrator.context_ids().is_empty());

    h.engine.update_script(|s| s.fail_init = None);
    h.orchestrator.create_context(params).await.unwrap();
}
