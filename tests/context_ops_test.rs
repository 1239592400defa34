//! Context operations outside the request path: detokenize, sessions, LoRA.

mod common;

use common::harness;
use gg_ctx::engine::{CallKind, CompletionParams, ContextParams, LoraAdapter, Script};
use gg_ctx::{ContextId, OrchestratorError, RequestKind, RequestPayload};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_detokenize_round_trips_tokenize() {
    let h = harness(Script::default());
    let ctx = h.create().await;

    let tokens = h.orchestrator.tokenize(ctx, "red fox red").await.unwrap();
    assert_eq!(tokens[0], tokens[2]);
    let text = h.orchestrator.detokenize(ctx, tokens).await.unwrap();
    assert_eq!(text, "red fox red");

    let err = h.orchestrator.detokenize(ctx, vec![4096]).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::EngineOperationFailed(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_save_then_load_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = format!("file://{}", dir.path().join("chat.session").display());

    let h = harness(Script::default());
    let ctx = h.create().await;
    h.orchestrator
        .complete(ctx, CompletionParams::new("tell me a story"))
        .await
        .unwrap();

    assert_eq!(h.orchestrator.save_session(ctx, &path, -1).await.unwrap(), 4);
    assert_eq!(h.orchestrator.save_session(ctx, &path, 2).await.unwrap(), 2);

    let loaded = h.orchestrator.load_session(ctx, &path).await.unwrap();
    assert_eq!(loaded.tokens_loaded, 2);
    assert_eq!(loaded.prompt, "tell me");
    assert_eq!(h.engine.count(CallKind::LoadSession), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_path_required() {
    let h = harness(Script::default());
    let ctx = h.create().await;

    for path in ["", "file://"] {
        let err = h.orchestrator.load_session(ctx, path).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
    }
    assert_eq!(h.engine.count(CallKind::LoadSession), 0);

    let missing = h
        .orchestrator
        .load_session(ctx, "/nonexistent/dir/none.session")
        .await
        .unwrap_err();
    assert!(matches!(missing, OrchestratorError::EngineOperationFailed(ref m) if m.contains("load session")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_and_lora_changes_are_single_flight() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("busy.session");
    let path = path.to_str().unwrap();

    let h = harness(Script::default());
    let ctx = h.create().await;
    h.engine.hold();

    let running = h
        .orchestrator
        .submit(
            ctx,
            RequestKind::Completion,
            RequestPayload::Completion(CompletionParams::new("a")),
        )
        .unwrap();
    assert!(h.wait_for_call(CallKind::CompleteStarted, 1).await);

    assert_eq!(
        h.orchestrator.save_session(ctx, path, 0).await.unwrap_err(),
        OrchestratorError::Busy(ctx)
    );
    assert_eq!(
        h.orchestrator.load_session(ctx, path).await.unwrap_err(),
        OrchestratorError::Busy(ctx)
    );
    assert_eq!(
        h.orchestrator
            .apply_lora_adapters(ctx, vec![LoraAdapter::new("a.bin")])
            .await
            .unwrap_err(),
        OrchestratorError::Busy(ctx)
    );
    assert_eq!(
        h.orchestrator.remove_lora_adapters(ctx).await.unwrap_err(),
        OrchestratorError::Busy(ctx)
    );
    // Reads do not need the busy flag.
    assert!(h.orchestrator.loaded_lora_adapters(ctx).await.unwrap().is_empty());
    let tokens = h.orchestrator.tokenize(ctx, "one").await.unwrap();
    assert_eq!(h.orchestrator.detokenize(ctx, tokens).await.unwrap(), "one");

    assert_eq!(h.engine.count(CallKind::SaveSession), 0);
    assert_eq!(h.engine.count(CallKind::ApplyLora), 0);
    h.engine.resume();
    running.result().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lora_apply_list_remove() {
    let h = harness(Script::default());
    let params = ContextParams {
        lora: vec![LoraAdapter::new("/loras/base.bin")],
        ..ContextParams::new("model.gguf")
    };
    let ctx = h.orchestrator.create_context(params).await.unwrap().context_id;
    assert_eq!(
        h.orchestrator.loaded_lora_adapters(ctx).await.unwrap(),
        vec![LoraAdapter::new("/loras/base.bin")]
    );

    h.orchestrator
        .apply_lora_adapters(
            ctx,
            vec![LoraAdapter {
                path: "file:///loras/style.bin".into(),
                scale: 0.25,
            }],
        )
        .await
        .unwrap();
    let loaded = h.orchestrator.loaded_lora_adapters(ctx).await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[1].path, "/loras/style.bin");
    assert_eq!(loaded[1].scale, 0.25);

    h.orchestrator.remove_lora_adapters(ctx).await.unwrap();
    assert!(h.orchestrator.loaded_lora_adapters(ctx).await.unwrap().is_empty());

    let err = h
        .orchestrator
        .apply_lora_adapters(ctx, vec![LoraAdapter::new("")])
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
    assert_eq!(h.engine.count(CallKind::ApplyLora), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_context_ops_on_unknown_context() {
    let h = harness(Script::default());
    let missing = ContextId(404);

    assert_eq!(
        h.orchestrator.detokenize(missing, vec![1]).await.unwrap_err(),
        OrchestratorError::NotFound(missing)
    );
    assert_eq!(
        h.orchestrator.save_session(missing, "/tmp/x", 0).await.unwrap_err(),
        OrchestratorError::NotFound(missing)
    );
    assert_eq!(
        h.orchestrator.remove_lora_adapters(missing).await.unwrap_err(),
        OrchestratorError::NotFound(missing)
    );
}
