//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gg_ctx::engine::{ContextParams, Script, ScriptedEngine};
use gg_ctx::{ChannelSink, ContextId, EventStream, Orchestrator, OrchestratorConfig};

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub engine: Arc<ScriptedEngine>,
    pub events: EventStream,
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        worker_threads: 4,
        worker_queue: 64,
        stop_timeout_ms: 2_000,
        ..Default::default()
    }
}

pub fn harness(script: Script) -> Harness {
    harness_with(script, test_config())
}

pub fn harness_with(script: Script, config: OrchestratorConfig) -> Harness {
    let engine = Arc::new(ScriptedEngine::new(script));
    let (sink, events) = ChannelSink::new();
    let orchestrator =
        Orchestrator::new(config, engine.clone(), Arc::new(sink)).expect("worker pool starts");
    Harness {
        orchestrator: Arc::new(orchestrator),
        engine,
        events,
    }
}

impl Harness {
    pub async fn create(&self) -> ContextId {
        self.orchestrator
            .create_context(ContextParams::new("model.gguf"))
            .await
            .expect("context created")
            .context_id
    }

    pub async fn create_parallel(&self, n_parallel: u32) -> ContextId {
        let params = ContextParams {
            n_parallel,
            ..ContextParams::new("model.gguf")
        };
        self.orchestrator
            .create_context(params)
            .await
            .expect("parallel context created")
            .context_id
    }

    /// Block (off the runtime) until the engine recorded `count` calls of `kind`.
    pub async fn wait_for_call(&self, kind: gg_ctx::engine::CallKind, count: usize) -> bool {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.wait_for(kind, count, Duration::from_secs(5)))
            .await
            .unwrap_or(false)
    }
}
