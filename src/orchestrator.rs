//! The orchestrator facade.
//!
//! Owns the registry, worker pool, task and request tables, and wires the
//! dispatcher, cancellation controller and teardown sequencer together.
//! Every public entry point is safe to call from any task or thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::cancel::CancellationController;
use crate::config::OrchestratorConfig;
use crate::context::{Context, ContextInfo, ContextState};
use crate::correlator::{LogAdapter, ProgressAdapter, RequestTable};
use crate::dispatch::{Dispatcher, RequestHandle};
use crate::engine::{
    file_path, CompletionOutput, CompletionParams, ContextParams, EmbeddingOutput,
    EmbeddingParams, Engine, LoraAdapter, RerankParams, RerankResult, SessionLoad,
};
use crate::error::{OrchestratorError, Result};
use crate::events::EventSink;
use crate::ids::{ContextId, RequestId};
use crate::registry::{ContextRegistry, Reservation, UNLIMITED};
use crate::request::{RequestKind, RequestPayload};
use crate::scheduler::{Operation, TaskTable, WorkerPool, WorkerPoolError, WorkerPoolStats};
use crate::shutdown::{ShutdownCoordinator, ShutdownResult, ShutdownState};
use crate::teardown::TeardownSequencer;
use crate::telemetry;

/// Per-context line of [`OrchestratorStatus`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStatus {
    pub context_id: ContextId,
    pub model: String,
    pub state: ContextState,
    pub busy: bool,
    pub parallel: bool,
    pub tasks_in_flight: usize,
}

/// Point-in-time snapshot of the orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub state: ShutdownState,
    pub context_limit: i64,
    pub contexts: Vec<ContextStatus>,
    pub loading: usize,
    pub tasks_in_flight: usize,
    pub queued_requests: usize,
    pub native_log: bool,
    pub pool: WorkerPoolStats,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    engine: Arc<dyn Engine>,
    sink: Arc<dyn EventSink>,
    registry: Arc<ContextRegistry>,
    pool: Arc<WorkerPool>,
    tasks: Arc<TaskTable>,
    requests: Arc<RequestTable>,
    dispatcher: Dispatcher,
    cancel: Arc<CancellationController>,
    teardown: TeardownSequencer,
    shutdown: ShutdownCoordinator,
    native_log: AtomicBool,
}

impl Orchestrator {
    /// Build an orchestrator and start its worker pool.
    pub fn new(
        config: OrchestratorConfig,
        engine: Arc<dyn Engine>,
        sink: Arc<dyn EventSink>,
    ) -> std::result::Result<Self, WorkerPoolError> {
        let config = config.normalized();
        let registry = Arc::new(ContextRegistry::new(config.context_limit));
        let pool = Arc::new(WorkerPool::new(config.worker_pool())?);
        let tasks = Arc::new(TaskTable::new());
        let requests = Arc::new(RequestTable::new());

        let dispatcher = Dispatcher::new(
            registry.clone(),
            pool.clone(),
            tasks.clone(),
            requests.clone(),
            sink.clone(),
        );
        let cancel = Arc::new(CancellationController::new(
            registry.clone(),
            tasks.clone(),
            requests.clone(),
        ));
        let teardown =
            TeardownSequencer::new(registry.clone(), tasks.clone(), cancel.clone(), pool.clone());

        tracing::info!(
            threads = pool.num_threads(),
            context_limit = config.context_limit,
            "orchestrator started"
        );

        Ok(Self {
            config,
            engine,
            sink,
            registry,
            pool,
            tasks,
            requests,
            dispatcher,
            cancel,
            teardown,
            shutdown: ShutdownCoordinator::new(),
            native_log: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn enter(&self) -> Result<crate::shutdown::ShutdownGuard> {
        self.shutdown.track().ok_or(OrchestratorError::ShuttingDown)
    }

    /// Load a model into a new context.
    ///
    /// The id and a limit slot are claimed before loading starts, so
    /// duplicate ids and a full registry fail fast. A release issued while
    /// the model loads interrupts it and this call fails.
    pub async fn create_context(&self, params: ContextParams) -> Result<ContextInfo> {
        let _guard = self.enter()?;
        let params = params.validated()?;
        let reservation = self.registry.reserve(params.context_id).map_err(|e| {
            tracing::warn!(error = %e, "context creation rejected");
            e
        })?;
        let context_id = reservation.context_id();
        tracing::info!(context_id = %context_id, model = %params.model, "loading model");

        let every = match params.progress_every {
            0 => self.config.progress_every,
            n => n,
        };
        let progress = Arc::new(ProgressAdapter::new(
            reservation.ticket(),
            self.sink.clone(),
            params.use_progress_callback,
            every,
        ));
        let task = self.tasks.track(context_id, Operation::Init, None, false);
        let engine = self.engine.clone();

        let rx = self.pool.execute(move || {
            let _task = task;
            load_context(engine.as_ref(), reservation, params, progress)
        })?;

        let result = match rx.await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(match OrchestratorError::from_panic(panic) {
                OrchestratorError::EngineOperationFailed(msg) => {
                    OrchestratorError::EngineInitFailed(msg)
                }
                other => other,
            }),
            Err(_) => Err(OrchestratorError::ShuttingDown),
        };

        match &result {
            Ok(_) => {
                telemetry::record_context_created();
                tracing::info!(context_id = %context_id, "context created");
            }
            Err(e) => tracing::warn!(context_id = %context_id, error = %e, "context creation failed"),
        }
        result
    }

    /// Admit a request of any kind. See [`Dispatcher::submit`].
    pub fn submit(
        &self,
        context_id: ContextId,
        kind: RequestKind,
        payload: RequestPayload,
    ) -> Result<RequestHandle> {
        let _guard = self.enter()?;
        self.dispatcher.submit(context_id, kind, payload)
    }

    /// Single-flight completion. Partials go to the sink as `token` events.
    pub async fn complete(
        &self,
        context_id: ContextId,
        params: CompletionParams,
    ) -> Result<CompletionOutput> {
        self.submit(context_id, RequestKind::Completion, RequestPayload::Completion(params))?
            .result()
            .await?
            .into_completion()
    }

    /// Queue a completion on a parallel-mode context.
    pub fn queue_completion(
        &self,
        context_id: ContextId,
        params: CompletionParams,
    ) -> Result<RequestHandle> {
        self.submit(
            context_id,
            RequestKind::QueuedCompletion,
            RequestPayload::Completion(params),
        )
    }

    pub async fn embed(
        &self,
        context_id: ContextId,
        params: EmbeddingParams,
    ) -> Result<EmbeddingOutput> {
        self.submit(context_id, RequestKind::Embedding, RequestPayload::Embedding(params))?
            .result()
            .await?
            .into_embedding()
    }

    pub fn queue_embedding(
        &self,
        context_id: ContextId,
        params: EmbeddingParams,
    ) -> Result<RequestHandle> {
        self.submit(
            context_id,
            RequestKind::QueuedEmbedding,
            RequestPayload::Embedding(params),
        )
    }

    pub async fn rerank(
        &self,
        context_id: ContextId,
        params: RerankParams,
    ) -> Result<Vec<RerankResult>> {
        self.submit(context_id, RequestKind::Rerank, RequestPayload::Rerank(params))?
            .result()
            .await?
            .into_rerank()
    }

    pub fn queue_rerank(
        &self,
        context_id: ContextId,
        params: RerankParams,
    ) -> Result<RequestHandle> {
        self.submit(context_id, RequestKind::QueuedRerank, RequestPayload::Rerank(params))
    }

    /// Tokenize text with the context's vocabulary. Not single-flight.
    pub async fn tokenize(&self, context_id: ContextId, text: impl Into<String>) -> Result<Vec<i32>> {
        let _guard = self.enter()?;
        let text = text.into();
        self.dispatcher
            .run_on_context(context_id, Operation::Tokenize, false, move |context| {
                context.handle().tokenize(&text).map_err(Into::into)
            })
            .await
    }

    /// Turn token ids back into text. Not single-flight.
    pub async fn detokenize(&self, context_id: ContextId, tokens: Vec<i32>) -> Result<String> {
        let _guard = self.enter()?;
        self.dispatcher
            .run_on_context(context_id, Operation::Detokenize, false, move |context| {
                context.handle().detokenize(&tokens).map_err(Into::into)
            })
            .await
    }

    /// Restore a saved session into the context's decoding state.
    ///
    /// Rewrites the evaluated tokens, so it is single-flight and fails with
    /// `Busy` while a request is running.
    pub async fn load_session(
        &self,
        context_id: ContextId,
        path: impl AsRef<str>,
    ) -> Result<SessionLoad> {
        let _guard = self.enter()?;
        let path = file_path(path.as_ref(), "session path")?;
        self.dispatcher
            .run_on_context(context_id, Operation::LoadSession, true, move |context| {
                let loaded = context.handle().load_session(&path)?;
                tracing::info!(context_id = %context.id(), tokens = loaded.tokens_loaded, "session loaded");
                Ok(loaded)
            })
            .await
    }

    /// Save up to `size` evaluated tokens (`<= 0` = all). Returns the count saved.
    pub async fn save_session(
        &self,
        context_id: ContextId,
        path: impl AsRef<str>,
        size: i32,
    ) -> Result<usize> {
        let _guard = self.enter()?;
        let path = file_path(path.as_ref(), "session path")?;
        self.dispatcher
            .run_on_context(context_id, Operation::SaveSession, true, move |context| {
                context.handle().save_session(&path, size).map_err(Into::into)
            })
            .await
    }

    /// Apply LoRA adapters on top of the loaded model. Single-flight.
    pub async fn apply_lora_adapters(
        &self,
        context_id: ContextId,
        adapters: Vec<LoraAdapter>,
    ) -> Result<()> {
        let _guard = self.enter()?;
        let adapters = adapters
            .into_iter()
            .map(LoraAdapter::validated)
            .collect::<Result<Vec<_>>>()?;
        self.dispatcher
            .run_on_context(context_id, Operation::LoraAdapters, true, move |context| {
                context.handle().apply_lora_adapters(&adapters)?;
                tracing::info!(context_id = %context.id(), count = adapters.len(), "lora adapters applied");
                Ok(())
            })
            .await
    }

    pub async fn remove_lora_adapters(&self, context_id: ContextId) -> Result<()> {
        let _guard = self.enter()?;
        self.dispatcher
            .run_on_context(context_id, Operation::LoraAdapters, true, move |context| {
                context.handle().remove_lora_adapters().map_err(Into::into)
            })
            .await
    }

    /// Adapters currently applied. Not single-flight.
    pub async fn loaded_lora_adapters(&self, context_id: ContextId) -> Result<Vec<LoraAdapter>> {
        let _guard = self.enter()?;
        self.dispatcher
            .run_on_context(context_id, Operation::LoraAdapters, false, move |context| {
                context.handle().loaded_lora_adapters().map_err(Into::into)
            })
            .await
    }

    /// Switch the context to the engine's slot scheduler.
    pub async fn enable_parallel_mode(
        &self,
        context_id: ContextId,
        n_parallel: u32,
        n_batch: u32,
    ) -> Result<()> {
        let _guard = self.enter()?;
        if n_parallel == 0 {
            return Err(OrchestratorError::invalid("n_parallel must be > 0"));
        }
        if n_batch == 0 {
            return Err(OrchestratorError::invalid("n_batch must be > 0"));
        }
        self.dispatcher
            .run_on_context(context_id, Operation::ParallelMode, true, move |context| {
                context.handle().enable_parallel(n_parallel, n_batch)?;
                context.set_parallel(true);
                tracing::info!(context_id = %context.id(), n_parallel, "parallel mode enabled");
                Ok(())
            })
            .await
    }

    /// Leave parallel mode. Outstanding queued requests are cancelled.
    pub async fn disable_parallel_mode(&self, context_id: ContextId) -> Result<()> {
        let _guard = self.enter()?;
        let cancel = self.cancel.clone();
        self.dispatcher
            .run_on_context(context_id, Operation::ParallelMode, true, move |context| {
                context.set_parallel(false);
                cancel.cancel_all(context);
                context.handle().disable_parallel()?;
                tracing::info!(context_id = %context.id(), "parallel mode disabled");
                Ok(())
            })
            .await
    }

    /// Soft-interrupt the single-flight request of a context.
    pub fn stop(&self, context_id: ContextId) -> Result<()> {
        self.cancel.stop(context_id)
    }

    /// Stop and wait using the configured default bound.
    pub async fn stop_and_wait(&self, context_id: ContextId) -> Result<()> {
        self.cancel
            .stop_and_wait(context_id, self.config.stop_timeout())
            .await
    }

    /// Stop and wait up to `timeout` (`None` = unbounded).
    pub async fn stop_and_wait_for(
        &self,
        context_id: ContextId,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.cancel.stop_and_wait(context_id, timeout).await
    }

    /// Cancel one queued request. False if unknown or already finished.
    pub fn cancel(&self, context_id: ContextId, request_id: RequestId) -> Result<bool> {
        self.cancel.cancel(context_id, request_id)
    }

    /// Tear a context down once all of its work has drained.
    pub async fn release_context(&self, context_id: ContextId) -> Result<()> {
        self.teardown.release(context_id).await
    }

    /// Release every context. Returns the number of loaded contexts released.
    pub async fn release_all(&self) -> Result<usize> {
        self.teardown.release_all().await
    }

    /// Change the context limit. Never evicts.
    pub fn set_context_limit(&self, limit: i64) -> Result<()> {
        self.registry.set_limit(limit)?;
        tracing::info!(limit, "context limit changed");
        Ok(())
    }

    /// Route native engine log lines to the sink as `native_log` events.
    pub fn toggle_native_log(&self, enabled: bool) {
        let previous = self.native_log.swap(enabled, Ordering::SeqCst);
        if previous == enabled {
            return;
        }
        if enabled {
            self.engine
                .set_log_callback(Some(Arc::new(LogAdapter::new(self.sink.clone()))));
        } else {
            self.engine.set_log_callback(None);
        }
        tracing::debug!(enabled, "native log forwarding toggled");
    }

    pub fn context_ids(&self) -> Vec<ContextId> {
        self.registry.ids()
    }

    pub fn context_info(&self, context_id: ContextId) -> Result<ContextInfo> {
        Ok(self.registry.get(context_id)?.info().clone())
    }

    pub fn status(&self) -> OrchestratorStatus {
        let contexts = self
            .registry
            .snapshot()
            .iter()
            .map(|context| ContextStatus {
                context_id: context.id(),
                model: context.info().model.clone(),
                state: context.state(),
                busy: context.is_busy(),
                parallel: context.is_parallel(),
                tasks_in_flight: self.tasks.in_flight(context.id()).len(),
            })
            .collect();

        OrchestratorStatus {
            state: self.shutdown.state(),
            context_limit: self.registry.limit(),
            contexts,
            loading: self.registry.loading_count(),
            tasks_in_flight: self.tasks.total(),
            queued_requests: self.requests.len(),
            native_log: self.native_log.load(Ordering::SeqCst),
            pool: self.pool.stats(),
        }
    }

    /// Global shutdown.
    ///
    /// Refuses new calls, releases every context, waits for calls already
    /// inside to leave, then stops the worker pool. Everything shares one
    /// `grace` budget; past it, remaining work is abandoned and reported.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownResult {
        if !self.shutdown.begin_drain() {
            tracing::debug!("shutdown already in progress");
            return ShutdownResult::Complete;
        }
        tracing::info!(grace_ms = grace.as_millis() as u64, "shutting down");
        let deadline = tokio::time::Instant::now() + grace;

        let contexts = match tokio::time::timeout(grace, self.teardown.release_all()).await {
            Ok(Ok(_)) => ShutdownResult::Complete,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "context release incomplete");
                ShutdownResult::Timeout {
                    remaining: self.tasks.total() as u32,
                }
            }
            Err(_) => {
                tracing::warn!("context release exceeded the grace period");
                ShutdownResult::Timeout {
                    remaining: self.tasks.total() as u32,
                }
            }
        };

        let left = || deadline.saturating_duration_since(tokio::time::Instant::now());
        let calls = self.shutdown.wait_for_drain(left()).await;

        let pool = self.pool.clone();
        let pool_grace = left();
        let workers = match tokio::task::spawn_blocking(move || pool.shutdown(pool_grace)).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "worker pool shutdown failed");
                ShutdownResult::Timeout { remaining: 0 }
            }
        };

        self.tasks.abort_waiters();
        self.shutdown.mark_stopped();
        // Limit resets with the process-wide state.
        let _ = self.registry.set_limit(UNLIMITED);

        let result = contexts.merge(calls).merge(workers);
        match &result {
            ShutdownResult::Complete => tracing::info!("shutdown complete"),
            ShutdownResult::Timeout { remaining } => {
                tracing::warn!(remaining, "shutdown forced after grace period")
            }
        }
        result
    }
}

/// Worker side of `create_context`.
fn load_context(
    engine: &dyn Engine,
    reservation: Reservation,
    params: ContextParams,
    progress: Arc<ProgressAdapter>,
) -> Result<ContextInfo> {
    let context_id = reservation.context_id();
    let handle = engine.init(&params, progress.clone()).map_err(|e| {
        if e.is_interruption() {
            OrchestratorError::EngineInitFailed("model load interrupted".into())
        } else {
            OrchestratorError::EngineInitFailed(e.to_string())
        }
    })?;

    if params.n_parallel > 0 {
        if let Err(e) = handle.enable_parallel(params.n_parallel, params.n_batch) {
            handle.release();
            return Err(OrchestratorError::EngineInitFailed(format!(
                "failed to enable parallel mode: {e}"
            )));
        }
    }

    let context = Context::new(context_id, handle, &params);
    context.set_parallel(params.n_parallel > 0);

    match reservation.commit(context) {
        Ok(context) => {
            progress.complete();
            Ok(context.info().clone())
        }
        Err((context, e)) => {
            context.handle().release();
            Err(e)
        }
    }
}
