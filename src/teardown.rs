//! Context teardown: `Active -> Interrupting -> Draining -> Released`.
//!
//! Interrupting closes admission, interrupts the engine and cancels
//! outstanding work. Draining waits until every task tracked for the
//! context has resolved. Only then are engine resources released on a
//! worker and the context removed from the registry.

use std::sync::Arc;

use futures::future::join_all;

use crate::cancel::{CancellationController, STOP_RESIGNAL_INTERVAL};
use crate::context::{Context, ContextState};
use crate::error::{OrchestratorError, Result};
use crate::ids::ContextId;
use crate::registry::ContextRegistry;
use crate::scheduler::{DrainError, TaskTable, WorkerPool};
use crate::telemetry;

pub struct TeardownSequencer {
    registry: Arc<ContextRegistry>,
    tasks: Arc<TaskTable>,
    cancel: Arc<CancellationController>,
    pool: Arc<WorkerPool>,
}

impl TeardownSequencer {
    pub fn new(
        registry: Arc<ContextRegistry>,
        tasks: Arc<TaskTable>,
        cancel: Arc<CancellationController>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            registry,
            tasks,
            cancel,
            pool,
        }
    }

    /// Release one context.
    ///
    /// A context still loading has its load interrupted and never becomes
    /// visible. Exactly one of two concurrent releases wins; the other gets
    /// `NotFound`.
    pub async fn release(&self, context_id: ContextId) -> Result<()> {
        if self.registry.interrupt_loading(context_id) {
            tracing::info!(context_id = %context_id, "interrupting model load");
            return self.drain(context_id).await;
        }

        let context = self.registry.get(context_id)?;
        if !self.interrupt(&context) {
            return Err(OrchestratorError::NotFound(context_id));
        }
        self.drain_loaded(&context).await?;
        self.finalize(&context).await;
        Ok(())
    }

    /// Release every context, loading ones included. Returns how many
    /// loaded contexts were released.
    pub async fn release_all(&self) -> Result<usize> {
        let loading = self.registry.interrupt_all_loading();
        let contexts: Vec<Arc<Context>> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|context| self.interrupt(context))
            .collect();
        tracing::info!(
            contexts = contexts.len(),
            loading = loading.len(),
            "releasing all contexts"
        );

        join_all(loading.iter().map(|&id| self.drain(id))).await;
        let drained = join_all(contexts.iter().map(|c| self.drain_loaded(c))).await;

        let mut first_error = None;
        let mut ready = Vec::with_capacity(contexts.len());
        for (context, drained) in contexts.iter().zip(drained) {
            match drained {
                Ok(()) => ready.push(context),
                Err(e) => {
                    // Still has running work; its engine handle stays alive.
                    tracing::warn!(context_id = %context.id(), error = %e, "context left undrained");
                    first_error.get_or_insert(e);
                }
            }
        }
        join_all(ready.iter().map(|c| self.finalize(c))).await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(ready.len()),
        }
    }

    /// `Active -> Interrupting -> Draining`. False if teardown already began.
    fn interrupt(&self, context: &Context) -> bool {
        if !context.begin_teardown() {
            return false;
        }
        tracing::info!(context_id = %context.id(), "releasing context");
        context.handle().interrupt_load();
        self.cancel.stop_context(context);
        self.cancel.cancel_all(context);
        context.advance(ContextState::Draining);
        true
    }

    async fn drain(&self, context_id: ContextId) -> Result<()> {
        self.tasks
            .wait_for_context(context_id, None)
            .await
            .map_err(|e| drain_error(context_id, e))
    }

    /// Drain a loaded context, repeating the stop signal in case the
    /// running generation cleared the first one on entry.
    async fn drain_loaded(&self, context: &Context) -> Result<()> {
        loop {
            match self
                .tasks
                .wait_for_context(context.id(), Some(STOP_RESIGNAL_INTERVAL))
                .await
            {
                Err(DrainError::Timeout { .. }) => self.cancel.stop_context(context),
                other => return other.map_err(|e| drain_error(context.id(), e)),
            }
        }
    }

    async fn finalize(&self, context: &Arc<Context>) {
        let context_id = context.id();
        let handle = context.handle().clone();
        let released = match self.pool.execute(move || handle.release()) {
            Ok(rx) => matches!(rx.await, Ok(Ok(()))),
            Err(_) => {
                // Pool already closed; release off the async threads anyway.
                let handle = context.handle().clone();
                tokio::task::spawn_blocking(move || handle.release())
                    .await
                    .is_ok()
            }
        };
        if !released {
            tracing::error!(context_id = %context_id, "engine release failed");
        }

        self.registry.remove(context_id);
        context.advance(ContextState::Released);
        telemetry::record_context_released();
        tracing::info!(context_id = %context_id, "context released");
    }
}

fn drain_error(context_id: ContextId, e: DrainError) -> OrchestratorError {
    match e {
        DrainError::Aborted => OrchestratorError::ShuttingDown,
        DrainError::Timeout { remaining } => OrchestratorError::Timeout {
            what: format!("{remaining} task(s) on context {context_id}"),
            waited_ms: 0,
        },
    }
}
