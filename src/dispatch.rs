//! Request dispatch onto the worker pool.
//!
//! Admission runs synchronously on the caller: payload validation, context
//! lookup, parallel-mode check, the busy flag for single-flight kinds,
//! request-id allocation and task registration. Only then is the engine
//! call handed to a worker. A rejected submission leaves no trace.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::context::Context;
use crate::correlator::{
    completion_outcome, embedding_outcome, rerank_outcome, CompletionAdapter, Delivery,
    EmbeddingAdapter, PartialAdapter, RequestTable, RerankAdapter,
};
use crate::engine::EngineError;
use crate::error::{OrchestratorError, Result};
use crate::events::EventSink;
use crate::ids::{ContextId, RequestId, TaskId};
use crate::registry::ContextRegistry;
use crate::request::{RequestKind, RequestOutput, RequestPayload, RequestResult, RequestStatus};
use crate::scheduler::{Operation, TaskTable, WorkerPool};
use crate::telemetry;

/// Routes requests to contexts and runs them on the worker pool.
pub struct Dispatcher {
    registry: Arc<ContextRegistry>,
    pool: Arc<WorkerPool>,
    tasks: Arc<TaskTable>,
    requests: Arc<RequestTable>,
    sink: Arc<dyn EventSink>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ContextRegistry>,
        pool: Arc<WorkerPool>,
        tasks: Arc<TaskTable>,
        requests: Arc<RequestTable>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            pool,
            tasks,
            requests,
            sink,
        }
    }

    /// Admit a request and schedule it.
    ///
    /// Fails without side effects when the payload is invalid, the context
    /// is unknown or tearing down, a queued kind is used without parallel
    /// mode, or a single-flight kind finds the context busy.
    pub fn submit(
        &self,
        context_id: ContextId,
        kind: RequestKind,
        payload: RequestPayload,
    ) -> Result<RequestHandle> {
        match self.admit(context_id, kind, payload) {
            Ok(handle) => {
                telemetry::record_request_accepted(kind.as_str());
                Ok(handle)
            }
            Err(e) => {
                telemetry::record_request_rejected(e.kind());
                if e.is_warning() {
                    tracing::warn!(context_id = %context_id, kind = kind.as_str(), error = %e, "request rejected");
                } else {
                    tracing::debug!(context_id = %context_id, kind = kind.as_str(), error = %e, "request rejected");
                }
                Err(e)
            }
        }
    }

    fn admit(
        &self,
        context_id: ContextId,
        kind: RequestKind,
        payload: RequestPayload,
    ) -> Result<RequestHandle> {
        payload.validate_for(kind)?;
        let context = self.registry.get(context_id)?;
        if kind.is_queued() && !context.is_parallel() {
            return Err(OrchestratorError::invalid("parallel mode not enabled"));
        }

        let (busy, request_id, task, engine_call) = context.admit(|| {
            let busy = if kind.is_queued() {
                None
            } else {
                Some(context.try_acquire()?)
            };
            let request_id = context.next_request_id();
            let task = self.tasks.track(
                context_id,
                kind.operation(),
                Some(request_id),
                !kind.is_queued(),
            );
            // A queued request can finish (cancel, teardown) while its worker
            // is still inside `queue_*`. This guard keeps the drain waiting
            // until the worker is out of the engine.
            let engine_call = kind.is_queued().then(|| {
                self.tasks
                    .track(context_id, kind.operation(), Some(request_id), false)
            });
            Ok((busy, request_id, task, engine_call))
        })?;

        let task_id = task.id();
        let (delivery, rx) = Delivery::new(
            context_id,
            request_id,
            kind,
            self.sink.clone(),
            busy,
            task,
            &self.requests,
        );
        if !kind.is_queued() {
            context.set_flight(&delivery);
        }

        let unit = {
            let context = context.clone();
            let delivery = delivery.clone();
            Box::new(move || {
                let _engine_call = engine_call;
                run_unit(&context, &delivery, payload)
            })
        };
        if let Err(e) = self.pool.submit(unit) {
            let err = OrchestratorError::from(e);
            delivery.finish(Err(err.clone()));
            return Err(err);
        }

        tracing::debug!(parent: delivery.span(), task = %task_id, "request scheduled");
        Ok(RequestHandle {
            context_id,
            request_id,
            task_id,
            kind,
            delivery,
            rx,
        })
    }

    /// Run a blocking closure against a context on the pool.
    ///
    /// Used for operations that are not requests (tokenize, sessions, LoRA,
    /// parallel mode).
    /// `single_flight` operations take the busy flag for their duration.
    pub async fn run_on_context<T, F>(
        &self,
        context_id: ContextId,
        operation: Operation,
        single_flight: bool,
        f: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<Context>) -> Result<T> + Send + 'static,
    {
        let context = self.registry.get(context_id)?;
        let (busy, task) = context.admit(|| {
            let busy = if single_flight {
                Some(context.try_acquire()?)
            } else {
                None
            };
            let task = self.tasks.track(context_id, operation, None, single_flight);
            Ok((busy, task))
        })?;

        let rx = self.pool.execute(move || {
            let _busy = busy;
            let _task = task;
            f(&context)
        })?;

        match rx.await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(OrchestratorError::from_panic(panic)),
            Err(_) => Err(OrchestratorError::ShuttingDown),
        }
    }
}

/// The worker side of a request.
fn run_unit(context: &Arc<Context>, delivery: &Arc<Delivery>, payload: RequestPayload) {
    let _enter = delivery.span().enter();

    // Teardown began between admission and pickup.
    if !context.is_active() {
        delivery.finish(Err(delivery.cancelled()));
        return;
    }
    if !delivery.mark_running() {
        return;
    }

    match panic::catch_unwind(AssertUnwindSafe(|| call_engine(context, delivery, &payload))) {
        Ok(Some(outcome)) => {
            delivery.finish(outcome);
        }
        // Accepted by the engine; its callback finishes the request.
        Ok(None) => {}
        Err(panic) => {
            delivery.finish(Err(OrchestratorError::from_panic(panic)));
        }
    }
}

/// `None` means a queued kind was accepted and will finish via callback.
fn call_engine(
    context: &Arc<Context>,
    delivery: &Arc<Delivery>,
    payload: &RequestPayload,
) -> Option<Result<RequestOutput>> {
    let handle = context.handle();
    let request_id = delivery.request_id();
    let queued = |accepted: std::result::Result<(), EngineError>| -> Option<Result<RequestOutput>> {
        match accepted {
            Ok(()) => {
                // Cancelled before the engine knew the id: its cancel was a
                // no-op, so abandon the slot now.
                if delivery.status() == RequestStatus::Cancelled {
                    handle.cancel(request_id);
                    tracing::debug!(request_id = %request_id, "late cancel forwarded to engine");
                }
                None
            }
            Err(e) => Some(Err(e.into())),
        }
    };

    match (delivery.kind(), payload) {
        (RequestKind::Completion, RequestPayload::Completion(params)) => {
            let partial = PartialAdapter::new(delivery.clone(), params.emit_partial_completion);
            Some(completion_outcome(handle.complete(params, &partial)))
        }
        (RequestKind::QueuedCompletion, RequestPayload::Completion(params)) => {
            let partial = Arc::new(PartialAdapter::new(
                delivery.clone(),
                params.emit_partial_completion,
            ));
            let done = Arc::new(CompletionAdapter(delivery.clone()));
            queued(handle.queue_complete(request_id, params, partial, done))
        }
        (RequestKind::Embedding, RequestPayload::Embedding(params)) => {
            Some(embedding_outcome(handle.embed(params)))
        }
        (RequestKind::QueuedEmbedding, RequestPayload::Embedding(params)) => {
            let done = Arc::new(EmbeddingAdapter(delivery.clone()));
            queued(handle.queue_embed(request_id, params, done))
        }
        (RequestKind::Rerank, RequestPayload::Rerank(params)) => {
            Some(rerank_outcome(handle.rerank(params)))
        }
        (RequestKind::QueuedRerank, RequestPayload::Rerank(params)) => {
            let done = Arc::new(RerankAdapter(delivery.clone()));
            queued(handle.queue_rerank(request_id, params, done))
        }
        (kind, _) => Some(Err(OrchestratorError::invalid(format!(
            "payload does not match request kind {}",
            kind.as_str()
        )))),
    }
}

/// Caller's side of an admitted request.
pub struct RequestHandle {
    context_id: ContextId,
    request_id: RequestId,
    task_id: TaskId,
    kind: RequestKind,
    delivery: Arc<Delivery>,
    rx: oneshot::Receiver<RequestResult>,
}

impl RequestHandle {
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Id allocated at admission. Usable with `cancel` for queued kinds.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn status(&self) -> RequestStatus {
        self.delivery.status()
    }

    /// Wait for the final result.
    pub async fn result(self) -> RequestResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Cancelled {
                context_id: self.context_id,
                request_id: self.request_id,
            }),
        }
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("context_id", &self.context_id)
            .field("request_id", &self.request_id)
            .field("task_id", &self.task_id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}
