//! Callback correlation between engine threads and callers.
//!
//! A [`Delivery`] is the per-request rendezvous: engine adapters push
//! partials through it and finish it exactly once. Partials and the final
//! result are emitted under the same lock, so every partial handed to the
//! sink precedes the final result for that request, and partials that
//! arrive after the request finished are dropped.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::Span;

use crate::context::BusyGuard;
use crate::engine::{
    CompletionCallback, CompletionOutput, EmbeddingCallback, EmbeddingOutput, EngineError,
    LoadProgressCallback, NativeLogCallback, NativeLogLevel, PartialCallback, RerankCallback,
    RerankResult,
};
use crate::error::{OrchestratorError, Result};
use crate::events::{Event, EventName, EventSink};
use crate::ids::{ContextId, RequestId};
use crate::registry::LoadTicket;
use crate::request::{RequestKind, RequestOutput, RequestResponse, RequestResult, RequestStatus};
use crate::scheduler::TaskGuard;
use crate::telemetry::{self, SpanExt};

/// Queued requests by `(context, request)`, for targeted cancellation.
#[derive(Default)]
pub struct RequestTable {
    entries: DashMap<(ContextId, RequestId), Arc<Delivery>>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, context_id: ContextId, request_id: RequestId) -> Option<Arc<Delivery>> {
        self.entries.get(&(context_id, request_id)).map(|e| e.value().clone())
    }

    /// Every queued request of `context_id`, by ascending request id.
    pub fn for_context(&self, context_id: ContextId) -> Vec<Arc<Delivery>> {
        let mut deliveries: Vec<Arc<Delivery>> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == context_id)
            .map(|e| e.value().clone())
            .collect();
        deliveries.sort_by_key(|d| d.request_id());
        deliveries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&self, delivery: Arc<Delivery>) {
        self.entries
            .insert((delivery.context_id, delivery.request_id), delivery);
    }

    fn remove(&self, context_id: ContextId, request_id: RequestId) {
        self.entries.remove(&(context_id, request_id));
    }
}

struct DeliveryState {
    status: RequestStatus,
    result_tx: Option<oneshot::Sender<RequestResult>>,
    busy: Option<BusyGuard>,
    task: Option<TaskGuard>,
}

/// Per-request rendezvous between engine callbacks and the caller.
pub struct Delivery {
    context_id: ContextId,
    request_id: RequestId,
    kind: RequestKind,
    sink: Arc<dyn EventSink>,
    table: Option<Weak<RequestTable>>,
    span: Span,
    started: Instant,
    state: Mutex<DeliveryState>,
}

impl Delivery {
    /// Create the delivery and the receiver its result will arrive on.
    ///
    /// Queued kinds are registered in `table` until they finish.
    pub(crate) fn new(
        context_id: ContextId,
        request_id: RequestId,
        kind: RequestKind,
        sink: Arc<dyn EventSink>,
        busy: Option<BusyGuard>,
        task: TaskGuard,
        table: &Arc<RequestTable>,
    ) -> (Arc<Self>, oneshot::Receiver<RequestResult>) {
        let (tx, rx) = oneshot::channel();
        let delivery = Arc::new(Self {
            context_id,
            request_id,
            kind,
            sink,
            table: kind.is_queued().then(|| Arc::downgrade(table)),
            span: telemetry::RequestSpan::new(context_id, request_id, kind.as_str()),
            started: Instant::now(),
            state: Mutex::new(DeliveryState {
                status: RequestStatus::Queued,
                result_tx: Some(tx),
                busy,
                task: Some(task),
            }),
        });
        if kind.is_queued() {
            table.insert(delivery.clone());
        }
        (delivery, rx)
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn status(&self) -> RequestStatus {
        self.state.lock().status
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    /// `Queued -> Running`. False if the request already finished.
    pub(crate) fn mark_running(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != RequestStatus::Queued {
            return false;
        }
        state.status = RequestStatus::Running;
        true
    }

    pub(crate) fn deliver_partial(&self, event: Event) {
        let state = self.state.lock();
        if state.status.is_terminal() {
            tracing::trace!(context_id = %self.context_id, request_id = %self.request_id, "late partial dropped");
            return;
        }
        self.sink.emit(event);
    }

    /// Resolve the request. Only the first call has any effect.
    ///
    /// Order: final event (queued kinds), busy flag cleared, task entry
    /// removed, then the result sent to the caller.
    pub(crate) fn finish(&self, outcome: Result<RequestOutput>) -> bool {
        self.finish_if(outcome, |status| !status.is_terminal())
    }

    /// Cancel the request only if no worker has picked it up yet.
    pub(crate) fn cancel_if_queued(&self) -> bool {
        self.finish_if(Err(self.cancelled()), |status| status == RequestStatus::Queued)
    }

    fn finish_if(
        &self,
        outcome: Result<RequestOutput>,
        allowed: impl Fn(RequestStatus) -> bool,
    ) -> bool {
        let status = match &outcome {
            Ok(_) => RequestStatus::Completed,
            Err(OrchestratorError::Cancelled { .. }) => RequestStatus::Cancelled,
            Err(_) => RequestStatus::Failed,
        };

        let (tx, busy, task) = {
            let mut state = self.state.lock();
            if !allowed(state.status) {
                return false;
            }
            state.status = status;
            if let Some(name) = self.kind.result_event() {
                let payload = match &outcome {
                    Ok(output) => result_payload(output),
                    Err(e) => json!({ "error": e.to_string(), "status": status.as_str() }),
                };
                self.sink.emit(Event::new(
                    name,
                    Some(self.context_id),
                    Some(self.request_id),
                    payload,
                ));
            }
            (state.result_tx.take(), state.busy.take(), state.task.take())
        };

        drop(busy);
        drop(task);
        if let Some(table) = self.table.as_ref().and_then(Weak::upgrade) {
            table.remove(self.context_id, self.request_id);
        }

        let elapsed = self.started.elapsed();
        self.span.record_result(&outcome);
        self.span.record("latency_ms", elapsed.as_millis() as u64);
        telemetry::record_request_finished(self.kind.as_str(), status.as_str(), elapsed);
        match &outcome {
            Ok(_) => tracing::debug!(parent: &self.span, "request completed"),
            Err(e) if e.is_warning() => tracing::warn!(parent: &self.span, error = %e, "request ended"),
            Err(e) => tracing::error!(parent: &self.span, error = %e, "request failed"),
        }

        let response = outcome.map(|output| RequestResponse {
            context_id: self.context_id,
            request_id: self.kind.is_queued().then_some(self.request_id),
            output,
        });
        if let Some(tx) = tx {
            // Caller may have stopped listening.
            let _ = tx.send(response);
        }
        true
    }

    pub(crate) fn cancelled(&self) -> OrchestratorError {
        OrchestratorError::Cancelled {
            context_id: self.context_id,
            request_id: self.request_id,
        }
    }
}

fn result_payload(output: &RequestOutput) -> Value {
    match output {
        RequestOutput::Completion(out) => serde_json::to_value(out).unwrap_or_default(),
        RequestOutput::Embedding(out) => serde_json::to_value(out).unwrap_or_default(),
        RequestOutput::Rerank(results) => json!({ "results": results }),
    }
}

/// An engine `error` field is a failure, same as an `Err`.
pub(crate) fn completion_outcome(
    result: std::result::Result<CompletionOutput, EngineError>,
) -> Result<RequestOutput> {
    match result {
        Ok(CompletionOutput {
            error: Some(message),
            ..
        }) => Err(OrchestratorError::EngineOperationFailed(message)),
        Ok(output) => Ok(RequestOutput::Completion(output)),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn embedding_outcome(
    result: std::result::Result<EmbeddingOutput, EngineError>,
) -> Result<RequestOutput> {
    result.map(RequestOutput::Embedding).map_err(Into::into)
}

pub(crate) fn rerank_outcome(
    result: std::result::Result<Vec<RerankResult>, EngineError>,
) -> Result<RequestOutput> {
    result.map(RequestOutput::Rerank).map_err(Into::into)
}

/// Stamps partial payloads and forwards them as `token` events.
///
/// Installed even when forwarding is off: the engine always expects a
/// callback object.
pub(crate) struct PartialAdapter {
    delivery: Arc<Delivery>,
    forward: bool,
}

impl PartialAdapter {
    pub(crate) fn new(delivery: Arc<Delivery>, forward: bool) -> Self {
        Self { delivery, forward }
    }
}

impl PartialCallback for PartialAdapter {
    fn on_partial(&self, payload: Value) {
        if !self.forward {
            return;
        }
        let request_id = if self.delivery.kind.is_queued() {
            Some(self.delivery.request_id)
        } else {
            payload
                .get("requestId")
                .and_then(Value::as_u64)
                .and_then(|id| u32::try_from(id).ok())
                .map(RequestId)
        };
        let event = Event::new(
            EventName::Token,
            Some(self.delivery.context_id),
            request_id,
            payload,
        );
        self.delivery.deliver_partial(event);
    }
}

fn check_request_id(delivery: &Delivery, reported: RequestId) {
    if reported != delivery.request_id {
        tracing::warn!(
            context_id = %delivery.context_id,
            expected = %delivery.request_id,
            reported = %reported,
            "engine reported a different request id"
        );
    }
}

/// Finishes a queued completion from the engine's result callback.
pub(crate) struct CompletionAdapter(pub(crate) Arc<Delivery>);

impl CompletionCallback for CompletionAdapter {
    fn on_complete(
        &self,
        request_id: RequestId,
        result: std::result::Result<CompletionOutput, EngineError>,
    ) {
        check_request_id(&self.0, request_id);
        self.0.finish(completion_outcome(result));
    }
}

pub(crate) struct EmbeddingAdapter(pub(crate) Arc<Delivery>);

impl EmbeddingCallback for EmbeddingAdapter {
    fn on_result(
        &self,
        request_id: RequestId,
        result: std::result::Result<EmbeddingOutput, EngineError>,
    ) {
        check_request_id(&self.0, request_id);
        self.0.finish(embedding_outcome(result));
    }
}

pub(crate) struct RerankAdapter(pub(crate) Arc<Delivery>);

impl RerankCallback for RerankAdapter {
    fn on_results(
        &self,
        request_id: RequestId,
        result: std::result::Result<Vec<RerankResult>, EngineError>,
    ) {
        check_request_id(&self.0, request_id);
        self.0.finish(rerank_outcome(result));
    }
}

/// Throttled, monotonic `load_progress` events plus load interruption.
pub(crate) struct ProgressAdapter {
    context_id: ContextId,
    ticket: Arc<LoadTicket>,
    sink: Arc<dyn EventSink>,
    emit: bool,
    every: i32,
    last: AtomicI32,
}

impl ProgressAdapter {
    pub(crate) fn new(
        ticket: Arc<LoadTicket>,
        sink: Arc<dyn EventSink>,
        emit: bool,
        every: u32,
    ) -> Self {
        Self {
            context_id: ticket.context_id(),
            ticket,
            sink,
            emit,
            every: every.clamp(1, 100) as i32,
            last: AtomicI32::new(0),
        }
    }

    /// Report 100% once the load succeeded, if not already reported.
    pub(crate) fn complete(&self) {
        if self.emit {
            self.maybe_emit(100);
        }
    }

    fn maybe_emit(&self, percent: i32) {
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            if percent <= last || (percent - last < self.every && percent != 100) {
                return;
            }
            match self
                .last
                .compare_exchange(last, percent, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(current) => last = current,
            }
        }
        self.sink.emit(Event::new(
            EventName::LoadProgress,
            Some(self.context_id),
            None,
            json!({ "progress": percent }),
        ));
    }
}

impl LoadProgressCallback for ProgressAdapter {
    fn on_progress(&self, progress: f32) -> bool {
        if self.ticket.is_interrupted() {
            return false;
        }
        if self.emit {
            self.maybe_emit((progress.clamp(0.0, 1.0) * 100.0).round() as i32);
        }
        true
    }
}

/// Forwards native log lines as `native_log` events.
pub(crate) struct LogAdapter {
    sink: Arc<dyn EventSink>,
}

impl LogAdapter {
    pub(crate) fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }
}

impl NativeLogCallback for LogAdapter {
    fn on_log(&self, level: NativeLogLevel, text: &str) {
        self.sink.emit(Event::new(
            EventName::NativeLog,
            None,
            None,
            json!({ "level": level.as_str(), "text": text }),
        ));
    }
}
