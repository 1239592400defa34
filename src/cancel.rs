//! Stop and cancel.
//!
//! `stop` is a soft interrupt for the single-flight request of a context;
//! `cancel` abandons one queued request by id. Neither waits for the
//! engine unless asked to through [`CancellationController::stop_and_wait`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::Context;
use crate::correlator::RequestTable;
use crate::error::{OrchestratorError, Result};
use crate::ids::{ContextId, RequestId};
use crate::registry::ContextRegistry;
use crate::request::RequestStatus;
use crate::scheduler::{DrainError, TaskTable};

/// How often a pending stop is signalled again while waiting.
pub(crate) const STOP_RESIGNAL_INTERVAL: Duration = Duration::from_millis(25);

pub struct CancellationController {
    registry: Arc<ContextRegistry>,
    tasks: Arc<TaskTable>,
    requests: Arc<RequestTable>,
}

impl CancellationController {
    pub fn new(
        registry: Arc<ContextRegistry>,
        tasks: Arc<TaskTable>,
        requests: Arc<RequestTable>,
    ) -> Self {
        Self {
            registry,
            tasks,
            requests,
        }
    }

    /// Interrupt the single-flight request of `context_id`.
    ///
    /// A request not yet picked up by a worker is cancelled outright. A
    /// running one is asked to stop and settles with whatever the engine
    /// produced so far. No-op when nothing is in flight.
    ///
    /// Engines clear their stop flag when a generation starts, so a stop
    /// that lands just after the worker picked the request up can be lost.
    /// [`stop_and_wait`](Self::stop_and_wait) signals again until the
    /// request is gone.
    pub fn stop(&self, context_id: ContextId) -> Result<()> {
        let context = self.registry.get(context_id)?;
        self.stop_context(&context);
        Ok(())
    }

    pub(crate) fn stop_context(&self, context: &Context) {
        let Some(delivery) = context.flight() else {
            return;
        };
        if delivery.cancel_if_queued() {
            tracing::info!(context_id = %context.id(), request_id = %delivery.request_id(), "queued request cancelled by stop");
            return;
        }
        if delivery.status() == RequestStatus::Running {
            tracing::info!(context_id = %context.id(), request_id = %delivery.request_id(), "stopping request");
            context.handle().stop();
        }
    }

    /// Stop, then wait for the single-flight work of the context to drain.
    ///
    /// `timeout = None` waits without bound. On expiry nothing is freed:
    /// the busy flag stays with the request still running.
    pub async fn stop_and_wait(
        &self,
        context_id: ContextId,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let context = self.registry.get(context_id)?;
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);

        loop {
            self.stop_context(&context);
            let slice = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(STOP_RESIGNAL_INTERVAL),
                None => STOP_RESIGNAL_INTERVAL,
            };
            match self
                .tasks
                .wait_for(|r| r.context_id == context_id && r.single_flight, Some(slice))
                .await
            {
                Ok(()) => return Ok(()),
                Err(DrainError::Timeout { remaining }) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(OrchestratorError::Timeout {
                            what: format!("{remaining} task(s) on context {context_id}"),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                }
                Err(DrainError::Aborted) => return Err(OrchestratorError::ShuttingDown),
            }
        }
    }

    /// Cancel one queued request.
    ///
    /// Returns false when the request is unknown or already finished.
    pub fn cancel(&self, context_id: ContextId, request_id: RequestId) -> Result<bool> {
        let context = self.registry.get(context_id)?;
        let Some(delivery) = self.requests.get(context_id, request_id) else {
            return Ok(false);
        };
        // Resolve first so a late engine callback finds the request terminal.
        if !delivery.finish(Err(delivery.cancelled())) {
            return Ok(false);
        }
        context.handle().cancel(request_id);
        tracing::info!(context_id = %context_id, request_id = %request_id, "request cancelled");
        Ok(true)
    }

    /// Cancel every outstanding queued request of `context`.
    pub(crate) fn cancel_all(&self, context: &Context) -> usize {
        let mut cancelled = 0;
        for delivery in self.requests.for_context(context.id()) {
            if delivery.finish(Err(delivery.cancelled())) {
                context.handle().cancel(delivery.request_id());
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::debug!(context_id = %context.id(), cancelled, "queued requests cancelled");
        }
        cancelled
    }
}
