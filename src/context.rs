//! A context: one engine handle plus orchestration bookkeeping.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::correlator::Delivery;
use crate::engine::{ContextParams, EngineCapabilities, EngineHandle};
use crate::error::{OrchestratorError, Result};
use crate::ids::{ContextId, RequestId};

/// Teardown progression. Only `Active` contexts admit new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    Active,
    Interrupting,
    Draining,
    Released,
}

/// Immutable snapshot captured at creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    pub context_id: ContextId,
    pub model: String,
    pub embedding: bool,
    pub n_ctx: u32,
    pub capabilities: EngineCapabilities,
}

pub struct Context {
    id: ContextId,
    handle: Arc<dyn EngineHandle>,
    info: ContextInfo,
    busy: AtomicBool,
    state: RwLock<ContextState>,
    parallel: AtomicBool,
    next_request_id: AtomicU32,
    /// The single-flight request holding `busy`, if any.
    flight: Mutex<Option<Weak<Delivery>>>,
}

impl Context {
    pub fn new(id: ContextId, handle: Arc<dyn EngineHandle>, params: &ContextParams) -> Self {
        let info = ContextInfo {
            context_id: id,
            model: params.model.clone(),
            embedding: params.embedding,
            n_ctx: params.n_ctx,
            capabilities: handle.capabilities(),
        };
        Self {
            id,
            handle,
            info,
            busy: AtomicBool::new(false),
            state: RwLock::new(ContextState::Active),
            parallel: AtomicBool::new(false),
            next_request_id: AtomicU32::new(1),
            flight: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn handle(&self) -> &Arc<dyn EngineHandle> {
        &self.handle
    }

    pub fn info(&self) -> &ContextInfo {
        &self.info
    }

    pub fn state(&self) -> ContextState {
        *self.state.read()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ContextState::Active
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel.load(Ordering::SeqCst)
    }

    pub(crate) fn set_parallel(&self, enabled: bool) {
        self.parallel.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        RequestId(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Take the busy flag. Check and set happen in one atomic step.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BusyGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| OrchestratorError::Busy(self.id))?;
        Ok(BusyGuard {
            context: self.clone(),
        })
    }

    /// Run `admit` while the context is guaranteed to stay `Active`.
    ///
    /// Teardown flips the state under the write side of the same lock, so
    /// anything registered inside `admit` is visible to its drain.
    pub(crate) fn admit<T>(&self, admit: impl FnOnce() -> Result<T>) -> Result<T> {
        let state = self.state.read();
        if *state != ContextState::Active {
            return Err(OrchestratorError::NotFound(self.id));
        }
        admit()
    }

    /// Move `Active -> Interrupting`. Returns false if teardown already began.
    pub(crate) fn begin_teardown(&self) -> bool {
        let mut state = self.state.write();
        if *state != ContextState::Active {
            return false;
        }
        *state = ContextState::Interrupting;
        true
    }

    pub(crate) fn advance(&self, next: ContextState) {
        *self.state.write() = next;
    }

    pub(crate) fn set_flight(&self, delivery: &Arc<Delivery>) {
        *self.flight.lock() = Some(Arc::downgrade(delivery));
    }

    /// The running single-flight request, if one holds the busy flag.
    pub(crate) fn flight(&self) -> Option<Arc<Delivery>> {
        self.flight.lock().as_ref().and_then(Weak::upgrade)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("busy", &self.is_busy())
            .field("parallel", &self.is_parallel())
            .finish()
    }
}

/// RAII guard for the busy flag.
pub struct BusyGuard {
    context: Arc<Context>,
}

impl std::fmt::Debug for BusyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusyGuard").field("context", &self.context.id).finish()
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        // Clear the slot first so the next holder never has its entry wiped.
        self.context.flight.lock().take();
        self.context.busy.store(false, Ordering::SeqCst);
    }
}
