//! Context registry: id to context mapping with a concurrency limit.
//!
//! Creation is split in two so no registry lock is held while the engine
//! loads: [`ContextRegistry::reserve`] claims an id and a limit slot, and
//! [`Reservation::commit`] publishes the loaded context. Loading contexts
//! count toward the limit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::context::Context;
use crate::error::{OrchestratorError, Result};
use crate::ids::ContextId;
use crate::telemetry;

/// Sentinel limit meaning "no limit".
pub const UNLIMITED: i64 = -1;

/// Interrupt flag for a context that is still loading.
#[derive(Debug)]
pub struct LoadTicket {
    context_id: ContextId,
    interrupted: AtomicBool,
}

impl LoadTicket {
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Slots {
    active: HashMap<ContextId, Arc<Context>>,
    loading: HashMap<ContextId, Arc<LoadTicket>>,
}

impl Slots {
    fn occupied(&self) -> usize {
        self.active.len() + self.loading.len()
    }

    fn contains(&self, id: ContextId) -> bool {
        self.active.contains_key(&id) || self.loading.contains_key(&id)
    }
}

/// Thread-safe registry of contexts.
pub struct ContextRegistry {
    slots: RwLock<Slots>,
    limit: AtomicI64,
    next_id: AtomicU32,
}

impl ContextRegistry {
    pub fn new(limit: i64) -> Self {
        Self {
            slots: RwLock::new(Slots::default()),
            limit: AtomicI64::new(limit.max(UNLIMITED)),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn limit(&self) -> i64 {
        self.limit.load(Ordering::SeqCst)
    }

    /// Change the limit. Existing contexts are never evicted.
    pub fn set_limit(&self, limit: i64) -> Result<()> {
        if limit < UNLIMITED {
            return Err(OrchestratorError::invalid(format!(
                "context limit must be >= {UNLIMITED}, got {limit}"
            )));
        }
        self.limit.store(limit, Ordering::SeqCst);
        Ok(())
    }

    /// Claim an id and a limit slot for a context about to load.
    ///
    /// Fails fast with `AlreadyExists` or `LimitReached`; on failure the
    /// registry is unchanged.
    pub fn reserve(self: &Arc<Self>, requested: Option<ContextId>) -> Result<Reservation> {
        let mut slots = self.slots.write();

        if let Some(id) = requested {
            if slots.contains(id) {
                return Err(OrchestratorError::AlreadyExists(id));
            }
        }
        let limit = self.limit();
        if limit >= 0 && slots.occupied() as i64 >= limit {
            return Err(OrchestratorError::LimitReached { limit });
        }

        let id = match requested {
            Some(id) => id,
            None => loop {
                let candidate = ContextId(self.next_id.fetch_add(1, Ordering::SeqCst));
                if !slots.contains(candidate) {
                    break candidate;
                }
            },
        };

        let ticket = Arc::new(LoadTicket {
            context_id: id,
            interrupted: AtomicBool::new(false),
        });
        slots.loading.insert(id, ticket.clone());

        Ok(Reservation {
            registry: self.clone(),
            ticket,
            committed: false,
        })
    }

    pub fn get(&self, id: ContextId) -> Result<Arc<Context>> {
        self.slots
            .read()
            .active
            .get(&id)
            .cloned()
            .ok_or(OrchestratorError::NotFound(id))
    }

    pub fn contains(&self, id: ContextId) -> bool {
        self.slots.read().active.contains_key(&id)
    }

    /// Remove a context. Removing an unknown id is a no-op.
    pub fn remove(&self, id: ContextId) -> Option<Arc<Context>> {
        let mut slots = self.slots.write();
        let removed = slots.active.remove(&id);
        telemetry::set_active_contexts(slots.active.len());
        removed
    }

    /// Ids of active contexts, ascending.
    pub fn ids(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self.slots.read().active.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<Arc<Context>> {
        let mut contexts: Vec<Arc<Context>> = self.slots.read().active.values().cloned().collect();
        contexts.sort_by_key(|c| c.id());
        contexts
    }

    pub fn len(&self) -> usize {
        self.slots.read().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn loading_count(&self) -> usize {
        self.slots.read().loading.len()
    }

    /// Interrupt a context that is still loading. False if `id` is not loading.
    pub fn interrupt_loading(&self, id: ContextId) -> bool {
        match self.slots.write().loading.get(&id) {
            Some(ticket) => {
                ticket.interrupt();
                true
            }
            None => false,
        }
    }

    /// Interrupt every loading context and return their ids.
    pub fn interrupt_all_loading(&self) -> Vec<ContextId> {
        let slots = self.slots.write();
        slots
            .loading
            .values()
            .map(|ticket| {
                ticket.interrupt();
                ticket.context_id
            })
            .collect()
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new(UNLIMITED)
    }
}

/// A claimed slot for a loading context. Dropping it uncommitted frees the slot.
pub struct Reservation {
    registry: Arc<ContextRegistry>,
    ticket: Arc<LoadTicket>,
    committed: bool,
}

impl Reservation {
    pub fn context_id(&self) -> ContextId {
        self.ticket.context_id
    }

    pub fn ticket(&self) -> Arc<LoadTicket> {
        self.ticket.clone()
    }

    /// Publish the loaded context.
    ///
    /// Checked against the interrupt flag under the registry lock, so a
    /// release racing with the end of a load either sees the context
    /// loading (and interrupts it) or sees it active.
    pub fn commit(
        mut self,
        context: Context,
    ) -> std::result::Result<Arc<Context>, (Context, OrchestratorError)> {
        let id = self.ticket.context_id;
        let mut slots = self.registry.slots.write();
        slots.loading.remove(&id);
        self.committed = true;

        if self.ticket.is_interrupted() {
            return Err((
                context,
                OrchestratorError::EngineInitFailed("model load interrupted".into()),
            ));
        }

        let context = Arc::new(context);
        slots.active.insert(id, context.clone());
        telemetry::set_active_contexts(slots.active.len());
        Ok(context)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.slots.write().loading.remove(&self.ticket.context_id);
        }
    }
}
