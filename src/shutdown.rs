//! Graceful shutdown coordination.
//!
//! A state machine for process-wide teardown: once draining, new calls are
//! refused while calls already inside the orchestrator are tracked until
//! they leave.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Notify;

/// Shutdown state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

/// Result of a shutdown operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownResult {
    Complete,
    Timeout { remaining: u32 },
}

impl ShutdownResult {
    /// Combine two phases. Timeouts add up.
    pub fn merge(self, other: ShutdownResult) -> ShutdownResult {
        match (self, other) {
            (Self::Complete, Self::Complete) => Self::Complete,
            (Self::Timeout { remaining }, Self::Complete)
            | (Self::Complete, Self::Timeout { remaining }) => Self::Timeout { remaining },
            (Self::Timeout { remaining: a }, Self::Timeout { remaining: b }) => Self::Timeout {
                remaining: a.saturating_add(b),
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// Coordinates graceful shutdown across orchestrator components.
pub struct ShutdownCoordinator {
    state: RwLock<ShutdownState>,
    in_flight: Arc<AtomicU32>,
    notify: Arc<Notify>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ShutdownState::Running),
            in_flight: Arc::new(AtomicU32::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.read()
    }

    /// Check if accepting new calls.
    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Track an in-flight call. Returns None if shutting down.
    pub fn track(&self) -> Option<ShutdownGuard> {
        // Held across the increment so begin_drain never misses a tracked call.
        let state = self.state.read();
        if *state != ShutdownState::Running {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(ShutdownGuard {
            counter: self.in_flight.clone(),
            notify: self.notify.clone(),
        })
    }

    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting. Returns false if shutdown already began.
    pub fn begin_drain(&self) -> bool {
        let mut state = self.state.write();
        if *state != ShutdownState::Running {
            return false;
        }
        *state = ShutdownState::Draining;
        true
    }

    pub fn mark_stopped(&self) {
        *self.state.write() = ShutdownState::Stopped;
    }

    /// Wait until every tracked call has left, up to `timeout`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> ShutdownResult {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let count = self.in_flight_count();
            if count == 0 {
                return ShutdownResult::Complete;
            }

            tokio::select! {
                _ = &mut notified => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    let final_count = self.in_flight_count();
                    if final_count == 0 {
                        return ShutdownResult::Complete;
                    }
                    return ShutdownResult::Timeout { remaining: final_count };
                }
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for in-flight call tracking.
pub struct ShutdownGuard {
    counter: Arc<AtomicU32>,
    notify: Arc<Notify>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}
