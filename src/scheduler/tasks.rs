//! In-flight task tracking for drain coordination.
//!
//! Every unit of work submitted to the worker pool is registered here under
//! a unique [`TaskId`] and removed when its [`TaskGuard`] drops. Lookups and
//! drains filter on typed fields (context, operation, request id); the
//! `"<operation>-<contextId>"` descriptor is kept for log output only, since
//! two same-kind tasks on one context share it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::ids::{ContextId, RequestId, TaskId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DrainError {
    #[error("Drain timed out with {remaining} task(s) still in flight")]
    Timeout { remaining: usize },

    #[error("Drain aborted by shutdown")]
    Aborted,
}

/// Operation a tracked task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Init,
    Completion,
    QueuedCompletion,
    Embedding,
    QueuedEmbedding,
    Rerank,
    QueuedRerank,
    Tokenize,
    Detokenize,
    LoadSession,
    SaveSession,
    LoraAdapters,
    ParallelMode,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Completion => "completion",
            Self::QueuedCompletion => "queued_completion",
            Self::Embedding => "embedding",
            Self::QueuedEmbedding => "queued_embedding",
            Self::Rerank => "rerank",
            Self::QueuedRerank => "queued_rerank",
            Self::Tokenize => "tokenize",
            Self::Detokenize => "detokenize",
            Self::LoadSession => "load_session",
            Self::SaveSession => "save_session",
            Self::LoraAdapters => "lora_adapters",
            Self::ParallelMode => "parallel_mode",
        }
    }
}

/// Snapshot of one tracked task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub context_id: ContextId,
    pub operation: Operation,
    pub request_id: Option<RequestId>,
    pub descriptor: String,
    /// Holds the context's busy flag.
    pub single_flight: bool,
    #[serde(skip)]
    pub started_at: Instant,
}

/// Shared table of in-flight tasks.
pub struct TaskTable {
    records: Mutex<HashMap<TaskId, TaskRecord>>,
    next_id: AtomicU64,
    changed: Notify,
    abort: CancellationToken,
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            changed: Notify::new(),
            abort: CancellationToken::new(),
        }
    }

    /// Register a task. The entry lives until the returned guard drops.
    pub fn track(
        self: &Arc<Self>,
        context_id: ContextId,
        operation: Operation,
        request_id: Option<RequestId>,
        single_flight: bool,
    ) -> TaskGuard {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let record = TaskRecord {
            id,
            context_id,
            operation,
            request_id,
            descriptor: format!("{}-{}", operation.as_str(), context_id),
            single_flight,
            started_at: Instant::now(),
        };
        tracing::trace!(task = %id, descriptor = %record.descriptor, "task tracked");
        self.records.lock().insert(id, record);
        TaskGuard {
            table: self.clone(),
            id,
        }
    }

    pub fn find(&self, id: TaskId) -> Option<TaskRecord> {
        self.records.lock().get(&id).cloned()
    }

    /// Tasks currently in flight for `context_id`, oldest first.
    pub fn in_flight(&self, context_id: ContextId) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| r.context_id == context_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    pub fn total(&self) -> usize {
        self.records.lock().len()
    }

    fn count_matching(&self, filter: &dyn Fn(&TaskRecord) -> bool) -> usize {
        self.records.lock().values().filter(|r| filter(r)).count()
    }

    /// Wake every pending wait with [`DrainError::Aborted`].
    pub fn abort_waiters(&self) {
        self.abort.cancel();
    }

    /// Wait until no tracked task matches `filter`.
    ///
    /// `timeout = None` waits without bound. Tasks registered after the call
    /// starts are included if they match.
    pub async fn wait_for(
        &self,
        filter: impl Fn(&TaskRecord) -> bool,
        timeout: Option<Duration>,
    ) -> Result<(), DrainError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before counting so a guard dropped in between still wakes us.
            notified.as_mut().enable();

            if self.count_matching(&filter) == 0 {
                return Ok(());
            }
            if self.abort.is_cancelled() {
                return Err(DrainError::Aborted);
            }

            match deadline {
                Some(deadline) => tokio::select! {
                    _ = &mut notified => continue,
                    _ = self.abort.cancelled() => return Err(DrainError::Aborted),
                    _ = tokio::time::sleep_until(deadline) => {
                        let remaining = self.count_matching(&filter);
                        if remaining == 0 {
                            return Ok(());
                        }
                        return Err(DrainError::Timeout { remaining });
                    }
                },
                None => tokio::select! {
                    _ = &mut notified => continue,
                    _ = self.abort.cancelled() => return Err(DrainError::Aborted),
                },
            }
        }
    }

    pub async fn wait_for_task(&self, id: TaskId, timeout: Option<Duration>) -> Result<(), DrainError> {
        self.wait_for(|r| r.id == id, timeout).await
    }

    pub async fn wait_for_context(
        &self,
        context_id: ContextId,
        timeout: Option<Duration>,
    ) -> Result<(), DrainError> {
        self.wait_for(|r| r.context_id == context_id, timeout).await
    }

    pub async fn wait_for_all(&self, timeout: Option<Duration>) -> Result<(), DrainError> {
        self.wait_for(|_| true, timeout).await
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that removes its task entry on drop.
pub struct TaskGuard {
    table: Arc<TaskTable>,
    id: TaskId,
}

impl TaskGuard {
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl std::fmt::Debug for TaskGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGuard").field("id", &self.id).finish()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(record) = self.table.records.lock().remove(&self.id) {
            tracing::trace!(
                task = %self.id,
                descriptor = %record.descriptor,
                elapsed_ms = record.started_at.elapsed().as_millis() as u64,
                "task resolved"
            );
        }
        self.table.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_and_drop() {
        let table = Arc::new(TaskTable::new());
        let guard = table.track(ContextId(1), Operation::Completion, Some(RequestId(1)), true);
        let record = table.find(guard.id()).unwrap();
        assert_eq!(record.descriptor, "completion-1");
        assert_eq!(table.total(), 1);
        drop(guard);
        assert_eq!(table.total(), 0);
    }

    #[test]
    fn test_same_descriptor_distinct_ids() {
        let table = Arc::new(TaskTable::new());
        let a = table.track(ContextId(3), Operation::QueuedCompletion, Some(RequestId(1)), false);
        let b = table.track(ContextId(3), Operation::QueuedCompletion, Some(RequestId(2)), false);
        assert_ne!(a.id(), b.id());
        assert_eq!(table.in_flight(ContextId(3)).len(), 2);
        drop(a);
        let left = table.in_flight(ContextId(3));
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].request_id, Some(RequestId(2)));
    }

    #[tokio::test]
    async fn test_wait_returns_when_guard_drops() {
        let table = Arc::new(TaskTable::new());
        let guard = table.track(ContextId(1), Operation::Embedding, None, true);
        let handle = tokio::spawn({
            let table = table.clone();
            async move { table.wait_for_context(ContextId(1), None).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        drop(guard);
        assert_eq!(handle.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_wait_ignores_other_contexts() {
        let table = Arc::new(TaskTable::new());
        let _other = table.track(ContextId(2), Operation::Completion, None, true);
        assert_eq!(
            table.wait_for_context(ContextId(1), Some(Duration::from_millis(10))).await,
            Ok(())
        );
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let table = Arc::new(TaskTable::new());
        let _guard = table.track(ContextId(1), Operation::Completion, None, true);
        let result = table.wait_for_all(Some(Duration::from_millis(20))).await;
        assert_eq!(result, Err(DrainError::Timeout { remaining: 1 }));
    }

    #[tokio::test]
    async fn test_abort_wakes_unbounded_wait() {
        let table = Arc::new(TaskTable::new());
        let _guard = table.track(ContextId(1), Operation::Completion, None, true);
        let handle = tokio::spawn({
            let table = table.clone();
            async move { table.wait_for_all(None).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        table.abort_waiters();
        assert_eq!(handle.await.unwrap(), Err(DrainError::Aborted));
    }
}
