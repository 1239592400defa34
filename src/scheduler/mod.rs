//! Execution scheduling: the worker pool and the in-flight task table.

mod tasks;
mod thread_pool;

pub use tasks::{DrainError, Operation, TaskGuard, TaskRecord, TaskTable};
pub use thread_pool::{Task, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStats};
