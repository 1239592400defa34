//! Worker pool for blocking engine calls.
//!
//! A fixed set of named OS threads drains one shared FIFO queue. Every
//! registry mutation and every request runs here so callers never block on
//! native work. Shutdown stops intake, waits a bounded grace period for
//! queued and running units, then drops what is left and detaches stuck
//! workers.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::shutdown::ShutdownResult;

/// Minimum thread count when auto-sizing.
const MIN_AUTO_THREADS: usize = 4;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads (0 = auto-detect).
    pub num_threads: usize,
    /// Maximum units waiting for a worker.
    pub queue_size: usize,
    /// Thread stack size in bytes (0 = default).
    pub stack_size: usize,
    /// Thread name prefix.
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            queue_size: 1024,
            stack_size: 0,
            thread_name_prefix: "ctx-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    /// Thread count after resolving auto-detection.
    pub fn resolved_threads(&self) -> usize {
        if self.num_threads == 0 {
            num_cpus::get().max(MIN_AUTO_THREADS)
        } else {
            self.num_threads
        }
    }
}

/// A unit of work executed by the pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Statistics for pool activity.
#[derive(Debug, Default, Clone, Serialize)]
pub struct WorkerPoolStats {
    pub total_tasks_executed: u64,
    pub tasks_panicked: u64,
    pub tasks_dropped: u64,
    pub avg_exec_time_us: u64,
    pub queued: usize,
    pub threads_active: usize,
    pub threads_live: usize,
}

struct State {
    queue: VecDeque<Task>,
    accepting: bool,
    stopping: bool,
    active: usize,
    live: usize,
    stats: WorkerPoolStats,
}

struct Shared {
    state: Mutex<State>,
    work_ready: Condvar,
    idle: Condvar,
}

/// Shared-queue worker pool.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    /// Create a pool and spawn its workers.
    pub fn new(config: WorkerPoolConfig) -> Result<Self, WorkerPoolError> {
        let num_threads = config.resolved_threads();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(config.queue_size.min(4096)),
                accepting: true,
                stopping: false,
                active: 0,
                live: 0,
                stats: WorkerPoolStats::default(),
            }),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
        });

        let pool = Self {
            shared,
            workers: Mutex::new(Vec::with_capacity(num_threads)),
            config,
        };

        for id in 0..num_threads {
            let shared = pool.shared.clone();
            let mut builder =
                thread::Builder::new().name(format!("{}-{}", pool.config.thread_name_prefix, id));
            if pool.config.stack_size > 0 {
                builder = builder.stack_size(pool.config.stack_size);
            }
            pool.shared.state.lock().live += 1;
            match builder.spawn(move || Self::worker_loop(shared)) {
                Ok(handle) => pool.workers.lock().push(handle),
                Err(e) => {
                    pool.shared.state.lock().live -= 1;
                    pool.signal_stop();
                    return Err(WorkerPoolError::ThreadSpawnFailed(e.to_string()));
                }
            }
        }

        tracing::debug!(threads = num_threads, "worker pool started");
        Ok(pool)
    }

    /// Queue a unit of work.
    pub fn submit(&self, task: Task) -> Result<(), WorkerPoolError> {
        {
            let mut state = self.shared.state.lock();
            if !state.accepting {
                return Err(WorkerPoolError::PoolShutdown);
            }
            if state.queue.len() >= self.config.queue_size {
                return Err(WorkerPoolError::QueueFull);
            }
            state.queue.push_back(task);
        }
        self.shared.work_ready.notify_one();
        Ok(())
    }

    /// Run `f` on the pool and receive its outcome, panics included.
    pub fn execute<T, F>(&self, f: F) -> Result<oneshot::Receiver<thread::Result<T>>, WorkerPoolError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f));
            let _ = tx.send(outcome);
        }))?;
        Ok(rx)
    }

    fn worker_loop(shared: Arc<Shared>) {
        loop {
            let task = {
                let mut state = shared.state.lock();
                loop {
                    if let Some(task) = state.queue.pop_front() {
                        state.active += 1;
                        break Some(task);
                    }
                    if state.stopping {
                        break None;
                    }
                    shared.work_ready.wait(&mut state);
                }
            };

            let Some(task) = task else { break };

            let start = Instant::now();
            let panicked = panic::catch_unwind(AssertUnwindSafe(task)).is_err();
            let exec_us = start.elapsed().as_micros() as u64;

            let mut state = shared.state.lock();
            state.active -= 1;
            let stats = &mut state.stats;
            stats.total_tasks_executed += 1;
            if panicked {
                stats.tasks_panicked += 1;
            }
            // Rolling average of execution time
            stats.avg_exec_time_us = if stats.avg_exec_time_us == 0 {
                exec_us
            } else {
                (stats.avg_exec_time_us * 9 + exec_us) / 10
            };
            if state.queue.is_empty() && state.active == 0 {
                shared.idle.notify_all();
            }
        }

        shared.state.lock().live -= 1;
        shared.idle.notify_all();
    }

    /// Current statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        let state = self.shared.state.lock();
        let mut stats = state.stats.clone();
        stats.queued = state.queue.len();
        stats.threads_active = state.active;
        stats.threads_live = state.live;
        stats
    }

    /// Get number of worker threads.
    pub fn num_threads(&self) -> usize {
        self.config.resolved_threads()
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.state.lock().accepting
    }

    fn signal_stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.accepting = false;
            state.stopping = true;
        }
        self.shared.work_ready.notify_all();
    }

    /// Stop intake, drain for up to `grace`, then force.
    ///
    /// Blocks the calling thread. Units still queued at the deadline are
    /// dropped without running; workers still inside a unit are detached.
    pub fn shutdown(&self, grace: Duration) -> ShutdownResult {
        let deadline = Instant::now() + grace;

        let mut state = self.shared.state.lock();
        state.accepting = false;
        while !(state.queue.is_empty() && state.active == 0) {
            if self.shared.idle.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        let dropped = state.queue.len();
        state.queue.clear();
        state.stats.tasks_dropped += dropped as u64;
        state.stopping = true;
        self.shared.work_ready.notify_all();

        while state.live > 0 {
            if self.shared.idle.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        let stuck = state.active;
        drop(state);

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.is_finished() {
                let _ = worker.join();
            }
            // Unfinished workers are detached by dropping the handle.
        }

        let remaining = (stuck + dropped) as u32;
        if remaining == 0 {
            tracing::debug!("worker pool stopped");
            ShutdownResult::Complete
        } else {
            tracing::warn!(stuck, dropped, "worker pool forced down after grace period");
            ShutdownResult::Timeout { remaining }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers exit once the queue is empty; never block here on engine work.
        self.signal_stop();
    }
}

/// Errors for worker pool operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("Worker pool is shut down")]
    PoolShutdown,

    #[error("Task queue is full")]
    QueueFull,

    #[error("Failed to spawn thread: {0}")]
    ThreadSpawnFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_pool(threads: usize) -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig {
            num_threads: threads,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_execute_returns_value() {
        let pool = small_pool(2);
        let rx = pool.execute(|| 21 * 2).unwrap();
        assert_eq!(tokio_test::block_on(rx).unwrap().unwrap(), 42);
    }

    #[test]
    fn test_panic_is_captured() {
        let pool = small_pool(1);
        let rx = pool.execute(|| -> u32 { panic!("boom") }).unwrap();
        assert!(tokio_test::block_on(rx).unwrap().is_err());
        // Worker survives the panic.
        let rx = pool.execute(|| 1).unwrap();
        assert_eq!(tokio_test::block_on(rx).unwrap().unwrap(), 1);
        assert_eq!(pool.stats().threads_live, 1);
    }

    #[test]
    fn test_auto_threads_has_floor() {
        assert!(WorkerPoolConfig::default().resolved_threads() >= MIN_AUTO_THREADS);
    }

    #[test]
    fn test_queue_full() {
        let pool = WorkerPool::new(WorkerPoolConfig {
            num_threads: 1,
            queue_size: 1,
            ..Default::default()
        })
        .unwrap();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let g = gate.clone();
        pool.submit(Box::new(move || {
            let mut open = g.0.lock();
            while !*open {
                g.1.wait(&mut open);
            }
        }))
        .unwrap();
        // Wait until the worker picked up the blocking unit.
        while pool.stats().threads_active == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        pool.submit(Box::new(|| {})).unwrap();
        assert_eq!(pool.submit(Box::new(|| {})), Err(WorkerPoolError::QueueFull));
        *gate.0.lock() = true;
        gate.1.notify_all();
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let pool = small_pool(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                thread::sleep(Duration::from_millis(2));
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        assert_eq!(pool.shutdown(Duration::from_secs(5)), ShutdownResult::Complete);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(pool.submit(Box::new(|| {})), Err(WorkerPoolError::PoolShutdown));
    }

    #[test]
    fn test_shutdown_forces_after_grace() {
        let pool = small_pool(1);
        pool.submit(Box::new(|| thread::sleep(Duration::from_millis(300)))).unwrap();
        pool.submit(Box::new(|| {})).unwrap();
        while pool.stats().threads_active == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        let result = pool.shutdown(Duration::from_millis(20));
        assert_eq!(result, ShutdownResult::Timeout { remaining: 2 });
        assert_eq!(pool.stats().tasks_dropped, 1);
    }
}
