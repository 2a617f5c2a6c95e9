//! Generic thread pool.
//!
//! The pool runs closures on a fixed set of OS worker threads fed from
//! either one shared queue or one queue per worker, with optional
//! work-stealing and an optional inline path for submissions made from
//! inside the pool itself. The scheduler uses a plain shared-queue
//! instance to host its worker loops; the configuration surface exists so
//! the pool is usable (and testable) as a component in its own right.
//!
//! Submission hands back a [`TaskFuture`]: a oneshot slot the task's
//! result (or panic payload) is sent through. `TaskFuture::get` re-raises
//! a captured panic in the calling thread.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, TryRecvError};
use crossbeam_utils::Backoff;
use log::{debug, warn};
use thiserror::Error;

use braid_util::Buffer;

/// A queued unit of work.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// How many sweeps over the queue array a stealing probe makes before
/// giving up and blocking.
const STEAL_ROUNDS: usize = 3;

/// Upper bound on pool size, as a multiple of the hardware concurrency.
const MAX_THREADS_PER_CORE: usize = 256;

/// How many times a transient thread-spawn failure is retried.
const SPAWN_RETRIES: usize = 3;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Where submitted tasks are queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// One queue shared by every worker.
    Shared,
    /// One queue per worker; submissions are distributed round-robin.
    PerWorker,
}

/// Errors surfaced while constructing a pool (or a scheduler on top of
/// one).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("thread pool requires at least one thread")]
    ZeroThreads,
    #[error("requested {requested} threads, limit is {limit}")]
    TooLarge { requested: usize, limit: usize },
    #[error("failed to spawn worker thread after {retries} attempts")]
    Spawn {
        retries: usize,
        #[source]
        source: io::Error,
    },
}

/// Builder for [`ThreadPool`].
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    num_threads: usize,
    queue_mode: QueueMode,
    stealing: bool,
    recursive_push: bool,
}

impl PoolBuilder {
    pub fn new(num_threads: usize) -> Self {
        PoolBuilder {
            num_threads,
            queue_mode: QueueMode::Shared,
            stealing: false,
            recursive_push: true,
        }
    }

    pub fn queue_mode(mut self, mode: QueueMode) -> Self {
        self.queue_mode = mode;
        self
    }

    /// Enable work-stealing. Only meaningful with per-worker queues.
    pub fn stealing(mut self, on: bool) -> Self {
        self.stealing = on;
        self
    }

    /// When off, a task submitted from inside a worker thread runs inline
    /// on that worker instead of being queued.
    pub fn recursive_push(mut self, on: bool) -> Self {
        self.recursive_push = on;
        self
    }

    pub fn build(self) -> Result<ThreadPool, ConfigError> {
        ThreadPool::with_config(self)
    }
}

// ---------------------------------------------------------------------------
// TaskFuture
// ---------------------------------------------------------------------------

/// Handle to the eventual result of a submitted task.
pub struct TaskFuture<R> {
    rx: Receiver<thread::Result<R>>,
}

impl<R> TaskFuture<R> {
    /// Block until the task completes and return its result.
    ///
    /// If the task panicked, the payload is re-raised here. Panics with
    /// its own message if the pool was torn down before the task ran.
    pub fn get(self) -> R {
        match self.rx.recv() {
            Ok(Ok(value)) => value,
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => panic!("task was dropped before producing a result"),
        }
    }

    fn poll(&self) -> Option<thread::Result<R>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                panic!("task was dropped before producing a result")
            }
        }
    }
}

impl<R> std::fmt::Debug for TaskFuture<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFuture")
            .field("ready", &!self.rx.is_empty())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ThreadPool
// ---------------------------------------------------------------------------

/// A fixed-size pool of worker threads.
pub struct ThreadPool {
    queues: Vec<Arc<Buffer<Task>>>,
    workers: Vec<JoinHandle<()>>,
    next_queue: AtomicUsize,
    num_threads: usize,
    stealing: bool,
    recursive_push: bool,
}

impl ThreadPool {
    /// Build a pool with default configuration (shared queue, no
    /// stealing, recursive push on).
    pub fn new(num_threads: usize) -> Result<Self, ConfigError> {
        PoolBuilder::new(num_threads).build()
    }

    fn with_config(config: PoolBuilder) -> Result<Self, ConfigError> {
        let hardware = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let limit = MAX_THREADS_PER_CORE * hardware;
        if config.num_threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if config.num_threads >= limit {
            return Err(ConfigError::TooLarge {
                requested: config.num_threads,
                limit,
            });
        }

        let num_queues = match config.queue_mode {
            QueueMode::Shared => 1,
            QueueMode::PerWorker => config.num_threads,
        };
        let queues: Vec<Arc<Buffer<Task>>> =
            (0..num_queues).map(|_| Arc::new(Buffer::unbounded())).collect();

        let mut workers = Vec::with_capacity(config.num_threads);
        for index in 0..config.num_threads {
            match Self::spawn_worker(index, &queues, &config) {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    // Roll back what started: release workers, then join.
                    for queue in &queues {
                        queue.shutdown();
                    }
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(err);
                }
            }
        }

        debug!(
            "thread pool up: {} threads, {:?}, stealing={}",
            config.num_threads, config.queue_mode, config.stealing
        );

        Ok(ThreadPool {
            queues,
            workers,
            next_queue: AtomicUsize::new(0),
            num_threads: config.num_threads,
            stealing: config.stealing,
            recursive_push: config.recursive_push,
        })
    }

    fn spawn_worker(
        index: usize,
        queues: &[Arc<Buffer<Task>>],
        config: &PoolBuilder,
    ) -> Result<JoinHandle<()>, ConfigError> {
        let mut tries = SPAWN_RETRIES;
        loop {
            let queues = queues.to_vec();
            let per_worker = config.queue_mode == QueueMode::PerWorker;
            let stealing = config.stealing;
            let result = thread::Builder::new()
                .name(format!("braid-pool-{index}"))
                .spawn(move || worker_loop(index, queues, per_worker, stealing));
            match result {
                Ok(handle) => return Ok(handle),
                Err(err) => {
                    tries -= 1;
                    if tries == 0 {
                        return Err(ConfigError::Spawn {
                            retries: SPAWN_RETRIES,
                            source: err,
                        });
                    }
                    warn!("worker spawn failed, retrying: {err}");
                }
            }
        }
    }

    /// Submit a closure for execution and get a future for its result.
    pub fn submit<F, R>(&self, f: F) -> TaskFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let task: Task = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            let _ = tx.send(result);
        });

        if !self.recursive_push && self.is_worker_thread() {
            // The queued task would be the next thing this worker ran
            // anyway.
            task();
        } else {
            self.route(task);
        }
        TaskFuture { rx }
    }

    fn route(&self, task: Task) {
        let index = self.next_queue.fetch_add(1, Ordering::Relaxed);
        let queue = &self.queues[index % self.queues.len()];
        if queue.push(task).is_err() {
            warn!("task submitted to a pool that is shutting down; dropped");
        }
    }

    fn is_worker_thread(&self) -> bool {
        let me = thread::current().id();
        self.workers.iter().any(|w| w.thread().id() == me)
    }

    /// Wait for a future, helping with queued work while it is pending.
    ///
    /// With stealing enabled the calling thread pops and runs tasks from
    /// the pool's queues while it waits; otherwise this simply blocks.
    pub fn wait<R>(&self, future: TaskFuture<R>) -> R {
        if !self.stealing {
            return future.get();
        }
        let backoff = Backoff::new();
        loop {
            if let Some(result) = future.poll() {
                match result {
                    Ok(value) => return value,
                    Err(payload) => panic::resume_unwind(payload),
                }
            }
            match self.steal_one() {
                Some(task) => {
                    task();
                    backoff.reset();
                }
                None => backoff.snooze(),
            }
        }
    }

    fn steal_one(&self) -> Option<Task> {
        let start = self.next_queue.fetch_add(1, Ordering::Relaxed);
        let n = self.queues.len();
        for probe in 0..n * STEAL_ROUNDS {
            if let Ok(task) = self.queues[(start + probe) % n].try_pop() {
                return Some(task);
            }
        }
        None
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for queue in &self.queues {
            queue.shutdown();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.num_threads)
            .field("queues", &self.queues.len())
            .field("stealing", &self.stealing)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// The loop each worker thread runs.
///
/// With per-worker queues and stealing, a worker probes its own queue
/// first and then sweeps the others round-robin before blocking on its
/// own queue's pop. A failed blocking pop means the queue was shut down,
/// and the worker exits.
fn worker_loop(index: usize, queues: Vec<Arc<Buffer<Task>>>, per_worker: bool, stealing: bool) {
    let n = queues.len();
    loop {
        let mut task = None;
        if per_worker {
            if stealing {
                for probe in 0..n * STEAL_ROUNDS {
                    if let Ok(t) = queues[(index + probe) % n].try_pop() {
                        task = Some(t);
                        break;
                    }
                }
            }
            if task.is_none() {
                task = queues[index].pop().ok();
            }
        } else {
            task = queues[0].pop().ok();
        }
        match task {
            Some(task) => task(),
            None => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    #[test]
    fn test_construct_and_drop() {
        let pool = ThreadPool::new(4).unwrap();
        assert_eq!(pool.num_threads(), 4);
        // Drop joins cleanly with no submitted work.
    }

    #[test]
    fn test_zero_threads_refused() {
        assert!(matches!(
            ThreadPool::new(0),
            Err(ConfigError::ZeroThreads)
        ));
    }

    #[test]
    fn test_oversized_pool_refused() {
        let hardware = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let result = ThreadPool::new(256 * hardware);
        assert!(matches!(result, Err(ConfigError::TooLarge { .. })));
    }

    #[test]
    fn test_simple_job() {
        let pool = ThreadPool::new(2).unwrap();
        let future = pool.submit(|| 8675309u64);
        assert_eq!(future.get(), 8675309);
    }

    #[test]
    fn test_many_squares() {
        let pool = ThreadPool::new(4).unwrap();
        let futures: Vec<_> = (0..120u64).map(|i| pool.submit(move || i * i)).collect();
        for (i, future) in futures.into_iter().enumerate() {
            assert_eq!(future.get(), (i * i) as u64);
        }
    }

    #[test]
    fn test_per_worker_queues() {
        let pool = PoolBuilder::new(4)
            .queue_mode(QueueMode::PerWorker)
            .build()
            .unwrap();
        let futures: Vec<_> = (0..64u64).map(|i| pool.submit(move || i + 1)).collect();
        for (i, future) in futures.into_iter().enumerate() {
            assert_eq!(future.get(), i as u64 + 1);
        }
    }

    #[test]
    fn test_per_worker_with_stealing() {
        let pool = PoolBuilder::new(4)
            .queue_mode(QueueMode::PerWorker)
            .stealing(true)
            .build()
            .unwrap();
        let futures: Vec<_> = (0..64u64).map(|i| pool.submit(move || i * 3)).collect();
        let mut total = 0;
        for future in futures {
            total += pool.wait(future);
        }
        assert_eq!(total, (0..64u64).map(|i| i * 3).sum());
    }

    #[test]
    fn test_wait_with_stealing_makes_progress() {
        // One worker busy with a slow task; wait() must steal the rest.
        let pool = PoolBuilder::new(1)
            .queue_mode(QueueMode::PerWorker)
            .stealing(true)
            .build()
            .unwrap();
        let slow = pool.submit(|| {
            thread::sleep(Duration::from_millis(50));
            1u64
        });
        let futures: Vec<_> = (0..16u64).map(|i| pool.submit(move || i)).collect();
        let mut total = 0;
        for future in futures {
            total += pool.wait(future);
        }
        assert_eq!(total, (0..16u64).sum());
        assert_eq!(pool.wait(slow), 1);
    }

    #[test]
    fn test_recursive_push_off_runs_inline() {
        static INNER_THREAD: AtomicU64 = AtomicU64::new(0);
        static OUTER_THREAD: AtomicU64 = AtomicU64::new(0);

        fn thread_fingerprint() -> u64 {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            thread::current().id().hash(&mut hasher);
            hasher.finish()
        }

        let pool = Arc::new(
            PoolBuilder::new(2)
                .recursive_push(false)
                .build()
                .unwrap(),
        );
        let inner_pool = Arc::clone(&pool);
        let outer = pool.submit(move || {
            OUTER_THREAD.store(thread_fingerprint(), Ordering::SeqCst);
            let inner = inner_pool.submit(|| {
                INNER_THREAD.store(thread_fingerprint(), Ordering::SeqCst);
            });
            inner.get();
        });
        outer.get();

        // The inner task ran inline on the worker that submitted it.
        assert_eq!(
            INNER_THREAD.load(Ordering::SeqCst),
            OUTER_THREAD.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn test_panic_is_rethrown_from_get() {
        let pool = ThreadPool::new(2).unwrap();
        let future = pool.submit(|| panic!("task exploded"));
        let result = panic::catch_unwind(AssertUnwindSafe(|| future.get()));
        assert!(result.is_err());

        // The pool survives a panicking task.
        let ok = pool.submit(|| 5);
        assert_eq!(ok.get(), 5);
    }

    #[test]
    fn test_results_capture_closure_state() {
        let pool = ThreadPool::new(3).unwrap();
        let base = 100u64;
        let futures: Vec<_> = (0..30u64)
            .map(|i| pool.submit(move || base + i))
            .collect();
        for (i, future) in futures.into_iter().enumerate() {
            assert_eq!(future.get(), 100 + i as u64);
        }
    }
}
