//! Node scheduler.
//!
//! The scheduler drives a submitted graph of nodes on a fixed-size
//! thread pool. Nodes move between five collections as their bodies
//! raise events:
//!
//! - `submission_queue`: admitted by `submit`, not yet started
//! - `ready_queue` (FIFO): runnable on any worker
//! - `running_set`: currently being resumed by some worker
//! - `waiting_set`: blocked on a channel operation
//! - `finished_queue`: reached the terminal state
//!
//! Every membership change goes through the task state machine, which
//! validates the transition; the worker loop moves the handles between
//! the collections explicitly, one collection lock at a time.
//!
//! ## Worker loop
//!
//! Each worker repeats: promote notified waiters (the sweep), check for
//! quiescence, pop a ready node, resume it, and dispatch on the event
//! its body raised. A `notify` keeps the node in the running set and
//! resumes it again, so a body that just moved an item continues until
//! it yields, waits, or exits.
//!
//! ## The notify race
//!
//! A node decides to wait based on channel state that its peer may
//! change concurrently. All last-event reads and writes happen under the
//! waiting-set lock: a notify marks its target before checking set
//! membership, and wait-processing re-checks the mark before parking.
//! Whichever side runs second sees the other's write, so a notify is
//! never dropped.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::Backoff;
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use braid_util::{Buffer, ConcurrentSet};

use crate::fsm::{Policy, StateMachine, TaskEvent, TaskState};
use crate::pool::{ConfigError, PoolBuilder, TaskFuture, ThreadPool};
use crate::task::{NodeId, TaskHandle};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// State-machine policy used by the scheduler: every action is traced.
struct TracePolicy;

impl Policy for TracePolicy {
    fn on_create(&self, task: &TaskHandle) {
        trace!("create: node {}", task.id());
    }
    fn on_stop_create(&self, task: &TaskHandle) {
        trace!("stop_create: node {}", task.id());
    }
    fn on_make_runnable(&self, task: &TaskHandle) {
        trace!("make_runnable: node {}", task.id());
    }
    fn on_stop_runnable(&self, task: &TaskHandle) {
        trace!("stop_runnable: node {}", task.id());
    }
    fn on_make_running(&self, task: &TaskHandle) {
        trace!("make_running: node {}", task.id());
    }
    fn on_stop_running(&self, task: &TaskHandle) {
        trace!("stop_running: node {}", task.id());
    }
    fn on_make_waiting(&self, task: &TaskHandle) {
        trace!("make_waiting: node {}", task.id());
    }
    fn on_stop_waiting(&self, task: &TaskHandle) {
        trace!("stop_waiting: node {}", task.id());
    }
    fn on_terminate(&self, task: &TaskHandle) {
        trace!("terminate: node {}", task.id());
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    submission_queue: Buffer<TaskHandle>,
    ready_queue: Buffer<TaskHandle>,
    finished_queue: Buffer<TaskHandle>,
    running_set: ConcurrentSet<TaskHandle>,
    waiting_set: ConcurrentSet<TaskHandle>,
    fsm: StateMachine<TracePolicy>,
    /// Start condition: workers park here until `sync_wait_all` kicks
    /// the run off.
    started: Mutex<bool>,
    start_cv: Condvar,
    debug: AtomicBool,
    /// Set when a worker hits a panic; the others observe it and exit.
    aborted: AtomicBool,
    first_panic: Mutex<Option<Box<dyn Any + Send>>>,
    num_submissions: AtomicUsize,
}

impl Shared {
    fn new() -> Self {
        Shared {
            submission_queue: Buffer::unbounded(),
            ready_queue: Buffer::unbounded(),
            finished_queue: Buffer::unbounded(),
            running_set: ConcurrentSet::new(),
            waiting_set: ConcurrentSet::new(),
            fsm: StateMachine::new(TracePolicy),
            started: Mutex::new(false),
            start_cv: Condvar::new(),
            debug: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            first_panic: Mutex::new(None),
            num_submissions: AtomicUsize::new(0),
        }
    }

    fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    fn wait_for_start(&self) {
        let mut started = self.started.lock();
        while !*started {
            self.start_cv.wait(&mut started);
        }
    }

    fn record_panic(&self, payload: Box<dyn Any + Send>) {
        self.aborted.store(true, Ordering::SeqCst);
        let mut slot = self.first_panic.lock();
        if slot.is_none() {
            *slot = Some(payload);
        }
    }

    /// Promote every waiter whose last event has become `notify`.
    ///
    /// The candidates are picked and removed in one pass under the
    /// waiting-set lock; the state transitions and requeueing happen
    /// after it is released.
    fn sweep_notified(&self) -> usize {
        let notified: Vec<TaskHandle> = self.waiting_set.with_lock(|set| {
            let picks: Vec<TaskHandle> = set
                .iter()
                .filter(|task| task.last_event() == TaskEvent::Notify)
                .cloned()
                .collect();
            for task in &picks {
                set.remove(task);
            }
            picks
        });
        for task in &notified {
            self.fsm.do_notify(task);
            if self.ready_queue.push(task.clone()).is_err() {
                warn!("ready queue closed while requeueing node {}", task.id());
            }
        }
        notified.len()
    }

    /// Apply `notify` to `target`: mark it, and promote it to the ready
    /// queue if it is parked in the waiting set.
    ///
    /// Marking happens under the waiting-set lock even when the target
    /// is absent -- a target mid-way into `apply_wait` re-checks the
    /// mark under the same lock and requeues itself.
    fn apply_notify(&self, target: &TaskHandle) {
        let was_waiting = self.waiting_set.with_lock(|set| {
            target.set_last_event(TaskEvent::Notify);
            set.take(target).is_some()
        });
        if was_waiting {
            self.fsm.do_notify(target);
            if self.ready_queue.push(target.clone()).is_err() {
                warn!("ready queue closed while promoting node {}", target.id());
            }
        }
    }

    /// Apply `wait` to `task`: move it from running to waiting, unless a
    /// notify already landed, in which case requeue it as runnable.
    fn apply_wait(&self, task: &TaskHandle) {
        let Some(task) = self.running_set.extract(task) else {
            warn!("wait for node {} which is not running", task.id());
            return;
        };
        self.fsm.do_wait(&task);
        let already_notified = self.waiting_set.with_lock(|set| {
            if task.last_event() == TaskEvent::Notify {
                true
            } else {
                task.set_last_event(TaskEvent::Wait);
                set.insert(task.clone());
                false
            }
        });
        if already_notified {
            // The peer notified before we parked; do not lose it.
            self.fsm.do_notify(&task);
            if self.ready_queue.push(task).is_err() {
                warn!("ready queue closed during wait/notify race");
            }
        }
    }

    /// Apply `yield`: move the task from running back to the ready queue.
    fn apply_yield(&self, task: &TaskHandle) {
        let Some(task) = self.running_set.extract(task) else {
            warn!("yield for node {} which is not running", task.id());
            return;
        };
        self.fsm.do_yield(&task);
        task.set_last_event(TaskEvent::Yield);
        if self.ready_queue.push(task).is_err() {
            warn!("ready queue closed during yield");
        }
    }

    /// Apply `exit`: move the task from running to the finished queue.
    fn apply_exit(&self, task: &TaskHandle) {
        let Some(task) = self.running_set.extract(task) else {
            warn!("exit for node {} which is not running", task.id());
            return;
        };
        self.fsm.do_exit(&task);
        task.set_last_event(TaskEvent::Exit);
        if self.finished_queue.push(task).is_err() {
            warn!("finished queue closed during exit");
        }
    }

    /// Dispatch a popped node and resume it until it leaves the running
    /// set.
    fn run_task(&self, task: TaskHandle) {
        self.fsm.do_dispatch(&task);
        // Reset the mark; a stale notify must not confuse a later wait.
        task.set_last_event(TaskEvent::Dispatch);
        self.running_set.insert(task.clone());

        loop {
            let event = task.resume();
            if self.debug() {
                debug!(
                    "node {} `{}` raised `{}` (pc {})",
                    task.id(),
                    task.name(),
                    event,
                    task.core().pc()
                );
            }
            match event {
                TaskEvent::Notify => {
                    self.fsm.do_notify(&task);
                    match task.correspondent() {
                        Some(peer) => self.apply_notify(&peer),
                        None => trace!("node {} notified with no correspondent", task.id()),
                    }
                    // The notifier stays in the running set; its next
                    // resume returns a different event.
                }
                TaskEvent::Yield => {
                    self.apply_yield(&task);
                    return;
                }
                TaskEvent::Wait => {
                    self.apply_wait(&task);
                    return;
                }
                TaskEvent::Exit => {
                    self.apply_exit(&task);
                    return;
                }
                other => panic!(
                    "logic fault: node {} body raised `{}`, which only the scheduler may raise",
                    task.id(),
                    other
                ),
            }
        }
    }

    fn worker_loop(&self, index: usize) {
        self.wait_for_start();
        if self.num_submissions.load(Ordering::SeqCst) == 0 {
            debug!("worker {index}: no submissions, returning");
            return;
        }

        let backoff = Backoff::new();
        loop {
            if self.aborted.load(Ordering::SeqCst) {
                return;
            }

            // Promote notified waiters before judging quiescence; a
            // notify observed here may repopulate the ready queue.
            self.sweep_notified();

            if self.ready_queue.is_empty()
                && self.running_set.is_empty()
                && self.waiting_set.is_empty()
            {
                if self.debug() {
                    debug!(
                        "worker {index}: quiescent (finished {} nodes), exiting",
                        self.finished_queue.len()
                    );
                }
                return;
            }

            let task = match self.ready_queue.try_pop() {
                Ok(task) => task,
                Err(_) => {
                    // Another worker holds the remaining nodes; re-run
                    // the sweep after a pause.
                    backoff.snooze();
                    continue;
                }
            };
            backoff.reset();

            // The node raced with a notify and is already parked again.
            if task.state() == TaskState::Waiting {
                self.waiting_set.insert(task);
                continue;
            }

            self.run_task(task);
        }
    }

    /// Run-down after the workers have exited: promote what can still be
    /// promoted, then close the queues and clear the sets.
    fn run_down(&self) {
        while !self.waiting_set.is_empty() {
            if self.sweep_notified() == 0 {
                warn!(
                    "{} waiter(s) left un-notified at shutdown",
                    self.waiting_set.len()
                );
                break;
            }
        }
        self.submission_queue.drain();
        self.ready_queue.drain();
        self.finished_queue.drain();
        self.waiting_set.clear();
        self.running_set.clear();
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Drives a DAG of nodes to completion on a pool of worker threads.
///
/// Usage is: `submit` every node, then consume the scheduler with
/// [`Scheduler::sync_wait_all`]. A scheduler runs one graph once; build
/// a new one for another run.
pub struct Scheduler {
    shared: Arc<Shared>,
    /// `None` for the inert (zero-thread) scheduler.
    pool: Option<ThreadPool>,
    worker_futures: Vec<TaskFuture<()>>,
    registry: Mutex<FxHashMap<NodeId, TaskHandle>>,
    concurrency: usize,
}

impl Scheduler {
    /// Build a scheduler with `num_threads` workers pre-launched.
    ///
    /// `num_threads == 0` constructs an inert scheduler that accepts no
    /// work. Oversized requests and repeated spawn failures surface as
    /// [`ConfigError`]s.
    pub fn new(num_threads: usize) -> Result<Self, ConfigError> {
        let shared = Arc::new(Shared::new());

        if num_threads == 0 {
            // Constructed in its shutdown state.
            shared.submission_queue.drain();
            shared.ready_queue.drain();
            shared.finished_queue.drain();
            return Ok(Scheduler {
                shared,
                pool: None,
                worker_futures: Vec::new(),
                registry: Mutex::new(FxHashMap::default()),
                concurrency: 0,
            });
        }

        let pool = PoolBuilder::new(num_threads).build()?;
        let mut worker_futures = Vec::with_capacity(num_threads);
        for index in 0..num_threads {
            let shared = Arc::clone(&shared);
            worker_futures.push(pool.submit(move || {
                let result =
                    panic::catch_unwind(AssertUnwindSafe(|| shared.worker_loop(index)));
                if let Err(payload) = result {
                    shared.record_panic(payload);
                }
            }));
        }

        Ok(Scheduler {
            shared,
            pool: Some(pool),
            worker_futures,
            registry: Mutex::new(FxHashMap::default()),
            concurrency: num_threads,
        })
    }

    /// Admit a node to the graph.
    ///
    /// Must be called before [`Scheduler::sync_wait_all`]. Submitting
    /// the same node twice is a logic fault. An inert scheduler ignores
    /// submissions.
    pub fn submit(&self, task: TaskHandle) {
        if self.concurrency == 0 {
            debug!("inert scheduler: ignoring submission of node {}", task.id());
            return;
        }
        {
            let mut registry = self.registry.lock();
            if registry.contains_key(&task.id()) {
                panic!("logic fault: node {} submitted twice", task.id());
            }
            registry.insert(task.id(), task.clone());
        }

        self.shared.fsm.do_create(&task);

        if self.shared.debug() {
            match task.correspondent() {
                Some(peer) => debug!(
                    "submitting `{}` node {} with correspondent `{}` node {}",
                    task.name(),
                    task.id(),
                    peer.name(),
                    peer.id()
                ),
                None => debug!(
                    "submitting `{}` node {} with no correspondent",
                    task.name(),
                    task.id()
                ),
            }
        }

        self.shared.num_submissions.fetch_add(1, Ordering::SeqCst);
        if self.shared.submission_queue.push(task).is_err() {
            warn!("submission queue closed; node not admitted");
        }
    }

    /// Start every submitted node and block until the graph is
    /// quiescent.
    ///
    /// Consumes the scheduler. If a node body panicked during the run,
    /// the first payload is re-raised here after the workers have been
    /// joined.
    pub fn sync_wait_all(mut self) {
        let shared = Arc::clone(&self.shared);

        // Move the submissions into the ready queue in one shot, then
        // admit each node so workers only ever pop runnable ones.
        shared.submission_queue.swap_data(&shared.ready_queue);
        let admitted = shared.ready_queue.len();
        for _ in 0..admitted {
            match shared.ready_queue.try_pop() {
                Ok(task) => {
                    shared.fsm.do_admit(&task);
                    task.set_last_event(TaskEvent::Admit);
                    if shared.ready_queue.push(task).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        // Kick the start condition.
        {
            let mut started = shared.started.lock();
            *started = true;
        }
        shared.start_cv.notify_all();

        // Join the workers.
        let futures = std::mem::take(&mut self.worker_futures);
        for future in futures {
            future.get();
        }

        shared.run_down();

        let panic_payload = shared.first_panic.lock().take();
        if let Some(payload) = panic_payload {
            panic::resume_unwind(payload);
        }
    }

    /// Event hook: apply `wait` to a running node.
    pub fn wait(&self, task: &TaskHandle) {
        self.shared.apply_wait(task);
    }

    /// Event hook: apply `notify` to a node, promoting it if it waits.
    pub fn notify(&self, task: &TaskHandle) {
        self.shared.apply_notify(task);
    }

    /// Event hook: apply `yield` to a running node. (`yield` is a
    /// reserved word in Rust.)
    pub fn yield_task(&self, task: &TaskHandle) {
        self.shared.apply_yield(task);
    }

    pub fn enable_debug(&self) {
        self.shared.debug.store(true, Ordering::Relaxed);
    }

    pub fn disable_debug(&self) {
        self.shared.debug.store(false, Ordering::Relaxed);
    }

    pub fn debug(&self) -> bool {
        self.shared.debug()
    }

    pub fn concurrency_level(&self) -> usize {
        self.concurrency
    }

    /// Number of nodes submitted so far.
    pub fn submitted(&self) -> usize {
        self.shared.num_submissions.load(Ordering::SeqCst)
    }

    pub fn ready_len(&self) -> usize {
        self.shared.ready_queue.len()
    }

    pub fn running_len(&self) -> usize {
        self.shared.running_set.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.shared.waiting_set.len()
    }

    pub fn finished_len(&self) -> usize {
        self.shared.finished_queue.len()
    }

    /// True when no node is ready, running, or waiting.
    pub fn is_quiescent(&self) -> bool {
        self.shared.ready_queue.is_empty()
            && self.shared.running_set.is_empty()
            && self.shared.waiting_set.is_empty()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // If the run never started, release the parked workers so the
        // pool can join them.
        let mut started = self.shared.started.lock();
        if !*started {
            self.shared.aborted.store(true, Ordering::SeqCst);
            *started = true;
            self.shared.start_cv.notify_all();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("concurrency", &self.concurrency)
            .field("submitted", &self.submitted())
            .field("ready", &self.ready_len())
            .field("running", &self.running_len())
            .field("waiting", &self.waiting_len())
            .field("finished", &self.finished_len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mover::Mover;
    use crate::nodes::{connect, handle, ConsumerNode, ProducerNode};
    use crate::task::{Node, NodeCore};

    fn range_producer(
        count: u64,
        mover: &Arc<Mover<u64>>,
    ) -> Arc<ProducerNode<u64, impl FnMut() -> Option<u64> + Send>> {
        let mut next = 0u64;
        ProducerNode::new(Arc::clone(mover), move || {
            if next < count {
                let item = next;
                next += 1;
                Some(item)
            } else {
                None
            }
        })
    }

    fn collecting_consumer(
        mover: &Arc<Mover<u64>>,
    ) -> (
        Arc<ConsumerNode<u64, impl FnMut(u64) + Send>>,
        Arc<Mutex<Vec<u64>>>,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let consumer = ConsumerNode::new(Arc::clone(mover), move |item| {
            sink.lock().push(item);
        });
        (consumer, seen)
    }

    #[test]
    fn test_construct_and_drop_unused() {
        let sched = Scheduler::new(2).unwrap();
        assert_eq!(sched.concurrency_level(), 2);
        // Dropping without a run must not hang.
    }

    #[test]
    fn test_empty_run_returns() {
        let sched = Scheduler::new(2).unwrap();
        sched.sync_wait_all();
    }

    #[test]
    fn test_inert_scheduler_accepts_no_work() {
        let mover = Arc::new(Mover::new(1));
        let producer = range_producer(3, &mover);

        let sched = Scheduler::new(0).unwrap();
        assert_eq!(sched.concurrency_level(), 0);
        sched.submit(handle(&producer));
        assert_eq!(sched.submitted(), 0);
        sched.sync_wait_all();
        assert_eq!(producer.produced(), 0);
    }

    #[test]
    #[should_panic(expected = "submitted twice")]
    fn test_double_submission_is_a_fault() {
        let mover = Arc::new(Mover::new(1));
        let producer = range_producer(1, &mover);
        let sched = Scheduler::new(1).unwrap();
        sched.submit(handle(&producer));
        sched.submit(handle(&producer));
    }

    #[test]
    fn test_single_pair_delivers_in_order() {
        let problem_size = 7u64;
        let mover = Arc::new(Mover::new(1));
        let producer = range_producer(problem_size, &mover);
        let (consumer, seen) = collecting_consumer(&mover);

        let p = handle(&producer);
        let c = handle(&consumer);
        connect(&p, &c);

        let sched = Scheduler::new(1).unwrap();
        sched.submit(p.clone());
        sched.submit(c.clone());
        assert_eq!(sched.submitted(), 2);

        sched.sync_wait_all();

        assert_eq!(*seen.lock(), (0..problem_size).collect::<Vec<u64>>());
        assert_eq!(producer.produced(), problem_size);
        assert_eq!(consumer.consumed(), problem_size);
        assert_eq!(p.state(), TaskState::Terminated);
        assert_eq!(c.state(), TaskState::Terminated);
    }

    #[test]
    fn test_single_pair_four_workers() {
        let problem_size = 7u64;
        let mover = Arc::new(Mover::new(1));
        let producer = range_producer(problem_size, &mover);
        let (consumer, seen) = collecting_consumer(&mover);

        let p = handle(&producer);
        let c = handle(&consumer);
        connect(&p, &c);

        let sched = Scheduler::new(4).unwrap();
        sched.submit(p.clone());
        sched.submit(c.clone());
        sched.sync_wait_all();

        // No duplicates, no drops: a FIFO edge delivers in order even
        // when any of four workers may resume either node.
        assert_eq!(*seen.lock(), (0..problem_size).collect::<Vec<u64>>());
        assert_eq!(p.state(), TaskState::Terminated);
        assert_eq!(c.state(), TaskState::Terminated);
    }

    #[test]
    fn test_partition_after_run() {
        let mover = Arc::new(Mover::new(2));
        let producer = range_producer(20, &mover);
        let (consumer, _seen) = collecting_consumer(&mover);

        let p = handle(&producer);
        let c = handle(&consumer);
        connect(&p, &c);

        let sched = Scheduler::new(2).unwrap();
        sched.submit(p);
        sched.submit(c);

        let shared = Arc::clone(&sched.shared);
        sched.sync_wait_all();

        // Every submitted node ended in the finished queue; the other
        // collections are empty.
        assert_eq!(shared.finished_queue.len(), 2);
        assert!(shared.ready_queue.is_empty());
        assert!(shared.running_set.is_empty());
        assert!(shared.waiting_set.is_empty());
    }

    #[test]
    fn test_debug_toggle() {
        let sched = Scheduler::new(1).unwrap();
        assert!(!sched.debug());
        sched.enable_debug();
        assert!(sched.debug());
        sched.disable_debug();
        assert!(!sched.debug());
        sched.sync_wait_all();
    }

    /// A node whose body panics on its first resume.
    struct ExplodingNode {
        core: NodeCore,
    }

    impl Node for ExplodingNode {
        fn core(&self) -> &NodeCore {
            &self.core
        }

        fn name(&self) -> &str {
            "exploding"
        }

        fn resume(&self) -> TaskEvent {
            panic!("node body exploded");
        }
    }

    #[test]
    #[should_panic(expected = "node body exploded")]
    fn test_body_panic_rethrown_from_sync_wait_all() {
        let node = Arc::new(ExplodingNode {
            core: NodeCore::new(),
        });
        let sched = Scheduler::new(2).unwrap();
        sched.submit(handle(&node));
        sched.sync_wait_all();
    }

    #[test]
    fn test_many_independent_pairs() {
        let pairs = 8;
        let per_pair = 25u64;
        let sched = Scheduler::new(4).unwrap();

        let mut ends = Vec::new();
        for _ in 0..pairs {
            let mover = Arc::new(Mover::new(1));
            let producer = range_producer(per_pair, &mover);
            let (consumer, seen) = collecting_consumer(&mover);
            let p = handle(&producer);
            let c = handle(&consumer);
            connect(&p, &c);
            sched.submit(p.clone());
            sched.submit(c.clone());
            ends.push((p, c, seen));
        }

        sched.sync_wait_all();

        for (p, c, seen) in ends {
            assert_eq!(p.state(), TaskState::Terminated);
            assert_eq!(c.state(), TaskState::Terminated);
            assert_eq!(*seen.lock(), (0..per_pair).collect::<Vec<u64>>());
        }
    }
}
