//! Braid task-graph execution engine.
//!
//! Braid runs a directed acyclic graph of cooperating nodes on a fixed
//! pool of OS threads. Nodes are stackless coroutines: each carries a
//! saved program counter, and `resume` runs the body from that pc to the
//! next channel operation or yield, returning the event the suspension
//! raises. The scheduler consumes those events through a table-driven
//! state machine and moves nodes between its ready/running/waiting/
//! finished collections accordingly.
//!
//! ## Modules
//!
//! - [`pool`]: generic thread pool (shared or per-worker queues,
//!   optional stealing) that hosts the scheduler's worker loops.
//! - [`fsm`]: the six-state, seven-event task state machine with
//!   entry/exit policy callbacks.
//! - [`task`]: node identity, the [`task::Node`] capability trait, and
//!   shared handles.
//! - [`mover`]: bounded single-edge channels with source/sink ports.
//! - [`nodes`]: producer, consumer, and n-ary function nodes written in
//!   the saved-pc convention.
//! - [`scheduler`]: the node scheduler itself.
//!
//! ## A minimal pipeline
//!
//! ```
//! use std::sync::Arc;
//! use braid_rt::mover::Mover;
//! use braid_rt::nodes::{connect, handle, ConsumerNode, ProducerNode};
//! use braid_rt::scheduler::Scheduler;
//!
//! let mover = Arc::new(Mover::new(1));
//! let mut next = 0u64;
//! let producer = ProducerNode::new(Arc::clone(&mover), move || {
//!     next += 1;
//!     (next <= 3).then_some(next)
//! });
//! let consumer = ConsumerNode::new(Arc::clone(&mover), |item| {
//!     println!("got {item}");
//! });
//!
//! let p = handle(&producer);
//! let c = handle(&consumer);
//! connect(&p, &c);
//!
//! let sched = Scheduler::new(2).expect("pool size within limits");
//! sched.submit(p);
//! sched.submit(c);
//! sched.sync_wait_all();
//! assert_eq!(consumer.consumed(), 3);
//! ```

pub mod fsm;
pub mod mover;
pub mod nodes;
pub mod pool;
pub mod scheduler;
pub mod task;

pub use fsm::{NullPolicy, Policy, StateMachine, TaskAction, TaskEvent, TaskState};
pub use mover::{Mover, Order, PortEvent};
pub use nodes::{connect, handle, ConsumerNode, FunctionNode, ProducerNode};
pub use pool::{ConfigError, PoolBuilder, QueueMode, TaskFuture, ThreadPool};
pub use scheduler::Scheduler;
pub use task::{Node, NodeCore, NodeId, TaskHandle};
