//! Concurrency primitives for the Braid task-graph engine.
//!
//! This crate holds the two building blocks everything else is assembled
//! from:
//!
//! - [`buffer`]: a synchronized bounded (or unbounded) buffer with paired
//!   producer/consumer operations and drain/shutdown semantics. Edges
//!   between graph nodes and the scheduler's own state queues are both
//!   backed by it.
//! - [`concurrent_set`]: a mutex-wrapped ordered set used for the
//!   scheduler's running/waiting bookkeeping.

pub mod buffer;
pub mod concurrent_set;

pub use buffer::{Buffer, Order, PopError, PushError, TryPopError, TryPushError};
pub use concurrent_set::ConcurrentSet;
