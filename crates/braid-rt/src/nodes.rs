//! Producer, consumer, and function nodes.
//!
//! Node bodies follow the saved-pc convention: `resume` dispatches on the
//! program counter stored in the node core, runs to the next mover
//! operation, and returns the event that operation raises. A case that
//! could not make progress leaves the pc where it is, so the retried
//! operation re-runs when the node is next resumed.
//!
//! The shapes here mirror the three node kinds every pipeline is built
//! from:
//!
//! - [`ProducerNode`]: produce -> fill -> push -> yield, until the
//!   producing closure runs dry.
//! - [`ConsumerNode`]: pull -> drain -> apply -> yield, until the input
//!   edge closes.
//! - [`FunctionNode`]: pull `arity` inputs, emit one output. Sits between
//!   two edges and retargets its correspondent to whichever peer its next
//!   operation concerns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;

use crate::fsm::TaskEvent;
use crate::mover::{Mover, PortEvent};
use crate::task::{Node, NodeCore, TaskHandle};

/// Make a scheduler handle for a concrete node.
pub fn handle<N: Node + 'static>(node: &Arc<N>) -> TaskHandle {
    TaskHandle::new(Arc::clone(node) as Arc<dyn Node>)
}

/// Make two nodes each other's correspondent.
pub fn connect(a: &TaskHandle, b: &TaskHandle) {
    a.set_correspondent(b);
    b.set_correspondent(a);
}

// ---------------------------------------------------------------------------
// ProducerNode
// ---------------------------------------------------------------------------

/// A source node feeding one outgoing edge.
///
/// The closure is called once per round; returning `None` ends the
/// stream, which finishes the mover (buffered items stay available to
/// the sink) and exits the node.
pub struct ProducerNode<T, F> {
    core: NodeCore,
    mover: Arc<Mover<T>>,
    f: Mutex<F>,
    produced: AtomicU64,
}

mod producer_pc {
    pub const PRODUCE: usize = 0;
    pub const PUSH: usize = 1;
    pub const YIELD: usize = 2;
    pub const EXIT: usize = 3;
}

impl<T, F> ProducerNode<T, F>
where
    T: Send + 'static,
    F: FnMut() -> Option<T> + Send + 'static,
{
    pub fn new(mover: Arc<Mover<T>>, f: F) -> Arc<Self> {
        Arc::new(ProducerNode {
            core: NodeCore::new(),
            mover,
            f: Mutex::new(f),
            produced: AtomicU64::new(0),
        })
    }

    /// Items pushed into the edge so far.
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::SeqCst)
    }
}

impl<T, F> Node for ProducerNode<T, F>
where
    T: Send + 'static,
    F: FnMut() -> Option<T> + Send + 'static,
{
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn name(&self) -> &str {
        "producer"
    }

    fn resume(&self) -> TaskEvent {
        use self::producer_pc::*;

        if self.debug() {
            debug!(
                "producer node {} resuming at pc {} with {} produced",
                self.id(),
                self.core.pc(),
                self.produced()
            );
        }

        loop {
            match self.core.pc() {
                PRODUCE => {
                    let next = {
                        let mut f = self.f.lock();
                        (*f)()
                    };
                    match next {
                        Some(item) => {
                            self.mover.fill(item);
                            self.core.set_pc(PUSH);
                        }
                        None => {
                            // End of stream: close the edge, then wake
                            // the peer so it can observe the close.
                            self.mover.finish();
                            self.core.set_pc(EXIT);
                            return TaskEvent::Notify;
                        }
                    }
                }
                PUSH => match self.mover.push() {
                    PortEvent::Moved => {
                        self.produced.fetch_add(1, Ordering::SeqCst);
                        self.core.set_pc(YIELD);
                        return TaskEvent::Notify;
                    }
                    PortEvent::WouldBlock => return TaskEvent::Wait,
                    PortEvent::Closed => self.core.set_pc(EXIT),
                },
                YIELD => {
                    self.core.set_pc(PRODUCE);
                    return TaskEvent::Yield;
                }
                EXIT => return TaskEvent::Exit,
                pc => panic!("logic fault: producer body at invalid pc {pc}"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ConsumerNode
// ---------------------------------------------------------------------------

/// A sink node draining one incoming edge.
///
/// The closure is applied to every item; the node exits when the edge
/// closes and no buffered items remain.
pub struct ConsumerNode<T, F> {
    core: NodeCore,
    mover: Arc<Mover<T>>,
    f: Mutex<F>,
    staged: Mutex<Option<T>>,
    consumed: AtomicU64,
}

mod consumer_pc {
    pub const PULL: usize = 0;
    pub const DRAIN: usize = 1;
    pub const APPLY: usize = 2;
    pub const YIELD: usize = 3;
    pub const EXIT: usize = 4;
}

impl<T, F> ConsumerNode<T, F>
where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    pub fn new(mover: Arc<Mover<T>>, f: F) -> Arc<Self> {
        Arc::new(ConsumerNode {
            core: NodeCore::new(),
            mover,
            f: Mutex::new(f),
            staged: Mutex::new(None),
            consumed: AtomicU64::new(0),
        })
    }

    /// Items taken off the edge so far.
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::SeqCst)
    }
}

impl<T, F> Node for ConsumerNode<T, F>
where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn name(&self) -> &str {
        "consumer"
    }

    fn resume(&self) -> TaskEvent {
        use self::consumer_pc::*;

        if self.debug() {
            debug!(
                "consumer node {} resuming at pc {} with {} consumed",
                self.id(),
                self.core.pc(),
                self.consumed()
            );
        }

        loop {
            match self.core.pc() {
                PULL => match self.mover.pull() {
                    PortEvent::Moved => {
                        self.core.set_pc(DRAIN);
                        // Popping freed buffer space for the source.
                        return TaskEvent::Notify;
                    }
                    PortEvent::WouldBlock => return TaskEvent::Wait,
                    PortEvent::Closed => self.core.set_pc(EXIT),
                },
                DRAIN => match self.mover.drain_item() {
                    Some(item) => {
                        *self.staged.lock() = Some(item);
                        self.core.set_pc(APPLY);
                    }
                    None => panic!("logic fault: consumer drained an empty sink port"),
                },
                APPLY => {
                    let item = match self.staged.lock().take() {
                        Some(item) => item,
                        None => panic!("logic fault: consumer applied with no staged item"),
                    };
                    {
                        let mut f = self.f.lock();
                        (*f)(item);
                    }
                    self.consumed.fetch_add(1, Ordering::SeqCst);
                    self.core.set_pc(YIELD);
                }
                YIELD => {
                    self.core.set_pc(PULL);
                    return TaskEvent::Yield;
                }
                EXIT => return TaskEvent::Exit,
                pc => panic!("logic fault: consumer body at invalid pc {pc}"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FunctionNode
// ---------------------------------------------------------------------------

/// A mid-pipeline node: consumes `arity` items from its input edge, emits
/// one item on its output edge.
///
/// A function node has two peers, but a node carries a single
/// correspondent: before raising an event the body points the
/// correspondent at whichever peer the event concerns (upstream for input
/// operations, downstream for output operations).
pub struct FunctionNode<A, B, F> {
    core: NodeCore,
    input: Arc<Mover<A>>,
    output: Arc<Mover<B>>,
    arity: usize,
    f: Mutex<F>,
    batch: Mutex<Vec<A>>,
    processed: AtomicU64,
    upstream: Mutex<Weak<dyn Node>>,
    downstream: Mutex<Weak<dyn Node>>,
}

mod function_pc {
    pub const PULL: usize = 0;
    pub const DRAIN: usize = 1;
    pub const PUSH: usize = 2;
    pub const YIELD: usize = 3;
    pub const EXIT: usize = 4;
}

impl<A, B, F> FunctionNode<A, B, F>
where
    A: Send + 'static,
    B: Send + 'static,
    F: FnMut(Vec<A>) -> B + Send + 'static,
{
    pub fn new(input: Arc<Mover<A>>, output: Arc<Mover<B>>, arity: usize, f: F) -> Arc<Self> {
        assert!(arity >= 1, "function node arity must be at least 1");
        Arc::new(FunctionNode {
            core: NodeCore::new(),
            input,
            output,
            arity,
            f: Mutex::new(f),
            batch: Mutex::new(Vec::new()),
            processed: AtomicU64::new(0),
            upstream: Mutex::new(crate::task::unset_peer()),
            downstream: Mutex::new(crate::task::unset_peer()),
        })
    }

    pub fn set_upstream(&self, peer: &TaskHandle) {
        *self.upstream.lock() = peer.downgrade();
    }

    pub fn set_downstream(&self, peer: &TaskHandle) {
        *self.downstream.lock() = peer.downgrade();
    }

    /// Outputs emitted so far.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    fn target_upstream(&self) {
        if let Some(peer) = self.upstream.lock().upgrade() {
            self.core.set_correspondent(&TaskHandle::new(peer));
        }
    }

    fn target_downstream(&self) {
        if let Some(peer) = self.downstream.lock().upgrade() {
            self.core.set_correspondent(&TaskHandle::new(peer));
        }
    }
}

impl<A, B, F> Node for FunctionNode<A, B, F>
where
    A: Send + 'static,
    B: Send + 'static,
    F: FnMut(Vec<A>) -> B + Send + 'static,
{
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn name(&self) -> &str {
        "function"
    }

    fn resume(&self) -> TaskEvent {
        use self::function_pc::*;

        loop {
            match self.core.pc() {
                PULL => match self.input.pull() {
                    PortEvent::Moved => {
                        self.core.set_pc(DRAIN);
                        self.target_upstream();
                        return TaskEvent::Notify;
                    }
                    PortEvent::WouldBlock => return TaskEvent::Wait,
                    PortEvent::Closed => {
                        // Input closed. An incomplete batch cannot be
                        // completed and is discarded.
                        self.output.finish();
                        self.core.set_pc(EXIT);
                        self.target_downstream();
                        return TaskEvent::Notify;
                    }
                },
                DRAIN => {
                    let item = match self.input.drain_item() {
                        Some(item) => item,
                        None => panic!("logic fault: function node drained an empty sink port"),
                    };
                    let mut batch = self.batch.lock();
                    batch.push(item);
                    if batch.len() == self.arity {
                        let ready = std::mem::take(&mut *batch);
                        drop(batch);
                        let out = {
                            let mut f = self.f.lock();
                            (*f)(ready)
                        };
                        self.output.fill(out);
                        self.core.set_pc(PUSH);
                    } else {
                        self.core.set_pc(PULL);
                    }
                }
                PUSH => match self.output.push() {
                    PortEvent::Moved => {
                        self.processed.fetch_add(1, Ordering::SeqCst);
                        self.core.set_pc(YIELD);
                        self.target_downstream();
                        return TaskEvent::Notify;
                    }
                    PortEvent::WouldBlock => return TaskEvent::Wait,
                    PortEvent::Closed => self.core.set_pc(EXIT),
                },
                YIELD => {
                    self.core.set_pc(PULL);
                    return TaskEvent::Yield;
                }
                EXIT => return TaskEvent::Exit,
                pc => panic!("logic fault: function body at invalid pc {pc}"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
