//! Node identity and handles.
//!
//! A graph node is anything implementing [`Node`]: it carries a stable
//! identity, the scheduling fields the state machine reads and writes
//! (state, last event), a saved program counter encoding where its body
//! resumes, and a reference to its correspondent -- the peer on the other
//! end of its primary channel.
//!
//! The common fields live in an embeddable [`NodeCore`]; concrete node
//! types hold one and implement the remaining two methods (`name` and
//! `resume`). Schedulers pass nodes around as [`TaskHandle`]s, which
//! compare equal only when they refer to the same underlying node.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::fsm::{TaskEvent, TaskState};

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// Unique identifier for a node.
///
/// Ids are assigned sequentially from an atomic counter, so they are
/// unique within a process and monotone in creation order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Allocate the next fresh id.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        NodeId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// The capability set the scheduler requires of a graph node.
///
/// `resume` runs the node body from its saved program counter to the
/// next channel operation or yield and returns the event that suspension
/// raises. Everything else delegates to the node's [`NodeCore`].
pub trait Node: Send + Sync {
    /// The embedded common state.
    fn core(&self) -> &NodeCore;

    /// Human-readable node kind, e.g. "producer".
    fn name(&self) -> &str;

    /// Run the body to its next suspension point.
    fn resume(&self) -> TaskEvent;

    fn id(&self) -> NodeId {
        self.core().id()
    }

    fn state(&self) -> TaskState {
        self.core().state()
    }

    fn set_state(&self, state: TaskState) {
        self.core().set_state(state)
    }

    fn last_event(&self) -> TaskEvent {
        self.core().last_event()
    }

    fn set_last_event(&self, event: TaskEvent) {
        self.core().set_last_event(event)
    }

    /// The peer on the other end of this node's primary channel.
    ///
    /// Returns `None` if the peer was never connected or has been
    /// dropped.
    fn correspondent(&self) -> Option<TaskHandle> {
        self.core().correspondent()
    }

    fn set_correspondent(&self, peer: &TaskHandle) {
        self.core().set_correspondent(peer)
    }

    fn enable_debug(&self) {
        self.core().set_debug(true)
    }

    fn disable_debug(&self) {
        self.core().set_debug(false)
    }

    fn debug(&self) -> bool {
        self.core().debug()
    }
}

// ---------------------------------------------------------------------------
// NodeCore
// ---------------------------------------------------------------------------

/// Common mutable state embedded in every node.
///
/// State and last-event are stored as encoded atomics; the program
/// counter is only ever touched by the worker currently resuming the
/// node, but lives here so the resumption point survives suspension.
/// The correspondent is held weakly: the scheduler's state sets own the
/// strong references, and a node handle cycle would otherwise never be
/// freed.
pub struct NodeCore {
    id: NodeId,
    state: AtomicU8,
    last_event: AtomicU8,
    pc: AtomicUsize,
    correspondent: Mutex<Weak<dyn Node>>,
    debug: AtomicBool,
}

impl NodeCore {
    pub fn new() -> Self {
        let unset = unset_peer();
        NodeCore {
            id: NodeId::next(),
            state: AtomicU8::new(TaskState::Created.index() as u8),
            last_event: AtomicU8::new(TaskEvent::Create.index() as u8),
            pc: AtomicUsize::new(0),
            correspondent: Mutex::new(unset),
            debug: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: TaskState) {
        self.state.store(state.index() as u8, Ordering::SeqCst);
    }

    pub fn last_event(&self) -> TaskEvent {
        TaskEvent::from_u8(self.last_event.load(Ordering::SeqCst))
    }

    pub fn set_last_event(&self, event: TaskEvent) {
        self.last_event.store(event.index() as u8, Ordering::SeqCst);
    }

    /// The saved program counter: where `resume` picks the body up.
    pub fn pc(&self) -> usize {
        self.pc.load(Ordering::SeqCst)
    }

    pub fn set_pc(&self, pc: usize) {
        self.pc.store(pc, Ordering::SeqCst);
    }

    pub fn correspondent(&self) -> Option<TaskHandle> {
        self.correspondent.lock().upgrade().map(TaskHandle)
    }

    pub fn set_correspondent(&self, peer: &TaskHandle) {
        *self.correspondent.lock() = Arc::downgrade(&peer.0);
    }

    pub fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    pub fn set_debug(&self, on: bool) {
        self.debug.store(on, Ordering::Relaxed);
    }
}

impl Default for NodeCore {
    fn default() -> Self {
        Self::new()
    }
}

/// A `Weak` that upgrades to nothing, for not-yet-connected peers.
pub(crate) fn unset_peer() -> Weak<dyn Node> {
    Weak::<Stub>::new()
}

/// Placeholder node type used only for [`unset_peer`].
struct Stub;

impl Node for Stub {
    fn core(&self) -> &NodeCore {
        unreachable!("stub node is never instantiated")
    }

    fn name(&self) -> &str {
        "stub"
    }

    fn resume(&self) -> TaskEvent {
        unreachable!("stub node is never instantiated")
    }
}

impl std::fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCore")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("last_event", &self.last_event())
            .field("pc", &self.pc())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TaskHandle
// ---------------------------------------------------------------------------

/// A shared, cheaply clonable reference to a node.
///
/// Equality is identity: two handles are equal iff they refer to the
/// same underlying node. Ordering and hashing go through the node id,
/// which is consistent with identity because ids are never reused.
#[derive(Clone)]
pub struct TaskHandle(Arc<dyn Node>);

impl TaskHandle {
    pub fn new(node: Arc<dyn Node>) -> Self {
        TaskHandle(node)
    }

    /// A weak reference to the underlying node.
    pub fn downgrade(&self) -> Weak<dyn Node> {
        Arc::downgrade(&self.0)
    }
}

impl std::ops::Deref for TaskHandle {
    type Target = dyn Node;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TaskHandle {}

impl PartialOrd for TaskHandle {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskHandle {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.id().cmp(&other.0.id())
    }
}

impl std::hash::Hash for TaskHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id().hash(state);
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.0.id())
            .field("name", &self.0.name())
            .field("state", &self.0.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
