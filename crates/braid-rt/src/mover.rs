//! Movers: the edges of the graph.
//!
//! A [`Mover`] materializes one DAG edge as a bounded buffer shared by
//! exactly two nodes, plus a one-item port slot on each end. The source
//! node stages an item into its port with [`Mover::fill`] and advances it
//! into the buffer with [`Mover::push`]; the sink node brings the buffer
//! front into its port with [`Mover::pull`] and takes it out with
//! [`Mover::drain_item`].
//!
//! `push` and `pull` are the suspension points of a node body. They never
//! block; instead they report a [`PortEvent`] that the body translates
//! into a scheduler event: `Moved` -> notify the peer, `WouldBlock` ->
//! wait, `Closed` -> exit. A `WouldBlock`ed operation leaves the port
//! unchanged so the body can retry from the same program counter after it
//! is notified.
//!
//! End-of-stream is [`Mover::finish`] (peer can still pop what is
//! buffered); cancellation is [`Mover::stop`] (everything fails at once).

use parking_lot::Mutex;

use braid_util::{Buffer, TryPopError, TryPushError};

pub use braid_util::Order;

// ---------------------------------------------------------------------------
// PortEvent
// ---------------------------------------------------------------------------

/// Outcome of a port operation, translated by node bodies into scheduler
/// events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    /// The item moved; the peer may have been unblocked by it.
    Moved,
    /// The channel cannot accept the operation right now; retry after the
    /// peer acts.
    WouldBlock,
    /// The channel is finished or stopped; no further items will move.
    Closed,
}

// ---------------------------------------------------------------------------
// Mover
// ---------------------------------------------------------------------------

/// A bounded single-edge channel between a source node and a sink node.
pub struct Mover<T> {
    buffer: Buffer<T>,
    source_port: Mutex<Option<T>>,
    sink_port: Mutex<Option<T>>,
}

impl<T> Mover<T> {
    /// Create a FIFO mover with the given in-flight capacity (typically 1
    /// or 2).
    pub fn new(capacity: usize) -> Self {
        Self::with_order(capacity, Order::Fifo)
    }

    /// Create a mover with explicit pop-side ordering.
    pub fn with_order(capacity: usize, order: Order) -> Self {
        Mover {
            buffer: Buffer::bounded_with_order(capacity, order),
            source_port: Mutex::new(None),
            sink_port: Mutex::new(None),
        }
    }

    /// Stage an item in the source port.
    ///
    /// Panics if the port already holds an item: a body must push (or see
    /// the channel close) before filling again.
    pub fn fill(&self, item: T) {
        let mut port = self.source_port.lock();
        if port.is_some() {
            panic!("logic fault: source port filled twice without a push");
        }
        *port = Some(item);
    }

    /// Advance the staged item from the source port into the buffer.
    ///
    /// `WouldBlock` re-stages the item so the body can retry later.
    pub fn push(&self) -> PortEvent {
        let mut port = self.source_port.lock();
        let item = match port.take() {
            Some(item) => item,
            None => panic!("logic fault: push with an empty source port"),
        };
        match self.buffer.try_push(item) {
            Ok(()) => PortEvent::Moved,
            Err(TryPushError::Full(item)) => {
                *port = Some(item);
                PortEvent::WouldBlock
            }
            // The item is dropped: the stream is over either way.
            Err(TryPushError::Stopped(_)) | Err(TryPushError::Drained(_)) => PortEvent::Closed,
        }
    }

    /// Bring the buffer front into the sink port.
    ///
    /// Idempotent while the port is occupied, so a body re-run after a
    /// spurious wakeup does not lose the item it already pulled.
    pub fn pull(&self) -> PortEvent {
        let mut port = self.sink_port.lock();
        if port.is_some() {
            return PortEvent::Moved;
        }
        match self.buffer.try_pop() {
            Ok(item) => {
                *port = Some(item);
                PortEvent::Moved
            }
            Err(TryPopError::Empty) => PortEvent::WouldBlock,
            Err(TryPopError::Stopped) | Err(TryPopError::Drained) => PortEvent::Closed,
        }
    }

    /// Take the pulled item out of the sink port.
    pub fn drain_item(&self) -> Option<T> {
        self.sink_port.lock().take()
    }

    /// End of stream: no further pushes, buffered items remain poppable.
    pub fn finish(&self) {
        self.buffer.drain();
    }

    /// Cancel the edge: all subsequent operations report `Closed`.
    pub fn stop(&self) {
        self.buffer.shutdown();
    }

    /// Items currently buffered (excludes the port slots).
    pub fn in_flight(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.buffer.capacity()
    }

    /// Total items ever pushed into the buffer.
    pub fn pushes(&self) -> u64 {
        self.buffer.pushes()
    }

    /// Total items ever popped out of the buffer.
    pub fn pops(&self) -> u64 {
        self.buffer.pops()
    }

    pub fn is_stopped(&self) -> bool {
        self.buffer.is_shutdown()
    }

    /// True once the source has signalled end-of-stream.
    pub fn is_finished(&self) -> bool {
        self.buffer.is_draining()
    }
}

impl<T> std::fmt::Debug for Mover<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mover")
            .field("in_flight", &self.in_flight())
            .field("capacity", &self.capacity())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
