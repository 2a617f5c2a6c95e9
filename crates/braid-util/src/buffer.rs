//! Synchronized bounded buffer with drain/shutdown semantics.
//!
//! A [`Buffer`] is the hand-off point between two cooperating parties: a
//! producer side that pushes and a consumer side that pops. It supports a
//! bounded mode (pushes block while the buffer is full) and an unbounded
//! mode (pushes never block on capacity), FIFO or LIFO ordering chosen at
//! construction, and a two-phase close protocol:
//!
//! - **drain**: no further pushes are accepted, but items already in the
//!   buffer may still be popped. Used for orderly run-down.
//! - **shutdown**: both pushes and pops fail immediately. Used for
//!   cancellation; all blocked waiters are released.
//!
//! Blocking operations park on condition variables and never spin.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Pop-side ordering of a buffer, chosen at construction.
///
/// `Fifo` treats the backing deque as a queue (push to the back), `Lifo`
/// as a stack (push to the front). Pops always take the front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Fifo,
    Lifo,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a blocking push failed. The rejected item is handed back.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError<T> {
    /// The buffer has been shut down.
    #[error("buffer is shut down")]
    Stopped(T),
    /// The buffer is draining and accepts no further items.
    #[error("buffer is draining")]
    Drained(T),
}

impl<T> PushError<T> {
    /// Recover the item that could not be pushed.
    pub fn into_inner(self) -> T {
        match self {
            PushError::Stopped(item) | PushError::Drained(item) => item,
        }
    }
}

/// Why a non-blocking push failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TryPushError<T> {
    /// The buffer is at capacity.
    #[error("buffer is full")]
    Full(T),
    #[error("buffer is shut down")]
    Stopped(T),
    #[error("buffer is draining")]
    Drained(T),
}

impl<T> TryPushError<T> {
    /// Recover the item that could not be pushed.
    pub fn into_inner(self) -> T {
        match self {
            TryPushError::Full(item)
            | TryPushError::Stopped(item)
            | TryPushError::Drained(item) => item,
        }
    }
}

/// Why a blocking pop came back empty.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PopError {
    #[error("buffer is shut down")]
    Stopped,
    /// The buffer is draining and holds no more items. End of stream.
    #[error("buffer is drained")]
    Drained,
}

/// Why a non-blocking pop came back empty.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TryPopError {
    /// Nothing buffered right now; the buffer is still open.
    #[error("buffer is empty")]
    Empty,
    #[error("buffer is shut down")]
    Stopped,
    #[error("buffer is drained")]
    Drained,
}

impl TryPopError {
    /// True for `Stopped` and `Drained`, i.e. no item will ever arrive.
    pub fn is_closed(self) -> bool {
        !matches!(self, TryPopError::Empty)
    }
}

// ---------------------------------------------------------------------------
// Buffer
// ---------------------------------------------------------------------------

struct Inner<T> {
    queue: VecDeque<T>,
    /// `None` means unbounded.
    capacity: Option<usize>,
    draining: bool,
    shutdown: bool,
    /// Total items ever pushed. Never decreases.
    pushes: u64,
    /// Total items ever popped. Never decreases.
    pops: u64,
}

/// A synchronized bounded buffer.
///
/// All operations are thread-safe; the buffer is shared by reference
/// (typically inside an `Arc`) between its producer and consumer sides.
pub struct Buffer<T> {
    inner: Mutex<Inner<T>>,
    /// Signalled when an item arrives; popping threads wait here.
    item_cv: Condvar,
    /// Signalled when space frees up; pushing threads wait here.
    space_cv: Condvar,
    order: Order,
}

impl<T> Buffer<T> {
    /// Create a bounded FIFO buffer holding at most `capacity` items.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_order(Some(capacity), Order::Fifo)
    }

    /// Create an unbounded FIFO buffer. Pushes never block on capacity.
    pub fn unbounded() -> Self {
        Self::with_order(None, Order::Fifo)
    }

    /// Create a bounded buffer with the given pop-side ordering.
    pub fn bounded_with_order(capacity: usize, order: Order) -> Self {
        Self::with_order(Some(capacity), order)
    }

    /// Create an unbounded buffer with the given pop-side ordering.
    pub fn unbounded_with_order(order: Order) -> Self {
        Self::with_order(None, order)
    }

    fn with_order(capacity: Option<usize>, order: Order) -> Self {
        Buffer {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                capacity,
                draining: false,
                shutdown: false,
                pushes: 0,
                pops: 0,
            }),
            item_cv: Condvar::new(),
            space_cv: Condvar::new(),
            order,
        }
    }

    fn enqueue(&self, inner: &mut Inner<T>, item: T) {
        match self.order {
            Order::Fifo => inner.queue.push_back(item),
            Order::Lifo => inner.queue.push_front(item),
        }
        inner.pushes += 1;
    }

    /// Push an item, blocking while the buffer is full.
    ///
    /// Fails without enqueuing once the buffer is draining or shut down,
    /// handing the item back to the caller.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut inner = self.inner.lock();
        while inner
            .capacity
            .is_some_and(|cap| inner.queue.len() >= cap)
            && !inner.draining
            && !inner.shutdown
        {
            self.space_cv.wait(&mut inner);
        }
        if inner.shutdown {
            return Err(PushError::Stopped(item));
        }
        if inner.draining {
            return Err(PushError::Drained(item));
        }
        self.enqueue(&mut inner, item);
        drop(inner);
        self.item_cv.notify_one();
        Ok(())
    }

    /// Push an item if there is room right now; never blocks.
    pub fn try_push(&self, item: T) -> Result<(), TryPushError<T>> {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return Err(TryPushError::Stopped(item));
        }
        if inner.draining {
            return Err(TryPushError::Drained(item));
        }
        if inner
            .capacity
            .is_some_and(|cap| inner.queue.len() >= cap)
        {
            return Err(TryPushError::Full(item));
        }
        self.enqueue(&mut inner, item);
        drop(inner);
        self.item_cv.notify_one();
        Ok(())
    }

    /// Pop an item, blocking while the buffer is empty and still open.
    ///
    /// Returns `Err(Stopped)` once the buffer has been shut down (even if
    /// items remain), and `Err(Drained)` once a draining buffer runs dry.
    pub fn pop(&self) -> Result<T, PopError> {
        let mut inner = self.inner.lock();
        while inner.queue.is_empty() && !inner.draining && !inner.shutdown {
            self.item_cv.wait(&mut inner);
        }
        if inner.shutdown {
            return Err(PopError::Stopped);
        }
        match inner.queue.pop_front() {
            Some(item) => {
                inner.pops += 1;
                drop(inner);
                self.space_cv.notify_one();
                Ok(item)
            }
            // Draining and empty: end of stream.
            None => Err(PopError::Drained),
        }
    }

    /// Pop an item if one is available right now; never blocks.
    ///
    /// A draining buffer still yields its pending items.
    pub fn try_pop(&self) -> Result<T, TryPopError> {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return Err(TryPopError::Stopped);
        }
        match inner.queue.pop_front() {
            Some(item) => {
                inner.pops += 1;
                drop(inner);
                self.space_cv.notify_one();
                Ok(item)
            }
            None => {
                if inner.draining {
                    Err(TryPopError::Drained)
                } else {
                    Err(TryPopError::Empty)
                }
            }
        }
    }

    /// Soft close: refuse further pushes, keep pending items poppable.
    ///
    /// Wakes every blocked waiter. Idempotent.
    pub fn drain(&self) {
        let mut inner = self.inner.lock();
        inner.draining = true;
        drop(inner);
        self.item_cv.notify_all();
        self.space_cv.notify_all();
    }

    /// Hard close: refuse both pushes and pops immediately.
    ///
    /// Wakes every blocked waiter. Idempotent.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        drop(inner);
        self.item_cv.notify_all();
        self.space_cv.notify_all();
    }

    /// Exchange buffered contents (and capacity) with another buffer.
    ///
    /// Both buffers must be quiescent: no thread may be blocked in a push
    /// or pop on either while the swap runs. The two internal mutexes are
    /// taken in address order so concurrent swaps cannot deadlock.
    pub fn swap_data(&self, other: &Buffer<T>) {
        if std::ptr::eq(self, other) {
            return;
        }
        let (first, second) = if (self as *const Buffer<T>) < (other as *const Buffer<T>) {
            (self, other)
        } else {
            (other, self)
        };
        let mut a = first.inner.lock();
        let mut b = second.inner.lock();
        std::mem::swap(&mut a.queue, &mut b.queue);
        std::mem::swap(&mut a.capacity, &mut b.capacity);
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// True if nothing is currently buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Capacity limit, or `None` for an unbounded buffer.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.lock().capacity
    }

    /// Pop-side ordering chosen at construction.
    pub fn order(&self) -> Order {
        self.order
    }

    /// Total number of items ever pushed.
    pub fn pushes(&self) -> u64 {
        self.inner.lock().pushes
    }

    /// Total number of items ever popped.
    pub fn pops(&self) -> u64 {
        self.inner.lock().pops
    }

    /// True once `shutdown` has been invoked.
    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    /// True once `drain` has been invoked.
    pub fn is_draining(&self) -> bool {
        self.inner.lock().draining
    }
}

impl<T> std::fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Buffer")
            .field("len", &inner.queue.len())
            .field("capacity", &inner.capacity)
            .field("order", &self.order)
            .field("draining", &inner.draining)
            .field("shutdown", &inner.shutdown)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
