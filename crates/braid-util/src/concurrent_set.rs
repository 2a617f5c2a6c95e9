//! Mutex-wrapped ordered set.
//!
//! The scheduler tracks which nodes are currently running or waiting in
//! sets of handles. Membership changes and membership queries can arrive
//! from any worker thread, so every operation is serialized by a single
//! internal mutex. Bulk iteration is done through [`ConcurrentSet::with_lock`],
//! which runs a closure over the underlying set while the lock is held --
//! callers snapshot the handles they care about and act on them after
//! releasing the lock.

use std::collections::BTreeSet;

use parking_lot::Mutex;

/// A thread-safe ordered set of keys.
pub struct ConcurrentSet<K> {
    inner: Mutex<BTreeSet<K>>,
}

impl<K: Ord> ConcurrentSet<K> {
    /// Create an empty set.
    pub fn new() -> Self {
        ConcurrentSet {
            inner: Mutex::new(BTreeSet::new()),
        }
    }

    /// Insert a key. Returns `false` if it was already present.
    pub fn insert(&self, key: K) -> bool {
        self.inner.lock().insert(key)
    }

    /// Remove a key. Returns `true` if it was present.
    pub fn remove(&self, key: &K) -> bool {
        self.inner.lock().remove(key)
    }

    /// Remove a key and hand it back, if present.
    pub fn extract(&self, key: &K) -> Option<K> {
        self.inner.lock().take(key)
    }

    /// Check membership.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    /// Number of keys in the set.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True if the set holds no keys.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Remove every key.
    pub fn clear(&self) {
        self.inner.lock().clear()
    }

    /// Exchange contents with another set.
    ///
    /// Locks both sets, in address order so concurrent swaps cannot
    /// deadlock.
    pub fn swap(&self, other: &ConcurrentSet<K>) {
        if std::ptr::eq(self, other) {
            return;
        }
        let (first, second) =
            if (self as *const ConcurrentSet<K>) < (other as *const ConcurrentSet<K>) {
                (self, other)
            } else {
                (other, self)
            };
        let mut a = first.inner.lock();
        let mut b = second.inner.lock();
        std::mem::swap(&mut *a, &mut *b);
    }

    /// Run `f` over the underlying set while holding its lock.
    ///
    /// This is the only way to iterate: the closure snapshots or mutates
    /// in place, and the lock is released when it returns. The closure
    /// must not touch this set re-entrantly.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut BTreeSet<K>) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<K: Ord> Default for ConcurrentSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for ConcurrentSet<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.inner.lock().len();
        f.debug_struct("ConcurrentSet").field("len", &len).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_insert_contains_remove() {
        let set = ConcurrentSet::new();
        assert!(set.insert(3));
        assert!(set.insert(1));
        assert!(!set.insert(3));

        assert!(set.contains(&1));
        assert!(set.contains(&3));
        assert!(!set.contains(&2));
        assert_eq!(set.len(), 2);

        assert!(set.remove(&1));
        assert!(!set.remove(&1));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_extract_returns_key() {
        let set = ConcurrentSet::new();
        set.insert("a");
        assert_eq!(set.extract(&"a"), Some("a"));
        assert_eq!(set.extract(&"a"), None);
        assert!(set.is_empty());
    }

    #[test]
    fn test_clear() {
        let set = ConcurrentSet::new();
        for i in 0..10 {
            set.insert(i);
        }
        set.clear();
        assert!(set.is_empty());
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_swap() {
        let a = ConcurrentSet::new();
        let b = ConcurrentSet::new();
        a.insert(1);
        a.insert(2);
        b.insert(9);

        a.swap(&b);

        assert_eq!(a.len(), 1);
        assert!(a.contains(&9));
        assert_eq!(b.len(), 2);
        assert!(b.contains(&1) && b.contains(&2));
    }

    #[test]
    fn test_with_lock_snapshot() {
        let set = ConcurrentSet::new();
        for i in 0..5 {
            set.insert(i);
        }
        let even: Vec<i32> =
            set.with_lock(|s| s.iter().copied().filter(|k| k % 2 == 0).collect());
        assert_eq!(even, vec![0, 2, 4]);
        // Snapshot did not mutate.
        assert_eq!(set.len(), 5);
    }

    #[test]
    fn test_ordered_iteration() {
        let set = ConcurrentSet::new();
        for k in [5, 1, 4, 2, 3] {
            set.insert(k);
        }
        let keys: Vec<i32> = set.with_lock(|s| s.iter().copied().collect());
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_concurrent_inserts() {
        let set = Arc::new(ConcurrentSet::new());
        let threads = 8;
        let per_thread = 100;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let set = Arc::clone(&set);
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        set.insert(t * per_thread + i);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(set.len(), (threads * per_thread) as usize);
    }
}
