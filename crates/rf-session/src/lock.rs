//! Session locks
//!
//! Every application owns one reentrant lock. A mutation touching several
//! applications builds a `LockSet`, which keeps its locks sorted by session
//! order and acquires them in that order, so two threads locking
//! overlapping sets can never deadlock. Guards release on drop, including
//! on early return and panic unwinding.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::Arc;

use rf_core::NodeId;

/// Per-application reentrant lock
#[derive(Debug)]
pub struct SessionLock {
    /// Global acquisition order
    order: u64,
    lock: ReentrantMutex<()>,
}

impl SessionLock {
    pub fn new(app: NodeId) -> Self {
        Self {
            order: app.0,
            lock: ReentrantMutex::new(()),
        }
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    /// Hold the session for a consistent multi-step read or edit
    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }
}

/// Canonically ordered set of session locks
#[derive(Debug, Default)]
pub struct LockSet {
    locks: Vec<Arc<SessionLock>>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a lock, keeping the set sorted and free of duplicates
    pub fn add(&mut self, lock: Arc<SessionLock>) -> &mut Self {
        if let Err(index) = self.locks.binary_search_by_key(&lock.order, |l| l.order) {
            self.locks.insert(index, lock);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Acquisition order
    pub fn orders(&self) -> Vec<u64> {
        self.locks.iter().map(|l| l.order).collect()
    }

    /// Acquire every lock in order
    pub fn acquire(&self) -> LockSetGuard<'_> {
        LockSetGuard {
            _guards: self.locks.iter().map(|l| l.lock()).collect(),
        }
    }
}

/// Holds every lock of a `LockSet` until dropped
#[must_use = "locks are released as soon as the guard is dropped"]
pub struct LockSetGuard<'a> {
    _guards: Vec<ReentrantMutexGuard<'a, ()>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_sorted_and_deduplicated() {
        let a = Arc::new(SessionLock::new(NodeId(7)));
        let b = Arc::new(SessionLock::new(NodeId(3)));
        let mut set = LockSet::new();
        set.add(a.clone()).add(b).add(a);
        assert_eq!(set.orders(), vec![3, 7]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_reentrant() {
        let lock = Arc::new(SessionLock::new(NodeId(1)));
        let mut set = LockSet::new();
        set.add(lock.clone());
        let _outer = lock.lock();
        let _inner = set.acquire();
    }

    #[test]
    fn test_opposite_insertion_orders_do_not_deadlock() {
        let a = Arc::new(SessionLock::new(NodeId(1)));
        let b = Arc::new(SessionLock::new(NodeId(2)));
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let (first, second) = if i % 2 == 0 {
                    (a.clone(), b.clone())
                } else {
                    (b.clone(), a.clone())
                };
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let mut set = LockSet::new();
                        set.add(first.clone()).add(second.clone());
                        let _guard = set.acquire();
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 800);
    }
}
