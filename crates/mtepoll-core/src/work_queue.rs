//! Bounded MPMC work queue with progress counters.
//!
//! A thin wrapper over `crossbeam_queue::ArrayQueue` that counts
//! successful pushes and pops. The counters are what the watchdog
//! observes: a head (pop counter) that stops moving while the queue is
//! non-empty means no consumer is making progress.

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct WorkQueue<T> {
    ring: ArrayQueue<T>,
    /// Successful pushes, monotonic.
    pushes: AtomicUsize,
    /// Successful pops, monotonic.
    pops: AtomicUsize,
}

impl<T> WorkQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: ArrayQueue::new(capacity),
            pushes: AtomicUsize::new(0),
            pops: AtomicUsize::new(0),
        }
    }

    /// Push one item. Returns the item back when the ring is full.
    pub fn push(&self, item: T) -> std::result::Result<(), T> {
        self.ring.push(item)?;
        self.pushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Pop one item at a time; batching is left to callers so work
    /// spreads across threads.
    pub fn pop(&self) -> Option<T> {
        let item = self.ring.pop()?;
        self.pops.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Consumer progress counter.
    #[inline]
    pub fn head(&self) -> usize {
        self.pops.load(Ordering::Acquire)
    }

    /// Producer progress counter.
    #[inline]
    pub fn tail(&self) -> usize {
        self.pushes.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_push_pop_fifo() {
        let q = WorkQueue::with_capacity(4);
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_full_returns_item() {
        let q = WorkQueue::with_capacity(2);
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.push(3), Err(3));
        assert_eq!(q.len(), 2);
        assert_eq!(q.capacity(), 2);
    }

    #[test]
    fn test_counters_track_progress() {
        let q = WorkQueue::with_capacity(8);
        assert_eq!(q.head(), 0);
        assert_eq!(q.tail(), 0);

        q.push(10).unwrap();
        q.push(11).unwrap();
        assert_eq!(q.tail(), 2);
        assert_eq!(q.head(), 0);

        q.pop().unwrap();
        assert_eq!(q.head(), 1);

        // A failed push moves nothing.
        let small = WorkQueue::with_capacity(1);
        small.push(1).unwrap();
        let _ = small.push(2);
        assert_eq!(small.tail(), 1);
    }

    #[test]
    fn test_concurrent_producers_consumers() {
        let q = Arc::new(WorkQueue::with_capacity(1024));
        let mut handles = vec![];

        for t in 0..4 {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    let mut v = t * 1000 + i;
                    loop {
                        match q.push(v) {
                            Ok(()) => break,
                            Err(back) => v = back,
                        }
                    }
                }
            }));
        }

        let mut popped = 0usize;
        while popped < 800 {
            if q.pop().is_some() {
                popped += 1;
            }
        }
        for h in handles {
            h.join().unwrap();
        }

        assert!(q.is_empty());
        assert_eq!(q.head(), 800);
        assert_eq!(q.tail(), 800);
    }
}
