//! Per-group pool of reusable session-like objects.
//!
//! The session layer parks context objects here instead of rebuilding
//! them per connection. The reactor only consumes one interface from
//! them: their creation time, for TTL eviction. One loop thread per
//! refresh interval walks the pool and drops entries past their
//! lifetime; the pass stops when it sees the first re-enqueued entry
//! again (the ring is FIFO) or exhausts the budget.

use crossbeam_queue::ArrayQueue;

/// Upper bound of pooled entries per group, and the cleanup budget.
pub const BUFFERED_REUSABLE_SESSION_COUNT: usize = 64;

/// The one interface the reactor consumes from pooled objects.
pub trait PooledItem: Send {
    /// Monotonic ms timestamp of creation (`time::steady_ms`).
    fn created_ms(&self) -> i64;
}

pub struct GroupContext {
    reusable_sessions: ArrayQueue<Box<dyn PooledItem>>,
}

impl GroupContext {
    pub fn new() -> Self {
        Self {
            reusable_sessions: ArrayQueue::new(BUFFERED_REUSABLE_SESSION_COUNT),
        }
    }

    /// Take a pooled object, if any.
    pub fn acquire(&self) -> Option<Box<dyn PooledItem>> {
        self.reusable_sessions.pop()
    }

    /// Return an object to the pool. Hands it back when the pool is
    /// full; the caller drops it.
    pub fn release(
        &self,
        item: Box<dyn PooledItem>,
    ) -> Result<(), Box<dyn PooledItem>> {
        self.reusable_sessions.push(item)
    }

    pub fn len(&self) -> usize {
        self.reusable_sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reusable_sessions.is_empty()
    }

    /// Drop entries older than `lifetime_ms`, re-enqueueing the rest.
    /// Called by at most one thread per refresh epoch.
    pub(crate) fn evict_expired(&self, now_ms: i64, lifetime_ms: i64) {
        let mut first: usize = 0;
        for _ in 0..BUFFERED_REUSABLE_SESSION_COUNT {
            let Some(item) = self.reusable_sessions.pop() else {
                break;
            };
            if now_ms - item.created_ms() > lifetime_ms {
                drop(item);
            } else {
                let ptr_val = &*item as *const dyn PooledItem as *const () as usize;
                // Another releaser may have filled the pool meanwhile;
                // losing a cached entry is fine.
                if self.reusable_sessions.push(item).is_err() {
                    break;
                }
                if first == 0 {
                    first = ptr_val;
                } else if ptr_val == first {
                    break; // all checked
                }
            }
        }
    }
}

impl Default for GroupContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSession {
        created: i64,
    }

    impl PooledItem for FakeSession {
        fn created_ms(&self) -> i64 {
            self.created
        }
    }

    #[test]
    fn test_acquire_release_fifo() {
        let ctx = GroupContext::new();
        assert!(ctx.acquire().is_none());

        ctx.release(Box::new(FakeSession { created: 1 })).ok().unwrap();
        ctx.release(Box::new(FakeSession { created: 2 })).ok().unwrap();
        assert_eq!(ctx.len(), 2);

        assert_eq!(ctx.acquire().unwrap().created_ms(), 1);
        assert_eq!(ctx.acquire().unwrap().created_ms(), 2);
    }

    #[test]
    fn test_release_full_pool_returns_item() {
        let ctx = GroupContext::new();
        for i in 0..BUFFERED_REUSABLE_SESSION_COUNT {
            ctx.release(Box::new(FakeSession { created: i as i64 }))
                .ok()
                .unwrap();
        }
        let back = ctx.release(Box::new(FakeSession { created: 999 }));
        assert!(back.is_err());
        assert_eq!(ctx.len(), BUFFERED_REUSABLE_SESSION_COUNT);
    }

    #[test]
    fn test_evict_expired_drops_only_old() {
        let ctx = GroupContext::new();
        ctx.release(Box::new(FakeSession { created: 0 })).ok().unwrap();
        ctx.release(Box::new(FakeSession { created: 900 })).ok().unwrap();
        ctx.release(Box::new(FakeSession { created: 950 })).ok().unwrap();

        // now=1000, lifetime=100: only the first entry is past TTL.
        ctx.evict_expired(1000, 100);
        assert_eq!(ctx.len(), 2);

        ctx.evict_expired(10_000, 100);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_evict_terminates_on_first_reseen() {
        let ctx = GroupContext::new();
        for _ in 0..8 {
            ctx.release(Box::new(FakeSession { created: 0 })).ok().unwrap();
        }
        // Nothing expires; the walk must stop after one full rotation.
        ctx.evict_expired(0, i64::MAX);
        assert_eq!(ctx.len(), 8);
    }
}
