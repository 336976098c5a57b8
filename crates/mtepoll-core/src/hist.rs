//! Queue-wait latency histogram.
//!
//! Workers sample the time a task spent between push and pop when
//! `enable_perf_hist` is set. Buckets are powers of two in
//! nanoseconds; updates are relaxed atomics so sampling stays off the
//! hot path's ordering.

use std::sync::atomic::{AtomicU64, Ordering};

const BUCKETS: usize = 40;

pub struct QueueWaitHist {
    buckets: [AtomicU64; BUCKETS],
    samples: AtomicU64,
    total_ns: AtomicU64,
}

impl QueueWaitHist {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            samples: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
        }
    }

    /// Record one queue-wait of `ns` nanoseconds.
    pub fn observe_ns(&self, ns: u64) {
        let bucket = if ns == 0 {
            0
        } else {
            ((64 - ns.leading_zeros()) as usize).min(BUCKETS - 1)
        };
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistSnapshot {
        let mut buckets = [0u64; BUCKETS];
        for (i, b) in self.buckets.iter().enumerate() {
            buckets[i] = b.load(Ordering::Relaxed);
        }
        HistSnapshot {
            buckets,
            samples: self.samples.load(Ordering::Relaxed),
            total_ns: self.total_ns.load(Ordering::Relaxed),
        }
    }
}

impl Default for QueueWaitHist {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
pub struct HistSnapshot {
    /// Bucket `i` counts waits in `[2^(i-1), 2^i)` ns; bucket 0 is zero-wait.
    pub buckets: [u64; BUCKETS],
    pub samples: u64,
    pub total_ns: u64,
}

impl HistSnapshot {
    /// Mean wait in nanoseconds, zero when no samples.
    pub fn mean_ns(&self) -> u64 {
        if self.samples == 0 {
            0
        } else {
            self.total_ns / self.samples
        }
    }
}

impl std::fmt::Debug for HistSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "samples={} mean_ns={}", self.samples, self.mean_ns())
    }
}
