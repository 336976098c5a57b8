//! # mtepoll-core
//!
//! Core types and primitives for the mtepoll reactor.
//!
//! This crate holds everything that does not touch the OS directly:
//! the deferred-work `Task` type, the per-descriptor callback trait,
//! the MCS spinlock guarding each group's timer heap, the timer heap
//! itself, the counted work queue, and small utilities (monotonic
//! clock, env-var parsing, leveled logging, latency histogram).
//!
//! The Linux reactor built on top of these lives in the `mtepoll`
//! crate.
//!
//! ## Modules
//!
//! - `task` - deferred work unit with run + finalize actions
//! - `callback` - per-descriptor event callback trait
//! - `error` - error types
//! - `spinlock` - MCS queue spinlock with try-lock
//! - `timer_heap` - min-heap of tasks keyed by trigger time
//! - `work_queue` - bounded MPMC ring with progress counters
//! - `time` - monotonic clock helpers
//! - `env` - environment variable utilities
//! - `log` - leveled stderr logging macros
//! - `hist` - queue-wait latency histogram

pub mod callback;
pub mod env;
pub mod error;
pub mod hist;
pub mod log;
pub mod spinlock;
pub mod task;
pub mod time;
pub mod timer_heap;
pub mod work_queue;

// Re-exports for convenience
pub use callback::EpollCallback;
pub use error::{ReactorError, Result};
pub use hist::{HistSnapshot, QueueWaitHist};
pub use spinlock::{McsLock, McsNode};
pub use task::Task;
pub use timer_heap::TimerHeap;
pub use work_queue::WorkQueue;
