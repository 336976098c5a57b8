//! # mtepoll
//!
//! Multi-group, multi-threaded epoll reactor: the I/O core of the RPC
//! front-end. Each group owns an epoll instance, an eventfd wake
//! channel, a lock-free work queue, a timer heap and a thread pool
//! that grows under stall or backlog pressure and shrinks when idle.
//!
//! ```text
//! readiness ──► multiplexer wake ──► callback dispatch
//!                     ▲                    │
//!                notifier wake        push_work / push_trigger
//!                     │                    ▼
//!                producers ◄──── worker executes tasks
//! ```
//!
//! Linux only: the core assumes an edge-triggered readiness primitive
//! and an eventfd-style notifier descriptor.
//!
//! ## Entry points
//!
//! - [`get_instance`] - lazily build all groups from host variables
//! - [`EpollGroup::add_fd`] / [`EpollGroup::listen_port`] - register
//!   descriptors with their callbacks
//! - [`EpollGroup::push_work`] / [`EpollGroup::push_trigger`] - feed
//!   deferred and timed tasks

pub mod config;
pub mod cpu;
pub mod epoll;
pub mod group;
pub mod group_ctx;
pub mod hooks;
pub mod instance;
pub mod notifier;
mod scale;
pub mod sock;

// Re-exports for convenience
pub use config::ReactorConfig;
pub use group::{AddFdError, CallbackToken, EpollGroup};
pub use group_ctx::{GroupContext, PooledItem, BUFFERED_REUSABLE_SESSION_COUNT};
pub use hooks::{set_thread_hooks, ThreadHooks};
pub use instance::{get_instance, global_thread_count, init_with, GroupPlan};
pub use sock::check_port;

pub use mtepoll_core::{EpollCallback, ReactorError, Result, Task};
