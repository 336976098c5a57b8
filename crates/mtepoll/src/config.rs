//! Reactor configuration.
//!
//! One `ReactorConfig` is read from the host at singleton init and
//! copied into every group; nothing re-reads the environment after
//! that. All values are clamped to their documented ranges at the
//! point of use, so a config built by hand can hold anything.

use mtepoll_core::env::{env_get, env_get_bool};

pub const MAX_EPOLL_GROUPS: u32 = 128;
pub const MAX_EPOLL_EXTRA_GROUPS: u32 = 32;
pub const MAX_EPOLL_THREADS_PER_GROUP: u32 = 128;
pub const MIN_EPOLL_WAIT_TOTAL_THREADS: u32 = 4;
pub const MAX_EPOLL_WAIT_TOTAL_THREADS: u32 = 128;
pub const MAX_EPOLL_EVENTS_PER_THREAD: u32 = 16;

/// 60s
pub const MAX_EPOLL_TIMEOUT: u32 = 60 * 1000;

pub const MAX_TCP_KEEP_ALIVE: u32 = 7200;
pub const MIN_TCP_LISTEN_QUEUE: u32 = 1;
pub const MAX_TCP_LISTEN_QUEUE: u32 = 4096;

pub const MIN_WORK_QUEUE_CAPACITY: u32 = 128;
pub const MAX_WORK_QUEUE_CAPACITY: u32 = 4096;

/// Compile-time defaults; every one can be overridden by the
/// matching `MTEPOLL_*` environment variable.
pub mod defaults {
    /// Base threads per group.
    pub const THREADS_PER_GROUP: u32 = 4;
    /// 0 = derive group count from cores.
    pub const GROUPS: u32 = 0;
    pub const EXTRA_GROUPS: u32 = 0;
    pub const MIN_AUTO_GROUPS: u32 = 1;
    pub const AUTO_CPU_AFFINITY: bool = false;
    pub const FORCE_ALL_CORES: bool = false;
    /// 0 = every thread may wait on the multiplexer.
    pub const MAX_WAIT_TOTAL_THREADS: u32 = 0;
    pub const WORK_QUEUE_CAPACITY: u32 = 256;
    pub const EVENTS_PER_THREAD: u32 = 4;
    pub const EPOLL_TIMEOUT_MS: u32 = 10_000;
    /// Seconds of keepalive idle; 0 disables keepalive.
    pub const TCP_KEEP_ALIVE: u32 = 30;
    pub const TCP_LISTEN_QUEUE: u32 = 128;
    /// Preferred dynamic workers beyond the base set.
    pub const DYNAMIC_THREADS: u32 = 0;
    pub const THREAD_SCALE_THRESH: u32 = 2;
    pub const DYNAMIC_THREADS_SHRINK_TIME_MS: u64 = 10_000;
    pub const TASKER_MULTIPLY: u32 = 3;
    pub const TASKER_EXTEND_STEP: u32 = 2;
    pub const EPOLL_IN_TASKER: bool = false;
    pub const CTX_REFRESH_TIME_MS: u64 = 10_000;
    /// 10 min lifetime for pooled sessions.
    pub const SHARED_SESSION_LIFETIME_MS: u64 = 600_000;
    pub const ENABLE_THREAD_POOL_LOG: bool = true;
    pub const ENABLE_PERF_HIST: bool = false;
    pub const MCS_SPIN_CNT: u32 = 2000;
}

#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Base threads per group, clamped to 1..=128.
    pub threads_per_group: u32,
    /// Group count; 0 derives it from usable cores.
    pub groups: u32,
    /// Additional groups beyond the derived base, 0..=32.
    pub extra_groups: u32,
    /// Lower bound on the auto-derived group count.
    pub min_auto_groups: u32,
    /// Honor the process affinity mask when counting cores and pinning.
    pub auto_cpu_affinity: bool,
    /// Pin to cores outside the process mask too.
    pub force_all_cores: bool,
    /// Budget of threads allowed inside the multi-event wait;
    /// 0 = all, otherwise clamped to 4..=128 and raised to the group
    /// count.
    pub max_wait_total_threads: u32,
    /// Work queue ring capacity, clamped to 128..=4096.
    pub work_queue_capacity: u32,
    /// Max events returned per wait, clamped to 1..=16.
    pub events_per_thread: u32,
    /// Max wait time in ms, clamped to 1..=60000. Zero would busy-spin
    /// and is disallowed.
    pub epoll_timeout_ms: u32,
    /// TCP keepalive idle seconds; 0 disables, clamped to <=7200.
    pub tcp_keep_alive: u32,
    /// Listen backlog, clamped to 1..=4096.
    pub tcp_listen_queue: u32,
    /// Preferred dynamic workers beyond the base set.
    pub dynamic_threads: u32,
    /// Stall threshold for grow-on-stall, clamped to 0..=base-1.
    pub thread_scale_thresh: u32,
    /// Idle period before a dynamic thread terminates.
    pub dynamic_threads_shrink_time_ms: u64,
    /// Backlog-to-thread ratio for tasker growth.
    pub tasker_multiply: u32,
    /// Taskers added per balance trigger.
    pub tasker_extend_step: u32,
    /// Taskers also wait on the multiplexer instead of the notifier.
    pub epoll_in_tasker: bool,
    /// Cleanup cadence for the reusable-session pool.
    pub ctx_refresh_time_ms: u64,
    /// TTL of pooled sessions.
    pub shared_session_lifetime_ms: u64,
    /// Log scale/shrink/balance events at WARN.
    pub enable_thread_pool_log: bool,
    /// Sample queue-wait latencies into the group histogram.
    pub enable_perf_hist: bool,
    /// Spin attempts between yields while queued on the timer lock.
    pub mcs_spin_cnt: u32,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            threads_per_group: defaults::THREADS_PER_GROUP,
            groups: defaults::GROUPS,
            extra_groups: defaults::EXTRA_GROUPS,
            min_auto_groups: defaults::MIN_AUTO_GROUPS,
            auto_cpu_affinity: defaults::AUTO_CPU_AFFINITY,
            force_all_cores: defaults::FORCE_ALL_CORES,
            max_wait_total_threads: defaults::MAX_WAIT_TOTAL_THREADS,
            work_queue_capacity: defaults::WORK_QUEUE_CAPACITY,
            events_per_thread: defaults::EVENTS_PER_THREAD,
            epoll_timeout_ms: defaults::EPOLL_TIMEOUT_MS,
            tcp_keep_alive: defaults::TCP_KEEP_ALIVE,
            tcp_listen_queue: defaults::TCP_LISTEN_QUEUE,
            dynamic_threads: defaults::DYNAMIC_THREADS,
            thread_scale_thresh: defaults::THREAD_SCALE_THRESH,
            dynamic_threads_shrink_time_ms: defaults::DYNAMIC_THREADS_SHRINK_TIME_MS,
            tasker_multiply: defaults::TASKER_MULTIPLY,
            tasker_extend_step: defaults::TASKER_EXTEND_STEP,
            epoll_in_tasker: defaults::EPOLL_IN_TASKER,
            ctx_refresh_time_ms: defaults::CTX_REFRESH_TIME_MS,
            shared_session_lifetime_ms: defaults::SHARED_SESSION_LIFETIME_MS,
            enable_thread_pool_log: defaults::ENABLE_THREAD_POOL_LOG,
            enable_perf_hist: defaults::ENABLE_PERF_HIST,
            mcs_spin_cnt: defaults::MCS_SPIN_CNT,
        }
    }
}

impl ReactorConfig {
    /// Defaults overridden by `MTEPOLL_*` environment variables, the
    /// host-provided configuration source.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            threads_per_group: env_get("MTEPOLL_THREADS_PER_GROUP", d.threads_per_group),
            groups: env_get("MTEPOLL_GROUPS", d.groups),
            extra_groups: env_get("MTEPOLL_EXTRA_GROUPS", d.extra_groups),
            min_auto_groups: env_get("MTEPOLL_MIN_AUTO_GROUPS", d.min_auto_groups),
            auto_cpu_affinity: env_get_bool("MTEPOLL_AUTO_CPU_AFFINITY", d.auto_cpu_affinity),
            force_all_cores: env_get_bool("MTEPOLL_FORCE_ALL_CORES", d.force_all_cores),
            max_wait_total_threads: env_get(
                "MTEPOLL_MAX_WAIT_TOTAL_THREADS",
                d.max_wait_total_threads,
            ),
            work_queue_capacity: env_get("MTEPOLL_WORK_QUEUE_CAPACITY", d.work_queue_capacity),
            events_per_thread: env_get("MTEPOLL_EVENTS_PER_THREAD", d.events_per_thread),
            epoll_timeout_ms: env_get("MTEPOLL_TIMEOUT_MS", d.epoll_timeout_ms),
            tcp_keep_alive: env_get("MTEPOLL_TCP_KEEP_ALIVE", d.tcp_keep_alive),
            tcp_listen_queue: env_get("MTEPOLL_TCP_LISTEN_QUEUE", d.tcp_listen_queue),
            dynamic_threads: env_get("MTEPOLL_DYNAMIC_THREADS", d.dynamic_threads),
            thread_scale_thresh: env_get("MTEPOLL_THREAD_SCALE_THRESH", d.thread_scale_thresh),
            dynamic_threads_shrink_time_ms: env_get(
                "MTEPOLL_SHRINK_TIME_MS",
                d.dynamic_threads_shrink_time_ms,
            ),
            tasker_multiply: env_get("MTEPOLL_TASKER_MULTIPLY", d.tasker_multiply),
            tasker_extend_step: env_get("MTEPOLL_TASKER_EXTEND_STEP", d.tasker_extend_step),
            epoll_in_tasker: env_get_bool("MTEPOLL_EPOLL_IN_TASKER", d.epoll_in_tasker),
            ctx_refresh_time_ms: env_get("MTEPOLL_CTX_REFRESH_TIME_MS", d.ctx_refresh_time_ms),
            shared_session_lifetime_ms: env_get(
                "MTEPOLL_SHARED_SESSION_LIFETIME_MS",
                d.shared_session_lifetime_ms,
            ),
            enable_thread_pool_log: env_get_bool(
                "MTEPOLL_THREAD_POOL_LOG",
                d.enable_thread_pool_log,
            ),
            enable_perf_hist: env_get_bool("MTEPOLL_PERF_HIST", d.enable_perf_hist),
            mcs_spin_cnt: env_get("MTEPOLL_MCS_SPIN_CNT", d.mcs_spin_cnt),
        }
    }

    /// Stall threshold clamped against the group's base thread count.
    pub(crate) fn clamped_thresh(&self, base_thread_count: i32) -> i32 {
        let thresh = self.thread_scale_thresh as i32;
        if thresh >= base_thread_count {
            (base_thread_count - 1).max(0)
        } else {
            thresh
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_in_range() {
        let c = ReactorConfig::default();
        assert!(c.threads_per_group >= 1 && c.threads_per_group <= MAX_EPOLL_THREADS_PER_GROUP);
        assert!(c.work_queue_capacity >= MIN_WORK_QUEUE_CAPACITY);
        assert!(c.work_queue_capacity <= MAX_WORK_QUEUE_CAPACITY);
        assert!(c.epoll_timeout_ms >= 1 && c.epoll_timeout_ms <= MAX_EPOLL_TIMEOUT);
        assert!(c.tcp_keep_alive <= MAX_TCP_KEEP_ALIVE);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("MTEPOLL_THREADS_PER_GROUP", "9");
        std::env::set_var("MTEPOLL_PERF_HIST", "1");
        let c = ReactorConfig::from_env();
        assert_eq!(c.threads_per_group, 9);
        assert!(c.enable_perf_hist);
        std::env::remove_var("MTEPOLL_THREADS_PER_GROUP");
        std::env::remove_var("MTEPOLL_PERF_HIST");
    }

    #[test]
    fn test_thresh_clamp() {
        let mut c = ReactorConfig::default();
        c.thread_scale_thresh = 100;
        assert_eq!(c.clamped_thresh(4), 3);
        c.thread_scale_thresh = 2;
        assert_eq!(c.clamped_thresh(4), 2);
        // Degenerate group with no base threads never goes negative.
        c.thread_scale_thresh = 5;
        assert_eq!(c.clamped_thresh(0), 0);
    }
}
