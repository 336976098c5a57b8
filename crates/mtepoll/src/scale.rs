//! Dynamic thread-pool scaling.
//!
//! Three scale actions: grow-on-stall (a blocked request needs another
//! worker), grow-on-pressure (the work queue backlog needs taskers),
//! and shrink-on-idle (dynamic threads terminate themselves). Growth
//! decisions pre-check outside the scale lock and re-validate inside
//! it; worker_count plus tasker_count never exceeds session_count plus
//! the base set.

use std::sync::atomic::Ordering;

use mtepoll_core::{mtwarn, time};

use crate::group::EpollGroup;
use crate::instance::global_thread_count;

impl EpollGroup {
    /// Called from a point where a request may block; `wait_type` is a
    /// caller-supplied diagnostic carried into the scale log line.
    pub fn try_scale_thread_pool(&'static self, wait_type: i32) {
        let base = self.base_thread_count.load(Ordering::Acquire);
        let thresh = self.config().clamped_thresh(base);
        let prefer = base + self.config().dynamic_threads as i32;

        let mut stalled = self.stall_count.load(Ordering::Acquire);
        let mut workers = self.worker_count.load(Ordering::Acquire);

        // Refresh the hysteresis clock whenever stall pressure exists,
        // so shrink keeps its distance from an active burst.
        if stalled > workers - base + thresh {
            self.last_scale_time
                .store(time::steady_ms(), Ordering::Release);
        } else if workers >= prefer {
            if stalled > workers / 4 {
                self.last_scale_time
                    .store(time::steady_ms(), Ordering::Release);
            }
            return;
        }

        let _lock = self.scale_lock.lock();
        stalled = self.stall_count.load(Ordering::Acquire);
        workers = self.worker_count.load(Ordering::Acquire);

        if workers >= self.sessions.load(Ordering::Acquire) + base {
            if self.config().enable_thread_pool_log {
                mtwarn!(
                    "group {} thread pool scale over limit, worker {} tasker {}, session {}, total threads {}",
                    self.group_id(),
                    workers,
                    self.tasker_count.load(Ordering::Acquire),
                    self.sessions.load(Ordering::Acquire),
                    global_thread_count().load(Ordering::Acquire)
                );
            }
            return; // never more workers than sessions plus base
        }

        let mut scaled = false;
        if stalled > workers - base + thresh {
            // One extra thread to absorb the blocked request.
            self.worker_count.fetch_add(1, Ordering::AcqRel);
            global_thread_count().fetch_add(1, Ordering::AcqRel);
            self.spawn_loop_thread(
                format!("mtepoll-g{}-dyn", self.group_id()),
                999,
                false,
                -1,
                true,
                true,
            );
            scaled = true;
        } else if workers < prefer {
            while self.worker_count.load(Ordering::Acquire) < prefer {
                self.worker_count.fetch_add(1, Ordering::AcqRel);
                global_thread_count().fetch_add(1, Ordering::AcqRel);
                self.spawn_loop_thread(
                    format!("mtepoll-g{}-dyn", self.group_id()),
                    999,
                    false,
                    -1,
                    true,
                    true,
                );
            }
            scaled = true;
        }

        if scaled && self.config().enable_thread_pool_log {
            mtwarn!(
                "group {} thread pool scale to worker {} tasker {}, total threads {}, wait_type {}",
                self.group_id(),
                self.worker_count.load(Ordering::Acquire),
                self.tasker_count.load(Ordering::Acquire),
                global_thread_count().load(Ordering::Acquire),
                wait_type
            );
        }
    }

    /// Explicit back-pressure signal: bypasses the stall thresholds
    /// but still honors the session cap.
    pub fn force_scale_thread_pool(&'static self) {
        self.last_scale_time
            .store(time::steady_ms(), Ordering::Release);

        let _lock = self.scale_lock.lock();
        let base = self.base_thread_count.load(Ordering::Acquire);

        if self.worker_count.load(Ordering::Acquire)
            >= self.sessions.load(Ordering::Acquire) + base
        {
            if self.config().enable_thread_pool_log {
                mtwarn!(
                    "group {} thread pool force scale over limit, worker {} tasker {}, session {}, total threads {}",
                    self.group_id(),
                    self.worker_count.load(Ordering::Acquire),
                    self.tasker_count.load(Ordering::Acquire),
                    self.sessions.load(Ordering::Acquire),
                    global_thread_count().load(Ordering::Acquire)
                );
            }
            return;
        }

        self.worker_count.fetch_add(1, Ordering::AcqRel);
        global_thread_count().fetch_add(1, Ordering::AcqRel);
        self.spawn_loop_thread(
            format!("mtepoll-g{}-dyn", self.group_id()),
            999,
            false,
            -1,
            true,
            true,
        );

        if self.config().enable_thread_pool_log {
            mtwarn!(
                "group {} thread pool force scale to worker {} tasker {}, total threads {}",
                self.group_id(),
                self.worker_count.load(Ordering::Acquire),
                self.tasker_count.load(Ordering::Acquire),
                global_thread_count().load(Ordering::Acquire)
            );
        }
    }

    /// Producer-side check when the queue fills: spawn taskers sized
    /// by the backlog-to-thread ratio.
    pub fn balance_tasker(&'static self) {
        let pending = self.work_queue.len() as i64;
        let capacity = self.work_queue.capacity() as i64;
        let mut workers = self.worker_count.load(Ordering::Acquire) as i64;
        let mut taskers = self.tasker_count.load(Ordering::Acquire) as i64;

        let multiply = self.config().tasker_multiply.max(1) as i64;
        let multiply_low = (multiply / 2).max(1);

        if pending * 2 > capacity || pending > multiply_low * (workers + taskers) {
            self.last_tasker_time
                .store(time::steady_ms(), Ordering::Release);

            if pending * 2 <= capacity && pending <= multiply * (workers + taskers) {
                return; // still under the strict thresholds
            }

            let _lock = self.scale_lock.lock();
            workers = self.worker_count.load(Ordering::Acquire) as i64;
            taskers = self.tasker_count.load(Ordering::Acquire) as i64;
            let sessions = self.sessions.load(Ordering::Acquire) as i64;

            if workers + taskers < sessions && workers + taskers < pending {
                let mut extend = (pending - workers - taskers + multiply - 1) / multiply;
                let step = self.config().tasker_extend_step.max(1) as i64;
                if extend > step {
                    extend = step;
                }

                self.tasker_count.fetch_add(extend as i32, Ordering::AcqRel);
                global_thread_count().fetch_add(extend as i32, Ordering::AcqRel);
                for _ in 0..extend {
                    self.spawn_loop_thread(
                        format!("mtepoll-g{}-tasker", self.group_id()),
                        999,
                        false,
                        -1,
                        self.config().epoll_in_tasker,
                        false,
                    );
                }

                if self.config().enable_thread_pool_log {
                    mtwarn!(
                        "group {} thread pool tasker scale to {}, worker {}, total threads {}",
                        self.group_id(),
                        self.tasker_count.load(Ordering::Acquire),
                        self.worker_count.load(Ordering::Acquire),
                        global_thread_count().load(Ordering::Acquire)
                    );
                }
            }
        }
    }

    /// Once-per-iteration self-check of a dynamic thread; true means
    /// the caller terminates.
    pub(crate) fn shrink_thread_pool(&self, is_worker: bool) -> bool {
        let shrink_time = self.config().dynamic_threads_shrink_time_ms as i64;

        if !is_worker {
            if time::steady_ms() - self.last_tasker_time.load(Ordering::Acquire) <= shrink_time {
                return false;
            }

            self.tasker_count.fetch_sub(1, Ordering::AcqRel);
            global_thread_count().fetch_sub(1, Ordering::AcqRel);

            if self.config().enable_thread_pool_log {
                mtwarn!(
                    "group {} thread pool shrink to worker {} tasker {}, total threads {}",
                    self.group_id(),
                    self.worker_count.load(Ordering::Acquire),
                    self.tasker_count.load(Ordering::Acquire),
                    global_thread_count().load(Ordering::Acquire)
                );
            }
            return true;
        }

        let base = self.base_thread_count.load(Ordering::Acquire);
        let prefer = base + self.config().dynamic_threads as i32;
        let thresh = self.config().clamped_thresh(base);
        let mut stalled = self.stall_count.load(Ordering::Acquire);
        let workers = self.worker_count.load(Ordering::Acquire);

        let mut shrunk = false;
        // Take the lock only when every idle condition already holds.
        if stalled < workers - base + thresh
            && time::steady_ms() - self.last_scale_time.load(Ordering::Acquire) > shrink_time
            && workers > prefer
        {
            let _lock = self.scale_lock.lock();
            stalled = self.stall_count.load(Ordering::Acquire);
            if self.worker_count.load(Ordering::Acquire) > prefer && stalled < prefer - 1 {
                self.worker_count.fetch_sub(1, Ordering::AcqRel);
                global_thread_count().fetch_sub(1, Ordering::AcqRel);
                shrunk = true;

                if self.config().enable_thread_pool_log {
                    mtwarn!(
                        "group {} thread pool shrink to worker {} tasker {}, total threads {}",
                        self.group_id(),
                        self.worker_count.load(Ordering::Acquire),
                        self.tasker_count.load(Ordering::Acquire),
                        global_thread_count().load(Ordering::Acquire)
                    );
                }
            }
        }
        shrunk
    }

    /// Watchdog: true when the queue head has not moved since the
    /// previous call and either the queue is non-empty or nothing is
    /// waiting and the loop has not advanced. Callers force a
    /// scale-out on true.
    pub fn worker_stall_since_last_check(&self) -> bool {
        let head = self.work_queue.head();
        if head != self.last_head.load(Ordering::Relaxed) {
            self.last_head.store(head, Ordering::Relaxed);
            return false;
        }
        // Consumer not moved; anything pending means a real stall.
        let tail = self.work_queue.tail();
        if head != tail {
            return true;
        }
        let loops = self.loop_cnt.load(Ordering::Acquire);
        let waits = self.wait_cnt.load(Ordering::Acquire);
        if waits > 0 {
            self.last_loop.store(loops, Ordering::Relaxed);
            return false;
        }
        if loops != self.last_loop.load(Ordering::Relaxed) {
            self.last_loop.store(loops, Ordering::Relaxed);
            return false;
        }
        true // empty queue but no waiter and no loop progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReactorConfig;
    use mtepoll_core::Task;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    fn scale_config() -> ReactorConfig {
        let mut cfg = ReactorConfig::default();
        cfg.threads_per_group = 2;
        cfg.epoll_timeout_ms = 10;
        cfg.dynamic_threads = 0;
        cfg.thread_scale_thresh = 1;
        cfg.dynamic_threads_shrink_time_ms = 10_000;
        cfg.enable_thread_pool_log = false;
        cfg
    }

    fn started_group(cfg: &ReactorConfig) -> &'static EpollGroup {
        let group = EpollGroup::new(0, cfg, 256).unwrap();
        group.start_threads(cfg.threads_per_group, &[], 0, cfg.threads_per_group as i32, 1);
        group
    }

    fn wait_until(deadline_ms: u64, mut pred: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_millis(deadline_ms);
        while std::time::Instant::now() < deadline {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        pred()
    }

    #[test]
    fn test_scale_up_under_stall() {
        let cfg = scale_config();
        let group = started_group(&cfg);
        group.session_count().store(10, Ordering::Release);

        // Three requests blocked on downstream work.
        for _ in 0..3 {
            group.add_stall_count();
        }

        // base=2, thresh=1, stalled=3: growth adds one worker per call
        // until stalled <= workers - base + thresh.
        for _ in 0..5 {
            group.try_scale_thread_pool(0);
        }
        assert_eq!(group.worker_count(), 4);

        // Converged: further calls change nothing.
        group.try_scale_thread_pool(0);
        assert_eq!(group.worker_count(), 4);
        assert!(
            group.worker_count() + group.tasker_count()
                <= group.session_count().load(Ordering::Acquire) + 2
        );
    }

    #[test]
    fn test_scale_capped_by_sessions() {
        let cfg = scale_config();
        let group = started_group(&cfg);
        // No sessions attributed: the cap is base alone.
        for _ in 0..3 {
            group.add_stall_count();
        }
        group.try_scale_thread_pool(1);
        assert_eq!(group.worker_count(), 2);
    }

    #[test]
    fn test_force_scale_honors_cap() {
        let cfg = scale_config();
        let group = started_group(&cfg);
        group.session_count().store(3, Ordering::Release);

        // Cap is session(3) + base(2); forcing past it is refused.
        for _ in 0..6 {
            group.force_scale_thread_pool();
        }
        assert_eq!(group.worker_count(), 5);
    }

    #[test]
    fn test_shrink_after_idle() {
        let mut cfg = scale_config();
        cfg.dynamic_threads_shrink_time_ms = 50;
        let group = started_group(&cfg);
        group.session_count().store(10, Ordering::Release);

        for _ in 0..3 {
            group.add_stall_count();
        }
        for _ in 0..5 {
            group.try_scale_thread_pool(0);
        }
        assert_eq!(group.worker_count(), 4);

        // Load gone: dynamic workers terminate after the idle window.
        for _ in 0..3 {
            group.sub_stall_count();
        }
        assert!(wait_until(10_000, || group.worker_count() == 2));
        thread::sleep(Duration::from_millis(200));
        // The base set never shrinks.
        assert_eq!(group.worker_count(), 2);
    }

    #[test]
    fn test_balance_tasker_spawns_bounded() {
        let mut cfg = scale_config();
        cfg.tasker_multiply = 3;
        cfg.tasker_extend_step = 2;
        // No base threads: the backlog has no consumer until taskers spawn.
        let group = EpollGroup::new(0, &cfg, 128).unwrap();
        group.session_count().store(100, Ordering::Release);

        for _ in 0..100 {
            group.push_work(Task::from_fn(|| {})).unwrap();
        }

        group.balance_tasker();
        // ceil((100 - 0) / 3) = 34, clamped to the extend step.
        assert_eq!(group.tasker_count(), 2);
        assert_eq!(group.worker_count(), 0);
    }

    #[test]
    fn test_balance_tasker_gated_by_sessions() {
        let mut cfg = scale_config();
        cfg.tasker_multiply = 3;
        let group = EpollGroup::new(0, &cfg, 128).unwrap();

        for _ in 0..10 {
            group.push_work(Task::from_fn(|| {})).unwrap();
        }

        // session_count is zero: pressure exists but no spawn happens.
        group.balance_tasker();
        assert_eq!(group.tasker_count(), 0);
    }

    #[test]
    fn test_tasker_shrinks_after_idle() {
        let mut cfg = scale_config();
        cfg.tasker_multiply = 3;
        cfg.tasker_extend_step = 2;
        cfg.dynamic_threads_shrink_time_ms = 50;
        let group = EpollGroup::new(0, &cfg, 128).unwrap();
        group.session_count().store(100, Ordering::Release);

        for _ in 0..100 {
            group.push_work(Task::from_fn(|| {})).unwrap();
        }
        group.balance_tasker();
        assert_eq!(group.tasker_count(), 2);

        // Taskers drain the backlog, then age out.
        assert!(wait_until(10_000, || group.tasker_count() == 0));
    }

    #[test]
    fn test_watchdog_detects_unconsumed_backlog() {
        let cfg = scale_config();
        // No threads: the backlog can never move.
        let group = EpollGroup::new(0, &cfg, 128).unwrap();

        group.push_work(Task::from_fn(|| {})).unwrap();
        assert!(group.worker_stall_since_last_check());
        assert!(group.worker_stall_since_last_check());
    }

    #[test]
    fn test_watchdog_quiet_when_threads_wait() {
        let cfg = scale_config();
        let group = started_group(&cfg);

        assert!(wait_until(2_000, || group.wait_cnt.load(Ordering::Acquire) > 0));
        assert!(!group.worker_stall_since_last_check());
    }

    #[test]
    fn test_watchdog_resets_on_progress() {
        let cfg = scale_config();
        let group = started_group(&cfg);

        // Consumed work moves the head; the next check observes it.
        group.push_work(Task::from_fn(|| {})).unwrap();
        assert!(wait_until(2_000, || group.work_queue_len() == 0));
        assert!(!group.worker_stall_since_last_check());
    }
}
