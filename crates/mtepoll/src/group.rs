//! # EpollGroup — one independent reactor unit
//!
//! A group owns its multiplexer, notifier, work queue, timer heap and
//! thread pool. Groups share nothing but the process-wide thread
//! counter; connections are attributed to exactly one group.
//!
//! Per-thread flow: drain the work queue, maybe shrink, compute the
//! wait timeout (shortened under the earliest timer), publish wait
//! intent, wait, batch-prepare events, run due timers, dispatch, and
//! occasionally sweep the reusable-session pool.
//!
//! Groups are created leaked: they live for the whole process and are
//! never destroyed, so every loop thread can hold `&'static` to its
//! group without reference counting.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicIsize, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::thread;

use parking_lot::Mutex;

use mtepoll_core::{
    mtdebug, mterror, mtwarn, time, EpollCallback, McsLock, McsNode, QueueWaitHist, ReactorError,
    Result, Task, TimerHeap, WorkQueue,
};

use crate::config::{
    ReactorConfig, MAX_EPOLL_EVENTS_PER_THREAD, MAX_EPOLL_TIMEOUT, MAX_TCP_KEEP_ALIVE,
    MAX_TCP_LISTEN_QUEUE, MIN_TCP_LISTEN_QUEUE,
};
use crate::cpu::{self, CpuInfo, CpuSet};
use crate::epoll::Epoll;
use crate::group_ctx::GroupContext;
use crate::hooks;
use crate::instance;
use crate::notifier::Notifier;
use crate::sock;

/// Opaque handle to a registered callback, returned by `add_fd` and
/// `reset_fd`. The caller keeps it to re-arm a registration's mask
/// via `rearm_fd` or to reclaim ownership after deregistering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackToken(u64);

/// Registration failure: the errno plus the callback handed back, since
/// ownership is not taken on failure.
pub struct AddFdError {
    pub errno: i32,
    pub cb: Box<dyn EpollCallback>,
}

impl std::fmt::Debug for AddFdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AddFdError(errno {})", self.errno)
    }
}

/// Affinity of a group's base threads, fixed once they are started.
pub(crate) struct GroupAffinity {
    pub(crate) enabled: bool,
    pub(crate) set: CpuSet,
    pub(crate) cores_str: String,
}

pub struct EpollGroup {
    group_id: u32,
    config: ReactorConfig,

    /// base epoll object
    epoll: Epoll,

    /// timer tasks
    timer: McsLock<TimerHeap<Task>>,

    /// work queue and its wake channel
    notifier: Notifier,
    pub(crate) work_queue: WorkQueue<Task>,
    hist: QueueWaitHist,

    /// worker wait counters
    pub(crate) wait_cnt: AtomicIsize,
    pub(crate) loop_cnt: AtomicIsize,

    /// extra per-group context
    ctx: GroupContext,
    last_cleanup: AtomicI64,

    /// affinity for dynamic threads
    affinity: OnceLock<GroupAffinity>,

    /// dynamic thread-pool scale state
    pub(crate) base_thread_count: AtomicI32,
    pub(crate) stall_count: AtomicI32,
    /// threads that also wait on the multiplexer
    pub(crate) worker_count: AtomicI32,
    /// threads that only poll the work queue
    pub(crate) tasker_count: AtomicI32,
    pub(crate) last_scale_time: AtomicI64,
    pub(crate) last_tasker_time: AtomicI64,
    pub(crate) scale_lock: Mutex<()>,
    /// connections attributed to this group
    pub(crate) sessions: AtomicI32,

    /// watchdog progress snapshots
    pub(crate) last_head: AtomicUsize,
    pub(crate) last_loop: AtomicIsize,
}

impl EpollGroup {
    /// Build a group: multiplexer, notifier, edge-triggered notifier
    /// registration. The group is leaked; it lives until process exit.
    pub fn new(
        group_id: u32,
        config: &ReactorConfig,
        work_queue_capacity: usize,
    ) -> Result<&'static Self> {
        let epoll = Epoll::create()?;
        let notifier = Notifier::create()?;
        epoll
            .add(
                notifier.fd(),
                (libc::EPOLLIN | libc::EPOLLET) as u32,
                notifier.fd() as u64,
            )
            .map_err(ReactorError::SystemInit)?;

        Ok(Box::leak(Box::new(Self {
            group_id,
            config: config.clone(),
            epoll,
            timer: McsLock::new(TimerHeap::new()),
            notifier,
            work_queue: WorkQueue::with_capacity(work_queue_capacity),
            hist: QueueWaitHist::new(),
            wait_cnt: AtomicIsize::new(0),
            loop_cnt: AtomicIsize::new(0),
            ctx: GroupContext::new(),
            last_cleanup: AtomicI64::new(0),
            affinity: OnceLock::new(),
            base_thread_count: AtomicI32::new(0),
            stall_count: AtomicI32::new(0),
            worker_count: AtomicI32::new(0),
            tasker_count: AtomicI32::new(0),
            last_scale_time: AtomicI64::new(0),
            last_tasker_time: AtomicI64::new(0),
            scale_lock: Mutex::new(()),
            sessions: AtomicI32::new(0),
            last_head: AtomicUsize::new(0),
            last_loop: AtomicIsize::new(0),
        })))
    }

    #[inline]
    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    #[inline]
    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    #[inline]
    pub fn group_ctx(&self) -> &GroupContext {
        &self.ctx
    }

    #[inline]
    pub fn work_queue_hist(&self) -> &QueueWaitHist {
        &self.hist
    }

    #[inline]
    pub fn work_queue_len(&self) -> usize {
        self.work_queue.len()
    }

    /// Connections attributed to this group; the session layer
    /// maintains it and the scale cap reads it.
    #[inline]
    pub fn session_count(&self) -> &AtomicI32 {
        &self.sessions
    }

    #[inline]
    pub fn worker_count(&self) -> i32 {
        self.worker_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn tasker_count(&self) -> i32 {
        self.tasker_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn add_stall_count(&self) {
        self.stall_count.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn sub_stall_count(&self) {
        self.stall_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Diagnostic: total notifier wake writes.
    #[inline]
    pub fn notifier_writes(&self) -> u64 {
        self.notifier.write_count()
    }

    /// Register a descriptor with its callback. On success ownership
    /// of the callback passes to the reactor until `events` returns
    /// false; the returned token lets the caller re-point or reclaim
    /// the registration. On failure the callback comes back inside the
    /// error.
    pub fn add_fd(
        &self,
        fd: RawFd,
        events: u32,
        mut cb: Box<dyn EpollCallback>,
        is_tcp: bool,
    ) -> std::result::Result<CallbackToken, AddFdError> {
        if let Err(errno) = sock::set_nonblock(fd, true) {
            return Err(AddFdError { errno, cb });
        }
        if is_tcp {
            if let Err(errno) = sock::set_nodelay(fd, true) {
                return Err(AddFdError { errno, cb });
            }
            let keep_alive = self.config.tcp_keep_alive.min(MAX_TCP_KEEP_ALIVE);
            if keep_alive > 0 {
                if let Err(errno) = sock::set_keepalive(fd, true, keep_alive) {
                    return Err(AddFdError { errno, cb });
                }
            }
        }

        cb.set_fd(fd);
        let raw = Box::into_raw(Box::new(cb));
        mtdebug!("epoll add fd {}", fd);
        match self.epoll.add(fd, events, raw as u64) {
            Ok(()) => {
                unsafe { (*raw).fd_registered() };
                Ok(CallbackToken(raw as u64))
            }
            Err(errno) => {
                mtdebug!("epoll add fd {} failed, errno {}", fd, errno);
                let cb = *unsafe { Box::from_raw(raw) };
                Err(AddFdError { errno, cb })
            }
        }
    }

    /// Swap the callback payload (and event mask) of a registered
    /// descriptor. The previous callback is not touched: it stays
    /// alive under the token its own registration returned, and the
    /// caller reclaims it with [`reclaim_callback`] once no dispatch
    /// can reach it. On failure the new callback comes back inside
    /// the error and the registration is unchanged.
    ///
    /// [`reclaim_callback`]: Self::reclaim_callback
    pub fn reset_fd(
        &self,
        fd: RawFd,
        events: u32,
        cb: Box<dyn EpollCallback>,
    ) -> std::result::Result<CallbackToken, AddFdError> {
        let raw = Box::into_raw(Box::new(cb));
        mtdebug!("epoll mod fd {}", fd);
        match self.epoll.modify(fd, events, raw as u64) {
            Ok(()) => Ok(CallbackToken(raw as u64)),
            Err(errno) => {
                mtdebug!("epoll mod fd {} failed, errno {}", fd, errno);
                let cb = *unsafe { Box::from_raw(raw) };
                Err(AddFdError { errno, cb })
            }
        }
    }

    /// Re-arm the event mask of a registered descriptor, keeping its
    /// current callback payload.
    pub fn rearm_fd(
        &self,
        fd: RawFd,
        events: u32,
        token: CallbackToken,
    ) -> std::result::Result<(), i32> {
        mtdebug!("epoll rearm fd {}", fd);
        self.epoll.modify(fd, events, token.0)
    }

    /// Remove a registered descriptor. The callback is not touched;
    /// pair with [`reclaim_callback`] to destroy it outside the event
    /// path.
    ///
    /// [`reclaim_callback`]: Self::reclaim_callback
    pub fn del_fd(&self, fd: RawFd) -> std::result::Result<(), i32> {
        mtdebug!("epoll del fd {}", fd);
        self.epoll.del(fd)
    }

    /// Take back ownership of a callback after its descriptor was
    /// removed with `del_fd`.
    ///
    /// # Safety
    ///
    /// The token must come from `add_fd` on this group, the descriptor
    /// must be deregistered, no dispatch may be in flight for it, and
    /// the token must not be used again.
    pub unsafe fn reclaim_callback(&self, token: CallbackToken) -> Box<dyn EpollCallback> {
        *Box::from_raw(token.0 as usize as *mut Box<dyn EpollCallback>)
    }

    /// Create a TCP listener on `INADDR_ANY:port` and register it
    /// edge-triggered readable. Returns the listening fd and the
    /// callback token.
    pub fn listen_port(
        &self,
        port: u16,
        cb: Box<dyn EpollCallback>,
        reuse_port: bool,
    ) -> std::result::Result<(RawFd, CallbackToken), AddFdError> {
        let backlog = self
            .config
            .tcp_listen_queue
            .clamp(MIN_TCP_LISTEN_QUEUE, MAX_TCP_LISTEN_QUEUE);
        let fd = match sock::listen_socket(port, reuse_port, backlog) {
            Ok(fd) => fd,
            Err(errno) => return Err(AddFdError { errno, cb }),
        };
        match self.add_fd(fd, (libc::EPOLLIN | libc::EPOLLET) as u32, cb, true) {
            Ok(token) => Ok((fd, token)),
            Err(e) => {
                unsafe { libc::close(fd) };
                Err(e)
            }
        }
    }

    /// Push a deferred task. When the ring is full the task comes back
    /// and nothing is written to the notifier; the producer decides
    /// whether to retry, drop or apply flow control.
    pub fn push_work(&self, task: Task) -> std::result::Result<(), Task> {
        self.work_queue.push(task)?;

        // Read-modify-write so the successful push is ordered before
        // the wait-counter observation; a spurious wake costs one loop,
        // a missed wake would cost a whole timeout.
        let waiting = self.wait_cnt.fetch_add(0, Ordering::AcqRel);
        if waiting > 0 {
            self.notifier.notify();
        }
        Ok(())
    }

    /// Arm a timer task at an absolute trigger time (`time::steady_ms`
    /// domain). Wakes a waiter whenever the new entry is at least as
    /// early as the previous head, so a thread sitting in a longer
    /// wait re-computes its timeout; with an empty heap the sentinel
    /// makes that always true.
    pub fn push_trigger(&self, task: Task, trigger_time_ms: i64) {
        let mut node = McsNode::new();
        let mut heap = self.timer.lock(&mut node, self.config.mcs_spin_cnt.max(1));
        let last_time = heap.peek().unwrap_or(trigger_time_ms + 1);
        heap.push(task, trigger_time_ms, 0);
        drop(heap);

        if last_time - trigger_time_ms >= 0 {
            self.notifier.notify();
        }
    }

    /// Spawn the base thread set. `affinities` is the process-wide
    /// pinning plan; this group's slice starts at `base_idx`. Waiter
    /// threads are the first `wait_threads` whose local index lands on
    /// the gap grid.
    pub(crate) fn start_threads(
        &'static self,
        threads: u32,
        affinities: &[CpuInfo],
        base_idx: usize,
        mut wait_threads: i32,
        wait_gap: u32,
    ) {
        self.base_thread_count.store(threads as i32, Ordering::Release);
        self.worker_count.store(threads as i32, Ordering::Release);
        instance::global_thread_count().fetch_add(threads as i32, Ordering::AcqRel);

        let wait_gap = wait_gap.max(1);
        let mut set = CpuSet::new();
        let mut with_affinity = true;
        let mut cores = Vec::new();
        let mut plan = Vec::with_capacity(threads as usize);

        for thread_id in 0..threads {
            let affinity = affinities
                .get(base_idx + thread_id as usize)
                .map(|c| c.processor)
                .unwrap_or(-1);
            let is_wait = thread_id % wait_gap == 0 && {
                wait_threads -= 1;
                wait_threads >= 0
            };
            if affinity < 0 {
                with_affinity = false;
            } else if !set.is_set(affinity as usize) {
                set.set(affinity as usize);
                cores.push(affinity);
            }
            plan.push((thread_id, affinity, is_wait));
        }

        let _ = self.affinity.set(GroupAffinity {
            enabled: with_affinity,
            set,
            cores_str: format!("{:?}", cores),
        });

        for (thread_id, affinity, is_wait) in plan {
            self.spawn_loop_thread(
                format!("mtepoll-g{}-t{}", self.group_id, thread_id),
                thread_id,
                true,
                affinity,
                is_wait,
                true,
            );
        }
    }

    pub(crate) fn spawn_loop_thread(
        &'static self,
        name: String,
        thread_id: u32,
        base_thread: bool,
        affinity: i32,
        epoll_wait: bool,
        is_worker: bool,
    ) {
        let group: &'static EpollGroup = self;
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                group.run_loop(thread_id, base_thread, affinity, epoll_wait, is_worker)
            })
            .expect("failed to spawn reactor thread");
    }

    /// The per-thread heart. Base threads never leave; dynamic threads
    /// leave when the shrink check says so.
    pub(crate) fn run_loop(
        &'static self,
        thread_id: u32,
        base_thread: bool,
        affinity: i32,
        epoll_wait: bool,
        is_worker: bool,
    ) {
        self.bind_thread(thread_id, base_thread, affinity, epoll_wait);
        hooks::thread_init();

        let mut events: [libc::epoll_event; MAX_EPOLL_EVENTS_PER_THREAD as usize] =
            unsafe { std::mem::zeroed() };
        let mut timer_tasks: Vec<Task> = Vec::new();
        let mut timer_node = McsNode::new();
        let notifier_payload = self.notifier.fd() as u64;

        loop {
            // Pop one task at a time so work spreads across threads.
            loop {
                let start_ns = if self.config.enable_perf_hist {
                    time::steady_ns()
                } else {
                    0
                };
                let popped = self.work_queue.pop();
                if start_ns != 0 {
                    self.hist.observe_ns((time::steady_ns() - start_ns) as u64);
                }
                let Some(task) = popped else { break };
                run_task(task);
            }

            if !base_thread && self.shrink_thread_pool(is_worker) {
                break;
            }

            let max_events = self
                .config
                .events_per_thread
                .clamp(1, MAX_EPOLL_EVENTS_PER_THREAD) as usize;
            // Zero would busy-spin; clamp from 1 up.
            let mut timeout = self.config.epoll_timeout_ms.clamp(1, MAX_EPOLL_TIMEOUT) as i64;

            // One thread with the correct timer-adjusted timeout is
            // enough; losers of the race keep the full timeout.
            if let Some(heap) = self.timer.try_lock(&mut timer_node) {
                if let Some(next_trigger) = heap.peek() {
                    let now = time::steady_ms();
                    if next_trigger - now > 0 {
                        timeout = timeout.min(next_trigger - now);
                    } else {
                        timeout = 0;
                    }
                }
                drop(heap);
            }

            self.wait_cnt.fetch_add(1, Ordering::Release);
            if !self.work_queue.is_empty() {
                // A push landed between the drain and the wait intent;
                // deal with it instead of sleeping on it.
                self.wait_cnt.fetch_sub(1, Ordering::Release);
                continue;
            }

            let n = if epoll_wait {
                self.epoll
                    .wait(&mut events[..max_events], timeout as i32)
                    .unwrap_or(0)
            } else {
                // Non-waiter threads only watch the notifier.
                let mut pfd = libc::pollfd {
                    fd: self.notifier.fd(),
                    events: libc::POLLIN,
                    revents: 0,
                };
                let r = unsafe { libc::poll(&mut pfd, 1, timeout as i32) };
                if r > 0 {
                    events[0] = libc::epoll_event {
                        events: libc::EPOLLIN as u32,
                        u64: notifier_payload,
                    };
                    1
                } else {
                    0
                }
            };

            self.loop_cnt.fetch_add(1, Ordering::Relaxed);
            self.wait_cnt.fetch_sub(1, Ordering::Release);

            // First pass: drain the notifier as soon as possible so
            // further pushes re-arm it for other threads, and let every
            // callback of the batch add its references before any
            // dispatch.
            let mut total = 0usize;
            for ev in events[..n].iter() {
                if ev.u64 == notifier_payload {
                    self.notifier.drain();
                    mtdebug!("thread {}:{} notified work", self.group_id, thread_id);
                } else {
                    let cb = unsafe { &mut **(ev.u64 as usize as *mut Box<dyn EpollCallback>) };
                    cb.pre_events();
                    total += 1;
                }
            }

            // Run due timers before event dispatch; whichever thread
            // wins the try-lock pops everything due, releases, then
            // executes outside the lock. Losers skip this tick.
            if let Some(mut heap) = self.timer.try_lock(&mut timer_node) {
                timer_tasks.clear();
                let now = time::steady_ms();
                while let Some((task, _id, _kind)) = heap.pop_due(now) {
                    timer_tasks.push(task);
                }
                drop(heap);

                for task in timer_tasks.drain(..) {
                    run_task(task);
                }
            }

            let mut index = 0usize;
            for ev in events[..n].iter() {
                if ev.u64 == notifier_payload {
                    continue;
                }
                let raw = ev.u64 as usize as *mut Box<dyn EpollCallback>;
                let alive = unsafe { (*raw).events(ev.events, index, total) };
                if !alive {
                    // The callback chose termination; the registration
                    // dies with it.
                    drop(unsafe { Box::from_raw(raw) });
                }
                index += 1;
            }

            // Sweep the reusable-session pool at most once per refresh
            // interval, from whichever thread wins the CAS.
            let last_time = self.last_cleanup.load(Ordering::Relaxed);
            let now = time::steady_ms();
            if now - last_time > self.config.ctx_refresh_time_ms as i64 {
                if self
                    .last_cleanup
                    .compare_exchange(last_time, now, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    self.ctx
                        .evict_expired(now, self.config.shared_session_lifetime_ms as i64);
                }
            }
        }

        hooks::thread_deinit();
    }

    fn bind_thread(&self, thread_id: u32, base_thread: bool, affinity: i32, epoll_wait: bool) {
        if affinity >= 0 {
            let allowed = cpu::current_affinity()
                .map(|m| m.is_set(affinity as usize))
                .unwrap_or(false);
            // Only bind when this thread may run there, unless forced.
            if allowed || self.config.force_all_cores {
                match cpu::pin_current_thread(affinity) {
                    Ok(()) => mtwarn!(
                        "start worker thread {}:{}({},{}) bind to core {}",
                        self.group_id,
                        thread_id,
                        base_thread as u8,
                        epoll_wait as u8,
                        affinity
                    ),
                    Err(e) => mtwarn!(
                        "start worker thread {}:{}({},{}) bind to core {} failed, errno {}",
                        self.group_id,
                        thread_id,
                        base_thread as u8,
                        epoll_wait as u8,
                        affinity,
                        e
                    ),
                }
            }
        } else if !base_thread {
            if let Some(aff) = self.affinity.get() {
                if aff.enabled {
                    match cpu::pin_current_thread_to_set(&aff.set) {
                        Ok(()) => mtwarn!(
                            "start dynamic worker thread {}:{}({},{}) bind to cores {}",
                            self.group_id,
                            thread_id,
                            base_thread as u8,
                            epoll_wait as u8,
                            aff.cores_str
                        ),
                        Err(e) => mtwarn!(
                            "start dynamic worker thread {}:{}({},{}) bind to cores {} failed, errno {}",
                            self.group_id,
                            thread_id,
                            base_thread as u8,
                            epoll_wait as u8,
                            aff.cores_str,
                            e
                        ),
                    }
                }
            }
        }
    }
}

/// Execute one task, keeping the loop thread alive across panics.
fn run_task(task: Task) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.execute()));
    if result.is_err() {
        mterror!("task panicked in reactor thread");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::IntoRawFd;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_config() -> ReactorConfig {
        let mut cfg = ReactorConfig::default();
        cfg.threads_per_group = 2;
        cfg.epoll_timeout_ms = 10;
        cfg.tcp_keep_alive = 0;
        cfg.enable_thread_pool_log = false;
        cfg.dynamic_threads_shrink_time_ms = 50;
        cfg
    }

    fn started_group(cfg: &ReactorConfig, threads: u32) -> &'static EpollGroup {
        let group = EpollGroup::new(0, cfg, 256).unwrap();
        group.start_threads(threads, &[], 0, threads as i32, 1);
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
    fn test_wake_coalescing_all_tasks_consumed() {
        let cfg = test_config();
        let group = started_group(&cfg, 2);

        let ran = Arc::new(AtomicUsize::new(0));
        let finalized = Arc::new(AtomicUsize::new(0));

        for _ in 0..1000 {
            let r = ran.clone();
            let f = finalized.clone();
            let mut task = Task::new(
                move || {
                    r.fetch_add(1, Ordering::SeqCst);
                },
                move || {
                    f.fetch_add(1, Ordering::SeqCst);
                },
            );
            // The ring is smaller than the burst; retry on back-pressure.
            loop {
                match group.push_work(task) {
                    Ok(()) => break,
                    Err(back) => {
                        task = back;
                        thread::yield_now();
                    }
                }
            }
        }

        assert!(wait_until(10_000, || {
            ran.load(Ordering::SeqCst) == 1000 && finalized.load(Ordering::SeqCst) == 1000
        }));
        assert_eq!(group.work_queue_len(), 0);
        // Wakes coalesce: never more writes than successful pushes.
        assert!(group.notifier_writes() <= 1000);
    }

    #[test]
    fn test_no_lost_task_with_many_producers() {
        let cfg = test_config();
        let group = started_group(&cfg, 2);
        let ran = Arc::new(AtomicUsize::new(0));

        let mut producers = Vec::new();
        for _ in 0..4 {
            let ran = ran.clone();
            producers.push(thread::spawn(move || {
                for _ in 0..250 {
                    let r = ran.clone();
                    let mut task = Task::from_fn(move || {
                        r.fetch_add(1, Ordering::SeqCst);
                    });
                    loop {
                        match group.push_work(task) {
                            Ok(()) => break,
                            Err(back) => {
                                task = back;
                                thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }
        for p in producers {
            p.join().unwrap();
        }

        assert!(wait_until(10_000, || ran.load(Ordering::SeqCst) == 1000));
        assert_eq!(group.work_queue_len(), 0);
    }

    #[test]
    fn test_push_work_backpressure_without_waiters() {
        let cfg = test_config();
        // No threads started: nothing waits, nothing drains.
        let group = EpollGroup::new(0, &cfg, 128).unwrap();

        for _ in 0..128 {
            group.push_work(Task::from_fn(|| {})).unwrap();
        }
        let overflow = group.push_work(Task::from_fn(|| {}));
        assert!(overflow.is_err());
        assert_eq!(group.work_queue_len(), 128);
        // No waiter was ever published, so no wake was written.
        assert_eq!(group.notifier_writes(), 0);
    }

    #[test]
    fn test_push_trigger_empty_heap_always_notifies() {
        let cfg = test_config();
        let group = EpollGroup::new(0, &cfg, 128).unwrap();

        group.push_trigger(Task::from_fn(|| {}), time::steady_ms() + 1000);
        assert_eq!(group.notifier_writes(), 1);

        // A later trigger than the current head stays quiet.
        group.push_trigger(Task::from_fn(|| {}), time::steady_ms() + 5000);
        assert_eq!(group.notifier_writes(), 1);

        // An earlier trigger wakes again.
        group.push_trigger(Task::from_fn(|| {}), time::steady_ms() + 1);
        assert_eq!(group.notifier_writes(), 2);
    }

    #[test]
    fn test_timer_ordering_and_deadlines() {
        let cfg = test_config();
        let group = started_group(&cfg, 2);

        let fired: Arc<std::sync::Mutex<Vec<(u32, i64)>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let now = time::steady_ms();

        for (label, delay) in [(50u32, 50i64), (10, 10), (30, 30)] {
            let fired = fired.clone();
            group.push_trigger(
                Task::from_fn(move || {
                    fired.lock().unwrap().push((label, time::steady_ms()));
                }),
                now + delay,
            );
        }

        assert!(wait_until(10_000, || fired.lock().unwrap().len() == 3));
        let fired = fired.lock().unwrap();
        let labels: Vec<u32> = fired.iter().map(|f| f.0).collect();
        assert_eq!(labels, vec![10, 30, 50]);
        for (label, at) in fired.iter() {
            let scheduled = now + *label as i64;
            assert!(*at >= scheduled, "timer {} fired early", label);
            assert!(*at < scheduled + MAX_EPOLL_TIMEOUT as i64);
        }
    }

    #[derive(Default)]
    struct CallbackCounters {
        set_fd: AtomicUsize,
        registered: AtomicUsize,
        pre_events: AtomicUsize,
        events: AtomicUsize,
        dropped: AtomicUsize,
    }

    struct CountingCallback {
        fd: RawFd,
        counters: Arc<CallbackCounters>,
    }

    impl EpollCallback for CountingCallback {
        fn set_fd(&mut self, fd: RawFd) {
            self.fd = fd;
            self.counters.set_fd.fetch_add(1, Ordering::SeqCst);
        }

        fn fd_registered(&mut self) {
            self.counters.registered.fetch_add(1, Ordering::SeqCst);
        }

        fn pre_events(&mut self) {
            self.counters.pre_events.fetch_add(1, Ordering::SeqCst);
        }

        fn events(&mut self, _events: u32, _index: usize, _total: usize) -> bool {
            self.counters.events.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    impl Drop for CountingCallback {
        fn drop(&mut self) {
            self.counters.dropped.fetch_add(1, Ordering::SeqCst);
            if self.fd >= 0 {
                unsafe { libc::close(self.fd) };
            }
        }
    }

    #[test]
    fn test_dispatch_liveness_single_shot() {
        let cfg = test_config();
        let group = started_group(&cfg, 2);

        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        let counters = Arc::new(CallbackCounters::default());
        let cb = Box::new(CountingCallback {
            fd: -1,
            counters: counters.clone(),
        });
        group
            .add_fd(
                accepted.into_raw_fd(),
                (libc::EPOLLIN | libc::EPOLLET) as u32,
                cb,
                true,
            )
            .unwrap();

        client.write_all(b"ping").unwrap();

        assert!(wait_until(10_000, || {
            counters.dropped.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(counters.set_fd.load(Ordering::SeqCst), 1);
        assert_eq!(counters.registered.load(Ordering::SeqCst), 1);
        assert_eq!(counters.pre_events.load(Ordering::SeqCst), 1);
        assert_eq!(counters.events.load(Ordering::SeqCst), 1);

        // Nothing further reaches a destroyed callback.
        let _ = client.write_all(b"again");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counters.events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_add_fd_failure_returns_callback() {
        let cfg = test_config();
        let group = EpollGroup::new(0, &cfg, 128).unwrap();

        let counters = Arc::new(CallbackCounters::default());
        let cb = Box::new(CountingCallback {
            fd: -1,
            counters: counters.clone(),
        });

        let err = group
            .add_fd(-1, libc::EPOLLIN as u32, cb, false)
            .unwrap_err();
        assert_eq!(err.errno, libc::EBADF);
        // Ownership came back: set_fd never ran, and the box is ours to drop.
        assert_eq!(counters.set_fd.load(Ordering::SeqCst), 0);
        drop(err);
        assert_eq!(counters.dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_del_reclaim_lifecycle() {
        let cfg = test_config();
        // No threads: no dispatch can race the payload swap or reclaim.
        let group = EpollGroup::new(0, &cfg, 128).unwrap();

        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        let first = Arc::new(CallbackCounters::default());
        let token1 = group
            .add_fd(
                rd,
                libc::EPOLLIN as u32,
                Box::new(CountingCallback {
                    fd: -1,
                    counters: first.clone(),
                }),
                false,
            )
            .unwrap();
        assert_eq!(first.set_fd.load(Ordering::SeqCst), 1);
        assert_eq!(first.registered.load(Ordering::SeqCst), 1);

        // Mask-only re-arm keeps the payload.
        group
            .rearm_fd(rd, (libc::EPOLLIN | libc::EPOLLOUT) as u32, token1)
            .unwrap();

        // Payload swap: the new callback takes over the registration,
        // the first stays alive under its own token.
        let second = Arc::new(CallbackCounters::default());
        let token2 = group
            .reset_fd(
                rd,
                libc::EPOLLIN as u32,
                Box::new(CountingCallback {
                    fd: -1,
                    counters: second.clone(),
                }),
            )
            .unwrap();
        assert_ne!(token1, token2);
        assert_eq!(first.dropped.load(Ordering::SeqCst), 0);
        // reset_fd registers the payload as-is; no lifecycle hooks run.
        assert_eq!(second.set_fd.load(Ordering::SeqCst), 0);
        assert_eq!(second.registered.load(Ordering::SeqCst), 0);

        group.del_fd(rd).unwrap();
        assert_eq!(group.del_fd(rd), Err(libc::ENOENT));

        // Explicit removal path: both callbacks come back to the caller.
        drop(unsafe { group.reclaim_callback(token1) });
        assert_eq!(first.dropped.load(Ordering::SeqCst), 1);
        drop(unsafe { group.reclaim_callback(token2) });
        assert_eq!(second.dropped.load(Ordering::SeqCst), 1);

        unsafe { libc::close(wr) };
    }

    #[test]
    fn test_reset_fd_failure_returns_callback() {
        let cfg = test_config();
        let group = EpollGroup::new(0, &cfg, 128).unwrap();

        let counters = Arc::new(CallbackCounters::default());
        let err = group
            .reset_fd(
                -1,
                libc::EPOLLIN as u32,
                Box::new(CountingCallback {
                    fd: -1,
                    counters: counters.clone(),
                }),
            )
            .unwrap_err();
        assert_eq!(err.errno, libc::EBADF);
        drop(err);
        assert_eq!(counters.dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_worker_count_never_below_base() {
        let cfg = test_config();
        let group = started_group(&cfg, 2);
        assert!(wait_until(1000, || group.worker_count() >= 2));
        // Idle loops must not shrink the base set.
        thread::sleep(Duration::from_millis(200));
        assert_eq!(group.worker_count(), 2);
    }
}
