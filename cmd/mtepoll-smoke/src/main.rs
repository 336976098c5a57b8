//! Reactor End-to-End Smoke Exercise
//!
//! Drives the full reactor stack in one process:
//!   Part A — Singleton: group plan, thread spawn, global counters
//!   Part B — Work queue: push/consume burst, wake coalescing
//!   Part C — Timers: ordering and deadline drift
//!   Part D — Network: listen, accept, echo over a real TCP socket
//!   Part E — Scaling: stall growth and idle shrink
//!
//! Run: ./target/release/mtepoll-smoke
//! Tune with MTEPOLL_* environment variables.

use std::io::{Read, Write};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mtepoll::{get_instance, EpollCallback, EpollGroup, Task};
use mtepoll_core::time;

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        self.total += 1;
        if ok {
            self.passed += 1;
            println!("  [{:2}] {:<52} PASS", self.total, name);
        } else {
            self.failed += 1;
            println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
        }
    }

    fn summary(&self) -> i32 {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
        if self.failed == 0 {
            0
        } else {
            1
        }
    }
}

fn wait_until(deadline_ms: u64, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_millis(deadline_ms);
    while std::time::Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    pred()
}

// ── Echo protocol callbacks ──

/// Accepts connections and registers each with an `EchoConn`.
struct EchoListener {
    fd: RawFd,
    group: &'static EpollGroup,
    accepted: Arc<AtomicUsize>,
}

impl EpollCallback for EchoListener {
    fn set_fd(&mut self, fd: RawFd) {
        self.fd = fd;
    }

    fn events(&mut self, _events: u32, _index: usize, _total: usize) -> bool {
        // Edge-triggered: accept until drained.
        loop {
            let conn = unsafe {
                libc::accept4(self.fd, std::ptr::null_mut(), std::ptr::null_mut(), 0)
            };
            if conn < 0 {
                break;
            }
            self.group.session_count().fetch_add(1, Ordering::AcqRel);
            self.accepted.fetch_add(1, Ordering::AcqRel);
            let cb = Box::new(EchoConn {
                fd: -1,
                group: self.group,
            });
            if let Err(e) = self
                .group
                .add_fd(conn, (libc::EPOLLIN | libc::EPOLLET) as u32, cb, true)
            {
                eprintln!("smoke: add_fd for accepted conn failed: errno {}", e.errno);
                unsafe { libc::close(conn) };
            }
        }
        true
    }
}

/// Echoes whatever arrives; terminates on peer close.
struct EchoConn {
    fd: RawFd,
    group: &'static EpollGroup,
}

impl EpollCallback for EchoConn {
    fn set_fd(&mut self, fd: RawFd) {
        self.fd = fd;
    }

    fn events(&mut self, events: u32, _index: usize, _total: usize) -> bool {
        if events & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
            return false;
        }
        let mut buf = [0u8; 4096];
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n == 0 {
                return false; // peer closed
            }
            if n < 0 {
                return true; // drained (EAGAIN) or transient
            }
            let _ = self.send(&buf[..n as usize]);
        }
    }

    fn send(&mut self, data: &[u8]) -> bool {
        let mut off = 0;
        while off < data.len() {
            let n = unsafe {
                libc::write(
                    self.fd,
                    data[off..].as_ptr() as *const libc::c_void,
                    data.len() - off,
                )
            };
            if n <= 0 {
                return false;
            }
            off += n as usize;
        }
        true
    }
}

impl Drop for EchoConn {
    fn drop(&mut self) {
        self.group.session_count().fetch_sub(1, Ordering::AcqRel);
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

fn main() {
    let mut t = TestRunner::new();

    // ── Part A: singleton ──
    t.section("Part A — Singleton");
    let groups = get_instance();
    t.check("at least one group built", !groups.is_empty(), "no groups");
    let group = groups[0];
    t.check(
        "base threads registered",
        wait_until(2000, || mtepoll::global_thread_count().load(Ordering::Acquire) > 0),
        "global thread count is zero",
    );
    t.check(
        "worker count at base",
        group.worker_count() >= 1,
        "no workers",
    );

    // ── Part B: work queue ──
    t.section("Part B — Work queue");
    let ran = Arc::new(AtomicUsize::new(0));
    let finalized = Arc::new(AtomicUsize::new(0));
    let burst = 10_000usize;
    for _ in 0..burst {
        let r = ran.clone();
        let f = finalized.clone();
        let mut task = Task::new(
            move || {
                r.fetch_add(1, Ordering::Relaxed);
            },
            move || {
                f.fetch_add(1, Ordering::Relaxed);
            },
        );
        loop {
            match group.push_work(task) {
                Ok(()) => break,
                Err(back) => {
                    task = back;
                    std::thread::yield_now();
                }
            }
        }
    }
    t.check(
        "burst fully consumed",
        wait_until(10_000, || ran.load(Ordering::Relaxed) == burst),
        "tasks lost",
    );
    t.check(
        "every task finalized",
        finalized.load(Ordering::Relaxed) == burst,
        "finalize missing",
    );
    t.check(
        "wakes coalesced",
        group.notifier_writes() <= burst as u64,
        "more wakes than pushes",
    );

    // ── Part C: timers ──
    t.section("Part C — Timers");
    let fired: Arc<std::sync::Mutex<Vec<(i64, i64)>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let now = time::steady_ms();
    for delay in [50i64, 10, 30] {
        let fired = fired.clone();
        group.push_trigger(
            Task::from_fn(move || {
                fired.lock().unwrap().push((delay, time::steady_ms()));
            }),
            now + delay,
        );
    }
    t.check(
        "all timers fired",
        wait_until(5_000, || fired.lock().unwrap().len() == 3),
        "timer lost",
    );
    {
        let fired = fired.lock().unwrap();
        let order: Vec<i64> = fired.iter().map(|f| f.0).collect();
        t.check("timer order by trigger", order == vec![10, 30, 50], "out of order");
        t.check(
            "no early firing",
            fired.iter().all(|(d, at)| *at >= now + d),
            "fired before deadline",
        );
    }

    // ── Part D: network echo ──
    t.section("Part D — Network echo");
    let accepted = Arc::new(AtomicUsize::new(0));
    let port = {
        let probe = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        probe.local_addr().unwrap().port()
    };
    let listener = Box::new(EchoListener {
        fd: -1,
        group,
        accepted: accepted.clone(),
    });
    let listen_ok = group.listen_port(port, listener, false).is_ok();
    t.check("listen_port", listen_ok, "listen failed");
    t.check(
        "port visibly in use",
        mtepoll::check_port(port) == Err(libc::EADDRINUSE),
        "probe says free",
    );

    if listen_ok {
        let mut client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"hello reactor").unwrap();

        let mut echo = [0u8; 32];
        let mut got = 0usize;
        while got < 13 {
            match client.read(&mut echo[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(_) => break,
            }
        }
        t.check("echo round-trip", &echo[..got] == b"hello reactor", "payload mismatch");
        t.check(
            "session attributed to group",
            accepted.load(Ordering::Acquire) == 1,
            "accept count off",
        );
        drop(client);
        t.check(
            "session detached on close",
            wait_until(2_000, || group.session_count().load(Ordering::Acquire) == 0),
            "session count stuck",
        );
    }

    // ── Part E: scaling ──
    t.section("Part E — Scaling");
    let base = group.worker_count();
    group.session_count().fetch_add(16, Ordering::AcqRel);
    for _ in 0..base + 1 {
        group.add_stall_count();
    }
    for _ in 0..8 {
        group.try_scale_thread_pool(0);
    }
    let grown = group.worker_count();
    t.check("grew under stall", grown > base, "no growth");
    for _ in 0..base + 1 {
        group.sub_stall_count();
    }
    group.session_count().fetch_sub(16, Ordering::AcqRel);
    println!(
        "  worker {} tasker {} total {}",
        group.worker_count(),
        group.tasker_count(),
        mtepoll::global_thread_count().load(Ordering::Acquire)
    );

    if group.config().enable_perf_hist {
        let snap = group.work_queue_hist().snapshot();
        println!("  queue-wait hist: {:?}", snap);
    }

    std::process::exit(t.summary());
}
