//! Eventfd wake channel.
//!
//! One notifier per group, registered edge-triggered with the group's
//! multiplexer. Writes coalesce: the eventfd counter accumulates, so
//! one drain may cover many notifies. A spurious wake costs one loop
//! iteration; a missed wake would cost a whole timeout interval, which
//! is why producers over-notify rather than under-notify.

use mtepoll_core::{ReactorError, Result};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::epoll::errno;

pub struct Notifier {
    fd: RawFd,
    /// Diagnostic: successful wake writes.
    writes: AtomicU64,
}

impl Notifier {
    /// Create an owned nonblocking eventfd.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(ReactorError::SystemInit(errno()));
        }
        Ok(Self {
            fd,
            writes: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Wake any thread waiting on the descriptor.
    pub fn notify(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            // EAGAIN means the counter is saturated: a wake is already
            // pending, nothing is lost.
            let e = errno();
            if e != libc::EAGAIN {
                mtepoll_core::mterror!("notifier write failed: errno {}", e);
            }
            return;
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Consume pending wakes: one read drains the whole counter.
    pub fn drain(&self) {
        let mut dummy: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut dummy as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }

    /// Total successful wake writes since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_then_drain() {
        let n = Notifier::create().unwrap();
        n.notify();
        n.notify();
        n.notify();
        assert_eq!(n.write_count(), 3);

        // One read consumes every pending wake.
        n.drain();
        let mut dummy: u64 = 0;
        let ret = unsafe {
            libc::read(
                n.fd(),
                &mut dummy as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // Counter is empty, nonblocking read refuses.
        assert!(ret < 0);
    }
}
