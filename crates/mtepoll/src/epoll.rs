//! Thin wrapper over the epoll readiness multiplexer.
//!
//! One `Epoll` per group. The per-event payload is an opaque `u64`:
//! the notifier's descriptor for the wake channel, or a thin callback
//! pointer for connection descriptors. The wrapper does not interpret
//! it.

use mtepoll_core::{ReactorError, Result};
use std::os::unix::io::RawFd;

pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    /// Create the multiplexer. Failure here is fatal at process scope.
    pub fn create() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(ReactorError::SystemInit(errno()));
        }
        Ok(Self { epfd })
    }

    /// Register `fd` with the given readiness mask and payload.
    pub fn add(&self, fd: RawFd, events: u32, payload: u64) -> std::result::Result<(), i32> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, payload)
    }

    /// Modify the mask and/or payload of a registered descriptor.
    pub fn modify(&self, fd: RawFd, events: u32, payload: u64) -> std::result::Result<(), i32> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, payload)
    }

    /// Remove a registered descriptor.
    pub fn del(&self, fd: RawFd) -> std::result::Result<(), i32> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    fn ctl(&self, op: i32, fd: RawFd, events: u32, payload: u64) -> std::result::Result<(), i32> {
        let mut event = libc::epoll_event {
            events,
            u64: payload,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if ret != 0 {
            return Err(errno());
        }
        Ok(())
    }

    /// Block until readiness or timeout; fills `events` and returns the
    /// count. `Err` carries the errno, EINTR included; callers treat
    /// that as an empty wake.
    pub fn wait(
        &self,
        events: &mut [libc::epoll_event],
        timeout_ms: i32,
    ) -> std::result::Result<usize, i32> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(errno());
        }
        Ok(n as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        if self.epfd >= 0 {
            unsafe { libc::close(self.epfd) };
            self.epfd = -1;
        }
    }
}

#[inline]
pub(crate) fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_del_unregistered_fd_surfaces_errno() {
        let ep = Epoll::create().unwrap();
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        // Valid fd that was never added.
        assert_eq!(ep.del(fds[0]), Err(libc::ENOENT));
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_add_and_wait_on_pipe() {
        let ep = Epoll::create().unwrap();
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        ep.add(rd, libc::EPOLLIN as u32, 77).unwrap();

        let mut events: [libc::epoll_event; 4] = unsafe { std::mem::zeroed() };
        // Nothing readable yet.
        assert_eq!(ep.wait(&mut events, 0).unwrap(), 0);

        let one = [1u8];
        unsafe { libc::write(wr, one.as_ptr() as *const _, 1) };
        let n = ep.wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        let ev0_u64 = events[0].u64;
        let ev0_events = events[0].events;
        assert_eq!(ev0_u64, 77);
        assert!(ev0_events & libc::EPOLLIN as u32 != 0);

        ep.del(rd).unwrap();
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
