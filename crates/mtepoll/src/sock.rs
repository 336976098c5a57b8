//! Socket option plumbing and TCP listener setup.
//!
//! Everything here returns `Err(errno)` on failure; callers own
//! recovery (closing the fd, freeing the callback). The only internal
//! retry anywhere in the reactor is the canonical fcntl EINTR loop.

use std::os::unix::io::RawFd;

use crate::config::{MAX_TCP_LISTEN_QUEUE, MIN_TCP_LISTEN_QUEUE};
use crate::epoll::errno;

/// Set or clear O_NONBLOCK, skipping the second fcntl when the flag
/// already matches.
pub fn set_nonblock(fd: RawFd, on: bool) -> Result<(), i32> {
    let mut r;
    loop {
        r = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if !(r == -1 && errno() == libc::EINTR) {
            break;
        }
    }
    if r == -1 {
        return Err(errno());
    }

    if ((r & libc::O_NONBLOCK) != 0) == on {
        return Ok(());
    }

    let flags = if on {
        r | libc::O_NONBLOCK
    } else {
        r & !libc::O_NONBLOCK
    };
    loop {
        r = unsafe { libc::fcntl(fd, libc::F_SETFL, flags) };
        if !(r == -1 && errno() == libc::EINTR) {
            break;
        }
    }
    if r != 0 {
        return Err(errno());
    }
    Ok(())
}

/// Disable Nagle.
pub fn set_nodelay(fd: RawFd, on: bool) -> Result<(), i32> {
    let opt: libc::c_int = on as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(errno());
    }
    Ok(())
}

/// Enable keepalive with the given idle time in seconds.
pub fn set_keepalive(fd: RawFd, on: bool, idle_secs: u32) -> Result<(), i32> {
    let opt: libc::c_int = on as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(errno());
    }

    if on {
        let idle: libc::c_int = idle_secs as libc::c_int;
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPIDLE,
                &idle as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(errno());
        }
    }
    Ok(())
}

/// Create a TCP listening socket on `INADDR_ANY:port`.
///
/// SO_REUSEADDR is always set; SO_REUSEPORT only when requested. The
/// backlog is clamped to the documented range before `listen`.
pub fn listen_socket(port: u16, reuse_port: bool, backlog: u32) -> Result<RawFd, i32> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(errno());
    }

    let opt: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        if reuse_port {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &opt as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
    addr.sin_port = port.to_be();

    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        let e = errno();
        unsafe { libc::close(fd) };
        return Err(e);
    }

    let depth = backlog.clamp(MIN_TCP_LISTEN_QUEUE, MAX_TCP_LISTEN_QUEUE);
    let ret = unsafe { libc::listen(fd, depth as libc::c_int) };
    if ret != 0 {
        let e = errno();
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(fd)
}

/// Probe whether `port` on the loopback address is already in use.
///
/// `Ok(())` when the connect attempt is refused (port free);
/// `Err(EADDRINUSE)` when something accepted; otherwise the errno of
/// the failed attempt.
pub fn check_port(port: u16) -> Result<(), i32> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP) };
    if fd < 0 {
        return Err(errno());
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::LOCALHOST).to_be();
    addr.sin_port = port.to_be();

    let ret = unsafe {
        libc::connect(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret == 0 {
        unsafe { libc::close(fd) };
        return Err(libc::EADDRINUSE);
    }
    let e = errno();
    unsafe { libc::close(fd) };
    if e == libc::ECONNREFUSED {
        Ok(())
    } else {
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_nonblock_toggle_and_idempotence() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let fd = fds[0];

        set_nonblock(fd, true).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);

        // Second call takes the early-out path.
        set_nonblock(fd, true).unwrap();

        set_nonblock(fd, false).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK == 0);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_nonblock_bad_fd() {
        assert_eq!(set_nonblock(-1, true), Err(libc::EBADF));
    }

    #[test]
    fn test_listen_and_check_port() {
        // Grab a free port from the kernel first.
        let probe = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();

        // While bound, the probe reports in-use.
        assert_eq!(check_port(port), Err(libc::EADDRINUSE));
        drop(probe);

        let fd = listen_socket(port, false, 16).unwrap();
        assert!(fd >= 0);
        assert_eq!(check_port(port), Err(libc::EADDRINUSE));

        let stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        set_nodelay(stream.as_raw_fd(), true).unwrap();
        set_keepalive(stream.as_raw_fd(), true, 60).unwrap();

        drop(stream);
        unsafe { libc::close(fd) };
        assert_eq!(check_port(port), Ok(()));
    }
}
