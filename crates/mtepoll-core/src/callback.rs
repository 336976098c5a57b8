//! Per-descriptor event callback.
//!
//! Every descriptor registered with a group carries exactly one
//! callback object; the group stores an owning pointer to it in the
//! multiplexer's per-event payload. The callback is destroyed by the
//! reactor when `events` returns false.

use std::os::unix::io::RawFd;

/// Polymorphic handle dispatched on descriptor readiness.
///
/// **Contract:**
/// - `set_fd` is called once, before registration.
/// - `fd_registered` is called once, after the registration succeeded.
/// - For a batch of K ready descriptors, `pre_events` is called on every
///   callback in the batch before any `events` call in that batch. This
///   lets a callback add references for the whole batch before any
///   dispatch can drop the last one.
/// - `events` receives the readiness mask, the callback's index within
///   the batch and the batch size. Returning false tells the reactor to
///   drop the registration and destroy the callback.
pub trait EpollCallback: Send {
    /// Record the descriptor this callback was registered with.
    fn set_fd(&mut self, fd: RawFd);

    /// Post-registration hook, used for resource reclaim counting.
    fn fd_registered(&mut self) {}

    /// Called for every event of a batch before any dispatch.
    fn pre_events(&mut self) {}

    /// Handle readiness. Return false to terminate: the reactor
    /// destroys this callback and forgets the registration.
    fn events(&mut self, events: u32, index: usize, total: usize) -> bool;

    /// Optional outbound path. Default implementation refuses.
    fn send(&mut self, _data: &[u8]) -> bool {
        false
    }
}
