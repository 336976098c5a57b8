//! Host thread lifecycle hooks.
//!
//! The hosting process may need per-thread setup before any callback
//! runs on a reactor thread (thread-local handles, allocator arenas)
//! and teardown when a dynamic thread exits. Register the pair once,
//! before the singleton is built; threads started earlier never see
//! them.

use std::sync::OnceLock;

#[derive(Clone, Copy)]
pub struct ThreadHooks {
    pub init: fn(),
    pub deinit: fn(),
}

static HOOKS: OnceLock<ThreadHooks> = OnceLock::new();

/// Install the hook pair. Returns false if hooks were already set.
pub fn set_thread_hooks(hooks: ThreadHooks) -> bool {
    HOOKS.set(hooks).is_ok()
}

pub(crate) fn thread_init() {
    if let Some(h) = HOOKS.get() {
        (h.init)();
    }
}

pub(crate) fn thread_deinit() {
    if let Some(h) = HOOKS.get() {
        (h.deinit)();
    }
}
