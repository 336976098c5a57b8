//! Monotonic clock helpers.
//!
//! All reactor timestamps (timer triggers, scale hysteresis, cleanup
//! epochs) are milliseconds since the first call in the process. The
//! epoch is pinned lazily; only differences are ever meaningful.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

#[inline]
fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// Milliseconds of monotonic time since process start.
#[inline]
pub fn steady_ms() -> i64 {
    epoch().elapsed().as_millis() as i64
}

/// Microseconds of monotonic time since process start.
#[inline]
pub fn steady_us() -> i64 {
    epoch().elapsed().as_micros() as i64
}

/// Nanoseconds of monotonic time since process start.
#[inline]
pub fn steady_ns() -> i64 {
    epoch().elapsed().as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = steady_ms();
        let b = steady_ms();
        assert!(b >= a);
        assert!(a >= 0);
    }

    #[test]
    fn test_units_consistent() {
        let ns = steady_ns();
        let us = steady_us();
        // Coarse sanity: microseconds lag nanoseconds by roughly 1000x.
        assert!(us <= ns / 1000 + 1_000);
    }
}
