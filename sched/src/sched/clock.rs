//! Monotonic uptime clock.
//!
//! Nanoseconds since the first use (in practice: since `kernel::init`).
//! Replaces a hardware tick counter with the host's monotonic clock.

use spin::Once;
use std::time::{Duration, Instant};

/// Clock origin, latched on first use.
static ORIGIN: Once<Instant> = Once::new();

/// Time since kernel initialization.
#[inline]
pub fn uptime() -> Duration {
    ORIGIN.call_once(Instant::now).elapsed()
}

/// `uptime()` in nanoseconds. All scheduler bookkeeping is in this unit.
#[inline]
pub fn uptime_nanos() -> u64 {
    uptime().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_is_monotonic() {
        let a = uptime_nanos();
        let b = uptime_nanos();
        assert!(b >= a);
    }
}
