//! Monotonic timestamps for event records and latency accounting.

use rustix::time::{clock_gettime, ClockId, Timespec};

pub(crate) const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Reads the monotonic clock.
#[inline]
pub(crate) fn now() -> Timespec {
    clock_gettime(ClockId::Monotonic)
}

/// Reads the monotonic clock as nanoseconds.
#[inline]
pub(crate) fn now_ns() -> u64 {
    nanos(now())
}

/// Converts a timespec to nanoseconds.
#[inline]
pub(crate) fn nanos(ts: Timespec) -> u64 {
    ts.tv_sec as u64 * NANOS_PER_SEC + ts.tv_nsec as u64
}

/// Splits a nanosecond timestamp into the record's (sec, nsec) fields.
#[inline]
pub(crate) fn split_ns(ns: u64) -> (u32, u32) {
    ((ns / NANOS_PER_SEC) as u32, (ns % NANOS_PER_SEC) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_advances() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn nanos_round_trip() {
        let ns = 3 * NANOS_PER_SEC + 17;
        assert_eq!(split_ns(ns), (3, 17));
    }
}
