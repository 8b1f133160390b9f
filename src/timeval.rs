//! Wall-clock timestamps used throughout the core, modeled on the C
//! `struct timeval` that `houseclock` threads through every component.
//!
//! Keeping seconds/microseconds apart (instead of a single float or a
//! `Duration` since some fixed epoch) matches the arithmetic the spec
//! describes: drift in whole milliseconds, sub-millisecond carries that
//! must be normalized by hand.

use std::time::{SystemTime, UNIX_EPOCH};

/// Unix wall time as (seconds, microseconds), `usec` always in `[0, 1_000_000)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timeval {
    pub secs: i64,
    pub usec: i32,
}

impl Timeval {
    pub const fn new(secs: i64, usec: i32) -> Self {
        Timeval { secs, usec }.normalized()
    }

    const fn normalized(self) -> Self {
        let mut secs = self.secs;
        let mut usec = self.usec;
        while usec >= 1_000_000 {
            usec -= 1_000_000;
            secs += 1;
        }
        while usec < 0 {
            usec += 1_000_000;
            secs -= 1;
        }
        Timeval { secs, usec }
    }

    /// Reads the current wall-clock time at microsecond resolution.
    pub fn now() -> Self {
        #[cfg(unix)]
        {
            use std::mem::MaybeUninit;
            unsafe {
                let mut ts = MaybeUninit::<libc::timespec>::uninit();
                if libc::clock_gettime(libc::CLOCK_REALTIME, ts.as_mut_ptr()) == 0 {
                    let ts = ts.assume_init();
                    return Timeval::new(ts.tv_sec as i64, (ts.tv_nsec / 1000) as i32);
                }
            }
        }
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timeval::new(d.as_secs() as i64, d.subsec_micros() as i32)
    }

    /// Milliseconds elapsed from `earlier` to `self` (can be negative).
    pub fn diff_ms(self, earlier: Timeval) -> i64 {
        (self.secs - earlier.secs) * 1000 + ((self.usec - earlier.usec) as i64) / 1000
    }

    pub fn add_ms(self, ms: i64) -> Timeval {
        let extra_sec = ms / 1000;
        let extra_usec = (ms % 1000) * 1000;
        Timeval::new(self.secs + extra_sec, self.usec + extra_usec as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_overflowing_usec() {
        let t = Timeval::new(10, 1_500_000);
        assert_eq!(t, Timeval::new(11, 500_000));
    }

    #[test]
    fn normalizes_negative_usec() {
        let t = Timeval::new(10, -1);
        assert_eq!(t, Timeval::new(9, 999_999));
    }

    #[test]
    fn diff_ms_is_signed() {
        let a = Timeval::new(100, 0);
        let b = Timeval::new(100, 500_000);
        assert_eq!(b.diff_ms(a), 500);
        assert_eq!(a.diff_ms(b), -500);
    }
}
