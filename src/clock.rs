//! Clock disciplinarian: turns `(source, local, latency)` triples from the
//! NMEA decoder or the SNTP engine's upstream path into either a hard
//! `settimeofday` reset or a progressive `adjtime` slew.
//!
//! Grounded in `hc_clock.c` from the houseclock original: learning-period
//! averaging, hysteresis around `precision`/`50*precision`, and the
//! per-second metrics ring all follow that file's arithmetic.

use crate::timeval::Timeval;

pub const LEARNING_PERIOD: u32 = 10;
pub const METRICS_DEPTH: usize = 360;
const LARGE_DRIFT_MS: i64 = 10_000;
const SAMPLING_PERIOD_OVERFLOW: i64 = 20_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricSlot {
    pub drift_abs_ms: u32,
    pub adjust_count: u32,
}

/// Snapshot of disciplinarian state for the telemetry exporter. Plain data,
/// copied out on demand; never shared by reference across threads.
#[derive(Debug, Clone)]
pub struct ClockStatus {
    pub synchronized: bool,
    pub precision_ms: i64,
    pub last_drift_ms: i64,
    pub last_avg_drift_ms: i64,
    pub reference: Timeval,
    pub sampling_period_secs: i64,
    pub accumulator_ms: i64,
    pub count: u32,
}

pub struct ClockDisciplinarian {
    precision_ms: i64,
    accumulator_ms: i64,
    count: u32,
    reference: Timeval,
    last_drift_ms: i64,
    last_avg_drift_ms: i64,
    synchronized: bool,
    has_reset: bool,
    sampling_period_x10: i64,
    last_synchronize_at: Option<Timeval>,
    metrics: [MetricSlot; METRICS_DEPTH],
    metrics_second: Option<i64>,
}

impl ClockDisciplinarian {
    pub fn new(precision_ms: i64) -> Self {
        ClockDisciplinarian {
            precision_ms,
            accumulator_ms: 0,
            count: 0,
            reference: Timeval::default(),
            last_drift_ms: 0,
            last_avg_drift_ms: 0,
            synchronized: false,
            has_reset: false,
            sampling_period_x10: 0,
            last_synchronize_at: None,
            metrics: [MetricSlot::default(); METRICS_DEPTH],
            metrics_second: None,
        }
    }

    pub fn synchronized(&self) -> bool {
        self.synchronized
    }

    pub fn reference(&self) -> Timeval {
        self.reference
    }

    pub fn precision_ms(&self) -> i64 {
        self.precision_ms
    }

    /// Published dispersion: the magnitude of the last averaged drift,
    /// in seconds, for the wire's 16.16 root-dispersion field.
    pub fn dispersion_seconds(&self) -> f64 {
        (self.last_avg_drift_ms.unsigned_abs() as f64) / 1000.0
    }

    pub fn status(&self) -> ClockStatus {
        ClockStatus {
            synchronized: self.synchronized,
            precision_ms: self.precision_ms,
            last_drift_ms: self.last_drift_ms,
            last_avg_drift_ms: self.last_avg_drift_ms,
            reference: self.reference,
            sampling_period_secs: self.sampling_period_seconds(),
            accumulator_ms: self.accumulator_ms,
            count: self.count,
        }
    }

    pub fn metrics_ring(&self) -> &[MetricSlot; METRICS_DEPTH] {
        &self.metrics
    }

    pub fn sampling_period_seconds(&self) -> i64 {
        ((self.sampling_period_x10 + 5) / 10).max(1)
    }

    /// `synchronize(source, local, latency_ms)` from spec.md §4.3. `source`
    /// is the reference time sample (GPS UTC, or an upstream's origin
    /// timestamp); `local` is when that sample was taken; `latency_ms` is
    /// the propagation delay to subtract credit for (0 for kernel-stamped
    /// upstream receives).
    pub fn synchronize(&mut self, source: Timeval, local: Timeval, latency_ms: i32) {
        let now = Timeval::now();
        self.update_sampling_period(now);

        let drift_ms = source.diff_ms(local) + latency_ms as i64;
        self.last_drift_ms = drift_ms;

        if !self.has_reset || drift_ms.abs() >= LARGE_DRIFT_MS {
            let delta_ms = now.diff_ms(local) + latency_ms as i64;
            let corrected = source.add_ms(delta_ms);
            if let Err(e) = ostime::set_time(corrected) {
                tracing::warn!(error = %e, "settimeofday failed, clock not reset");
            }
            self.reference = corrected;
            self.synchronized = true;
            self.has_reset = true;
            self.accumulator_ms = 0;
            self.count = 0;
            self.record_metric(now, drift_ms, true);
            return;
        }

        self.accumulator_ms += drift_ms;
        self.count += 1;

        if latency_ms > 0 && self.count < LEARNING_PERIOD {
            self.record_metric(now, drift_ms, false);
            return;
        }

        let avg = self.accumulator_ms / self.count as i64;
        self.last_avg_drift_ms = avg;
        if avg.abs() < self.precision_ms {
            self.synchronized = true;
        } else if avg.abs() > 50 * self.precision_ms {
            self.synchronized = false;
        }
        if let Err(e) = ostime::adjust(avg) {
            tracing::warn!(error = %e, "adjtime failed, slew not applied");
        }
        self.reference = now;
        self.record_metric(now, drift_ms, true);
        self.accumulator_ms = 0;
        self.count = 0;
    }

    fn update_sampling_period(&mut self, now: Timeval) {
        if let Some(last) = self.last_synchronize_at {
            let elapsed_secs_x10 = now.diff_ms(last).max(0) / 100;
            self.sampling_period_x10 = if self.sampling_period_x10 == 0 {
                elapsed_secs_x10
            } else {
                (self.sampling_period_x10 * 9 + elapsed_secs_x10) / 10
            };
            if self.sampling_period_x10 > SAMPLING_PERIOD_OVERFLOW {
                self.sampling_period_x10 /= 2;
            }
        }
        self.last_synchronize_at = Some(now);
    }

    fn record_metric(&mut self, now: Timeval, drift_ms: i64, adjusted: bool) {
        self.cleanup_metrics(now.secs);
        let idx = now.secs.rem_euclid(METRICS_DEPTH as i64) as usize;
        self.metrics[idx].drift_abs_ms = drift_ms.unsigned_abs() as u32;
        if adjusted {
            self.metrics[idx].adjust_count += 1;
        }
        self.metrics_second = Some(now.secs);
    }

    /// Zeroes ring slots between the previous current-second and `new_second`
    /// so stale samples from a prior minute never linger into the next.
    fn cleanup_metrics(&mut self, new_second: i64) {
        if let Some(prev) = self.metrics_second {
            if new_second > prev {
                let span = (new_second - prev).min(METRICS_DEPTH as i64);
                for s in (new_second - span + 1)..=new_second {
                    let idx = s.rem_euclid(METRICS_DEPTH as i64) as usize;
                    self.metrics[idx] = MetricSlot::default();
                }
            }
        }
    }
}

/// OS clock-setting boundary. This is the only module allowed to touch the
/// wall clock; every write from `ClockDisciplinarian::synchronize` funnels
/// through here.
mod ostime {
    use crate::timeval::Timeval;
    use std::io;

    #[cfg(unix)]
    pub fn set_time(t: Timeval) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: t.secs as libc::time_t,
            tv_usec: t.usec as libc::suseconds_t,
        };
        let rc = unsafe { libc::settimeofday(&tv, std::ptr::null()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(unix)]
    pub fn adjust(delta_ms: i64) -> io::Result<()> {
        let delta_us = delta_ms * 1000;
        let delta = libc::timeval {
            tv_sec: (delta_us / 1_000_000) as libc::time_t,
            tv_usec: (delta_us % 1_000_000) as libc::suseconds_t,
        };
        let rc = unsafe { libc::adjtime(&delta, std::ptr::null_mut()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    pub fn set_time(_t: Timeval) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "clock discipline requires a unix target"))
    }

    #[cfg(not(unix))]
    pub fn adjust(_delta_ms: i64) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "clock discipline requires a unix target"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_always_hard_resets_and_synchronizes() {
        let mut d = ClockDisciplinarian::new(10);
        let local = Timeval::new(1_700_000_000, 0);
        d.synchronize(local, local, 70);
        assert!(d.synchronized());
        assert!(d.reference().secs >= local.secs);
    }

    #[test]
    fn large_drift_forces_hard_reset_after_lock() {
        let mut d = ClockDisciplinarian::new(10);
        let t0 = Timeval::new(1_700_000_000, 0);
        d.synchronize(t0, t0, 0);
        assert!(d.synchronized());

        let t1 = Timeval::new(1_700_000_001, 0);
        let far_source = t1.add_ms(20_000);
        d.synchronize(far_source, t1, 0);
        assert!(d.synchronized());
        assert_eq!(d.reference().secs, far_source.secs);
    }

    #[test]
    fn sync_flag_follows_avg_drift_hysteresis_thresholds() {
        let mut d = ClockDisciplinarian::new(10);
        let base = Timeval::new(1_700_000_000, 0);
        d.synchronize(base, base, 0);

        let mut t = base;
        for i in 1..=LEARNING_PERIOD {
            t = t.add_ms(1000);
            let source = t.add_ms(15);
            d.synchronize(source, t, 0);
            if i < LEARNING_PERIOD {
                assert!(d.synchronized(), "iteration {i} should still be syncing silently");
            }
        }
        // average drift +15ms: |15| < precision(10) is false, |15| > 50*10 is
        // false either, so the synchronized flag must be unchanged (true).
        assert!(d.synchronized());
    }

    #[test]
    fn large_average_drift_drops_lock() {
        let mut d = ClockDisciplinarian::new(10);
        let base = Timeval::new(1_700_000_000, 0);
        d.synchronize(base, base, 0);

        let mut t = base;
        for _ in 0..LEARNING_PERIOD {
            t = t.add_ms(1000);
            let source = t.add_ms(600);
            d.synchronize(source, t, 0);
        }
        assert!(!d.synchronized());
    }

    #[test]
    fn metrics_ring_clears_stale_slots_across_a_gap() {
        let mut d = ClockDisciplinarian::new(10);
        let t0 = Timeval::new(1_700_000_000, 0);
        d.synchronize(t0, t0, 0);
        let idx0 = t0.secs.rem_euclid(METRICS_DEPTH as i64) as usize;
        assert_ne!(d.metrics_ring()[idx0].adjust_count, 0);

        let t1 = Timeval::new(t0.secs + 5, 0);
        d.synchronize(t1, t1, 0);
        let stale_idx = (t0.secs + 2).rem_euclid(METRICS_DEPTH as i64) as usize;
        assert_eq!(d.metrics_ring()[stale_idx].drift_abs_ms, 0);
    }
}
