//! Monotonic + UTC-offset time source.
//!
//! Reads of the monotonic tick never block; the UTC view is derived from it
//! plus an offset that can be nudged by an upstream HTTP `Date` header.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// A signed running-time value in nanoseconds, matching the source
/// framework's "clock time diff" semantics: negative values are valid,
/// `None` stands in for "no running time" (pre-segment / unknown).
pub type RunningTime = Option<i64>;

/// Add a duration to a running time, saturating rather than overflowing.
pub fn running_time_add(rt: i64, d: Duration) -> i64 {
    rt.saturating_add(d.as_nanos().min(i64::MAX as u128) as i64)
}

#[derive(Debug)]
pub struct Clock {
    epoch: Instant,
    // Offset (nanoseconds) added to `epoch.elapsed()` to produce the UTC
    // view, guarded separately from the lock-free monotonic read path.
    utc_offset_ns: Mutex<i128>,
    // Cached monotonic-tick reading in nanoseconds since `epoch`, updated by
    // `tick()`. Stored atomically so concurrent readers never block.
    last_tick_ns: AtomicI64,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            utc_offset_ns: Mutex::new(0),
            last_tick_ns: AtomicI64::new(0),
        }
    }

    /// Monotonic nanoseconds since the clock was created. Lock-free.
    pub fn tick(&self) -> i64 {
        let now = self.epoch.elapsed().as_nanos().min(i64::MAX as u128) as i64;
        self.last_tick_ns.store(now, Ordering::Relaxed);
        now
    }

    /// Current UTC time as derived from the monotonic tick and the offset
    /// established by the last `set_utc` call (or wall-clock at creation if
    /// `set_utc` was never called).
    pub fn utc_now(&self) -> SystemTime {
        let offset = *self.utc_offset_ns.lock();
        let tick = self.tick() as i128;
        let nanos_since_unix = tick + offset;
        if nanos_since_unix >= 0 {
            UNIX_EPOCH + Duration::from_nanos(nanos_since_unix as u64)
        } else {
            UNIX_EPOCH - Duration::from_nanos((-nanos_since_unix) as u64)
        }
    }

    /// Adjust the UTC offset so that `utc_now()` reports `now_utc` at the
    /// instant this call is made. Used when an HTTP `Date` header arrives.
    pub fn set_utc(&self, now_utc: SystemTime) {
        let tick = self.tick() as i128;
        let since_unix = now_utc
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i128)
            .unwrap_or_else(|e| -(e.duration().as_nanos() as i128));
        *self.utc_offset_ns.lock() = since_unix - tick;
    }

    /// Parse an RFC-5322 `Date` header value and feed it to `set_utc`.
    ///
    /// Returns `false` (and leaves the clock untouched) if the header value
    /// cannot be parsed, matching spec §6's "skew the UTC clock" behaviour
    /// for a best-effort header.
    pub fn set_utc_from_http_date(&self, header_value: &str) -> bool {
        match httpdate::parse_http_date(header_value) {
            Ok(t) => {
                self.set_utc(t);
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_is_monotonic() {
        let clock = Clock::new();
        let a = clock.tick();
        std::thread::sleep(Duration::from_millis(5));
        let b = clock.tick();
        assert!(b > a);
    }

    #[test]
    fn set_utc_from_http_date_updates_offset() {
        let clock = Clock::new();
        let ok = clock.set_utc_from_http_date("Sun, 06 Nov 1994 08:49:37 GMT");
        assert!(ok);
        let now = clock.utc_now();
        let expected = UNIX_EPOCH + Duration::from_secs(784111777);
        let diff = now
            .duration_since(expected)
            .unwrap_or_else(|e| e.duration());
        assert!(diff < Duration::from_millis(50));
    }

    #[test]
    fn set_utc_from_http_date_rejects_garbage() {
        let clock = Clock::new();
        assert!(!clock.set_utc_from_http_date("not a date"));
    }
}
