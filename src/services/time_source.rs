//! Clock abstraction shared by the protection core.
//!
//! Segment headers, log entries, lock records and the polling loop all read
//! time through `TimeSource`, so tests can pin the wall clock and skip real
//! sleeps.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Abstraction over time-related operations.
pub trait TimeSource: Send + Sync + std::fmt::Debug {
    /// Monotonic instant, used for poll pacing and incident deduplication.
    fn now(&self) -> Instant;

    /// Current wall-clock time, used for every persisted timestamp.
    fn wall_clock(&self) -> DateTime<Utc>;

    /// Sleep for the specified duration.
    ///
    /// In tests, this advances logical time instead of blocking.
    fn sleep(&self, duration: Duration);

    /// Calculate elapsed time since an earlier instant.
    fn elapsed_since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }

    /// Milliseconds since the Unix epoch of the wall clock.
    fn unix_millis(&self) -> i64 {
        self.wall_clock().timestamp_millis()
    }
}

/// Type alias for shared time source.
pub type SharedTimeSource = Arc<dyn TimeSource>;

/// Production implementation using actual system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealTimeSource;

impl RealTimeSource {
    pub fn new() -> Self {
        Self
    }

    pub fn shared() -> SharedTimeSource {
        Arc::new(Self)
    }
}

impl TimeSource for RealTimeSource {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Test implementation with controllable time.
///
/// - `now()` and `wall_clock()` both move with an internal logical counter
/// - `sleep()` advances logical time (no actual sleeping)
/// - Time can be advanced manually via `advance()`
///
/// # Example
///
/// ```
/// use injectlog::services::time_source::{TimeSource, TestTimeSource};
/// use std::time::Duration;
///
/// let time = TestTimeSource::new();
/// let before = time.wall_clock();
///
/// time.sleep(Duration::from_secs(5));
///
/// assert_eq!((time.wall_clock() - before).num_seconds(), 5);
/// ```
#[derive(Debug)]
pub struct TestTimeSource {
    /// Logical time in nanoseconds since creation.
    logical_nanos: AtomicU64,
    /// Real instant at creation, used for Instant arithmetic.
    base_instant: Instant,
    /// Wall-clock time that logical zero maps to.
    base_wall: DateTime<Utc>,
}

impl Default for TestTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TestTimeSource {
    /// Logical zero is 2024-01-01T00:00:00Z.
    pub fn new() -> Self {
        let base_wall = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self::starting_at(base_wall)
    }

    /// Create a time source whose wall clock starts at `base_wall`.
    pub fn starting_at(base_wall: DateTime<Utc>) -> Self {
        Self {
            logical_nanos: AtomicU64::new(0),
            base_instant: Instant::now(),
            base_wall,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Advance logical time by the given duration.
    pub fn advance(&self, duration: Duration) {
        self.logical_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Get the logical elapsed time since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.logical_nanos.load(Ordering::SeqCst))
    }
}

impl TimeSource for TestTimeSource {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.elapsed()).unwrap_or(chrono::Duration::zero());
        self.base_wall + elapsed
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_time_source_now_advances() {
        let ts = RealTimeSource::new();
        let t1 = ts.now();
        std::thread::sleep(Duration::from_millis(1));
        let t2 = ts.now();
        assert!(t2 > t1);
    }

    #[test]
    fn test_time_source_wall_clock_is_fixed_until_advanced() {
        let ts = TestTimeSource::new();
        assert_eq!(ts.wall_clock(), ts.wall_clock());
        assert_eq!(ts.wall_clock().to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_time_source_sleep_moves_both_clocks() {
        let ts = TestTimeSource::new();
        let start = ts.now();
        let wall = ts.wall_clock();

        ts.sleep(Duration::from_millis(2500));

        assert_eq!(ts.elapsed(), Duration::from_millis(2500));
        assert!(ts.elapsed_since(start) >= Duration::from_millis(2500));
        assert_eq!((ts.wall_clock() - wall).num_milliseconds(), 2500);
    }

    #[test]
    fn test_unix_millis_tracks_wall_clock() {
        let ts = TestTimeSource::new();
        let before = ts.unix_millis();
        ts.advance(Duration::from_millis(7));
        assert_eq!(ts.unix_millis() - before, 7);
    }

    #[test]
    fn test_time_source_thread_safe() {
        use std::thread;

        let ts = Arc::new(TestTimeSource::new());
        let ts_clone = ts.clone();

        let handle = thread::spawn(move || {
            for _ in 0..100 {
                ts_clone.advance(Duration::from_millis(1));
            }
        });

        for _ in 0..100 {
            ts.advance(Duration::from_millis(1));
        }

        handle.join().unwrap();

        assert_eq!(ts.elapsed(), Duration::from_millis(200));
    }
}
