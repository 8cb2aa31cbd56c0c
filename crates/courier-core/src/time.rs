//! Clock abstraction so retry scheduling can be tested deterministically.
//!
//! Workers stamp attempts and compute `next_retry_at` from a [`Clock`]; the
//! scheduler compares due times against the same clock. Production wiring
//! uses [`RealClock`], tests inject a [`TestClock`] and move time by hand.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant for measuring durations.
    fn now(&self) -> Instant;

    /// Wall-clock time.
    fn now_system(&self) -> SystemTime;

    /// Suspends for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }

    /// Wall-clock time as whole Unix seconds.
    fn unix_timestamp(&self) -> i64 {
        self.now_utc().timestamp()
    }
}

/// System clock backed by tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[derive(Debug)]
struct ManualTime {
    elapsed: Duration,
    wall: SystemTime,
}

/// Manually driven clock.
///
/// Clones share the same underlying time, so a test can hand one clone to the
/// engine and keep another to advance it.
#[derive(Debug, Clone)]
pub struct TestClock {
    state: Arc<Mutex<ManualTime>>,
    origin: Instant,
}

impl TestClock {
    /// Starts at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Starts at the given wall-clock time.
    pub fn with_start_time(start: SystemTime) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualTime { elapsed: Duration::ZERO, wall: start })),
            origin: Instant::now(),
        }
    }

    /// Starts at the given UTC timestamp.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self::with_start_time(SystemTime::from(start))
    }

    /// Starts at `secs` seconds past the Unix epoch.
    pub fn from_unix(secs: u64) -> Self {
        Self::with_start_time(UNIX_EPOCH + Duration::from_secs(secs))
    }

    /// Moves both monotonic and wall-clock time forward.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.elapsed += duration;
        state.wall += duration;
    }

    /// Sets wall-clock time. Monotonic time only ever moves forward, so a
    /// backwards jump leaves it untouched.
    pub fn jump_to(&self, time: SystemTime) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Ok(forward) = time.duration_since(state.wall) {
            state.elapsed += forward;
        }
        state.wall = time;
    }

    /// Monotonic time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).elapsed
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).wall
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_both_clocks() {
        let clock = TestClock::from_unix(1_000);
        let start = clock.now();

        clock.advance(Duration::from_secs(16));

        assert_eq!(clock.now().duration_since(start), Duration::from_secs(16));
        assert_eq!(clock.unix_timestamp(), 1_016);
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::from_unix(0);
        let handle = clock.clone();

        handle.advance(Duration::from_secs(5));

        assert_eq!(clock.unix_timestamp(), 5);
    }

    #[test]
    fn backwards_jump_keeps_monotonic_time() {
        let clock = TestClock::from_unix(2_000);
        clock.advance(Duration::from_secs(3));

        clock.jump_to(UNIX_EPOCH + Duration::from_secs(1_500));

        assert_eq!(clock.unix_timestamp(), 1_500);
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn sleep_advances_without_waiting() {
        let clock = TestClock::from_unix(0);

        clock.sleep(Duration::from_secs(3600)).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(3600));
    }
}
