//! Clock abstractions used by the skew estimator and timing stats.

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock abstraction so wire timestamps can be faked in tests.
pub trait WallClock: Send + Sync + std::fmt::Debug {
    /// Milliseconds since the unix epoch.
    fn now_millis(&self) -> i64;
}

/// Production wall clock backed by `SystemTime::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Test clock that returns a programmable timestamp.
#[derive(Debug, Clone)]
pub struct FixedClock {
    millis: std::sync::Arc<std::sync::atomic::AtomicI64>,
}

impl FixedClock {
    pub fn new(millis: i64) -> Self {
        Self { millis: std::sync::Arc::new(std::sync::atomic::AtomicI64::new(millis)) }
    }

    pub fn set(&self, millis: i64) {
        self.millis.store(millis, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance(&self, delta: i64) {
        self.millis.fetch_add(delta, std::sync::atomic::Ordering::SeqCst);
    }
}

impl WallClock for FixedClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_past_2020() {
        let now = SystemClock.now_millis();
        assert!(now > 1_577_836_800_000, "epoch millis should be after 2020, got {}", now);
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_millis(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }
}
