//! Monotonic time source, injectable so controllers can be driven at
//! simulated speed in tests instead of waiting on real wall-clock time.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A source of monotonic time. Every controller's rate-limit, decay, and
/// timeout math goes through this instead of calling `Instant::now()`
/// directly.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wraps the real OS clock.
#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock a test can advance explicitly, so rate-limit/decay/timeout
/// logic can be exercised at 1000x real time without real sleeps.
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<Instant>>,
}

impl FakeClock {
    pub fn new() -> Self {
        FakeClock {
            inner: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, dt: Duration) {
        let mut t = self.inner.lock().unwrap();
        *t += dt;
    }

    pub fn advance_secs(&self, secs: f64) {
        self.advance(Duration::from_secs_f64(secs.max(0.0)));
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.inner.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_on_request_only() {
        let clock = FakeClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);
        clock.advance_secs(5.0);
        assert_eq!(clock.now(), t0 + Duration::from_secs(5));
    }
}
