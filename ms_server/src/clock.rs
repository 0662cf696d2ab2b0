//! Millisecond time source for timer deadlines.

use std::time::Instant;

/// Source of the reactor's notion of "now".
///
/// Only differences between readings matter; the epoch is arbitrary.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Monotonic clock measured from its own creation.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn monotonic_clock_moves_forward() {
        let clock = MonotonicClock::new();
        let a = clock.now_ms();
        thread::sleep(Duration::from_millis(5));
        assert!(clock.now_ms() >= a + 5);
    }
}
