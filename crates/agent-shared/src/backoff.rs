//! # Retry Backoff
//!
//! Jittered exponential delays for the controller link. The sysinfo
//! registration retries with min 500 ms, max 120 s, factor 1.6 and
//! ±20 % jitter.

use std::time::Duration;

/// Exponential backoff state. `next_delay` advances the attempt counter;
/// `reset` rewinds after a success.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            min,
            max,
            factor,
            jitter,
            attempt: 0,
        }
    }

    /// The schedule used for controller sysinfo registration
    pub fn controller_defaults() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(120), 1.6, 0.2)
    }

    /// Next delay: `min(max, min * factor^attempt)` scaled by a random
    /// factor in `[1 - jitter, 1 + jitter]`.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.min.as_secs_f64() * self.factor.powi(self.attempt as i32);
        let capped = base.min(self.max.as_secs_f64());
        let scale = 1.0 + self.jitter * (fastrand::f64() * 2.0 - 1.0);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs_f64(capped * scale)
    }

    /// Rewind after a successful attempt
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
