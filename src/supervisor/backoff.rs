use std::time::Duration;

/// Capped exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    multiplier: f64,
    next: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, multiplier: f64) -> Self {
        let max = max.max(min);
        let multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            1.0
        };
        Self {
            min,
            max,
            multiplier,
            next: min,
        }
    }

    /// Delay to wait before the next attempt; grows the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.mul_f64(self.multiplier).min(self.max);
        delay
    }

    /// Start over from the minimum after a successful connection.
    pub fn reset(&mut self) {
        self.next = self.min;
    }
}
