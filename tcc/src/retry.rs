use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Exponential backoff for Confirm/Cancel delivery.
///
/// Delivery state is durable, so the interval is derived from the persisted
/// attempt count instead of a long-lived `ExponentialBackoff` instance.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
    /// Retry window of one branch, measured from its first delivery attempt.
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(60),
            multiplier: 2.0,
            randomization_factor: 0.5,
            max_elapsed: Duration::from_secs(24 * 3600),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given number of failed attempts.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);

        let current = if secs.is_finite() && secs < self.max_interval.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_interval
        };

        let mut backoff = ExponentialBackoff {
            current_interval: current,
            initial_interval: self.initial_interval,
            randomization_factor: self.randomization_factor,
            multiplier: self.multiplier,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        backoff.next_backoff().unwrap_or(current)
    }

    pub fn exhausted(&self, started_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - started_at)
            .to_std()
            .is_ok_and(|elapsed| elapsed >= self.max_elapsed)
    }
}
