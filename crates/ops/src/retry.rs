use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bound and pacing of the conflict-retry loop.
///
/// The default mirrors client-go's `retry.DefaultRetry`: five attempts, 10ms
/// apart, no growth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total read-modify-write cycles, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Growth of the delay per retry; 1.0 keeps it fixed.
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            factor: 1.0,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

impl RetryPolicy {
    /// Doubling delay starting at `initial`, capped at `max`.
    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self { max_attempts, initial_backoff: initial, max_backoff: max, factor: 2.0 }
    }

    /// No delay between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self { max_attempts, initial_backoff: Duration::ZERO, max_backoff: Duration::ZERO, factor: 1.0 }
    }

    /// Default policy with `KEEL_UPDATE_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut p = Self::default();
        if let Some(n) = env_parse::<u32>("KEEL_UPDATE_MAX_ATTEMPTS") { p.max_attempts = n; }
        if let Some(ms) = env_parse::<u64>("KEEL_UPDATE_BACKOFF_MS") { p.initial_backoff = Duration::from_millis(ms); }
        if let Some(ms) = env_parse::<u64>("KEEL_UPDATE_BACKOFF_MAX_MS") { p.max_backoff = Duration::from_millis(ms); }
        if let Some(f) = env_parse::<f64>("KEEL_UPDATE_BACKOFF_FACTOR") { p.factor = f; }
        p
    }

    /// Attempts actually made; zero is treated as one.
    pub fn attempts(&self) -> u32 { self.max_attempts.max(1) }

    /// Delay before retry number `retry` (1 for the first retry).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = if self.factor.is_finite() && self.factor >= 1.0 { self.factor } else { 1.0 };
        let exp = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * factor.powi(exp);
        let cap = self.max_backoff.as_secs_f64();
        if secs.is_finite() && secs < cap { Duration::from_secs_f64(secs) } else { self.max_backoff }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_fixed_ten_millis() {
        let p = RetryPolicy::default();
        assert_eq!(p.attempts(), 5);
        assert_eq!(p.backoff(1), Duration::from_millis(10));
        assert_eq!(p.backoff(4), Duration::from_millis(10));
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let p = RetryPolicy::exponential(8, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(4), Duration::from_millis(500));
        assert_eq!(p.backoff(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn degenerate_values_are_tamed() {
        let mut p = RetryPolicy::immediate(0);
        assert_eq!(p.attempts(), 1);
        assert_eq!(p.backoff(3), Duration::ZERO);
        p.initial_backoff = Duration::from_millis(5);
        p.max_backoff = Duration::from_millis(50);
        p.factor = f64::NAN;
        assert_eq!(p.backoff(9), Duration::from_millis(5));
        p.factor = 0.5;
        assert_eq!(p.backoff(2), Duration::from_millis(5));
    }
}
