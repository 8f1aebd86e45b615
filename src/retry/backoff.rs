use rand::Rng;
use std::time::Duration;
use tracing::trace;

/// Delay policy between reprocessing attempts
pub trait Backoff: Send + Sync {
    /// Delay before attempt number `attempt + 1`
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Doubling delay with symmetric jitter, never above `ceiling`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    ceiling: Duration,
    factor: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling,
            factor: 2.0,
            jitter: 0.1,
        }
    }

    /// Growth factor per attempt, at least 1.0
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    /// Fraction of the delay added or removed at random, within 0.0..=1.0
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    fn spread(&self, delay_ms: f64) -> f64 {
        let range = delay_ms * self.jitter;
        if range <= 0.0 {
            return 0.0;
        }
        rand::thread_rng().gen_range(-range..=range)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(30))
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let ceiling_ms = self.ceiling.as_millis() as f64;
        let grown = self.base.as_millis() as f64 * self.factor.powi(attempt.min(64) as i32);
        let bounded = grown.min(ceiling_ms);
        let spread = self.spread(bounded);
        let delay = Duration::from_millis((bounded + spread).clamp(0.0, ceiling_ms) as u64);

        trace!(attempt, ?delay, "Next reprocess delay");
        delay
    }
}

/// Same delay before every attempt
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Backoff for FixedBackoff {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_ceiling() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10))
            .with_jitter(0.0);

        assert_eq!(backoff.next_delay(0), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(1), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(3), Duration::from_millis(800));
        assert_eq!(backoff.next_delay(20), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_around_base_delay() {
        let backoff = ExponentialBackoff::default().with_jitter(0.5);

        let delays: Vec<Duration> = (0..100).map(|_| backoff.next_delay(1)).collect();
        let distinct: std::collections::HashSet<_> = delays.iter().collect();
        assert!(distinct.len() > 1);
        for delay in delays {
            let ms = delay.as_millis();
            assert!((100..=300).contains(&ms), "delay {}ms out of range", ms);
        }
    }

    #[test]
    fn test_setters_clamp_their_input() {
        let backoff = ExponentialBackoff::default().with_jitter(1.5).with_factor(0.5);
        assert_eq!(backoff.jitter, 1.0);
        assert_eq!(backoff.factor, 1.0);
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = FixedBackoff::new(Duration::from_millis(25));
        for attempt in 0..5 {
            assert_eq!(backoff.next_delay(attempt), Duration::from_millis(25));
        }
    }
}
