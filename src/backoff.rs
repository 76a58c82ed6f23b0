//! Exponential backoff shared by the watcher and the fill submitter.

use crate::shutdown::Shutdown;

use std::time::Duration;

/// Exponential backoff with a ceiling.
///
/// The delay for attempt `n` (zero-based) is `initial * multiplier^n`, capped at `max`.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial: Duration,
    /// Factor applied after each attempt
    pub multiplier: f64,
    /// Upper bound on any single delay
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            multiplier: 2.0,
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Default::default()
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let backoff = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(backoff.min(self.max.as_millis() as f64) as u64)
    }

    /// Sleep for the delay of `attempt`, returning `false` if shutdown fired first.
    pub async fn wait(&self, attempt: u32, shutdown: &Shutdown) -> bool {
        shutdown.sleep(self.delay(attempt)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(1000),
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_millis(1000));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_wait_is_cut_short_by_shutdown() {
        let shutdown = Shutdown::new();
        let policy = BackoffPolicy::new(Duration::from_secs(3600), Duration::from_secs(3600));
        shutdown.trigger();

        assert!(!policy.wait(0, &shutdown).await);
    }
}
