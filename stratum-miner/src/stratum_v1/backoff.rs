//! Reconnect delay schedule.

use std::time::Duration;

/// Reconnect policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound on any single delay
    pub cap: Duration,
    /// Consecutive failed attempts allowed before giving up
    pub max_attempts: u32,
    /// Time a session must stay authorized before the schedule starts over
    pub reset_after: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_attempts: 10,
            reset_after: Duration::from_secs(60),
        }
    }
}

/// Exponential backoff: `base`, `2·base`, `4·base`, ... clamped to `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Count a failed attempt and return how long to wait before the next
    /// one, or `None` once `max_attempts` is used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        let exp = self.attempts.min(31);
        self.attempts += 1;

        let delay = self
            .config
            .base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.config.cap);
        Some(delay.min(self.config.cap))
    }

    /// Start the schedule over.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Reset if a session stayed authorized for at least `reset_after`.
    ///
    /// Returns whether the schedule was reset.
    pub fn observe_uptime(&mut self, authorized_for: Duration) -> bool {
        if authorized_for >= self.config.reset_after {
            self.reset();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(max_attempts: u32) -> Backoff {
        Backoff::new(BackoffConfig {
            max_attempts,
            ..Default::default()
        })
    }

    #[test]
    fn test_doubles_until_cap_then_constant() {
        let mut b = backoff(10);
        let delays: Vec<u64> = std::iter::from_fn(|| b.next_delay())
            .map(|d| d.as_secs())
            .collect();

        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60, 60]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_exhaustion() {
        let mut b = backoff(3);
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert_eq!(b.next_delay(), None);
        assert_eq!(b.attempts(), 3);
    }

    #[test]
    fn test_resets_after_sustained_connection() {
        let mut b = backoff(10);
        b.next_delay();
        b.next_delay();
        b.next_delay();

        // Short-lived session does not reset the schedule
        assert!(!b.observe_uptime(Duration::from_secs(5)));
        assert_eq!(b.next_delay(), Some(Duration::from_secs(8)));

        assert!(b.observe_uptime(Duration::from_secs(60)));
        assert_eq!(b.attempts(), 0);
        assert_eq!(b.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_huge_attempt_counts_stay_capped() {
        let mut b = Backoff::new(BackoffConfig {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            max_attempts: 100,
            reset_after: Duration::from_secs(60),
        });
        let last = std::iter::from_fn(|| b.next_delay()).last();
        assert_eq!(last, Some(Duration::from_secs(30)));
    }
}
