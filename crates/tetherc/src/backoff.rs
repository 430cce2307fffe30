use std::time::Duration;

/// Fixed-interval retry schedule with a cap on consecutive failures.
#[derive(Debug)]
pub struct FixedBackoff {
    interval: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl FixedBackoff {
    /// Creates a new `FixedBackoff` allowing `max_attempts` consecutive
    /// failures, each followed by `interval` of waiting.
    ///
    /// # Examples
    ///
    /// ```
    /// use tetherc::backoff::FixedBackoff;
    /// use std::time::Duration;
    /// let mut backoff = FixedBackoff::new(Duration::from_secs(2), 2);
    /// assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
    /// assert_eq!(backoff.next_delay(), None);
    /// ```
    #[must_use]
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            attempts: 0,
        }
    }

    /// Record a failed attempt. Returns the delay before the next one, or
    /// `None` once `max_attempts` failures have been recorded.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.max_attempts {
            None
        } else {
            Some(self.interval)
        }
    }

    /// Forget past failures after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Consecutive failures recorded since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}
