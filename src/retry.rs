//! Retry strategy with exponential backoff.
//!
//! Shared by the channel connect loop and by master task retries.

use std::time::Duration;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default backoff multiplier.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Default upper bound on the delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Default number of attempts for a task (the first try included).
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryStrategy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Factor applied to the delay after each failure
    pub multiplier: f64,
    /// Upper bound on the delay
    pub max_delay: Duration,
    /// Maximum attempts, `None` for unlimited
    pub max_attempts: Option<usize>,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
        }
    }
}

impl RetryStrategy {
    /// Strategy that never retries.
    pub fn none() -> Self {
        Self::default().max_attempts(Some(1))
    }

    /// Strategy with unlimited attempts, used for connection retries.
    pub fn forever(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: None,
            ..Self::default()
        }
    }

    /// Set the initial delay.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the backoff multiplier. Values below 1.0 are treated as 1.0.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Set the maximum delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the maximum number of attempts.
    pub fn max_attempts(mut self, attempts: Option<usize>) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Start a new backoff sequence.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            strategy: self.clone(),
            attempts: 0,
            next_delay: self.initial_delay.min(self.max_delay),
        }
    }
}

/// State of one retry sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    strategy: RetryStrategy,
    attempts: usize,
    next_delay: Duration,
}

impl Backoff {
    /// Number of failed attempts recorded so far.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Record a failed attempt and return the delay before the next one,
    /// or `None` if the attempts are exhausted.
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if let Some(max) = self.strategy.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }

        let delay = self.next_delay;
        self.next_delay = self
            .next_delay
            .mul_f64(self.strategy.multiplier)
            .min(self.strategy.max_delay);
        Some(delay)
    }

    /// Start over after a success.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_delay = self.strategy.initial_delay.min(self.strategy.max_delay);
    }
}
