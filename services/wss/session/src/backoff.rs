//! Linear reconnect backoff.

use std::time::Duration;

/// Initial retry delay
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(5);
/// Amount added after each failed attempt
pub const DEFAULT_DELAY_STEP: Duration = Duration::from_secs(2);
/// Delay ceiling
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Backoff shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// First delay
    pub initial: Duration,
    /// Increment per failure
    pub step: Duration,
    /// Ceiling
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_DELAY,
            step: DEFAULT_DELAY_STEP,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

/// Delay to wait after each consecutive failure: `initial`, `initial + step`,
/// ... never exceeding `max`. Only [`Backoff::reset`] brings it back down.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    /// Fresh backoff
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial.min(config.max),
            config,
        }
    }

    /// Delay the next failure will wait
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Take the delay for this failure and grow it for the next one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current + self.config.step).min(self.config.max);
        delay
    }

    /// Back to the initial delay
    pub fn reset(&mut self) {
        self.current = self.config.initial.min(self.config.max);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
