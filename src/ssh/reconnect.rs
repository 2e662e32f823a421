//! Bounded reconnection backoff.

use std::time::Duration;

/// Configuration for reconnection behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt (1.0 = fixed delay)
    pub multiplier: f64,
    /// Consecutive failed attempts allowed before giving up for good
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 1.0,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Fixed delay between attempts
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            max_attempts,
        }
    }
}

/// Attempt counter and delay schedule for one manager.
///
/// The attempt count is the reconnect counter: it only grows while the
/// tunnel is down and is reset on every successful connect.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            attempt: 0,
            config,
        }
    }

    /// Count one more attempt and return its delay, or None once the
    /// ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }

        let delay = self.current_delay;
        self.attempt += 1;

        let next =
            Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.config.multiplier);
        self.current_delay = next.min(self.config.max_delay);

        Some(delay)
    }

    /// Attempts made since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    pub fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt = 0;
    }
}
