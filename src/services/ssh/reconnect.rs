//! Exponential backoff shared by tunnel retries, readiness polling and the
//! tunnel monitor.

use std::time::Duration;

/// Configuration for backoff behavior
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay returned by the first call to `next_delay`
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier applied after every attempt
    pub multiplier: f64,
    /// Maximum number of attempts (None = infinite)
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(5),
        }
    }
}

pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_delay: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            attempt: 0,
            config,
        }
    }

    /// Get the next delay, or None if max attempts reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }

        let delay = self.current_delay.min(self.config.max_delay);
        self.attempt += 1;

        let next =
            Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.config.multiplier);
        self.current_delay = next.min(self.config.max_delay);

        Some(delay)
    }

    /// Get the current attempt number (1-based after first call to next_delay)
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Get the maximum number of attempts (or u32::MAX if unlimited)
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.unwrap_or(u32::MAX)
    }

    pub fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt = 0;
    }
}

/// Determine if an SSH tunnel failure is worth retrying.
///
/// Authentication and host key problems will not fix themselves; network
/// trouble and port races might. Unknown errors are not retried.
pub fn is_retriable_error(message: &str) -> bool {
    let message = message.to_lowercase();

    let non_retriable_patterns = [
        "permission denied",
        "authentication failed",
        "auth fail",
        "host key verification failed",
        "no supported authentication",
        "too many authentication failures",
        "invalid format",
        "bad permissions",
        "load key",
        "key rejected",
        "publickey denied",
    ];

    if non_retriable_patterns.iter().any(|p| message.contains(p)) {
        return false;
    }

    let retriable_patterns = [
        "connection refused",
        "connection timed out",
        "connection reset",
        "connection closed",
        "network unreachable",
        "network is unreachable",
        "host unreachable",
        "no route to host",
        "could not resolve hostname",
        "not listening",
        "address already in use",
        "temporary failure",
        "try again",
    ];

    retriable_patterns.iter().any(|p| message.contains(p))
}
