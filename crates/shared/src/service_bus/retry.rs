//! Retry policies and backoff calculation for directed deliveries
//!
//! Each priority class maps onto a [`RetryPolicy`] that bounds the number of
//! delivery attempts and computes the wait before the next one.
//!
//! ## Key Features
//!
//! - **Attempt Ceilings**: LOW 1, NORMAL 3, HIGH 10, CRITICAL unbounded
//! - **Backoff Strategies**: none, linear, capped linear, capped exponential
//! - **Jitter**: optional randomization as a fraction of the computed delay
//!
//! ## Usage Example
//!
//! ```rust
//! use meridian_shared::service_bus::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::critical();
//! assert!(policy.allows_retry(1_000));
//! assert_eq!(policy.delay_for(1), Duration::from_secs(1));
//! assert_eq!(policy.delay_for(3), Duration::from_secs(4));
//! ```

use super::types::Priority;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Growth strategy between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Retry immediately
    None,
    /// `attempt × base`
    Linear,
    /// `min(attempt × base, max)`
    LinearCapped,
    /// `min(base × factor^(attempt - 1), max)`
    Exponential { factor: u32 },
}

/// Attempt ceiling and backoff for one priority class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts, `None` for unbounded
    pub max_attempts: Option<u32>,

    /// Base delay fed into the strategy
    pub base_delay: Duration,

    /// Upper bound applied by the capped strategies
    pub max_delay: Duration,

    /// Growth strategy
    pub strategy: BackoffStrategy,

    /// Jitter factor for backoff randomization (0.0 to 1.0)
    #[serde(default)]
    pub jitter_factor: f64,
}

impl RetryPolicy {
    /// Single attempt, no backoff
    pub fn low() -> Self {
        Self {
            max_attempts: Some(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            strategy: BackoffStrategy::None,
            jitter_factor: 0.0,
        }
    }

    /// Three attempts, linear backoff on a 1s base
    pub fn normal() -> Self {
        Self {
            max_attempts: Some(3),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            strategy: BackoffStrategy::Linear,
            jitter_factor: 0.0,
        }
    }

    /// Ten attempts, linear backoff on a 1s base capped at 30s
    pub fn high() -> Self {
        Self {
            max_attempts: Some(10),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::LinearCapped,
            jitter_factor: 0.0,
        }
    }

    /// Unbounded attempts, doubling from 1s up to 5 minutes
    pub fn critical() -> Self {
        Self {
            max_attempts: None,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential { factor: 2 },
            jitter_factor: 0.0,
        }
    }

    /// Returns the default policy for a priority class
    pub fn for_priority(priority: Priority) -> Self {
        match priority {
            Priority::Low => Self::low(),
            Priority::Normal => Self::normal(),
            Priority::High => Self::high(),
            Priority::Critical => Self::critical(),
        }
    }

    /// Returns whether another attempt may follow `attempts_made` attempts
    ///
    /// # Examples
    ///
    /// ```rust
    /// use meridian_shared::service_bus::RetryPolicy;
    ///
    /// let policy = RetryPolicy::normal();
    /// assert!(policy.allows_retry(2));
    /// assert!(!policy.allows_retry(3));
    /// assert!(!RetryPolicy::low().allows_retry(1));
    /// ```
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts_made < max,
            None => true,
        }
    }

    /// Calculates the wait before the attempt following `attempt`
    ///
    /// # Arguments
    ///
    /// * `attempt` - Number of attempts already made (1 after the first failure)
    ///
    /// # Returns
    ///
    /// The backoff delay, with jitter added when `jitter_factor > 0`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.base_delay;

        let delay = match self.strategy {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Linear => base.saturating_mul(attempt),
            BackoffStrategy::LinearCapped => base.saturating_mul(attempt).min(self.max_delay),
            BackoffStrategy::Exponential { factor } => {
                let multiplier = factor.max(1).saturating_pow(attempt - 1);
                base.saturating_mul(multiplier).min(self.max_delay)
            }
        };

        self.apply_jitter(delay)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }

        let jitter_range = (delay.as_millis() as f64 * self.jitter_factor.min(1.0)) as u64;
        if jitter_range == 0 {
            return delay;
        }
        delay + Duration::from_millis(fastrand::u64(0..=jitter_range))
    }
}

/// Retry policies keyed by priority class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicies {
    pub low: RetryPolicy,
    pub normal: RetryPolicy,
    pub high: RetryPolicy,
    pub critical: RetryPolicy,
}

impl RetryPolicies {
    /// Returns the policy governing a priority class
    pub fn for_priority(&self, priority: Priority) -> &RetryPolicy {
        match priority {
            Priority::Low => &self.low,
            Priority::Normal => &self.normal,
            Priority::High => &self.high,
            Priority::Critical => &self.critical,
        }
    }
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            low: RetryPolicy::low(),
            normal: RetryPolicy::normal(),
            high: RetryPolicy::high(),
            critical: RetryPolicy::critical(),
        }
    }
}
