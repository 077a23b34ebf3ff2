//! Per-method call policy.
//!
//! A [`MethodConfig`] is looked up from the transport by
//! [`MethodDescriptor`](crate::MethodDescriptor) and is read-only from the
//! pipeline's perspective. Configs typically originate from a service-config
//! document, so the types here derive [`serde::Deserialize`].

use std::time::Duration;

use serde::Deserialize;

use crate::error::Code;

/// Default retry policy values.
pub mod defaults {
    use std::time::Duration;

    /// Default total number of attempts (the original call plus retries).
    pub const MAX_ATTEMPTS: u32 = 3;

    /// Default delay before the first retry.
    pub const BASE_DELAY: Duration = Duration::from_millis(100);

    /// Default maximum delay between attempts.
    pub const MAX_DELAY: Duration = Duration::from_secs(10);

    /// Default multiplier for exponential backoff.
    pub const MULTIPLIER: f64 = 1.6;

    /// Default jitter factor (0.2 means +/- 20%).
    pub const JITTER: f64 = 0.2;
}

/// Policy for a single method, looked up by descriptor.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MethodConfig {
    /// Retry policy for the method. `None` means failures are never retried.
    pub retry: Option<RetryPolicy>,

    /// Deadline applied to the whole call, covering all attempts.
    pub timeout: Option<Duration>,
}

/// Configuration for retrying failed call attempts.
///
/// A failure qualifies for a retry when its status code is retryable under
/// this policy, the attempt budget is not exhausted, and the transport's
/// [`RetryThrottle`](crate::RetryThrottle) permits it.
///
/// # Example
///
/// ```
/// use trellis_core::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new()
///     .max_attempts(5)
///     .base_delay(Duration::from_millis(50));
/// assert!(policy.validate().is_ok());
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the original call. Must be >= 1.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Maximum delay between attempts; backoff never exceeds this.
    pub max_delay: Duration,

    /// Multiplier for exponential backoff. Must be >= 1.0.
    pub multiplier: f64,

    /// Jitter factor in `[0, 1]` randomising each delay by +/- that fraction.
    pub jitter: f64,

    /// Status codes that qualify for a retry. An empty list falls back to
    /// [`Code::is_retryable`].
    #[serde(skip)]
    pub retryable_codes: Vec<Code>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_ATTEMPTS,
            base_delay: defaults::BASE_DELAY,
            max_delay: defaults::MAX_DELAY,
            multiplier: defaults::MULTIPLIER,
            jitter: defaults::JITTER,
            retryable_codes: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Create a new policy with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total attempt budget.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the delay before the first retry.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay between attempts.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter factor.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Restrict retries to the given status codes.
    pub fn retryable_codes(mut self, codes: Vec<Code>) -> Self {
        self.retryable_codes = codes;
        self
    }

    /// Validate the policy configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1");
        }
        if self.base_delay > self.max_delay {
            return Err("base_delay must not exceed max_delay");
        }
        if self.multiplier < 1.0 {
            return Err("multiplier must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("jitter must be between 0.0 and 1.0");
        }
        Ok(())
    }

    /// Returns whether a failure with the given code qualifies for a retry
    /// under this policy.
    pub fn is_code_retryable(&self, code: Code) -> bool {
        if self.retryable_codes.is_empty() {
            code.is_retryable()
        } else {
            self.retryable_codes.contains(&code)
        }
    }

    /// Compute the backoff delay before the retry following the given attempt
    /// (1-indexed), applying jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent as i32);
        let delay = delay.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let jitter_range = self.jitter * 2.0;
            let random_factor = rand::random::<f64>() * jitter_range - self.jitter;
            delay * (1.0 + random_factor)
        } else {
            delay
        };

        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
        assert!((policy.multiplier - 1.6).abs() < f64::EPSILON);
        assert!((policy.jitter - 0.2).abs() < f64::EPSILON);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_retry_policy_builder() {
        let policy = RetryPolicy::new()
            .max_attempts(5)
            .base_delay(Duration::from_millis(10))
            .max_delay(Duration::from_secs(1))
            .multiplier(2.0)
            .jitter(0.0);

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(10));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_retry_policy_validate_rejects_bad_config() {
        assert!(RetryPolicy::new().max_attempts(0).validate().is_err());
        assert!(RetryPolicy::new().multiplier(0.5).validate().is_err());
        assert!(RetryPolicy::new().jitter(1.5).validate().is_err());
        assert!(
            RetryPolicy::new()
                .base_delay(Duration::from_secs(60))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_retry_policy_code_classification() {
        let policy = RetryPolicy::default();
        assert!(policy.is_code_retryable(Code::Unavailable));
        assert!(!policy.is_code_retryable(Code::Internal));

        let policy = policy.retryable_codes(vec![Code::Internal]);
        assert!(policy.is_code_retryable(Code::Internal));
        assert!(!policy.is_code_retryable(Code::Unavailable));
    }

    #[test]
    fn test_delay_for_attempt_grows_exponentially() {
        let policy = RetryPolicy::new()
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(100))
            .multiplier(2.0)
            .jitter(0.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_for_attempt_clamps_to_max() {
        let policy = RetryPolicy::new()
            .base_delay(Duration::from_secs(5))
            .max_delay(Duration::from_secs(8))
            .multiplier(10.0)
            .jitter(0.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_for_attempt_with_jitter_stays_in_band() {
        let policy = RetryPolicy::new()
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(100))
            .multiplier(2.0)
            .jitter(0.2);

        let delay = policy.delay_for_attempt(1);
        assert!(delay >= Duration::from_millis(800));
        assert!(delay <= Duration::from_millis(1200));
    }

    #[test]
    fn test_method_config_from_json() {
        let config: MethodConfig = serde_json::from_str(
            r#"{"retry": {"max_attempts": 4, "base_delay": {"secs": 0, "nanos": 50000000}}}"#,
        )
        .unwrap();
        let retry = config.retry.unwrap();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.base_delay, Duration::from_millis(50));
        assert!(config.timeout.is_none());
    }
}
