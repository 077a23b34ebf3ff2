//! Retry throttling: a token-bucket gate guarding against retry storms.
//!
//! One throttle instance is shared by every call attempt on a transport.
//! Successful attempts refill the bucket, retry-eligible failures drain it,
//! and retries are only permitted while the bucket is more than half full.
//! The asymmetric threshold keeps the gate from oscillating between "just
//! barely allowed" and "just barely denied" under sustained partial failure.

use std::sync::{Arc, Mutex};

/// Invalid throttle parameters, rejected at construction.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ThrottleConfigError {
    /// `max_tokens` must be greater than zero.
    #[error("max_tokens must be greater than zero, got {0}")]
    MaxTokens(f64),

    /// `token_ratio` must be in `(0, 1]`.
    #[error("token_ratio must be in (0, 1], got {0}")]
    TokenRatio(f64),
}

/// A token-bucket gate deciding whether a failed call may be retried.
///
/// The bucket starts full at `max_tokens`. Every completed attempt mutates
/// it: a success (or a failure that does not qualify for retry under policy)
/// restores one token, a retry-eligible failure costs
/// `token_ratio * max_tokens`. [`is_retry_permitted`](Self::is_retry_permitted)
/// is true only while more than half the tokens remain.
///
/// Cloning shares the underlying state; all reads and updates are serialized
/// through a single lock so concurrent attempts observe consistent snapshots.
///
/// # Example
///
/// ```
/// use trellis_core::RetryThrottle;
///
/// let throttle = RetryThrottle::new(10.0, 0.1).unwrap();
/// assert!(throttle.is_retry_permitted());
///
/// throttle.record_retryable_failure();
/// throttle.record_success();
/// ```
#[derive(Clone, Debug)]
pub struct RetryThrottle {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    max_tokens: f64,
    token_ratio: f64,
    tokens: Mutex<f64>,
}

impl RetryThrottle {
    /// Create a throttle with the given bucket size and failure cost ratio.
    ///
    /// Fails with [`ThrottleConfigError`] if `max_tokens` is not greater than
    /// zero or `token_ratio` is outside `(0, 1]`.
    pub fn new(max_tokens: f64, token_ratio: f64) -> Result<Self, ThrottleConfigError> {
        if !(max_tokens > 0.0) {
            return Err(ThrottleConfigError::MaxTokens(max_tokens));
        }
        if !(token_ratio > 0.0 && token_ratio <= 1.0) {
            return Err(ThrottleConfigError::TokenRatio(token_ratio));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                max_tokens,
                token_ratio,
                tokens: Mutex::new(max_tokens),
            }),
        })
    }

    /// Returns whether a retry attempt is currently permitted.
    ///
    /// True iff the current token count is strictly greater than half of
    /// `max_tokens`.
    pub fn is_retry_permitted(&self) -> bool {
        *self.lock_tokens() > self.shared.max_tokens / 2.0
    }

    /// Record a successful attempt, or a failure that does not qualify for
    /// retry under policy. Restores one token, clamped to `max_tokens`.
    pub fn record_success(&self) {
        let mut tokens = self.lock_tokens();
        *tokens = (*tokens + 1.0).min(self.shared.max_tokens);
    }

    /// Record a retry-eligible failure. Costs `token_ratio * max_tokens`,
    /// clamped to zero.
    pub fn record_retryable_failure(&self) {
        let mut tokens = self.lock_tokens();
        *tokens = (*tokens - self.shared.token_ratio * self.shared.max_tokens).max(0.0);
        tracing::trace!(tokens = *tokens, "retry throttle drained");
    }

    /// The configured bucket size.
    pub fn max_tokens(&self) -> f64 {
        self.shared.max_tokens
    }

    /// The configured cost ratio charged per retry-eligible failure.
    pub fn token_ratio(&self) -> f64 {
        self.shared.token_ratio
    }

    /// The current token count.
    pub fn tokens(&self) -> f64 {
        *self.lock_tokens()
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, f64> {
        // Token arithmetic cannot panic, so a poisoned lock still holds a
        // valid count.
        self.shared
            .tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RetryThrottle {
    /// The standard throttle: a bucket of 10 tokens costing 1 per
    /// retry-eligible failure.
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                max_tokens: 10.0,
                token_ratio: 0.1,
                tokens: Mutex::new(10.0),
            }),
        }
    }
}
