//! Retry policies: decide whether an attempt should be retried.

use rustpress_core::error::Error;
use std::fmt;

/// Decides whether to retry a failed attempt.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    fn should_retry(&self, attempt: u32, error: &Error) -> bool;
    fn max_attempts(&self) -> u32;
}

/// Never retries.
#[derive(Debug, Clone, Copy)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _attempt: u32, _error: &Error) -> bool {
        false
    }

    fn max_attempts(&self) -> u32 {
        1
    }
}

/// Retries up to `max_attempts`, optionally restricted to a subset of
/// retryable error kinds (by default, every error kind is retryable).
pub struct ExponentialRetry {
    pub max_attempts: u32,
    pub retryable: Option<Box<dyn Fn(&Error) -> bool + Send + Sync>>,
}

impl fmt::Debug for ExponentialRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExponentialRetry")
            .field("max_attempts", &self.max_attempts)
            .field("retryable", &self.retryable.is_some())
            .finish()
    }
}

impl ExponentialRetry {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            retryable: None,
        }
    }

    pub fn with_retryable(max_attempts: u32, retryable: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        Self {
            max_attempts,
            retryable: Some(Box::new(retryable)),
        }
    }
}

impl Default for ExponentialRetry {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy for ExponentialRetry {
    fn should_retry(&self, attempt: u32, error: &Error) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match &self.retryable {
            Some(f) => f(error),
            None => true,
        }
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
