//! Backoff strategies: pure functions from attempt number to a delay in
//! seconds. No state, no I/O.

use rand::Rng;
use std::fmt;

/// Produces the delay before retrying an attempt.
pub trait Backoff: Send + Sync + fmt::Debug {
    /// `attempt` is 1-based: the attempt that just failed.
    fn next_delay(&self, attempt: u32) -> f64;
}

/// `delay = min(cap, base * 2^(attempt-1))`, then a symmetric
/// multiplicative jitter `delay + (rand() * 2 - 1) * jitter * delay`,
/// clamped at zero.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base_secs: f64,
    pub cap_secs: f64,
    pub jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_secs: 1.0,
            cap_secs: 60.0,
            jitter: 0.2,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base_secs: f64, cap_secs: f64, jitter: f64) -> Self {
        Self {
            base_secs,
            cap_secs,
            jitter,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> f64 {
        let delay = self.cap_secs.min(self.base_secs * 2f64.powi(attempt as i32 - 1));
        let jitter_amt = if self.jitter > 0.0 {
            let r: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
            r * self.jitter * delay
        } else {
            0.0
        };
        (delay + jitter_amt).max(0.0)
    }
}

/// Constant delay regardless of attempt number.
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    pub delay_secs: f64,
}

impl Backoff for FixedBackoff {
    fn next_delay(&self, _attempt: u32) -> f64 {
        self.delay_secs.max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_no_jitter() {
        let backoff = ExponentialBackoff::new(1.0, 60.0, 0.0);
        assert_eq!(backoff.next_delay(1), 1.0);
        assert_eq!(backoff.next_delay(2), 2.0);
        assert_eq!(backoff.next_delay(3), 4.0);
        assert_eq!(backoff.next_delay(4), 8.0);
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = ExponentialBackoff::new(1.0, 10.0, 0.0);
        assert_eq!(backoff.next_delay(10), 10.0);
    }

    #[test]
    fn test_exponential_backoff_jitter_bounds() {
        let backoff = ExponentialBackoff::new(4.0, 60.0, 0.2);
        for attempt in 1..6 {
            let delay = backoff.next_delay(attempt);
            let base = 4.0 * 2f64.powi(attempt as i32 - 1);
            let base = base.min(60.0);
            assert!(delay >= (base * 0.8).max(0.0) - 1e-9);
            assert!(delay <= base * 1.2 + 1e-9);
        }
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = FixedBackoff { delay_secs: 2.5 };
        assert_eq!(backoff.next_delay(1), 2.5);
        assert_eq!(backoff.next_delay(99), 2.5);
    }
}
