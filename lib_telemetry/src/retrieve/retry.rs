//! # Retry Executor
//!
//! Runs a fallible async operation a bounded number of times with deterministic
//! exponential backoff. There is no jitter: the `n`-th wait is always
//! `initial_delay * factor^(n-1)`, which keeps paused-clock tests exact.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Upper bound for a single backoff wait.
pub const MAX_DELAY: Duration = Duration::from_secs(3600);

/// Attempt count and backoff curve for [`retry`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below 1 are treated as 1.
    pub attempts: u32,
    /// Wait before the second attempt.
    pub initial_delay: Duration,
    /// Multiplier applied to the wait after every failed attempt.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Wait that precedes attempt number `attempt` (1-based). Zero for the first.
    ///
    /// Capped at [`MAX_DELAY`], which is also what an overflowing product yields.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.max(0.0).powi(exponent);
        Duration::try_from_secs_f64(secs)
            .map(|delay| delay.min(MAX_DELAY))
            .unwrap_or(MAX_DELAY)
    }

    /// Sum of every wait a fully failing run sleeps through.
    pub fn total_backoff(&self) -> Duration {
        (1..=self.attempts.max(1))
            .map(|n| self.delay_before(n))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// Runs `op` until it succeeds or `policy.attempts` are used up.
///
/// Returns the first success, or the error of the final attempt unchanged.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                let delay = policy.delay_before(attempt + 1);
                log::warn!(
                    "Attempt {}/{} failed: {}. Retrying in {:?}...",
                    attempt,
                    attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }

    #[test]
    fn delays_grow_geometrically() {
        let p = policy();
        assert_eq!(p.delay_before(1), Duration::ZERO);
        assert_eq!(p.delay_before(2), Duration::from_secs(10));
        assert_eq!(p.delay_before(3), Duration::from_secs(20));
        assert_eq!(p.total_backoff(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_failures_with_k_plus_one_calls() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let start = Instant::now();

        let out: Result<&str, String> = retry(&policy(), || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("boom {}", n))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(out, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_run_returns_last_error_and_sleeps_total_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let start = Instant::now();

        let out: Result<(), String> = retry(&policy(), || {
            let c = c.clone();
            async move { Err(format!("fail {}", c.fetch_add(1, Ordering::SeqCst) + 1)) }
        })
        .await;

        assert_eq!(out, Err("fail 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(10 + 20));
    }

    #[test]
    fn oversized_backoff_is_capped() {
        let p = RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_secs(10),
            backoff_factor: 1e300,
        };
        assert_eq!(p.delay_before(2), Duration::from_secs(10));
        assert_eq!(p.delay_before(3), MAX_DELAY);
        assert_eq!(p.delay_before(u32::MAX), MAX_DELAY);

        let infinite = RetryPolicy {
            backoff_factor: f64::INFINITY,
            ..p
        };
        assert_eq!(infinite.delay_before(3), MAX_DELAY);
        assert_eq!(infinite.total_backoff(), Duration::from_secs(10) + MAX_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_backoff_factor_still_returns_the_last_error() {
        let p = RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_secs(10),
            backoff_factor: 1e300,
        };
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let out: Result<(), &str> = retry(&p, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("down") }
        })
        .await;

        assert_eq!(out, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(10) + MAX_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_runs_once() {
        let p = RetryPolicy {
            attempts: 0,
            ..policy()
        };
        let calls = AtomicU32::new(0);
        let out: Result<(), &str> = retry(&p, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope") }
        })
        .await;
        assert_eq!(out, Err("nope"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
