//! Bounded retries with exponential backoff.
//!
//! Delay after failed attempt `n` (1-based):
//! `min(initial_delay * backoff_base^(n-1), max_delay)`, optionally spread
//! by `±jitter` so many clients retrying together do not stay in lockstep.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ConfigError, RetryError};
use crate::types::config::RetrySettings;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_base: f64,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_base: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_base: f64,
    ) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".to_string()));
        }
        if !(backoff_base > 1.0) || !backoff_base.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "backoff_base must be a finite number greater than 1.0, got {}",
                backoff_base
            )));
        }
        if max_delay < initial_delay {
            return Err(ConfigError::Invalid(
                "max_delay must not be shorter than initial_delay".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_base,
            jitter: 0.0,
        })
    }

    /// Spread each delay by up to `±fraction` of its value.
    pub fn with_jitter(mut self, fraction: f64) -> Result<Self, ConfigError> {
        if !(0.0..1.0).contains(&fraction) {
            return Err(ConfigError::Invalid(format!(
                "jitter must be in [0, 1), got {}",
                fraction
            )));
        }
        self.jitter = fraction;
        Ok(self)
    }

    pub fn from_settings(settings: &RetrySettings) -> Result<Self, ConfigError> {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.initial_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
            settings.backoff_base,
        )?
        .with_jitter(settings.jitter)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_base(&self) -> f64 {
        self.backoff_base
    }

    /// Backoff after failed attempt `attempt` (1-based), before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.backoff_base.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Longest total time `execute` can spend sleeping between attempts.
    pub fn max_total_delay(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| {
                let delay = self.delay_for_attempt(attempt);
                if self.jitter == 0.0 {
                    delay
                } else {
                    delay.mul_f64(1.0 + self.jitter).min(self.max_delay)
                }
            })
            .sum()
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 {
            return delay;
        }
        let spread = delay.as_secs_f64() * (1.0 + self.jitter * jitter_factor());
        Duration::from_secs_f64(spread.max(0.0)).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with an error `is_retryable`
    /// rejects, or `max_attempts` is reached.
    pub async fn execute<F, Fut, T, E, C>(&self, mut op: F, is_retryable: C) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if !is_retryable(&error) => {
                    debug!(attempt, "Non-retryable failure, giving up");
                    return Err(RetryError::Aborted { attempt, error });
                }
                Err(last) if attempt >= self.max_attempts => {
                    warn!(attempts = attempt, "Retries exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last,
                    });
                }
                Err(_) => {
                    let delay = self.jittered(self.delay_for_attempt(attempt));
                    debug!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Pseudo-random factor in `[-1.0, 1.0]` from a shared LCG.
fn jitter_factor() -> f64 {
    static SEED: AtomicU64 = AtomicU64::new(0);

    if SEED.load(Ordering::Relaxed) == 0 {
        let init = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(12345, |d| d.as_nanos() as u64)
            | 1;
        let _ = SEED.compare_exchange(0, init, Ordering::Relaxed, Ordering::Relaxed);
    }

    const A: u64 = 6_364_136_223_846_793_005;
    const C: u64 = 1_442_695_040_888_963_407;
    let prev = SEED
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
            Some(x.wrapping_mul(A).wrapping_add(C))
        })
        .unwrap_or(42);
    (prev as f64 / u64::MAX as f64) * 2.0 - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn policy(max_attempts: u32, initial_secs: u64, max_secs: u64) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_secs(initial_secs),
            Duration::from_secs(max_secs),
            2.0,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn fails_twice_then_succeeds_with_exact_backoff() {
        let policy = policy(3, 1, 60);
        let calls: Mutex<Vec<Instant>> = Mutex::new(Vec::new());

        let result = policy
            .execute(
                || {
                    let mut calls = calls.lock().unwrap();
                    calls.push(Instant::now());
                    let n = calls.len();
                    async move {
                        if n < 3 {
                            Err(format!("attempt {} failed", n))
                        } else {
                            Ok("ok")
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap(), "ok");
        let calls = calls.lock().unwrap();
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_and_returns_last_error() {
        let policy = policy(3, 1, 60);
        let attempts = Mutex::new(0u32);

        let err = policy
            .execute(
                || {
                    let mut n = attempts.lock().unwrap();
                    *n += 1;
                    let n = *n;
                    async move { Err::<(), _>(format!("attempt {}", n)) }
                },
                |_| true,
            )
            .await
            .unwrap_err();

        assert_eq!(*attempts.lock().unwrap(), 3);
        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.into_inner(), "attempt 3");
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_aborts_immediately() {
        let policy = policy(5, 1, 60);
        let attempts = Mutex::new(0u32);
        let start = Instant::now();

        let err = policy
            .execute(
                || {
                    *attempts.lock().unwrap() += 1;
                    async { Err::<(), _>("401 unauthorized") }
                },
                |e: &&str| !e.starts_with("401"),
            )
            .await
            .unwrap_err();

        assert_eq!(*attempts.lock().unwrap(), 1);
        assert!(!err.is_exhausted());
        assert_eq!(err.into_inner(), "401 unauthorized");
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_policy_never_sleeps() {
        let policy = policy(1, 1, 60);
        let start = Instant::now();
        let err = policy
            .execute(|| async { Err::<(), _>("nope") }, |_| true)
            .await
            .unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn delays_grow_then_cap() {
        let policy = policy(6, 1, 5);
        let delays: Vec<u64> = (1..=5)
            .map(|n| policy.delay_for_attempt(n).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        assert_eq!(policy.delay_for_attempt(10_000), Duration::from_secs(5));
    }

    #[test]
    fn rejects_invalid_parameters() {
        let d = Duration::from_secs(1);
        assert!(RetryPolicy::new(0, d, d, 2.0).is_err());
        assert!(RetryPolicy::new(3, d, d, 1.0).is_err());
        assert!(RetryPolicy::new(3, d, d, f64::NAN).is_err());
        assert!(RetryPolicy::new(3, Duration::from_secs(2), d, 2.0).is_err());
        assert!(RetryPolicy::default().with_jitter(1.0).is_err());
        assert!(RetryPolicy::default().with_jitter(-0.1).is_err());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = policy(5, 4, 60).with_jitter(0.25).unwrap();
        for _ in 0..200 {
            let d = policy.jittered(Duration::from_secs(4)).as_secs_f64();
            assert!((3.0..=5.0).contains(&d), "jittered delay {} out of range", d);
        }
    }

    #[test]
    fn total_delay_covers_every_backoff() {
        assert_eq!(policy(1, 1, 60).max_total_delay(), Duration::ZERO);
        assert_eq!(policy(3, 1, 60).max_total_delay(), Duration::from_secs(3));
        assert_eq!(policy(4, 1, 3).max_total_delay(), Duration::from_secs(6));

        let jittered = policy(3, 2, 60).with_jitter(0.5).unwrap();
        assert_eq!(jittered.max_total_delay(), Duration::from_secs(9));
    }

    #[test]
    fn builds_from_settings() {
        let policy = RetryPolicy::from_settings(&RetrySettings::default()).unwrap();
        assert_eq!(policy.max_attempts(), 2);
        assert_eq!(policy.initial_delay(), Duration::from_millis(250));
        assert_eq!(policy.max_delay(), Duration::from_secs(2));
        assert_eq!(policy.backoff_base(), 2.0);
    }
}
