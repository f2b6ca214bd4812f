//! Exponential backoff for transient provider failures.
//!
//! [`RetryExecutor::execute`] runs an operation, and on a retryable
//! [`ProviderError`] sleeps for `min(base * 2^(n-1), max)` (jittered into
//! `[0.5, 1.0]` of that value) before attempt `n + 1`. Non-retryable
//! errors are returned straight away.
//!
//! Sleeping and jitter go through the [`Sleeper`] and [`Jitter`] traits so
//! tests can run the loop deterministically without waiting.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng as _;
use serde::{Deserialize, Serialize};

use crate::{ErrorCode, ProviderError};

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 8000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Un-jittered delay applied after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let delay = self.base_delay_ms.saturating_mul(1_u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Sum of all un-jittered delays when every attempt fails.
    #[must_use]
    pub fn worst_case_backoff(&self) -> Duration {
        (1..=self.max_retries).map(|n| self.delay_for_attempt(n)).sum()
    }
}

/// Suspends the retry loop between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Waits for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Spreads retry delays so concurrent callers do not retry in lockstep.
pub trait Jitter: Send + Sync {
    /// Returns the delay to actually wait, within `[0.5, 1.0] * delay`.
    fn apply(&self, delay: Duration) -> Duration;
}

/// Uniform random jitter in `[0.5, 1.0] * delay`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn apply(&self, delay: Duration) -> Duration {
        let factor: f64 = rand::rng().random_range(0.5..=1.0);
        delay.mul_f64(factor)
    }
}

/// Deterministic jitter that always applies the same factor.
///
/// The factor is clamped to `[0.5, 1.0]`.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl Jitter for FixedJitter {
    fn apply(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.0.clamp(0.5, 1.0))
    }
}

/// Runs provider operations under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    jitter: Arc<dyn Jitter>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    /// Executor that really sleeps and uses random jitter.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            sleeper: Arc::new(TokioSleeper),
            jitter: Arc::new(RandomJitter),
        }
    }

    /// Replaces the sleeper.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Replaces the jitter source.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Arc<dyn Jitter>) -> Self {
        self.jitter = jitter;
        self
    }

    /// The active policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, fails permanently, or the
    /// retries are used up.
    ///
    /// The closure receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns the operation's error unchanged when it is not retryable.
    /// When retries run out, returns a [`ErrorCode::MaxRetriesExceeded`]
    /// error whose cause is the last failure.
    pub async fn execute<T, F, Fut>(
        &self,
        provider: &str,
        mut operation: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1;

        loop {
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.retryable {
                log::debug!("{provider}: non-retryable failure on attempt {attempt}: {err}");
                return Err(err);
            }

            if attempt > self.policy.max_retries {
                log::warn!(
                    "{provider}: giving up after {attempt} attempts, last error: {err}"
                );
                return Err(ProviderError::new(
                    provider,
                    ErrorCode::MaxRetriesExceeded,
                    format!(
                        "max retries ({}) exceeded after {attempt} attempts",
                        self.policy.max_retries
                    ),
                )
                .with_retryable(false)
                .with_cause(err));
            }

            let delay = self.jitter.apply(self.policy.delay_for_attempt(attempt));
            log::warn!(
                "{provider}: attempt {attempt} failed ({}), retry {attempt}/{} in {delay:?}",
                err.code,
                self.policy.max_retries
            );
            self.sleeper.sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    fn executor(policy: RetryPolicy, jitter: f64) -> (RetryExecutor, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::default());
        let executor = RetryExecutor::new(policy)
            .with_sleeper(sleeper.clone())
            .with_jitter(Arc::new(FixedJitter(jitter)));
        (executor, sleeper)
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(8000));
        assert_eq!(policy.worst_case_backoff(), Duration::from_millis(7000));
    }

    #[test]
    fn random_jitter_stays_in_bounds() {
        let delay = Duration::from_millis(4000);
        for _ in 0..1000 {
            let jittered = RandomJitter.apply(delay);
            assert!(jittered >= Duration::from_millis(2000), "{jittered:?}");
            assert!(jittered <= delay, "{jittered:?}");
        }
    }

    #[test]
    fn fixed_jitter_is_clamped() {
        let delay = Duration::from_millis(1000);
        assert_eq!(FixedJitter(0.1).apply(delay), Duration::from_millis(500));
        assert_eq!(FixedJitter(2.0).apply(delay), delay);
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let (executor, sleeper) = executor(RetryPolicy::default(), 1.0);
        let calls = AtomicU32::new(0);

        let result = executor
            .execute("google", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(ProviderError::new("google", ErrorCode::ServerError, "503"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
    }

    #[tokio::test]
    async fn non_retryable_failure_is_attempted_once() {
        let (executor, sleeper) = executor(RetryPolicy::default(), 1.0);
        let calls = AtomicU32::new(0);

        let err = executor
            .execute("google", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(ProviderError::new("google", ErrorCode::Unauthorized, "denied"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::Unauthorized);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhaustion_wraps_last_error() {
        let (executor, sleeper) = executor(RetryPolicy::default(), 0.5);
        let calls = AtomicU32::new(0);

        let err = executor
            .execute("here", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Err::<(), _>(ProviderError::unexpected("here", format!("boom {attempt}")))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.code, ErrorCode::MaxRetriesExceeded);
        assert!(!err.retryable);
        let cause = err.cause.as_deref().unwrap();
        assert_eq!(cause.code, ErrorCode::Unexpected);
        assert_eq!(cause.message, "boom 4");

        let slept = sleeper.slept.lock().unwrap().clone();
        assert_eq!(
            slept,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
            ]
        );
    }

    #[tokio::test]
    async fn zero_retries_gives_up_after_first_failure() {
        let (executor, sleeper) = executor(RetryPolicy::no_retry(), 1.0);
        let err = executor
            .execute("osm", |_| async {
                Err::<(), _>(ProviderError::new("osm", ErrorCode::Timeout, "slow"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MaxRetriesExceeded);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: RetryPolicy = toml::from_str("max_retries = 5").unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 8000);
    }
}
