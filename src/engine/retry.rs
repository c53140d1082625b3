//! Bounded retry with exponential backoff and jitter.
//!
//! Wraps a single operation; the circuit breaker wraps the *entire* retry
//! sequence as one logical call (see [`crate::engine::ResilienceEngine::guarded`]),
//! so transient blips absorbed here never trip the breaker prematurely.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Deterministic part of the backoff: `min(base * 2^(attempt-1), max)`.
    /// `attempt` is 1-based (the attempt that just failed).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(1u64 << exp);
        Duration::from_millis(millis).min(self.max_delay)
    }
}

type ClassifyFn = Box<dyn Fn(&AppError) -> bool + Send + Sync>;
type OnRetryFn = Box<dyn Fn(u32, &AppError) + Send + Sync>;

/// One configured retry execution. Consumed by [`Retry::run`].
pub struct Retry {
    policy: RetryPolicy,
    classify: Option<ClassifyFn>,
    on_retry: Option<OnRetryFn>,
}

impl Retry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            classify: None,
            on_retry: None,
        }
    }

    /// Restrict which errors are worth retrying. Without a classifier every
    /// error is considered retryable; daemon calls pass
    /// [`AppError::is_transient`].
    pub fn retry_if(mut self, f: impl Fn(&AppError) -> bool + Send + Sync + 'static) -> Self {
        self.classify = Some(Box::new(f));
        self
    }

    /// Observe each scheduled retry (attempt number that failed, its error).
    pub fn on_retry(mut self, f: impl Fn(u32, &AppError) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Box::new(f));
        self
    }

    /// Attempt `op` up to `max_attempts` times, sleeping between attempts
    /// with exponential backoff plus random jitter in `[0, delay/4]`.
    pub async fn run<T, F, Fut>(self, mut op: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut last_err: Option<AppError> = None;

        for attempt in 1..=self.policy.max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let retryable = self.classify.as_ref().map_or(true, |c| c(&e));
                    if !retryable {
                        return Err(AppError::NonRetryable(e.to_string()));
                    }

                    if attempt < self.policy.max_attempts {
                        let delay = with_jitter(self.policy.backoff_delay(attempt));
                        tracing::debug!(
                            attempt,
                            max_attempts = self.policy.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Retrying after backoff",
                        );
                        if let Some(cb) = &self.on_retry {
                            cb(attempt, &e);
                        }
                        last_err = Some(e);
                        tokio::time::sleep(delay).await;
                    } else {
                        last_err = Some(e);
                    }
                }
            }
        }

        Err(AppError::RetryExhausted {
            attempts: self.policy.max_attempts,
            source: Box::new(last_err.unwrap_or(AppError::Internal("no attempts made".into()))),
        })
    }
}

/// Add random jitter in `[0, delay/4]` so concurrent callers do not retry in
/// lockstep.
fn with_jitter(delay: Duration) -> Duration {
    let quarter = delay.as_millis() as u64 / 4;
    if quarter == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=quarter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = Retry::new(policy(3))
            .run(move || {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(AppError::Timeout("blip".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), _> = Retry::new(policy(3))
            .run(move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::Connect("refused".into()))
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            AppError::RetryExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert_eq!(source.kind(), "connect");
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_invoked_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), _> = Retry::new(policy(5))
            .retry_if(AppError::is_transient)
            .run(move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::Http {
                        status: 400,
                        message: "bad request".into(),
                    })
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(AppError::NonRetryable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_retry_sees_attempt_numbers() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let _: Result<(), _> = Retry::new(policy(3))
            .on_retry(move |attempt, _err| seen2.lock().unwrap().push(attempt))
            .run(move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::Timeout("blip".into()))
                }
            })
            .await;
        // Called before each backoff wait, not after the final failure
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    proptest! {
        #[test]
        fn prop_backoff_never_exceeds_max(attempt in 1u32..64, base in 1u64..10_000, max in 1u64..120_000) {
            let p = RetryPolicy {
                max_attempts: 10,
                base_delay: Duration::from_millis(base),
                max_delay: Duration::from_millis(max),
            };
            prop_assert!(p.backoff_delay(attempt) <= p.max_delay);
        }

        #[test]
        fn prop_backoff_is_nondecreasing(attempt in 1u32..32) {
            let p = RetryPolicy {
                max_attempts: 10,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(60),
            };
            prop_assert!(p.backoff_delay(attempt) <= p.backoff_delay(attempt + 1));
        }
    }

    #[test]
    fn test_backoff_doubles_from_base() {
        let p = policy(5);
        assert_eq!(p.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(p.backoff_delay(3), Duration::from_millis(400));
        // Capped at max_delay
        assert_eq!(p.backoff_delay(10), Duration::from_secs(5));
    }
}
