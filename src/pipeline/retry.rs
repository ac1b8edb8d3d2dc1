use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

use super::ledger::{RunLedger, StageName};
use super::AnalysisError;

/// Bounds for the exponential backoff loop.
/// Delay for attempt `n` is `base_delay * 2^n + jitter(0..max_jitter)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per operation, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Fast policy for tests — keeps the backoff shape, drops the waiting.
    pub fn immediate() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_jitter: Duration::from_millis(1),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let jitter_ms = if self.max_jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..self.max_jitter.as_millis() as u64)
        };
        exponential + Duration::from_millis(jitter_ms)
    }
}

/// Run `operation` with bounded exponential backoff, recording every attempt
/// against `stage` in the ledger. The terminal error is surfaced to the
/// caller, never swallowed — stage-level fallback handling happens there.
/// Non-retryable errors (validation, parse) short-circuit immediately.
pub async fn run_with_retry<F, Fut, T>(
    stage: StageName,
    policy: &RetryPolicy,
    ledger: &Mutex<RunLedger>,
    mut operation: F,
) -> Result<T, AnalysisError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AnalysisError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => {
                ledger
                    .lock()
                    .expect("ledger poisoned")
                    .record_attempt(stage, None);
                if attempt > 0 {
                    tracing::debug!(stage = %stage, attempt = attempt + 1, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => {
                ledger
                    .lock()
                    .expect("ledger poisoned")
                    .record_attempt(stage, Some(&e.to_string()));
                return Err(e);
            }
            Err(e) => {
                ledger
                    .lock()
                    .expect("ledger poisoned")
                    .record_attempt(stage, Some(&e.to_string()));

                attempt += 1;
                if attempt >= policy.max_attempts {
                    tracing::warn!(
                        stage = %stage,
                        attempts = attempt,
                        error = %e,
                        "retries exhausted"
                    );
                    return Err(e);
                }

                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(
                    stage = %stage,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "operation failed, will retry after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ProviderErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn test_ledger() -> Mutex<RunLedger> {
        Mutex::new(RunLedger::new(Uuid::new_v4()))
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let ledger = test_ledger();
        let result = run_with_retry(
            StageName::NotesAnalysis,
            &RetryPolicy::immediate(),
            &ledger,
            || async { Ok::<_, AnalysisError>(42) },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        let ledger = ledger.lock().unwrap();
        assert_eq!(ledger.stage(StageName::NotesAnalysis).attempts, 1);
        assert_eq!(ledger.stage(StageName::NotesAnalysis).retries(), 0);
    }

    #[tokio::test]
    async fn fails_twice_then_succeeds_logs_two_retries() {
        let ledger = test_ledger();
        let calls = AtomicU32::new(0);

        let result = run_with_retry(
            StageName::ImageAnalysis,
            &RetryPolicy::immediate(),
            &ledger,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(AnalysisError::provider(
                            ProviderErrorKind::Timeout,
                            "slow upstream",
                        ))
                    } else {
                        Ok("done")
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        let ledger = ledger.lock().unwrap();
        let record = ledger.stage(StageName::ImageAnalysis);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.retries(), 2);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_surfaces_last_error() {
        let ledger = test_ledger();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = run_with_retry(
            StageName::ImageAnalysis,
            &RetryPolicy::immediate(),
            &ledger,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(AnalysisError::provider(
                        ProviderErrorKind::RateLimit,
                        "quota exceeded",
                    ))
                }
            },
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.provider_kind(), Some(ProviderErrorKind::RateLimit));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            ledger.lock().unwrap().stage(StageName::ImageAnalysis).attempts,
            3
        );
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let ledger = test_ledger();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = run_with_retry(
            StageName::Validation,
            &RetryPolicy::immediate(),
            &ledger,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AnalysisError::Validation("no images".into())) }
            },
        )
        .await;

        assert!(matches!(result, Err(AnalysisError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_grows_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_jitter: Duration::ZERO,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_jitter: Duration::from_millis(50),
        };
        for _ in 0..32 {
            let d = policy.delay_for(0);
            assert!(d >= Duration::from_millis(100));
            assert!(d < Duration::from_millis(150));
        }
    }
}
