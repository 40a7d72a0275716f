//! Bounded retry for agent invocations (spec §4.4).
//!
//! Grounded in `original_source/src/core/utils/retry_manager.py`'s
//! `RetryManager`: a fixed `max_attempts`/`base_delay`, a retryable
//! predicate over error kinds, and attempt-then-sleep semantics rather than
//! exponential backoff ("no exponential backoff is required for the core").

use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tracing::{instrument, warn};

use crate::errors::AgentError;

/// Wraps an [`AgentError`]-returning operation with bounded retry (spec
/// §4.4). `max_attempts` defaults to 3, `base_delay` to a fixed 1 second.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: StdDuration,
    retryable: Arc<dyn Fn(&AgentError) -> bool + Send + Sync>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: StdDuration::from_secs(1),
            retryable: Arc::new(AgentError::is_retryable),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: StdDuration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// Override which error kinds are worth retrying; default is
    /// [`AgentError::is_retryable`].
    pub fn with_retryable(mut self, predicate: impl Fn(&AgentError) -> bool + Send + Sync + 'static) -> Self {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Attempt `operation` up to `max_attempts` times, sleeping `base_delay`
    /// between attempts. Non-retryable errors propagate immediately without
    /// consuming further attempts (spec §4.4). After exhaustion, returns
    /// `RetryOutcome::Exhausted` wrapping the last error (`kRetryExhausted`
    /// at the Engine boundary, per spec §7).
    #[instrument(skip(self, operation))]
    pub async fn run<F, Fut, T>(&self, operation: F) -> RetryOutcome<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, AgentError>>,
    {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match operation(attempt).await {
                Ok(value) => return RetryOutcome::Succeeded { value, attempts: attempt },
                Err(err) if !(self.retryable)(&err) => {
                    return RetryOutcome::NonRetryable { error: err, attempts: attempt };
                }
                Err(err) => {
                    warn!(attempt, max_attempts = self.max_attempts, %err, "agent attempt failed, retrying");
                    last_error = Some(err);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.base_delay).await;
                    }
                }
            }
        }
        RetryOutcome::Exhausted {
            error: last_error.expect("loop runs at least once since max_attempts >= 1"),
            attempts: self.max_attempts,
        }
    }
}

/// The three terminal shapes a retried operation can settle into.
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    /// Predicate rejected the error on the attempt it occurred; no further
    /// attempts were made.
    NonRetryable { error: AgentError, attempts: u32 },
    /// `max_attempts` was reached without success (`kRetryExhausted`).
    Exhausted { error: AgentError, attempts: u32 },
}

impl<T> RetryOutcome<T> {
    pub fn into_result(self) -> std::result::Result<T, AgentError> {
        match self {
            RetryOutcome::Succeeded { value, .. } => Ok(value),
            RetryOutcome::NonRetryable { error, .. } | RetryOutcome::Exhausted { error, .. } => Err(error),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::NonRetryable { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. } => *attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_on_first_attempt_without_sleeping() {
        let policy = RetryPolicy::new(3, StdDuration::from_millis(0));
        let outcome = policy.run(|_attempt| async { Ok::<_, AgentError>(42) }).await;
        assert_eq!(outcome.attempts(), 1);
        assert_eq!(outcome.into_result().unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let policy = RetryPolicy::new(3, StdDuration::from_millis(0));
        let calls = AtomicU32::new(0);
        let outcome = policy
            .run(|_attempt| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(AgentError::Transient("not yet".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert_eq!(outcome.attempts(), 3);
        assert!(outcome.into_result().is_ok());
    }

    #[tokio::test]
    async fn non_retryable_error_short_circuits() {
        let policy = RetryPolicy::new(5, StdDuration::from_millis(0));
        let calls = AtomicU32::new(0);
        let outcome = policy
            .run(|_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AgentError::InvalidInput("bad".into())) }
            })
            .await;
        assert_eq!(outcome.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(outcome.into_result().is_err());
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let policy = RetryPolicy::new(3, StdDuration::from_millis(0));
        let outcome = policy
            .run(|_attempt| async { Err::<(), _>(AgentError::Timeout) })
            .await;
        assert_eq!(outcome.attempts(), 3);
        assert!(matches!(outcome, RetryOutcome::Exhausted { .. }));
    }
}
