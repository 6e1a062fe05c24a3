//! Retry and circuit-breaker framework shared by the processor and the
//! transaction manager.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, ErrorClass, Result};

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{BreakerRegistry, BreakerState, BreakerStats, CircuitBreaker};
pub use retry::RetryPolicy;

pub struct ErrorHandler {
    policy: RetryPolicy,
    breakers: Arc<BreakerRegistry>,
}

impl ErrorHandler {
    pub fn new(policy: RetryPolicy, breakers: Arc<BreakerRegistry>) -> Self {
        Self { policy, breakers }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Runs `f` behind the breaker for `operation`, retrying transient
    /// failures up to `max_retries` times with backoff.
    ///
    /// Returns `CircuitOpen` without calling `f` when the breaker denies the
    /// call, `Cancelled` as soon as `token` fires, the error itself when it is
    /// not retryable, and `RetriesExhausted` once attempts run out.
    pub async fn handle_error<T, F, Fut>(&self, token: &CancellationToken, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breakers.get_or_create(operation);
        let mut attempt: u32 = 0;

        loop {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !breaker.allow() {
                debug!(operation, attempt, "circuit breaker rejected call");
                return Err(Error::CircuitOpen(operation.to_string()));
            }

            let outcome = tokio::select! {
                _ = token.cancelled() => Err(Error::Cancelled),
                outcome = f() => outcome,
            };

            let err = match outcome {
                Ok(value) => {
                    breaker.on_success();
                    if attempt > 0 {
                        debug!(operation, attempt, "operation recovered after retry");
                    }
                    return Ok(value);
                }
                Err(Error::Cancelled) => {
                    breaker.release_probe();
                    return Err(Error::Cancelled);
                }
                Err(err) => {
                    breaker.on_failure();
                    err
                }
            };

            if err.class() != ErrorClass::Transient {
                debug!(operation, attempt, error = %err, "non-retryable error");
                return Err(err);
            }
            if attempt >= self.policy.max_retries {
                warn!(operation, attempts = attempt + 1, error = %err, "retries exhausted");
                return Err(Error::RetriesExhausted {
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }

            let delay = retry_delay(&self.policy, attempt, &err);
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "operation failed, retrying"
            );
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// A single attempt behind the breaker for `operation`. The caller owns
    /// the retry decision; the outcome still feeds the breaker.
    pub async fn run_guarded<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breakers.get_or_create(operation);
        if !breaker.allow() {
            return Err(Error::CircuitOpen(operation.to_string()));
        }
        match fut.await {
            Ok(value) => {
                breaker.on_success();
                Ok(value)
            }
            Err(Error::Cancelled) => {
                breaker.release_probe();
                Err(Error::Cancelled)
            }
            Err(err) => {
                breaker.on_failure();
                Err(err)
            }
        }
    }
}

/// Backoff for `attempt`, stretched to honour a server-provided `Retry-After`.
pub fn retry_delay(policy: &RetryPolicy, attempt: u32, err: &Error) -> Duration {
    let delay = policy.delay(attempt);
    match err {
        Error::RateLimited {
            retry_after: Some(after),
            ..
        } => delay.max(*after),
        _ => delay,
    }
}
