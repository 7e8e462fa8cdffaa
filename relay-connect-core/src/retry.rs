//! Retry policies and backoff execution.
//!
//! A policy only answers "should attempt N be retried, and after how long".
//! It never fails; exhaustion is reported by [`retry`], which wraps the last
//! error in [`ConnectorError::RetryExhausted`].

mod budget;
mod status;

pub use budget::{DurationBudget, PhasedBudget, RetryBudget, TimeoutBudget};
pub use status::{StatusRetryPolicy, DEFAULT_RETRYABLE_STATUSES};

use crate::{ConnectorError, ConnectorResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default upper bound for a single backoff sleep
pub const DEFAULT_MAX_SLEEP: Duration = Duration::from_secs(30);

/// What the failed attempt looked like, from the policy's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Connection refused, reset, timed out and the like
    Transient,
    /// Transport status code, e.g. HTTP 503
    Status(u16),
    /// Credentials were rejected
    AuthStale,
    /// An asynchronous job has not finished yet
    Pending,
}

impl Outcome {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Outcome::AuthStale | Outcome::Status(401))
    }
}

/// Produced once per failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub wait_before: Duration,
}

impl RetryDecision {
    pub fn retry_after(wait: Duration) -> Self {
        Self {
            should_retry: true,
            wait_before: wait,
        }
    }

    pub fn stop() -> Self {
        Self {
            should_retry: false,
            wait_before: Duration::ZERO,
        }
    }
}

/// Decides whether a failed attempt should be retried.
///
/// `attempt` is 1-indexed and counts failed attempts so far.
pub trait RetryPolicy: Send {
    fn next_decision(&mut self, attempt: u32, outcome: &Outcome) -> RetryDecision;

    /// Restart any elapsed-time window the policy keeps.
    fn reset_timer(&mut self) {}
}

/// Passed to the operation on every try
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-indexed try number
    pub number: u32,
    /// How the previous try failed, if there was one
    pub previous: Option<Outcome>,
}

impl Attempt {
    /// True when the previous try was rejected for stale credentials and the
    /// operation should refresh them before calling out again.
    pub fn credentials_stale(&self) -> bool {
        self.previous.is_some_and(|o| o.is_auth_failure())
    }
}

/// Executes the waits a policy asks for.
///
/// Each sleep is capped at `max_sleep` and interrupted by cancellation, so no
/// policy can park a task for longer than one slot.
#[derive(Debug, Clone)]
pub struct Backoff {
    max_sleep: Duration,
    jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SLEEP)
    }
}

impl Backoff {
    pub fn new(max_sleep: Duration) -> Self {
        Self {
            max_sleep,
            jitter: false,
        }
    }

    /// Randomize each sleep uniformly in `[0, wait]`
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_sleep(&self) -> Duration {
        self.max_sleep
    }

    /// The duration actually slept for a requested wait
    pub fn effective_wait(&self, wait: Duration) -> Duration {
        let capped = wait.min(self.max_sleep);
        if self.jitter && !capped.is_zero() {
            let millis = capped.as_millis() as u64;
            Duration::from_millis(rand::rng().random_range(0..=millis))
        } else {
            capped
        }
    }

    /// Sleep for the capped wait, returning `Cancelled` if the token fires first.
    pub async fn sleep(&self, wait: Duration, cancel: &CancellationToken) -> ConnectorResult<()> {
        let wait = self.effective_wait(wait);
        if cancel.is_cancelled() {
            return Err(ConnectorError::Cancelled);
        }
        if wait.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(ConnectorError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }
}

/// Run `operation` until it succeeds, fails with an error that is not
/// retryable, or the policy declines another attempt.
pub async fn retry<P, T, Fut, Op>(
    policy: &mut P,
    backoff: &Backoff,
    cancel: &CancellationToken,
    mut operation: Op,
) -> ConnectorResult<T>
where
    P: RetryPolicy + ?Sized,
    Fut: Future<Output = ConnectorResult<T>>,
    Op: FnMut(Attempt) -> Fut,
{
    let mut attempt = Attempt {
        number: 1,
        previous: None,
    };

    loop {
        if cancel.is_cancelled() {
            return Err(ConnectorError::Cancelled);
        }

        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let Some(outcome) = error.outcome() else {
            return Err(error);
        };

        let decision = policy.next_decision(attempt.number, &outcome);
        if !decision.should_retry {
            warn!(attempts = attempt.number, error = %error, "retry budget exhausted");
            return Err(ConnectorError::RetryExhausted {
                attempts: attempt.number,
                source: Box::new(error),
            });
        }

        debug!(
            attempt = attempt.number,
            wait_ms = decision.wait_before.as_millis() as u64,
            error = %error,
            "retrying after failure"
        );
        backoff.sleep(decision.wait_before, cancel).await?;

        attempt = Attempt {
            number: attempt.number + 1,
            previous: Some(outcome),
        };
    }
}
