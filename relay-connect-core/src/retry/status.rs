//! Status-aware retry policy wrapping a generic budget.

use super::{Outcome, RetryDecision, RetryPolicy};
use std::time::Duration;

/// Statuses treated as transient unless configured otherwise
pub const DEFAULT_RETRYABLE_STATUSES: &[u16] = &[429, 502, 503, 504];

/// Status-aware policy layered over a generic budget.
///
/// A status outcome is retried only when the status is retryable and the
/// wrapped policy still has budget. The first authentication failure is
/// always retried once, immediately, so the caller can refresh credentials;
/// later ones fall through to the normal status check.
#[derive(Debug, Clone)]
pub struct StatusRetryPolicy<P> {
    inner: P,
    retryable: Vec<u16>,
    auth_retry_used: bool,
}

impl<P: RetryPolicy> StatusRetryPolicy<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            retryable: DEFAULT_RETRYABLE_STATUSES.to_vec(),
            auth_retry_used: false,
        }
    }

    pub fn with_retryable_statuses(mut self, statuses: impl Into<Vec<u16>>) -> Self {
        self.retryable = statuses.into();
        self
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable.contains(&status)
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: RetryPolicy> RetryPolicy for StatusRetryPolicy<P> {
    fn next_decision(&mut self, attempt: u32, outcome: &Outcome) -> RetryDecision {
        if outcome.is_auth_failure() && !self.auth_retry_used {
            self.auth_retry_used = true;
            return RetryDecision::retry_after(Duration::ZERO);
        }

        match outcome {
            Outcome::Status(code) if !self.is_retryable_status(*code) => RetryDecision::stop(),
            Outcome::AuthStale => RetryDecision::stop(),
            _ => self.inner.next_decision(attempt, outcome),
        }
    }

    fn reset_timer(&mut self) {
        self.inner.reset_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryBudget;

    fn policy(max_attempts: u32) -> StatusRetryPolicy<RetryBudget> {
        StatusRetryPolicy::new(RetryBudget::phased(
            max_attempts,
            vec![Duration::from_millis(250)],
        ))
    }

    #[test]
    fn test_retryable_status_uses_inner_budget() {
        let mut policy = policy(2);
        let decision = policy.next_decision(1, &Outcome::Status(503));
        assert!(decision.should_retry);
        assert_eq!(decision.wait_before, Duration::from_millis(250));

        assert!(policy.next_decision(2, &Outcome::Status(429)).should_retry);
        assert!(!policy.next_decision(3, &Outcome::Status(503)).should_retry);
    }

    #[test]
    fn test_non_retryable_status_stops() {
        let mut policy = policy(10);
        assert!(!policy.next_decision(1, &Outcome::Status(400)).should_retry);
        assert!(!policy.next_decision(1, &Outcome::Status(404)).should_retry);
    }

    #[test]
    fn test_single_forced_auth_retry() {
        // zero budget: only the forced retry can happen
        let mut policy = policy(0);
        let first = policy.next_decision(1, &Outcome::Status(401));
        assert!(first.should_retry);
        assert_eq!(first.wait_before, Duration::ZERO);

        assert!(!policy.next_decision(2, &Outcome::Status(401)).should_retry);
        assert!(!policy.next_decision(3, &Outcome::AuthStale).should_retry);
    }

    #[test]
    fn test_auth_retry_when_401_is_retryable() {
        let mut policy = policy(3).with_retryable_statuses(vec![401, 503]);
        assert!(policy.next_decision(1, &Outcome::Status(401)).should_retry);
        // falls back to the status check, which now allows 401
        assert!(policy.next_decision(2, &Outcome::Status(401)).should_retry);
    }

    #[test]
    fn test_transient_delegates() {
        let mut policy = policy(1);
        assert!(policy.next_decision(1, &Outcome::Transient).should_retry);
        assert!(!policy.next_decision(2, &Outcome::Transient).should_retry);
    }
}
