//! Retry budgets: how many attempts and how much time an operation may use.

use super::{Outcome, RetryDecision, RetryPolicy};
use std::time::Duration;
use tokio::time::Instant;

/// Look up the delay for a 1-indexed attempt. Attempts past the end of the
/// table reuse the last slot.
fn slot(delays: &[Duration], attempt: u32) -> Duration {
    if delays.is_empty() {
        return Duration::ZERO;
    }
    let index = (attempt.max(1) as usize - 1).min(delays.len() - 1);
    delays[index]
}

/// Attempt-bounded budget with a fixed delay table
#[derive(Debug, Clone, PartialEq)]
pub struct PhasedBudget {
    max_attempts: u32,
    delays: Vec<Duration>,
}

impl PhasedBudget {
    pub fn new(max_attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts,
            delays,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn next_decision(&self, attempt: u32) -> RetryDecision {
        RetryDecision {
            should_retry: attempt <= self.max_attempts,
            wait_before: slot(&self.delays, attempt),
        }
    }
}

/// Attempt-bounded budget that also expires after a fixed window
#[derive(Debug, Clone)]
pub struct DurationBudget {
    max_attempts: u32,
    window: Duration,
    deadline: Instant,
    delays: Vec<Duration>,
}

impl DurationBudget {
    /// The window starts now.
    pub fn new(max_attempts: u32, window: Duration, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts,
            window,
            deadline: Instant::now() + window,
            delays,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn next_decision(&self, attempt: u32) -> RetryDecision {
        RetryDecision {
            should_retry: attempt <= self.max_attempts && Instant::now() < self.deadline,
            wait_before: slot(&self.delays, attempt),
        }
    }

    pub fn reset_timer(&mut self) {
        self.deadline = Instant::now() + self.window;
    }
}

/// Time-bounded budget, independent of the attempt count
#[derive(Debug, Clone)]
pub struct TimeoutBudget {
    timeout: Duration,
    deadline: Instant,
    delays: Vec<Duration>,
    indefinite: bool,
}

impl TimeoutBudget {
    pub fn new(timeout: Duration, delays: Vec<Duration>) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
            delays,
            indefinite: false,
        }
    }

    /// A budget that never runs out. Sleeps are still bounded by the
    /// [`Backoff`](super::Backoff) cap.
    pub fn indefinite(delays: Vec<Duration>) -> Self {
        Self {
            timeout: Duration::ZERO,
            deadline: Instant::now(),
            delays,
            indefinite: true,
        }
    }

    pub fn is_indefinite(&self) -> bool {
        self.indefinite
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn next_decision(&self, attempt: u32) -> RetryDecision {
        let wait = slot(&self.delays, attempt);
        if self.indefinite {
            return RetryDecision::retry_after(wait);
        }
        let now = Instant::now();
        RetryDecision {
            should_retry: now < self.deadline,
            // never ask to sleep past our own deadline
            wait_before: wait.min(self.deadline.saturating_duration_since(now)),
        }
    }

    /// Restart the window, e.g. between polls of an asynchronous job.
    pub fn reset_timer(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }
}

/// Every supported budget shape
#[derive(Debug, Clone)]
pub enum RetryBudget {
    Phased(PhasedBudget),
    Duration(DurationBudget),
    Timeout(TimeoutBudget),
    Never,
    Always { delay: Duration },
}

impl RetryBudget {
    pub fn phased(max_attempts: u32, delays: Vec<Duration>) -> Self {
        Self::Phased(PhasedBudget::new(max_attempts, delays))
    }

    pub fn duration(max_attempts: u32, window: Duration, delays: Vec<Duration>) -> Self {
        Self::Duration(DurationBudget::new(max_attempts, window, delays))
    }

    pub fn timeout(timeout: Duration, delays: Vec<Duration>) -> Self {
        Self::Timeout(TimeoutBudget::new(timeout, delays))
    }

    pub fn indefinite(delays: Vec<Duration>) -> Self {
        Self::Timeout(TimeoutBudget::indefinite(delays))
    }

    pub fn never() -> Self {
        Self::Never
    }

    pub fn always(delay: Duration) -> Self {
        Self::Always { delay }
    }

    pub fn evaluate(&self, attempt: u32) -> RetryDecision {
        match self {
            Self::Phased(budget) => budget.next_decision(attempt),
            Self::Duration(budget) => budget.next_decision(attempt),
            Self::Timeout(budget) => budget.next_decision(attempt),
            Self::Never => RetryDecision::stop(),
            Self::Always { delay } => RetryDecision::retry_after(*delay),
        }
    }

    /// Restart the elapsed-time reference point. No-op for budgets that
    /// are not time-bounded.
    pub fn reset_timer(&mut self) {
        match self {
            Self::Duration(budget) => budget.reset_timer(),
            Self::Timeout(budget) => budget.reset_timer(),
            Self::Phased(_) | Self::Never | Self::Always { .. } => {}
        }
    }
}

impl RetryPolicy for RetryBudget {
    fn next_decision(&mut self, attempt: u32, _outcome: &Outcome) -> RetryDecision {
        self.evaluate(attempt)
    }

    fn reset_timer(&mut self) {
        RetryBudget::reset_timer(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|v| Duration::from_millis(*v)).collect()
    }

    #[test]
    fn test_phased_boundary() {
        for max in [1u32, 3, 5, 10] {
            let budget = PhasedBudget::new(max, ms(&[10]));
            assert!(budget.next_decision(max).should_retry);
            assert!(!budget.next_decision(max + 1).should_retry);
        }
    }

    #[test]
    fn test_phased_last_slot_repeats() {
        let budget = RetryBudget::phased(5, ms(&[0, 1, 2]));
        let waits: Vec<_> = (1..=5).map(|n| budget.evaluate(n).wait_before).collect();
        assert_eq!(waits, ms(&[0, 1, 2, 2, 2]));
    }

    #[test]
    fn test_empty_slots_wait_zero() {
        let budget = RetryBudget::phased(2, vec![]);
        assert_eq!(budget.evaluate(1).wait_before, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_budget_expires() {
        let budget = RetryBudget::duration(10, Duration::from_secs(5), ms(&[100]));
        assert!(budget.evaluate(1).should_retry);
        assert!(!budget.evaluate(11).should_retry);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!budget.evaluate(2).should_retry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_budget_reset() {
        let mut budget = RetryBudget::duration(10, Duration::from_secs(5), vec![]);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!budget.evaluate(1).should_retry);

        budget.reset_timer();
        assert!(budget.evaluate(1).should_retry);
    }

    #[test]
    fn test_indefinite_always_retries() {
        let budget = RetryBudget::indefinite(ms(&[50]));
        for attempt in [1, 100, 10_000, u32::MAX] {
            assert!(budget.evaluate(attempt).should_retry);
        }
    }

    #[test]
    fn test_zero_timeout_stops_immediately() {
        let budget = RetryBudget::timeout(Duration::ZERO, ms(&[50]));
        assert!(!budget.evaluate(1).should_retry);
        assert!(!budget.evaluate(1000).should_retry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_ignores_attempt_count() {
        let mut budget = TimeoutBudget::new(Duration::from_secs(10), ms(&[1000]));
        assert!(budget.next_decision(1_000_000).should_retry);

        tokio::time::advance(Duration::from_millis(9_500)).await;
        let decision = budget.next_decision(2);
        assert!(decision.should_retry);
        assert_eq!(decision.wait_before, Duration::from_millis(500));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!budget.next_decision(3).should_retry);

        budget.reset_timer();
        assert!(budget.next_decision(4).should_retry);
        assert_eq!(budget.remaining(), Duration::from_secs(10));
    }

    #[test]
    fn test_degenerate_budgets() {
        assert!(!RetryBudget::never().evaluate(1).should_retry);
        let always = RetryBudget::always(Duration::from_millis(5));
        assert!(always.evaluate(u32::MAX).should_retry);
        assert_eq!(always.evaluate(1).wait_before, Duration::from_millis(5));
    }
}
