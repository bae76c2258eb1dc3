use tracing::warn;

/// Decision returned by the retry budget when an attempt has to be replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Budget remains: restart (includes the 1-based retry number).
    Retry { retry: u32 },
    /// `max_retries` restarts already happened.
    Exhausted,
}

/// Retry budget for one download session.
///
/// Every stall restart, resumable crash and failed spawn consumes one retry.
/// The counter only grows and never passes `max_retries`. Pauses and
/// non-resumable failures never reach the budget.
pub struct RetryPolicy {
    max_retries: u32,
    retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            retries: 0,
        }
    }

    /// Consume one retry if any remain.
    pub fn evaluate(&mut self) -> RetryDecision {
        if self.retries < self.max_retries {
            self.retries += 1;
            RetryDecision::Retry {
                retry: self.retries,
            }
        } else {
            warn!(max_retries = self.max_retries, "retry budget exhausted");
            RetryDecision::Exhausted
        }
    }

    /// Retries consumed so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
