//! Bounded per-overlay retry bookkeeping

use fielder_domain::OverlayStatus;

/// Outcome of recording one failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the overlay to `pending` for a future claim
    Retry {
        /// The incremented attempt count to persist
        attempt_count: u32,
    },
    /// Attempts exhausted; the overlay fails terminally
    GiveUp {
        /// The incremented attempt count to persist
        attempt_count: u32,
    },
}

impl RetryDecision {
    /// Queue status this decision transitions the overlay to
    pub fn next_status(&self) -> OverlayStatus {
        match self {
            RetryDecision::Retry { .. } => OverlayStatus::Pending,
            RetryDecision::GiveUp { .. } => OverlayStatus::Failed,
        }
    }

    /// The incremented attempt count to persist
    pub fn attempt_count(&self) -> u32 {
        match self {
            RetryDecision::Retry { attempt_count } | RetryDecision::GiveUp { attempt_count } => {
                *attempt_count
            }
        }
    }
}

/// Record one failure against the current attempt count
///
/// The count is incremented first; an overlay retries while the new count
/// stays below `max_retries` and gives up once it reaches it.
pub fn next_attempt(current_attempts: u32, max_retries: u32) -> RetryDecision {
    let attempt_count = current_attempts.saturating_add(1);
    if attempt_count < max_retries {
        RetryDecision::Retry { attempt_count }
    } else {
        RetryDecision::GiveUp { attempt_count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_strikes_with_max_retries_three() {
        // pending -> pending -> pending -> failed, attempt_count reaching 3
        let first = next_attempt(0, 3);
        assert_eq!(first, RetryDecision::Retry { attempt_count: 1 });
        assert_eq!(first.next_status(), OverlayStatus::Pending);

        let second = next_attempt(1, 3);
        assert_eq!(second, RetryDecision::Retry { attempt_count: 2 });

        let third = next_attempt(2, 3);
        assert_eq!(third, RetryDecision::GiveUp { attempt_count: 3 });
        assert_eq!(third.next_status(), OverlayStatus::Failed);
    }

    #[test]
    fn test_max_retries_one_fails_immediately() {
        let decision = next_attempt(0, 1);
        assert_eq!(decision, RetryDecision::GiveUp { attempt_count: 1 });
    }

    #[test]
    fn test_counts_already_past_limit_give_up() {
        let decision = next_attempt(9, 3);
        assert_eq!(decision, RetryDecision::GiveUp { attempt_count: 10 });
    }

    #[test]
    fn test_attempt_count_accessor() {
        assert_eq!(next_attempt(0, 5).attempt_count(), 1);
        assert_eq!(next_attempt(4, 5).attempt_count(), 5);
    }
}
