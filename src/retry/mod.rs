// ============================================================================
// Retry Engine
// ============================================================================
//
// A RetryPolicy runs an operation, asks its detector whether each failure
// is transient, and asks its strategy how long to wait before the next
// attempt. Strategies are immutable and shared; observers hear about every
// retry before the delay starts.
//
// ============================================================================

pub mod policy;
pub mod sleep;
pub mod strategy;

pub use policy::{ChannelObserver, RetryNotice, RetryObserver, RetryPolicy, RetryingEvent};
pub use sleep::{CancellationToken, RecordingSleeper, Sleeper, ThreadSleeper};
pub use strategy::{
    ExponentialBackoff, FixedInterval, Incremental, NoRetry, RetryDecision, RetryStrategy,
    default_command_strategy, default_connection_strategy,
};

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    proptest! {
        #[test]
        fn test_exponential_delay_stays_in_bounds(
            min_ms in 0u64..5_000,
            span_ms in 0u64..60_000,
            delta_ms in 0u64..20_000,
            attempt in 1u32..200,
        ) {
            let min = Duration::from_millis(min_ms);
            let max = Duration::from_millis(min_ms + span_ms);
            let strategy = ExponentialBackoff::new(u32::MAX, min, max, Duration::from_millis(delta_ms));

            let delay = strategy.delay(attempt);
            prop_assert!(delay >= min);
            prop_assert!(delay <= max);
        }

        #[test]
        fn test_budget_is_exact(retry_count in 0u32..50) {
            let strategy = FixedInterval::new(retry_count, Duration::from_millis(1));
            let err = crate::core::DbError::Cancelled;
            let allowed = (1..=retry_count + 5)
                .filter(|a| strategy.next_retry(*a, &err).should_retry())
                .count();
            prop_assert_eq!(allowed as u32, retry_count);
        }

        #[test]
        fn test_incremental_is_monotonic(
            initial_ms in 0u64..1_000,
            increment_ms in 0u64..1_000,
            attempt in 1u32..1_000,
        ) {
            let strategy = Incremental::new(
                u32::MAX,
                Duration::from_millis(initial_ms),
                Duration::from_millis(increment_ms),
            );
            prop_assert!(strategy.delay(attempt) <= strategy.delay(attempt + 1));
        }
    }
}
