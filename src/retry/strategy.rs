use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use rand::Rng;

/// Outcome of asking a strategy about the next retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again
    Retry(Duration),
    /// The budget is spent
    Stop,
}

impl RetryDecision {
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }

    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Retry(delay) => Some(*delay),
            Self::Stop => None,
        }
    }
}

/// Immutable policy producing the delay sequence and budget for retries.
///
/// `attempt` is the 1-based retry number: 1 is the first retry after the
/// initial failure. A strategy allows exactly `retry_count()` retries.
pub trait RetryStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn retry_count(&self) -> u32;

    /// Whether the first retry happens without any delay.
    fn fast_first_retry(&self) -> bool;

    /// Delay scheduled before retry `attempt`, before budget and
    /// fast-first-retry are applied.
    fn delay(&self, attempt: u32) -> Duration;

    fn next_retry(&self, attempt: u32, _last_error: &(dyn StdError + 'static)) -> RetryDecision {
        if attempt == 0 || attempt > self.retry_count() {
            return RetryDecision::Stop;
        }
        if attempt == 1 && self.fast_first_retry() {
            return RetryDecision::Retry(Duration::ZERO);
        }
        RetryDecision::Retry(self.delay(attempt))
    }
}

// ============================================================================
// Incremental
// ============================================================================

/// Linear growth: `initial_interval + attempt * increment`, optionally capped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incremental {
    name: String,
    retry_count: u32,
    initial_interval: Duration,
    increment: Duration,
    max_interval: Option<Duration>,
    fast_first_retry: bool,
}

impl Incremental {
    pub fn new(retry_count: u32, initial_interval: Duration, increment: Duration) -> Self {
        Self {
            name: "Incremental Retry Strategy".to_string(),
            retry_count,
            initial_interval,
            increment,
            max_interval: None,
            fast_first_retry: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = Some(max_interval);
        self
    }

    pub fn with_fast_first_retry(mut self, fast_first_retry: bool) -> Self {
        self.fast_first_retry = fast_first_retry;
        self
    }

    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    pub fn increment(&self) -> Duration {
        self.increment
    }

    pub fn max_interval(&self) -> Option<Duration> {
        self.max_interval
    }
}

impl RetryStrategy for Incremental {
    fn name(&self) -> &str {
        &self.name
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn fast_first_retry(&self) -> bool {
        self.fast_first_retry
    }

    fn delay(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_interval
            .saturating_add(self.increment.saturating_mul(attempt));
        match self.max_interval {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

// ============================================================================
// Exponential backoff
// ============================================================================

/// Jittered exponential growth bounded by `[min_backoff, max_backoff]`.
///
/// Retry `a` waits `min_backoff + (2^a - 1) * d` where `d` is drawn
/// uniformly from `[4/5 * delta_backoff, delta_backoff]` on every call, so
/// clients that failed together do not retry in lockstep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    name: String,
    retry_count: u32,
    min_backoff: Duration,
    max_backoff: Duration,
    delta_backoff: Duration,
    fast_first_retry: bool,
}

impl ExponentialBackoff {
    /// `max_backoff` is raised to `min_backoff` if it is smaller.
    pub fn new(
        retry_count: u32,
        min_backoff: Duration,
        max_backoff: Duration,
        delta_backoff: Duration,
    ) -> Self {
        Self {
            name: "Backoff Retry Strategy".to_string(),
            retry_count,
            min_backoff,
            max_backoff: max_backoff.max(min_backoff),
            delta_backoff,
            fast_first_retry: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_fast_first_retry(mut self, fast_first_retry: bool) -> Self {
        self.fast_first_retry = fast_first_retry;
        self
    }

    pub fn min_backoff(&self) -> Duration {
        self.min_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn delta_backoff(&self) -> Duration {
        self.delta_backoff
    }

    fn scaled(&self, attempt: u32, increment_nanos: u128) -> Duration {
        let max_nanos = self.max_backoff.as_nanos();
        let grown = 2u128
            .checked_pow(attempt)
            .map(|p| p - 1)
            .and_then(|factor| factor.checked_mul(increment_nanos))
            .and_then(|extra| extra.checked_add(self.min_backoff.as_nanos()));

        match grown {
            Some(nanos) if nanos < max_nanos => nanos_to_duration(nanos),
            _ => self.max_backoff,
        }
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn name(&self) -> &str {
        &self.name
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn fast_first_retry(&self) -> bool {
        self.fast_first_retry
    }

    fn delay(&self, attempt: u32) -> Duration {
        let delta = self.delta_backoff.as_nanos();
        let low = delta - delta / 5;
        let increment = if low < delta {
            rand::thread_rng().gen_range(low..=delta)
        } else {
            delta
        };
        self.scaled(attempt, increment)
    }
}

fn nanos_to_duration(nanos: u128) -> Duration {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    let secs = (nanos / NANOS_PER_SEC).min(u64::MAX as u128) as u64;
    Duration::new(secs, (nanos % NANOS_PER_SEC) as u32)
}

// ============================================================================
// Fixed interval / no retry
// ============================================================================

/// The same delay before every retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedInterval {
    name: String,
    retry_count: u32,
    interval: Duration,
    fast_first_retry: bool,
}

impl FixedInterval {
    pub fn new(retry_count: u32, interval: Duration) -> Self {
        Self {
            name: "Fixed Interval Retry Strategy".to_string(),
            retry_count,
            interval,
            fast_first_retry: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_fast_first_retry(mut self, fast_first_retry: bool) -> Self {
        self.fast_first_retry = fast_first_retry;
        self
    }
}

impl RetryStrategy for FixedInterval {
    fn name(&self) -> &str {
        &self.name
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn fast_first_retry(&self) -> bool {
        self.fast_first_retry
    }

    fn delay(&self, _attempt: u32) -> Duration {
        self.interval
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn name(&self) -> &str {
        "No Retry Strategy"
    }

    fn retry_count(&self) -> u32 {
        0
    }

    fn fast_first_retry(&self) -> bool {
        false
    }

    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

// Process-wide defaults
lazy_static! {
    static ref DEFAULT_COMMAND_STRATEGY: Arc<dyn RetryStrategy> = Arc::new(Incremental::new(
        10,
        Duration::from_secs(1),
        Duration::from_secs(1),
    ));
    static ref DEFAULT_CONNECTION_STRATEGY: Arc<dyn RetryStrategy> =
        Arc::new(ExponentialBackoff::new(
            10,
            Duration::from_secs(1),
            Duration::from_secs(30),
            Duration::from_secs(10),
        ));
}

/// Incremental, 10 retries, 1s initial interval, 1s increment.
pub fn default_command_strategy() -> Arc<dyn RetryStrategy> {
    Arc::clone(&DEFAULT_COMMAND_STRATEGY)
}

/// Exponential backoff, 10 retries from 1s to 30s with a 10s delta.
pub fn default_connection_strategy() -> Arc<dyn RetryStrategy> {
    Arc::clone(&DEFAULT_CONNECTION_STRATEGY)
}
