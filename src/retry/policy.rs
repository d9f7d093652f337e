use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::Duration;

use tracing::{Level, event};

use super::sleep::{CancellationToken, Sleeper, ThreadSleeper};
use super::strategy::{RetryDecision, RetryStrategy};
use crate::core::{DbError, Result};
use crate::transient::TransientErrorDetectionStrategy;

/// Notification raised before each retry, after the delay is known.
#[derive(Debug, Clone, Copy)]
pub struct RetryingEvent<'a> {
    /// Name of the policy that is retrying
    pub policy: &'a str,
    /// 1-based number of the retry about to happen
    pub current_retry_count: u32,
    pub delay: Duration,
    pub last_error: &'a DbError,
}

/// Owned copy of a [`RetryingEvent`] that can cross threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryNotice {
    pub policy: String,
    pub current_retry_count: u32,
    pub delay: Duration,
    pub last_error: String,
}

impl From<&RetryingEvent<'_>> for RetryNotice {
    fn from(event: &RetryingEvent<'_>) -> Self {
        Self {
            policy: event.policy.to_string(),
            current_retry_count: event.current_retry_count,
            delay: event.delay,
            last_error: event.last_error.to_string(),
        }
    }
}

impl fmt::Display for RetryNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Retry - Count: {}, Delay: {:?}, Exception: {}",
            self.current_retry_count, self.delay, self.last_error
        )
    }
}

/// Subscriber to retry notifications.
///
/// Observers run synchronously on the retrying thread. A panicking
/// observer is logged and skipped; it never aborts the retry loop.
pub trait RetryObserver: Send + Sync {
    fn on_retrying(&self, event: &RetryingEvent<'_>);
}

impl<F> RetryObserver for F
where
    F: Fn(&RetryingEvent<'_>) + Send + Sync,
{
    fn on_retrying(&self, event: &RetryingEvent<'_>) {
        self(event)
    }
}

/// Forwards owned notices to a channel. A dropped receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: Sender<RetryNotice>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<RetryNotice>) -> Self {
        Self { sender }
    }
}

impl RetryObserver for ChannelObserver {
    fn on_retrying(&self, event: &RetryingEvent<'_>) {
        let _ = self.sender.send(RetryNotice::from(event));
    }
}

/// Strategy + detector + observers: runs an operation, retrying transient
/// failures.
///
/// The strategy and detector are fixed at construction; only the observer
/// list may grow. Run it by shared reference from any number of threads.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use reliabledb::driver::NativeError;
/// use reliabledb::retry::{FixedInterval, RecordingSleeper, RetryPolicy};
/// use reliabledb::transient::TransientErrorClassifier;
///
/// let policy = RetryPolicy::new(
///     Arc::new(FixedInterval::new(3, Duration::from_secs(1))),
///     Arc::new(TransientErrorClassifier::sql_azure()),
/// )
/// .with_sleeper(Arc::new(RecordingSleeper::new()));
///
/// let mut calls = 0;
/// let value = policy.execute_action(|| {
///     calls += 1;
///     if calls < 3 {
///         Err(NativeError::single(40501, "The service is currently busy.").into())
///     } else {
///         Ok(calls)
///     }
/// });
/// assert_eq!(value.unwrap(), 3);
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    name: String,
    strategy: Arc<dyn RetryStrategy>,
    detector: Arc<dyn TransientErrorDetectionStrategy>,
    sleeper: Arc<dyn Sleeper>,
    observers: Vec<Arc<dyn RetryObserver>>,
}

impl RetryPolicy {
    pub fn new(
        strategy: Arc<dyn RetryStrategy>,
        detector: Arc<dyn TransientErrorDetectionStrategy>,
    ) -> Self {
        Self {
            name: strategy.name().to_string(),
            strategy,
            detector,
            sleeper: Arc::new(ThreadSleeper),
            observers: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn subscribe(&mut self, observer: Arc<dyn RetryObserver>) {
        self.observers.push(observer);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> &Arc<dyn RetryStrategy> {
        &self.strategy
    }

    pub fn detector(&self) -> &Arc<dyn TransientErrorDetectionStrategy> {
        &self.detector
    }

    pub fn sleeper(&self) -> &Arc<dyn Sleeper> {
        &self.sleeper
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn is_transient(&self, error: &DbError) -> bool {
        self.detector.is_transient(error)
    }

    /// Run `operation` until it succeeds, fails permanently, or the budget
    /// is spent. The error returned is the last one the operation produced.
    pub fn execute_action<T, F>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        self.execute_with(None, operation)
    }

    /// Like [`execute_action`](Self::execute_action), but stops with
    /// [`DbError::Cancelled`] once `token` trips, between attempts or
    /// during a delay.
    pub fn execute_action_cancellable<T, F>(
        &self,
        token: &CancellationToken,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        self.execute_with(Some(token), operation)
    }

    pub(crate) fn execute_with<T, F>(
        &self,
        cancellation: Option<&CancellationToken>,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut retries: u32 = 0;

        loop {
            if let Some(token) = cancellation {
                token.check()?;
            }

            let err = match operation() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_cancelled() || !self.detector.is_transient(&err) {
                event!(
                    Level::DEBUG,
                    policy = %self.name,
                    error = %err,
                    "Permanent failure, not retrying"
                );
                return Err(err);
            }

            retries = retries.saturating_add(1);
            let delay = match self.strategy.next_retry(retries, &err) {
                RetryDecision::Retry(delay) => delay,
                RetryDecision::Stop => {
                    event!(
                        Level::WARN,
                        policy = %self.name,
                        retries = retries - 1,
                        error = %err,
                        "Retry budget exhausted"
                    );
                    return Err(err);
                }
            };

            event!(
                Level::WARN,
                policy = %self.name,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );

            self.notify(&RetryingEvent {
                policy: &self.name,
                current_retry_count: retries,
                delay,
                last_error: &err,
            });

            self.sleeper.sleep(delay, cancellation)?;
        }
    }

    fn notify(&self, event: &RetryingEvent<'_>) {
        for observer in &self.observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| observer.on_retrying(event)));
            if outcome.is_err() {
                event!(
                    Level::ERROR,
                    policy = %self.name,
                    retry = event.current_retry_count,
                    "Retry observer panicked"
                );
            }
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .field("sleeper", &self.sleeper)
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::NativeError;
    use crate::retry::{Incremental, NoRetry, RecordingSleeper};
    use crate::transient::TransientErrorClassifier;
    use std::sync::Mutex;
    use std::sync::mpsc;

    fn policy(retries: u32, sleeper: &RecordingSleeper) -> RetryPolicy {
        RetryPolicy::new(
            Arc::new(Incremental::new(
                retries,
                Duration::from_millis(10),
                Duration::from_millis(10),
            )),
            Arc::new(TransientErrorClassifier::sql_azure()),
        )
        .with_sleeper(Arc::new(sleeper.clone()))
    }

    struct PanickingObserver;

    impl RetryObserver for PanickingObserver {
        fn on_retrying(&self, _event: &RetryingEvent<'_>) {
            panic!("observer failure");
        }
    }

    fn busy() -> DbError {
        NativeError::single(40501, "The service is currently busy.").into()
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let sleeper = RecordingSleeper::new();
        let (tx, rx) = mpsc::channel();
        let policy = policy(5, &sleeper).with_observer(Arc::new(ChannelObserver::new(tx)));

        let mut calls = 0;
        let result = policy.execute_action(|| {
            calls += 1;
            if calls <= 3 { Err(busy()) } else { Ok("done") }
        });

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls, 4);

        let notices: Vec<RetryNotice> = rx.try_iter().collect();
        assert_eq!(
            notices.iter().map(|n| n.current_retry_count).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(
            sleeper.delays(),
            vec![
                Duration::from_millis(20),
                Duration::from_millis(30),
                Duration::from_millis(40)
            ]
        );
        assert_eq!(notices[0].delay, Duration::from_millis(20));
    }

    #[test]
    fn test_exhaustion_returns_last_error() {
        let sleeper = RecordingSleeper::new();
        let count = Arc::new(Mutex::new(0u32));
        let seen = Arc::clone(&count);
        let policy = policy(3, &sleeper).with_observer(Arc::new(move |_: &RetryingEvent<'_>| {
            *seen.lock().unwrap() += 1;
        }));

        let mut calls = 0;
        let err = policy
            .execute_action(|| -> Result<()> {
                calls += 1;
                Err(NativeError::single(40613, format!("attempt {}", calls)).into())
            })
            .unwrap_err();

        assert_eq!(calls, 4);
        assert_eq!(*count.lock().unwrap(), 3);
        assert_eq!(err.to_string(), "attempt 4");
        assert_eq!(err.as_native().map(NativeError::number), Some(40613));
    }

    #[test]
    fn test_permanent_error_is_not_retried() {
        let sleeper = RecordingSleeper::new();
        let (tx, rx) = mpsc::channel();
        let policy = policy(5, &sleeper).with_observer(Arc::new(ChannelObserver::new(tx)));

        let mut calls = 0;
        let err = policy
            .execute_action(|| -> Result<()> {
                calls += 1;
                Err(NativeError::single(208, "Invalid object name 'missing'.").into())
            })
            .unwrap_err();

        assert_eq!(calls, 1);
        assert_eq!(rx.try_iter().count(), 0);
        assert_eq!(sleeper.count(), 0);
        assert_eq!(err.as_native().map(NativeError::number), Some(208));
    }

    #[test]
    fn test_zero_budget() {
        let policy = RetryPolicy::new(
            Arc::new(NoRetry),
            Arc::new(TransientErrorClassifier::sql_azure()),
        );
        let mut calls = 0;
        let result = policy.execute_action(|| -> Result<()> {
            calls += 1;
            Err(busy())
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let sleeper = RecordingSleeper::new();
        let (tx, rx) = mpsc::channel();
        let policy = policy(2, &sleeper)
            .with_observer(Arc::new(PanickingObserver))
            .with_observer(Arc::new(ChannelObserver::new(tx)));

        let mut calls = 0;
        let result = policy.execute_action(|| {
            calls += 1;
            if calls == 1 { Err(busy()) } else { Ok(calls) }
        });

        assert_eq!(result.unwrap(), 2);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_cancelled_before_first_attempt() {
        let sleeper = RecordingSleeper::new();
        let policy = policy(5, &sleeper);
        let token = CancellationToken::new();
        token.cancel();

        let mut calls = 0;
        let err = policy
            .execute_action_cancellable(&token, || {
                calls += 1;
                Ok(())
            })
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_cancelled_between_attempts() {
        let sleeper = RecordingSleeper::new();
        let policy = policy(10, &sleeper);
        let token = CancellationToken::new();

        let mut calls = 0;
        let err = policy
            .execute_action_cancellable(&token, || -> Result<()> {
                calls += 1;
                if calls == 2 {
                    token.cancel();
                }
                Err(busy())
            })
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_notice_display() {
        let err = busy();
        let event = RetryingEvent {
            policy: "command",
            current_retry_count: 2,
            delay: Duration::from_secs(1),
            last_error: &err,
        };
        assert_eq!(
            RetryNotice::from(&event).to_string(),
            "Retry - Count: 2, Delay: 1s, Exception: The service is currently busy."
        );
    }
}
