use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::core::{DbError, Result};

/// Waits out the delay between retry attempts.
///
/// Tests swap in [`RecordingSleeper`] so delay sequences can be asserted
/// without blocking.
pub trait Sleeper: Send + Sync + fmt::Debug {
    /// Block for `delay`. Returns [`DbError::Cancelled`] as soon as the
    /// token trips, even mid-wait.
    fn sleep(&self, delay: Duration, cancellation: Option<&CancellationToken>) -> Result<()>;
}

/// Blocks the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration, cancellation: Option<&CancellationToken>) -> Result<()> {
        match cancellation {
            Some(token) => {
                if token.wait(delay) {
                    Err(DbError::Cancelled)
                } else {
                    Ok(())
                }
            }
            None => {
                thread::sleep(delay);
                Ok(())
            }
        }
    }
}

/// Records requested delays and returns immediately.
#[derive(Debug, Default, Clone)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.delays().len()
    }

    pub fn total(&self) -> Duration {
        self.delays().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, delay: Duration, cancellation: Option<&CancellationToken>) -> Result<()> {
        if let Some(token) = cancellation {
            token.check()?;
        }
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(delay);
        Ok(())
    }
}

// ============================================================================
// Cancellation
// ============================================================================

#[derive(Debug)]
struct CancelState {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    lock: Mutex<()>,
    signal: Condvar,
}

/// Cooperative cancellation shared between a caller and a running retry
/// loop. Clones observe the same flag.
///
/// A token trips when [`cancel`](Self::cancel) is called or when its
/// deadline passes, whichever comes first.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<CancelState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(Some(deadline))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Instant::now().checked_add(timeout))
    }

    fn build(deadline: Option<Instant>) -> Self {
        Self {
            state: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                deadline,
                lock: Mutex::new(()),
                signal: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        let _guard = self.state.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
            || self.state.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.state.deadline
    }

    /// `Err(DbError::Cancelled)` once the token has tripped.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DbError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Wait up to `timeout`. Returns `true` if the token tripped first.
    pub fn wait(&self, timeout: Duration) -> bool {
        let end = Instant::now().checked_add(timeout);
        let mut guard = self.state.lock.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if self.is_cancelled() {
                return true;
            }

            let now = Instant::now();
            let wake = match (end, self.state.deadline) {
                (Some(end), Some(deadline)) => Some(end.min(deadline)),
                (end, deadline) => end.or(deadline),
            };
            let remaining = match wake {
                Some(wake) if wake <= now => return self.is_cancelled(),
                Some(wake) => wake - now,
                // Unbounded wait with no deadline
                None => Duration::from_secs(3600),
            };

            guard = self
                .state
                .signal
                .wait_timeout(guard, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sleeper_does_not_block() {
        let sleeper = RecordingSleeper::new();
        let started = Instant::now();
        sleeper.sleep(Duration::from_secs(30), None).unwrap();
        sleeper.sleep(Duration::from_secs(30), None).unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(sleeper.count(), 2);
        assert_eq!(sleeper.total(), Duration::from_secs(60));
    }

    #[test]
    fn test_cancel_interrupts_sleep() {
        let token = CancellationToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });

        let started = Instant::now();
        let result = ThreadSleeper.sleep(Duration::from_secs(10), Some(&token));
        handle.join().unwrap();

        assert!(matches!(result, Err(DbError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_deadline_trips_token() {
        let token = CancellationToken::with_timeout(Duration::from_millis(20));
        assert!(!token.is_cancelled());
        assert!(token.wait(Duration::from_secs(10)));
        assert!(token.check().is_err());
    }

    #[test]
    fn test_wait_times_out_without_cancel() {
        let token = CancellationToken::new();
        assert!(!token.wait(Duration::from_millis(10)));
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_recording_sleeper_honors_cancelled_token() {
        let token = CancellationToken::new();
        token.cancel();
        let sleeper = RecordingSleeper::new();
        assert!(sleeper.sleep(Duration::from_secs(1), Some(&token)).is_err());
        assert_eq!(sleeper.count(), 0);
    }
}
