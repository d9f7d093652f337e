// ============================================================================
// Transient Error Detection
// ============================================================================
//
// Decides whether a failure is worth retrying. Driver errors carry a
// collection of numbered records; an error is transient when any record's
// number is in the classifier's code set. Callers and mapping layers often
// wrap driver errors, so the whole `source()` chain is inspected.
//
// ============================================================================

use std::collections::HashSet;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;

use lazy_static::lazy_static;

use crate::core::DbError;
use crate::driver::NativeError;

/// Predicate over errors consumed by [`RetryPolicy`](crate::retry::RetryPolicy).
pub trait TransientErrorDetectionStrategy: Send + Sync {
    fn is_transient(&self, error: &(dyn StdError + 'static)) -> bool;
}

impl<F> TransientErrorDetectionStrategy for F
where
    F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync,
{
    fn is_transient(&self, error: &(dyn StdError + 'static)) -> bool {
        self(error)
    }
}

lazy_static! {
    /// Throttling, failover and transport codes reported by hosted SQL.
    static ref SQL_AZURE_CODES: Arc<HashSet<i32>> = Arc::new(
        [
            40501, // service busy
            40197, // error processing request
            40540, // service encountered an error
            40613, // database unavailable
            40143, // connection could not be initialized
            10928, // resource limit
            10929, // resource limit, minimum guarantee
            10053, // transport: aborted by software
            10054, // transport: reset by peer
            10060, // network timeout
            233,   // no process on the other end of the pipe
            64,    // specified network name no longer available
            20,    // instance does not support encryption
            4221,  // login to read-secondary failed
            49918, 49919, 49920, // too many operations in progress
        ]
        .into_iter()
        .collect()
    );

    /// Transient codes for self-hosted servers.
    static ref ON_PREMISES_CODES: Arc<HashSet<i32>> = Arc::new(
        [
            2,     // server not found
            20,
            53,    // network path not found
            64,
            233,
            1205,  // deadlock victim
            10053,
            10054,
            10060,
            17142, // server paused
        ]
        .into_iter()
        .collect()
    );

    /// Client timeout codes honored when a classifier treats timeouts as
    /// transient.
    static ref TIMEOUT_CODES: HashSet<i32> = [-2, 121].into_iter().collect();
}

/// Code-set classifier for driver errors.
///
/// # Examples
///
/// ```
/// use reliabledb::driver::NativeError;
/// use reliabledb::transient::{TransientErrorClassifier, TransientErrorDetectionStrategy};
///
/// let classifier = TransientErrorClassifier::sql_azure();
/// assert!(classifier.is_transient(&NativeError::single(40501, "busy")));
/// assert!(!classifier.is_transient(&NativeError::single(208, "invalid object")));
/// ```
#[derive(Clone)]
pub struct TransientErrorClassifier {
    name: String,
    codes: Arc<HashSet<i32>>,
    timeouts: bool,
}

impl TransientErrorClassifier {
    pub fn sql_azure() -> Self {
        Self {
            name: "SqlAzure".into(),
            codes: Arc::clone(&SQL_AZURE_CODES),
            timeouts: false,
        }
    }

    /// `sql_azure()` plus client-side timeouts.
    pub fn sql_azure_with_timeouts() -> Self {
        Self {
            name: "SqlAzureWithTimeouts".into(),
            timeouts: true,
            ..Self::sql_azure()
        }
    }

    /// Self-hosted servers; timeouts are transient.
    pub fn on_premises() -> Self {
        Self {
            name: "OnPremises".into(),
            codes: Arc::clone(&ON_PREMISES_CODES),
            timeouts: true,
        }
    }

    /// Classifier over an arbitrary code set.
    pub fn with_codes(codes: impl IntoIterator<Item = i32>) -> Self {
        Self {
            name: "Custom".into(),
            codes: Arc::new(codes.into_iter().collect()),
            timeouts: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timeouts(mut self, timeouts: bool) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Extend the code set; the shared preset sets are left untouched.
    pub fn with_additional_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        let mut merged: HashSet<i32> = self.codes.as_ref().clone();
        merged.extend(codes);
        self.codes = Arc::new(merged);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn includes_timeouts(&self) -> bool {
        self.timeouts
    }

    pub fn is_transient_code(&self, number: i32) -> bool {
        self.codes.contains(&number) || (self.timeouts && TIMEOUT_CODES.contains(&number))
    }

    fn is_transient_native(&self, native: &NativeError) -> bool {
        native
            .errors()
            .iter()
            .any(|record| self.is_transient_code(record.number))
    }
}

impl TransientErrorDetectionStrategy for TransientErrorClassifier {
    fn is_transient(&self, error: &(dyn StdError + 'static)) -> bool {
        let mut layer = Some(error);
        while let Some(current) = layer {
            if let Some(native) = native_error(current) {
                if self.is_transient_native(native) {
                    return true;
                }
            } else if self.timeouts && is_timeout(current) {
                return true;
            }
            layer = current.source();
        }
        false
    }
}

impl fmt::Debug for TransientErrorClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransientErrorClassifier")
            .field("name", &self.name)
            .field("codes", &self.codes.len())
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

// `DbError::Native` is transparent, so its own `source()` skips the driver
// error; look through it explicitly.
fn native_error<'a>(error: &'a (dyn StdError + 'static)) -> Option<&'a NativeError> {
    error
        .downcast_ref::<NativeError>()
        .or_else(|| error.downcast_ref::<DbError>().and_then(DbError::as_native))
}

fn is_timeout(error: &(dyn StdError + 'static)) -> bool {
    if let Some(DbError::Timeout(_)) = error.downcast_ref::<DbError>() {
        return true;
    }
    error
        .downcast_ref::<io::Error>()
        .is_some_and(|io| io.kind() == io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ErrorRecord;
    use thiserror::Error;

    #[derive(Error, Debug)]
    #[error("transaction failed")]
    struct TransactionFailed(#[source] DbError);

    #[derive(Error, Debug)]
    #[error("lazy load error")]
    struct LazyLoad(#[source] Box<dyn StdError + Send + Sync>);

    fn native(number: i32) -> NativeError {
        NativeError::single(number, format!("error {}", number))
    }

    #[test]
    fn test_direct_driver_error() {
        let classifier = TransientErrorClassifier::sql_azure();
        assert!(classifier.is_transient(&native(40197)));
        assert!(classifier.is_transient(&DbError::from(native(40501))));
        assert!(!classifier.is_transient(&native(208)));
    }

    #[test]
    fn test_any_record_counts() {
        let err = NativeError::new(vec![
            ErrorRecord::new(3621, "The statement has been terminated."),
            ErrorRecord::new(40613, "Database is not currently available."),
        ]);
        assert!(TransientErrorClassifier::sql_azure().is_transient(&err));
    }

    #[test]
    fn test_wrapped_driver_error() {
        let classifier = TransientErrorClassifier::sql_azure();

        let once = DbError::wrap("Wrapped exception", native(40197));
        assert!(classifier.is_transient(&once));

        let in_transaction = TransactionFailed(DbError::from(native(40197)));
        assert!(classifier.is_transient(&in_transaction));

        let twice = LazyLoad(Box::new(DbError::wrap("Wrapped exception", native(40197))));
        assert!(classifier.is_transient(&twice));

        let thrice = DbError::wrap("outer", LazyLoad(Box::new(TransactionFailed(native(40197).into()))));
        assert!(classifier.is_transient(&thrice));
    }

    #[test]
    fn test_wrapped_permanent_error() {
        let classifier = TransientErrorClassifier::sql_azure();
        let err = LazyLoad(Box::new(DbError::wrap("Wrapped exception", native(547))));
        assert!(!classifier.is_transient(&err));
    }

    #[test]
    fn test_timeouts_depend_on_variant() {
        let timeout = native(-2);
        let local = DbError::Timeout("Execution Timeout Expired".into());
        let io_timeout = io::Error::new(io::ErrorKind::TimedOut, "read timed out");

        let plain = TransientErrorClassifier::sql_azure();
        assert!(!plain.is_transient(&timeout));
        assert!(!plain.is_transient(&local));
        assert!(!plain.is_transient(&io_timeout));

        let with_timeouts = TransientErrorClassifier::sql_azure_with_timeouts();
        assert!(with_timeouts.is_transient(&timeout));
        assert!(with_timeouts.is_transient(&native(121)));
        assert!(with_timeouts.is_transient(&local));
        assert!(with_timeouts.is_transient(&io_timeout));
        assert!(with_timeouts.is_transient(&native(40501)));
    }

    #[test]
    fn test_on_premises() {
        let classifier = TransientErrorClassifier::on_premises();
        assert!(classifier.is_transient(&native(1205)));
        assert!(classifier.is_transient(&native(-2)));
        assert!(!classifier.is_transient(&native(40501)));
        assert!(!classifier.is_transient(&native(18456)));
    }

    #[test]
    fn test_custom_codes() {
        let classifier = TransientErrorClassifier::with_codes([42]);
        assert!(classifier.is_transient(&native(42)));
        assert!(!classifier.is_transient(&native(40501)));

        let extended = TransientErrorClassifier::sql_azure().with_additional_codes([1205]);
        assert!(extended.is_transient(&native(1205)));
        assert!(!TransientErrorClassifier::sql_azure().is_transient(&native(1205)));
    }

    #[test]
    fn test_non_driver_errors() {
        let classifier = TransientErrorClassifier::sql_azure_with_timeouts();
        assert!(!classifier.is_transient(&DbError::InvalidState("closed".into())));
        assert!(!classifier.is_transient(&DbError::Cancelled));
        assert!(!classifier.is_transient(&io::Error::other("disk full")));
    }

    #[test]
    fn test_closure_detector() {
        let detector = |error: &(dyn StdError + 'static)| error.to_string().contains("busy");
        assert!(!detector.is_transient(&native(1)));
        assert!(detector.is_transient(&NativeError::single(1, "server busy")));
    }
}
