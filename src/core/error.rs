use thiserror::Error;

use crate::driver::NativeError;

/// Error surface of the reliable layer.
///
/// Failures raised by the native driver are carried unchanged in
/// [`DbError::Native`]: once a retry budget is spent the caller sees the
/// last driver error, not a wrapper. Every other variant is produced by this
/// crate and never by the driver.
#[derive(Error, Debug)]
pub enum DbError {
    #[error(transparent)]
    Native(#[from] NativeError),

    #[error("Timeout expired: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{context}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl DbError {
    /// Wrap an arbitrary error under a context message, keeping it reachable
    /// through `source()`.
    pub fn wrap<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Wrapped {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// The driver error carried by this value, if any.
    pub fn as_native(&self) -> Option<&NativeError> {
        match self {
            Self::Native(native) => Some(native),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_native_error_is_transparent() {
        let err = DbError::from(NativeError::single(40613, "Database is not currently available"));
        assert_eq!(err.to_string(), "Database is not currently available");
        assert_eq!(err.as_native().map(|n| n.number()), Some(40613));
    }

    #[test]
    fn test_wrapped_keeps_source() {
        let err = DbError::wrap("lazy load failed", NativeError::single(40197, "service error"));
        assert_eq!(err.to_string(), "lazy load failed");
        let source = err.source().unwrap();
        assert!(source.downcast_ref::<NativeError>().is_some());
    }
}
