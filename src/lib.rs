// ============================================================================
// ReliableDB Library
// ============================================================================
//
// Retry-resilient stand-ins for a database driver's connection, command and
// transaction objects. Transient failures (throttling, failover, dropped
// sockets) are classified by error code and retried under a configurable
// strategy; a broken physical connection is reopened transparently outside
// transactions.
//
// ============================================================================

pub mod core;
pub mod result;
pub mod driver;
pub mod retry;
pub mod transient;
pub mod connection;
pub mod provider;

// Re-export main types for convenience
pub use crate::core::{ConnectionState, DbError, IsolationLevel, Result, Value};
pub use result::QueryResult;

pub use connection::{ConnectionSettings, ReliableCommand, ReliableConnection, ReliableTransaction};
pub use provider::{ProviderConfig, ReliableProvider, ReliableProviderServices};
pub use retry::{
    CancellationToken, ExponentialBackoff, FixedInterval, Incremental, NoRetry, RetryPolicy,
    RetryStrategy, RetryingEvent,
};
pub use transient::{TransientErrorClassifier, TransientErrorDetectionStrategy};
