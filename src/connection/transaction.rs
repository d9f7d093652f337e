use tracing::{Level, event};

use crate::core::{DbError, IsolationLevel, Result, TransactionId};
use crate::driver::NativeTransaction;

use super::ReliableConnection;

/// Transaction proxy
///
/// Wraps the driver's transaction and hands back the reliable connection
/// rather than the physical one. A transaction is pinned to the physical
/// connection it began on: if that connection breaks, `commit` fails with
/// [`DbError::TransactionAborted`] and only `rollback` (or drop) ends it.
///
/// Dropping an uncompleted transaction rolls it back.
pub struct ReliableTransaction {
    native: Option<Box<dyn NativeTransaction>>,
    id: TransactionId,
    isolation_level: IsolationLevel,
    connection: ReliableConnection,
}

impl ReliableTransaction {
    pub(crate) fn new(native: Box<dyn NativeTransaction>, connection: ReliableConnection) -> Self {
        Self {
            id: native.id(),
            isolation_level: native.isolation_level(),
            native: Some(native),
            connection,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// The owning reliable connection.
    pub fn connection(&self) -> &ReliableConnection {
        &self.connection
    }

    pub fn is_completed(&self) -> bool {
        self.native.is_none()
    }

    pub fn commit(&mut self) -> Result<()> {
        let native = self.native.as_mut().ok_or_else(completed)?;
        self.connection
            .session()?
            .complete_transaction(native.as_mut(), true)?;
        self.native = None;
        Ok(())
    }

    /// Roll back. The transaction is finished afterwards even if the
    /// driver reports an error.
    pub fn rollback(&mut self) -> Result<()> {
        let mut native = self.native.take().ok_or_else(completed)?;
        self.connection
            .session()?
            .complete_transaction(native.as_mut(), false)
    }
}

fn completed() -> DbError {
    DbError::InvalidState("This transaction has completed; it is no longer usable".into())
}

impl Drop for ReliableTransaction {
    fn drop(&mut self) {
        if self.native.is_none() {
            return;
        }
        if let Err(err) = self.rollback() {
            event!(
                Level::DEBUG,
                transaction = %self.id,
                error = %err,
                "Rollback on drop failed"
            );
        }
    }
}

impl std::fmt::Debug for ReliableTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableTransaction")
            .field("id", &self.id)
            .field("isolation_level", &self.isolation_level)
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::simulated::{Operation, SimulatedDriver};
    use crate::retry::{FixedInterval, RecordingSleeper, RetryPolicy};
    use crate::transient::TransientErrorClassifier;
    use std::sync::Arc;
    use std::time::Duration;

    fn connection(driver: &SimulatedDriver) -> ReliableConnection {
        let policy = Arc::new(
            RetryPolicy::new(
                Arc::new(FixedInterval::new(3, Duration::from_millis(1))),
                Arc::new(TransientErrorClassifier::sql_azure()),
            )
            .with_sleeper(Arc::new(RecordingSleeper::new())),
        );
        ReliableConnection::new(
            Arc::new(driver.clone()),
            "Data Source=sim",
            Arc::clone(&policy),
            policy,
        )
    }

    fn insert(conn: &ReliableConnection, txn: &ReliableTransaction, text: &str) -> Result<u64> {
        let mut cmd = conn.create_command();
        cmd.set_text(text);
        cmd.set_transaction(Some(txn));
        cmd.execute_non_query()
    }

    #[test]
    fn test_transaction_lifecycle() {
        let driver = SimulatedDriver::new("sim");
        let conn = connection(&driver);

        let mut txn = conn.begin_transaction_with(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(txn.isolation_level(), IsolationLevel::RepeatableRead);
        assert!(txn.connection().same_session(&conn));

        insert(&conn, &txn, "INSERT a").unwrap();
        txn.commit().unwrap();

        assert!(txn.is_completed());
        assert!(matches!(txn.commit(), Err(DbError::InvalidState(_))));
        assert!(matches!(txn.rollback(), Err(DbError::InvalidState(_))));
        assert_eq!(driver.server().committed(), vec!["INSERT a".to_string()]);
    }

    #[test]
    fn test_transaction_rollback() {
        let driver = SimulatedDriver::new("sim");
        let conn = connection(&driver);

        let mut txn = conn.begin_transaction().unwrap();
        insert(&conn, &txn, "INSERT a").unwrap();
        txn.rollback().unwrap();

        assert!(driver.server().committed().is_empty());
        assert_eq!(driver.server().active_transactions(), 0);
    }

    #[test]
    fn test_auto_rollback_on_drop() {
        let driver = SimulatedDriver::new("sim");
        let conn = connection(&driver);
        {
            let txn = conn.begin_transaction().unwrap();
            insert(&conn, &txn, "INSERT a").unwrap();
        }

        assert_eq!(driver.server().active_transactions(), 0);
        assert!(driver.server().committed().is_empty());

        // The session accepts a new transaction once the old one is gone
        let mut txn = conn.begin_transaction().unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_begin_is_retried() {
        let driver = SimulatedDriver::new("sim");
        driver.server().fail_next(Operation::BeginTransaction, 40501, 2);
        let conn = connection(&driver);

        let mut txn = conn.begin_transaction().unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_commit_failure_leaves_transaction_pending() {
        let driver = SimulatedDriver::new("sim");
        driver.server().fail_next(Operation::Commit, 547, 1);
        let conn = connection(&driver);

        let mut txn = conn.begin_transaction().unwrap();
        insert(&conn, &txn, "INSERT a").unwrap();

        let err = txn.commit().unwrap_err();
        assert_eq!(err.as_native().map(|e| e.number()), Some(547));
        assert!(!txn.is_completed());

        txn.commit().unwrap();
        assert_eq!(driver.server().committed(), vec!["INSERT a".to_string()]);
    }

    #[test]
    fn test_close_abandons_transaction() {
        let driver = SimulatedDriver::new("sim");
        let conn = connection(&driver);
        let mut txn = conn.begin_transaction().unwrap();

        conn.close().unwrap();
        assert!(matches!(txn.commit(), Err(DbError::InvalidState(_))));
        assert_eq!(driver.server().active_transactions(), 0);
    }
}
