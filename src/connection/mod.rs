pub mod command;
pub mod config;
mod session;
pub mod transaction;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use uuid::Uuid;

use crate::core::{ConnectionState, IsolationLevel, Result, StateChange};
use crate::driver::Driver;
use crate::result::QueryResult;
use crate::retry::{CancellationToken, RetryPolicy};

pub use command::ReliableCommand;
pub use config::ConnectionSettings;
pub use session::{ListenerId, StateListener};

use session::ReliableSession;
pub use transaction::ReliableTransaction;

/// Database connection handle
///
/// Stands in for the driver's connection object. The physical connection
/// lives in a shared session; cloning a `ReliableConnection`
/// yields another view of the same session, never a second connection.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use reliabledb::driver::simulated::SimulatedDriver;
/// use reliabledb::provider::ReliableProvider;
///
/// # fn main() -> reliabledb::Result<()> {
/// let provider = ReliableProvider::builder(Arc::new(SimulatedDriver::new("sim"))).build()?;
/// let conn = provider.create_connection("Data Source=sim;Initial Catalog=app");
/// conn.open()?;
///
/// let mut cmd = conn.create_command();
/// cmd.set_text("UPDATE accounts SET active = 1");
/// cmd.execute_non_query()?;
/// conn.close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ReliableConnection {
    session: Arc<Mutex<ReliableSession>>,
}

impl ReliableConnection {
    pub fn new(
        driver: Arc<dyn Driver>,
        connection_string: impl Into<String>,
        connection_policy: Arc<RetryPolicy>,
        command_policy: Arc<RetryPolicy>,
    ) -> Self {
        let session =
            ReliableSession::new(driver, connection_string, connection_policy, command_policy);
        Self {
            session: Arc::new(Mutex::new(session)),
        }
    }

    /// Lock the session for a sequence of operations.
    pub(crate) fn session(&self) -> Result<MutexGuard<'_, ReliableSession>> {
        Ok(self.session.lock()?)
    }

    /// Whether `other` is a view of the same session.
    pub fn same_session(&self, other: &ReliableConnection) -> bool {
        Arc::ptr_eq(&self.session, &other.session)
    }

    pub fn id(&self) -> Result<Uuid> {
        Ok(self.session()?.id())
    }

    /// Number of physical connections opened so far; grows on every
    /// reconnect.
    pub fn generation(&self) -> Result<u64> {
        Ok(self.session()?.generation())
    }

    /// Whether a transaction begun through this connection is pending.
    pub fn in_transaction(&self) -> Result<bool> {
        Ok(self.session()?.in_transaction())
    }

    pub fn is_disposed(&self) -> Result<bool> {
        Ok(self.session()?.is_disposed())
    }

    /// Open the connection, retrying transient failures with the
    /// connection policy.
    pub fn open(&self) -> Result<()> {
        self.session()?.open(None)
    }

    pub fn open_cancellable(&self, token: &CancellationToken) -> Result<()> {
        self.session()?.open(Some(token))
    }

    /// Release the physical connection. Closing twice is harmless.
    pub fn close(&self) -> Result<()> {
        self.session()?.close()
    }

    pub fn dispose(&self) -> Result<()> {
        self.session()?.dispose()
    }

    /// Create a command bound to this connection.
    pub fn create_command(&self) -> ReliableCommand {
        ReliableCommand::with_connection("", self.clone())
    }

    /// Begin a transaction at the default isolation level.
    pub fn begin_transaction(&self) -> Result<ReliableTransaction> {
        self.begin_transaction_with(IsolationLevel::default())
    }

    pub fn begin_transaction_with(&self, isolation_level: IsolationLevel) -> Result<ReliableTransaction> {
        let native = self.session()?.begin_transaction(isolation_level, None)?;
        Ok(ReliableTransaction::new(native, self.clone()))
    }

    /// List the schema collections the driver offers.
    pub fn get_schema(&self) -> Result<QueryResult> {
        self.session()?.get_schema(None, &[], None)
    }

    pub fn get_schema_collection(&self, collection: &str) -> Result<QueryResult> {
        self.session()?.get_schema(Some(collection), &[], None)
    }

    pub fn get_schema_restricted(
        &self,
        collection: &str,
        restrictions: &[Option<String>],
    ) -> Result<QueryResult> {
        self.session()?.get_schema(Some(collection), restrictions, None)
    }

    pub fn change_database(&self, database: &str) -> Result<()> {
        self.session()?.change_database(database)
    }

    pub fn connection_string(&self) -> Result<String> {
        Ok(self.session()?.connection_string().to_string())
    }

    /// Fails with `InvalidState` while the connection is open.
    pub fn set_connection_string(&self, connection_string: &str) -> Result<()> {
        self.session()?.set_connection_string(connection_string)
    }

    /// Timeout for establishing one physical connection, as configured in
    /// the connection string.
    pub fn connection_timeout(&self) -> Result<Duration> {
        Ok(self.settings()?.connect_timeout)
    }

    pub fn database(&self) -> Result<String> {
        let database = self.session()?.database();
        match database {
            Some(database) => Ok(database),
            None => Ok(self.settings()?.database),
        }
    }

    pub fn data_source(&self) -> Result<String> {
        let data_source = self.session()?.data_source();
        match data_source {
            Some(data_source) => Ok(data_source),
            None => Ok(self.settings()?.data_source),
        }
    }

    pub fn server_version(&self) -> Result<String> {
        self.session()?.server_version()
    }

    pub fn state(&self) -> Result<ConnectionState> {
        Ok(self.session()?.state())
    }

    /// Subscribe to state changes; the subscription survives reconnects.
    pub fn on_state_change<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        Ok(self.session()?.add_state_listener(Arc::new(listener)))
    }

    pub fn remove_state_listener(&self, id: ListenerId) -> Result<bool> {
        Ok(self.session()?.remove_state_listener(id))
    }

    pub fn connection_policy(&self) -> Result<Arc<RetryPolicy>> {
        Ok(Arc::clone(self.session()?.connection_policy()))
    }

    pub fn command_policy(&self) -> Result<Arc<RetryPolicy>> {
        Ok(Arc::clone(self.session()?.command_policy()))
    }

    fn settings(&self) -> Result<ConnectionSettings> {
        let connection_string = self.connection_string()?;
        ConnectionSettings::parse(&connection_string)
    }
}

impl std::fmt::Debug for ReliableConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // try_lock: formatting must not deadlock against a held session
        let redacted = self
            .session
            .try_lock()
            .ok()
            .and_then(|session| ConnectionSettings::parse(session.connection_string()).ok())
            .map(|settings| settings.to_redacted());
        f.debug_struct("ReliableConnection")
            .field("connection_string", &redacted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DbError;
    use crate::driver::simulated::SimulatedDriver;
    use crate::retry::{NoRetry, RecordingSleeper};
    use crate::transient::TransientErrorClassifier;

    fn connection(connection_string: &str) -> (SimulatedDriver, ReliableConnection) {
        let driver = SimulatedDriver::new("sim");
        let policy = Arc::new(
            RetryPolicy::new(Arc::new(NoRetry), Arc::new(TransientErrorClassifier::sql_azure()))
                .with_sleeper(Arc::new(RecordingSleeper::new())),
        );
        let conn = ReliableConnection::new(
            Arc::new(driver.clone()),
            connection_string,
            Arc::clone(&policy),
            policy,
        );
        (driver, conn)
    }

    #[test]
    fn test_connection_creation() {
        let (driver, conn) = connection("Data Source=db1;Initial Catalog=sales;Connect Timeout=7");

        assert_eq!(conn.state().unwrap(), ConnectionState::Closed);
        assert_eq!(conn.database().unwrap(), "sales");
        assert_eq!(conn.data_source().unwrap(), "db1");
        assert_eq!(conn.connection_timeout().unwrap(), Duration::from_secs(7));
        assert_eq!(driver.server().connections_created(), 0);
    }

    #[test]
    fn test_clones_share_session() {
        let (driver, conn) = connection("Data Source=db1");
        let other = conn.clone();

        conn.open().unwrap();
        assert_eq!(other.state().unwrap(), ConnectionState::Open);
        assert!(conn.same_session(&other));
        assert_eq!(conn.id().unwrap(), other.id().unwrap());

        other.close().unwrap();
        assert_eq!(conn.state().unwrap(), ConnectionState::Closed);
        assert_eq!(driver.server().live_connections(), 0);
    }

    #[test]
    fn test_server_version_requires_open() {
        let (_driver, conn) = connection("Data Source=db1");
        assert!(matches!(conn.server_version(), Err(DbError::InvalidState(_))));
        conn.open().unwrap();
        assert!(conn.server_version().unwrap().starts_with("15."));
    }

    #[test]
    fn test_schema_collections() {
        let (_driver, conn) = connection("Data Source=db1");
        let collections = conn.get_schema().unwrap();
        assert_eq!(collections.row_count(), 2);

        let databases = conn.get_schema_collection("Databases").unwrap();
        assert!(databases.rows.iter().any(|row| row[0].as_str() == Some("master")));
    }

    #[test]
    fn test_debug_hides_password() {
        let (_driver, conn) = connection("Data Source=db1;User ID=sa;Password=hunter2");
        let rendered = format!("{:?}", conn);
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_connection_string_change_rules() {
        let (_driver, conn) = connection("Data Source=db1");
        conn.open().unwrap();
        assert!(matches!(
            conn.set_connection_string("Data Source=db2"),
            Err(DbError::InvalidState(_))
        ));
        conn.close().unwrap();
        conn.set_connection_string("Data Source=db2").unwrap();
        assert_eq!(conn.data_source().unwrap(), "db2");
    }
}
