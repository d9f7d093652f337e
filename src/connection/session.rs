// ============================================================================
// Reliable Session
// ============================================================================
//
// Owns the single physical connection slot behind a ReliableConnection and
// every proxy created from it. Execution goes through one of two retry
// policies: the connection policy re-establishes a physical handle, the
// command policy re-runs an operation (reopening the handle first when it
// broke).
//
// Transactions pin the session to the handle they began on. While a
// transaction is pending nothing is retried and no handle is replaced; if
// that handle breaks the transaction is aborted and stays aborted until
// it is rolled back or dropped.
//
// ============================================================================

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{Level, event};
use uuid::Uuid;

use crate::core::{
    ConnectionState, DbError, HandleId, IsolationLevel, Result, StateChange, TransactionId,
};
use crate::driver::{
    Driver, NativeCommand, NativeConnection, NativeError, NativeResult, NativeTransaction,
};
use crate::result::QueryResult;
use crate::retry::{CancellationToken, RetryPolicy};

use super::config::ConnectionSettings;

const TRANSACTION_COMPLETED: &str = "This transaction has completed; it is no longer usable";

/// Callback fired when the connection state changes.
pub type StateListener = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Handle returned by [`ReliableConnection::on_state_change`](super::ReliableConnection::on_state_change).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy)]
struct ActiveTransaction {
    id: TransactionId,
    handle: HandleId,
    aborted: bool,
}

pub struct ReliableSession {
    id: Uuid,
    driver: Arc<dyn Driver>,
    connection_string: String,
    connection_policy: Arc<RetryPolicy>,
    command_policy: Arc<RetryPolicy>,
    current: Option<Box<dyn NativeConnection>>,
    /// Number of physical handles opened so far
    generation: u64,
    reported: ConnectionState,
    closed_explicitly: bool,
    disposed: bool,
    transaction: Option<ActiveTransaction>,
    database: Option<String>,
    listeners: Vec<(ListenerId, StateListener)>,
    next_listener: u64,
}

impl ReliableSession {
    pub fn new(
        driver: Arc<dyn Driver>,
        connection_string: impl Into<String>,
        connection_policy: Arc<RetryPolicy>,
        command_policy: Arc<RetryPolicy>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            driver,
            connection_string: connection_string.into(),
            connection_policy,
            command_policy,
            current: None,
            generation: 0,
            reported: ConnectionState::Closed,
            closed_explicitly: false,
            disposed: false,
            transaction: None,
            database: None,
            listeners: Vec::new(),
            next_listener: 1,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection_policy(&self) -> &Arc<RetryPolicy> {
        &self.connection_policy
    }

    pub fn command_policy(&self) -> &Arc<RetryPolicy> {
        &self.command_policy
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Replace the connection string. Only allowed while no physical
    /// handle is open.
    pub fn set_connection_string(&mut self, connection_string: impl Into<String>) -> Result<()> {
        self.ensure_not_disposed()?;
        if self.has_open_handle() {
            return Err(DbError::InvalidState(
                "The connection string cannot be changed while the connection is open".into(),
            ));
        }
        self.connection_string = connection_string.into();
        Ok(())
    }

    /// State of the physical handle; `Closed` when there is none.
    pub fn state(&self) -> ConnectionState {
        match &self.current {
            Some(handle) => handle.state(),
            None => ConnectionState::Closed,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Current database: the live handle's, else the last requested one.
    pub fn database(&self) -> Option<String> {
        match &self.current {
            Some(handle) => Some(handle.database()),
            None => self.database.clone(),
        }
    }

    pub fn data_source(&self) -> Option<String> {
        self.current.as_ref().map(|handle| handle.data_source())
    }

    pub fn server_version(&self) -> Result<String> {
        let handle = self.open_handle()?;
        Ok(handle.server_version()?)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open the session. A no-op when a physical handle is already open.
    pub fn open(&mut self, cancellation: Option<&CancellationToken>) -> Result<()> {
        self.ensure_not_disposed()?;
        self.closed_explicitly = false;
        self.ensure_open(cancellation)
    }

    /// Release the physical handle. Idempotent.
    ///
    /// A pending transaction is abandoned; the server rolls it back when
    /// the handle goes away.
    pub fn close(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.closed_explicitly = true;
        if let Some(active) = self.transaction.take() {
            event!(
                Level::WARN,
                session = %self.id,
                transaction = %active.id,
                "Closing with a pending transaction"
            );
        }
        if self.current.is_some() {
            self.release_current();
            self.transition(ConnectionState::Closed);
        }
        Ok(())
    }

    /// Close and refuse every further use.
    pub fn dispose(&mut self) -> Result<()> {
        self.close()?;
        self.disposed = true;
        self.listeners.clear();
        Ok(())
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.disposed {
            return Err(DbError::InvalidState("The connection has been disposed".into()));
        }
        Ok(())
    }

    fn ensure_usable(&self) -> Result<()> {
        self.ensure_not_disposed()?;
        if self.closed_explicitly {
            return Err(DbError::InvalidState(
                "The connection is closed; call open() first".into(),
            ));
        }
        Ok(())
    }

    fn has_open_handle(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|handle| handle.state().is_open())
    }

    fn open_handle(&self) -> Result<&dyn NativeConnection> {
        match self.current.as_deref() {
            Some(handle) if handle.state().is_open() => Ok(handle),
            _ => Err(DbError::InvalidState("The connection is not open".into())),
        }
    }

    fn open_handle_mut(&mut self) -> Result<&mut (dyn NativeConnection + 'static)> {
        match self.current.as_deref_mut() {
            Some(handle) if handle.state().is_open() => Ok(handle),
            _ => Err(DbError::InvalidState("The connection is not open".into())),
        }
    }

    /// Make sure a physical handle is open, replacing a missing or broken
    /// one through the connection policy.
    fn ensure_open(&mut self, cancellation: Option<&CancellationToken>) -> Result<()> {
        if self.has_open_handle() {
            return Ok(());
        }
        if self.state() == ConnectionState::Broken {
            self.transition(ConnectionState::Broken);
        }
        if let Some(active) = self.transaction.as_mut() {
            active.aborted = true;
            return Err(DbError::TransactionAborted(format!(
                "Transaction {} lost its connection",
                active.id
            )));
        }
        if self.connection_string.trim().is_empty() {
            return Err(DbError::InvalidState(
                "The connection string has not been initialized".into(),
            ));
        }
        ConnectionSettings::parse(&self.connection_string)?.validate()?;

        self.transition(ConnectionState::Connecting);
        let policy = Arc::clone(&self.connection_policy);
        match policy.execute_with(cancellation, || self.open_once()) {
            Ok(()) => {
                self.transition(ConnectionState::Open);
                Ok(())
            }
            Err(err) => {
                self.release_current();
                self.transition(ConnectionState::Closed);
                Err(err)
            }
        }
    }

    /// One attempt at acquiring a physical handle. The previous handle is
    /// released before the new one is created.
    fn open_once(&mut self) -> Result<()> {
        self.release_current();

        let mut handle = self.driver.create_connection(&self.connection_string)?;
        handle.open()?;
        if let Some(database) = &self.database {
            handle.change_database(database)?;
        }

        self.generation += 1;
        event!(
            Level::INFO,
            session = %self.id,
            generation = self.generation,
            handle = %handle.handle_id(),
            "Physical connection opened"
        );
        self.current = Some(handle);
        Ok(())
    }

    fn release_current(&mut self) {
        let Some(mut handle) = self.current.take() else {
            return;
        };
        if handle.state() == ConnectionState::Broken {
            event!(
                Level::WARN,
                session = %self.id,
                handle = %handle.handle_id(),
                "Discarding broken physical connection"
            );
        }
        if let Err(err) = handle.close() {
            event!(
                Level::WARN,
                session = %self.id,
                handle = %handle.handle_id(),
                error = %err,
                "Failed to close physical connection"
            );
        }
    }

    /// Convert a driver failure, noting whether it left the handle broken.
    fn record_failure(&mut self, err: NativeError) -> DbError {
        let broken = self
            .current
            .as_ref()
            .is_some_and(|handle| handle.state() == ConnectionState::Broken);
        if broken {
            if let Some(active) = self.transaction.as_mut() {
                active.aborted = true;
            }
            self.transition(ConnectionState::Broken);
        }
        DbError::Native(err)
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Run `op` against an open handle under the command policy, or
    /// directly on the transaction's handle when one is pending.
    pub(crate) fn execute_on_handle<T, F>(
        &mut self,
        cancellation: Option<&CancellationToken>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(&mut dyn NativeConnection) -> NativeResult<T>,
    {
        self.ensure_usable()?;
        if self.transaction.is_some() {
            return self.run_in_transaction(|handle, _| op(handle));
        }
        let policy = Arc::clone(&self.command_policy);
        self.retrying(&policy, cancellation, op)
    }

    /// Execute a command. Outside a transaction every attempt reopens the
    /// handle if needed and rebinds `command` to it; inside one the command
    /// runs exactly once on the transaction's handle.
    pub(crate) fn execute_command<T, F>(
        &mut self,
        command: &mut NativeCommand,
        transaction: Option<TransactionId>,
        cancellation: Option<&CancellationToken>,
        mut run: F,
    ) -> Result<T>
    where
        F: FnMut(&mut dyn NativeConnection, &NativeCommand) -> NativeResult<T>,
    {
        self.ensure_usable()?;

        match (self.transaction.map(|active| active.id), transaction) {
            (Some(active), Some(requested)) if active == requested => {
                return self.run_in_transaction(|handle, txn| {
                    command.bind(handle.handle_id(), Some(txn));
                    run(handle, command)
                });
            }
            (Some(_), _) => {
                return Err(DbError::InvalidState(
                    "The command must be enlisted in the connection's pending transaction".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(DbError::InvalidState(TRANSACTION_COMPLETED.into()));
            }
            (None, None) => {}
        }

        let session = self.id;
        let policy = Arc::clone(&self.command_policy);
        self.retrying(&policy, cancellation, |handle| {
            let id = handle.handle_id();
            if command.connection() != Some(id) {
                event!(Level::DEBUG, session = %session, handle = %id, "Rebinding command");
                command.bind(id, None);
            }
            run(handle, command)
        })
    }

    /// Prepare `command` on the open handle. Not retried.
    pub(crate) fn prepare(
        &mut self,
        command: &mut NativeCommand,
        transaction: Option<TransactionId>,
    ) -> Result<()> {
        self.ensure_usable()?;
        let handle = self.open_handle_mut()?;
        command.bind(handle.handle_id(), transaction);
        handle.prepare(command).map_err(|err| self.record_failure(err))
    }

    /// Schema introspection under the connection policy.
    pub fn get_schema(
        &mut self,
        collection: Option<&str>,
        restrictions: &[Option<String>],
        cancellation: Option<&CancellationToken>,
    ) -> Result<QueryResult> {
        self.ensure_usable()?;
        if self.transaction.is_some() {
            return self.run_in_transaction(|handle, _| handle.get_schema(collection, restrictions));
        }
        let policy = Arc::clone(&self.connection_policy);
        self.retrying(&policy, cancellation, |handle| {
            handle.get_schema(collection, restrictions)
        })
    }

    /// Switch database on the open handle; reopened handles switch too.
    pub fn change_database(&mut self, database: &str) -> Result<()> {
        self.ensure_usable()?;
        let handle = self.open_handle_mut()?;
        match handle.change_database(database) {
            Ok(()) => {
                self.database = Some(database.to_string());
                Ok(())
            }
            Err(err) => Err(self.record_failure(err)),
        }
    }

    fn retrying<T, F>(
        &mut self,
        policy: &RetryPolicy,
        cancellation: Option<&CancellationToken>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(&mut dyn NativeConnection) -> NativeResult<T>,
    {
        policy.execute_with(cancellation, || {
            self.ensure_open(cancellation)?;
            let handle = self.open_handle_mut()?;
            let result = op(handle);
            result.map_err(|err| self.record_failure(err))
        })
    }

    fn run_in_transaction<T, F>(&mut self, mut op: F) -> Result<T>
    where
        F: FnMut(&mut dyn NativeConnection, TransactionId) -> NativeResult<T>,
    {
        let active = self.live_transaction()?;
        let handle = self.open_handle_mut()?;
        let result = op(handle, active.id);
        result.map_err(|err| self.record_failure(err))
    }

    /// The pending transaction, provided its handle is still the live one.
    fn live_transaction(&mut self) -> Result<ActiveTransaction> {
        let Some(active) = self.transaction.as_mut() else {
            return Err(DbError::InvalidState(TRANSACTION_COMPLETED.into()));
        };
        let alive = !active.aborted
            && self.current.as_ref().is_some_and(|handle| {
                handle.handle_id() == active.handle && handle.state().is_open()
            });
        if !alive {
            active.aborted = true;
            return Err(DbError::TransactionAborted(format!(
                "Transaction {} lost its connection; roll it back",
                active.id
            )));
        }
        Ok(*active)
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Begin a transaction under the command policy, opening if needed.
    pub(crate) fn begin_transaction(
        &mut self,
        isolation_level: IsolationLevel,
        cancellation: Option<&CancellationToken>,
    ) -> Result<Box<dyn NativeTransaction>> {
        self.ensure_usable()?;
        if self.transaction.is_some() {
            return Err(DbError::InvalidState(
                "Parallel transactions are not supported".into(),
            ));
        }

        let policy = Arc::clone(&self.command_policy);
        let native = self.retrying(&policy, cancellation, |handle| {
            handle.begin_transaction(isolation_level)
        })?;

        let handle = self.open_handle()?.handle_id();
        event!(
            Level::DEBUG,
            session = %self.id,
            transaction = %native.id(),
            handle = %handle,
            "Transaction started"
        );
        self.transaction = Some(ActiveTransaction {
            id: native.id(),
            handle,
            aborted: false,
        });
        Ok(native)
    }

    /// Commit or roll back `native`, which must be the pending transaction.
    ///
    /// Commit of an aborted transaction fails with `TransactionAborted` and
    /// leaves it pending. Rollback always ends it; rolling back an aborted
    /// transaction succeeds since the server already discarded it.
    pub(crate) fn complete_transaction(
        &mut self,
        native: &mut dyn NativeTransaction,
        commit: bool,
    ) -> Result<()> {
        match self.transaction {
            Some(active) if active.id == native.id() => {}
            _ => return Err(DbError::InvalidState(TRANSACTION_COMPLETED.into())),
        }

        if commit {
            self.live_transaction()?;
            return match native.commit() {
                Ok(()) => {
                    self.transaction = None;
                    Ok(())
                }
                Err(err) => Err(self.record_failure(err)),
            };
        }

        let alive = self.live_transaction().is_ok();
        self.transaction = None;
        if !alive {
            event!(
                Level::DEBUG,
                session = %self.id,
                transaction = %native.id(),
                "Rolled back aborted transaction"
            );
            return Ok(());
        }
        native.rollback().map_err(|err| self.record_failure(err))
    }

    // ------------------------------------------------------------------------
    // State notifications
    // ------------------------------------------------------------------------

    /// Subscribe to state changes. Listeners run with the session locked
    /// and must not call back into the connection.
    pub fn add_state_listener(&mut self, listener: StateListener) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn remove_state_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener, _)| *listener != id);
        self.listeners.len() != before
    }

    fn transition(&mut self, current: ConnectionState) {
        let original = std::mem::replace(&mut self.reported, current);
        if original == current {
            return;
        }
        let change = StateChange { original, current };
        for (_, listener) in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&change))).is_err() {
                event!(
                    Level::ERROR,
                    session = %self.id,
                    from = %original,
                    to = %current,
                    "State listener panicked"
                );
            }
        }
    }
}

impl Drop for ReliableSession {
    fn drop(&mut self) {
        self.release_current();
    }
}
