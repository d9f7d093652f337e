use std::time::Duration;

use crate::core::{
    CommandBehavior, CommandType, DbError, Parameter, ParameterCollection, Result,
    TransactionId, UpdateRowSource, Value,
};
use crate::driver::{NativeCommand, NativeConnection, NativeResult};
use crate::result::QueryResult;
use crate::retry::CancellationToken;

use super::{ReliableConnection, ReliableTransaction};

/// Command proxy
///
/// Property members read and write the wrapped driver command directly.
/// The three execute members go through the owning session: outside a
/// transaction they are retried with the command policy, reopening the
/// physical connection when it broke; inside a transaction they run once.
pub struct ReliableCommand {
    command: NativeCommand,
    connection: Option<ReliableConnection>,
    transaction: Option<TransactionId>,
    cancellation: CancellationToken,
}

impl ReliableCommand {
    /// A command with no connection; assign one before executing.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            command: NativeCommand::new(text),
            connection: None,
            transaction: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_connection(text: impl Into<String>, connection: ReliableConnection) -> Self {
        let mut command = Self::new(text);
        command.connection = Some(connection);
        command
    }

    pub fn text(&self) -> &str {
        self.command.text()
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.command.set_text(text);
    }

    pub fn command_type(&self) -> CommandType {
        self.command.command_type()
    }

    pub fn set_command_type(&mut self, command_type: CommandType) {
        self.command.set_command_type(command_type);
    }

    /// Per-call timeout handed to the driver.
    pub fn timeout(&self) -> Duration {
        self.command.timeout()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.command.set_timeout(timeout);
    }

    pub fn parameters(&self) -> &ParameterCollection {
        self.command.parameters()
    }

    pub fn parameters_mut(&mut self) -> &mut ParameterCollection {
        self.command.parameters_mut()
    }

    pub fn create_parameter(&self, name: impl Into<String>, value: impl Into<Value>) -> Parameter {
        Parameter::new(name, value)
    }

    pub fn updated_row_source(&self) -> UpdateRowSource {
        self.command.updated_row_source()
    }

    pub fn set_updated_row_source(&mut self, source: UpdateRowSource) {
        self.command.set_updated_row_source(source);
    }

    pub fn design_time_visible(&self) -> bool {
        self.command.design_time_visible()
    }

    pub fn set_design_time_visible(&mut self, visible: bool) {
        self.command.set_design_time_visible(visible);
    }

    pub fn connection(&self) -> Option<&ReliableConnection> {
        self.connection.as_ref()
    }

    /// Assign a connection; the driver command is unbound until the next
    /// execution binds it to that session's physical handle.
    pub fn set_connection(&mut self, connection: Option<ReliableConnection>) {
        self.command.unbind();
        self.transaction = None;
        self.connection = connection;
    }

    pub fn transaction(&self) -> Option<TransactionId> {
        self.transaction
    }

    /// Enlist in `transaction`, adopting its connection.
    pub fn set_transaction(&mut self, transaction: Option<&ReliableTransaction>) {
        match transaction {
            Some(transaction) => {
                let connection = transaction.connection();
                let same = self
                    .connection
                    .as_ref()
                    .is_some_and(|current| current.same_session(connection));
                if !same {
                    self.command.unbind();
                    self.connection = Some(connection.clone());
                }
                self.transaction = Some(transaction.id());
            }
            None => self.transaction = None,
        }
    }

    /// Narrow accessor to the wrapped driver command.
    pub fn native_command(&self) -> &NativeCommand {
        &self.command
    }

    /// Token observed by executions of this command. Hand a clone to
    /// another thread to cancel a pending retry loop from there.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Install a fresh token, e.g. after a cancellation or to set a deadline.
    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.cancellation = token;
    }

    /// Cancel pending and further executions until a new token is
    /// installed. Interrupts the delay between retries.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Prepare on the open physical connection. Not retried.
    pub fn prepare(&mut self) -> Result<()> {
        let connection = self.require_connection()?;
        let mut session = connection.session()?;
        session.prepare(&mut self.command, self.transaction)
    }

    pub fn execute_reader(&mut self) -> Result<QueryResult> {
        self.execute_reader_with(CommandBehavior::Default)
    }

    pub fn execute_reader_with(&mut self, behavior: CommandBehavior) -> Result<QueryResult> {
        self.execute(|handle, command| handle.execute_reader(command, behavior))
    }

    /// Rows affected.
    pub fn execute_non_query(&mut self) -> Result<u64> {
        self.execute(|handle, command| handle.execute_non_query(command))
    }

    /// First column of the first row, `None` for an empty result.
    pub fn execute_scalar(&mut self) -> Result<Option<Value>> {
        self.execute(|handle, command| handle.execute_scalar(command))
    }

    fn execute<T, F>(&mut self, run: F) -> Result<T>
    where
        F: FnMut(&mut dyn NativeConnection, &NativeCommand) -> NativeResult<T>,
    {
        let connection = self.require_connection()?;
        let mut session = connection.session()?;
        session.execute_command(
            &mut self.command,
            self.transaction,
            Some(&self.cancellation),
            run,
        )
    }

    fn require_connection(&self) -> Result<ReliableConnection> {
        self.connection.clone().ok_or_else(|| {
            DbError::InvalidState("The command's connection property has not been initialized".into())
        })
    }
}

/// Clones get their own cancellation token and keep the connection and
/// transaction enlistment.
impl Clone for ReliableCommand {
    fn clone(&self) -> Self {
        Self {
            command: self.command.clone(),
            connection: self.connection.clone(),
            transaction: self.transaction,
            cancellation: CancellationToken::new(),
        }
    }
}

impl std::fmt::Debug for ReliableCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableCommand")
            .field("text", &self.command.text())
            .field("command_type", &self.command.command_type())
            .field("parameters", &self.command.parameters().len())
            .field("transaction", &self.transaction)
            .finish()
    }
}
