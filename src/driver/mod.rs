// ============================================================================
// Native Driver Contract
// ============================================================================
//
// The reliable layer never talks to a server itself. It drives a native
// driver through the traits below and owns the physical connections the
// driver hands out. A driver implementation decides how commands travel on
// the wire; this module only fixes the capability set.
//
// ============================================================================

pub mod error;
#[cfg(any(test, feature = "simulated"))]
pub mod simulated;

use std::time::Duration;

use crate::core::{
    CommandBehavior, CommandType, ConnectionState, DEFAULT_COMMAND_TIMEOUT, HandleId,
    IsolationLevel, ParameterCollection, TransactionId, UpdateRowSource, Value,
};
use crate::result::QueryResult;

pub use error::{ErrorRecord, NativeError, NativeResult};

/// Entry point of a native driver.
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Create a physical connection for `connection_string`. The returned
    /// handle is closed; the caller opens it.
    fn create_connection(&self, connection_string: &str) -> NativeResult<Box<dyn NativeConnection>>;

    /// Database-level services used by mapping layers, if the driver has any.
    fn provider_services(&self) -> Option<&dyn NativeProviderServices> {
        None
    }
}

/// One physical session with the server.
///
/// Dropping a handle must release it back to the driver.
pub trait NativeConnection: Send {
    fn handle_id(&self) -> HandleId;

    fn open(&mut self) -> NativeResult<()>;

    fn close(&mut self) -> NativeResult<()>;

    fn state(&self) -> ConnectionState;

    fn database(&self) -> String;

    fn data_source(&self) -> String;

    fn server_version(&self) -> NativeResult<String>;

    fn change_database(&mut self, database: &str) -> NativeResult<()>;

    fn begin_transaction(
        &mut self,
        isolation_level: IsolationLevel,
    ) -> NativeResult<Box<dyn NativeTransaction>>;

    /// Schema introspection. `None` lists the available collections.
    fn get_schema(
        &mut self,
        collection: Option<&str>,
        restrictions: &[Option<String>],
    ) -> NativeResult<QueryResult>;

    fn execute_reader(
        &mut self,
        command: &NativeCommand,
        behavior: CommandBehavior,
    ) -> NativeResult<QueryResult>;

    fn execute_non_query(&mut self, command: &NativeCommand) -> NativeResult<u64>;

    fn execute_scalar(&mut self, command: &NativeCommand) -> NativeResult<Option<Value>>;

    fn prepare(&mut self, command: &NativeCommand) -> NativeResult<()>;
}

/// A transaction started on a physical connection.
pub trait NativeTransaction: Send {
    fn id(&self) -> TransactionId;

    fn isolation_level(&self) -> IsolationLevel;

    fn commit(&mut self) -> NativeResult<()>;

    fn rollback(&mut self) -> NativeResult<()>;
}

/// Database-level operations a mapping layer performs through a connection.
pub trait NativeProviderServices: Send + Sync {
    fn manifest_token(&self, connection: &mut dyn NativeConnection) -> NativeResult<String>;

    fn database_exists(
        &self,
        connection: &mut dyn NativeConnection,
        database: &str,
    ) -> NativeResult<bool>;

    fn create_database(
        &self,
        connection: &mut dyn NativeConnection,
        database: &str,
    ) -> NativeResult<()>;

    fn delete_database(
        &self,
        connection: &mut dyn NativeConnection,
        database: &str,
    ) -> NativeResult<()>;
}

/// The driver's command object.
///
/// A command is bound to at most one physical connection (and optionally
/// one transaction on it). Drivers refuse to execute a command on a
/// connection it is not bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeCommand {
    text: String,
    command_type: CommandType,
    timeout: Duration,
    parameters: ParameterCollection,
    updated_row_source: UpdateRowSource,
    design_time_visible: bool,
    connection: Option<HandleId>,
    transaction: Option<TransactionId>,
}

impl NativeCommand {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            command_type: CommandType::Text,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            parameters: ParameterCollection::new(),
            updated_row_source: UpdateRowSource::Both,
            design_time_visible: true,
            connection: None,
            transaction: None,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    pub fn set_command_type(&mut self, command_type: CommandType) {
        self.command_type = command_type;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn parameters(&self) -> &ParameterCollection {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut ParameterCollection {
        &mut self.parameters
    }

    pub fn updated_row_source(&self) -> UpdateRowSource {
        self.updated_row_source
    }

    pub fn set_updated_row_source(&mut self, source: UpdateRowSource) {
        self.updated_row_source = source;
    }

    pub fn design_time_visible(&self) -> bool {
        self.design_time_visible
    }

    pub fn set_design_time_visible(&mut self, visible: bool) {
        self.design_time_visible = visible;
    }

    pub fn connection(&self) -> Option<HandleId> {
        self.connection
    }

    pub fn transaction(&self) -> Option<TransactionId> {
        self.transaction
    }

    /// Point the command at a physical connection and transaction.
    pub fn bind(&mut self, connection: HandleId, transaction: Option<TransactionId>) {
        self.connection = Some(connection);
        self.transaction = transaction;
    }

    pub fn set_transaction(&mut self, transaction: Option<TransactionId>) {
        self.transaction = transaction;
    }

    pub fn unbind(&mut self) {
        self.connection = None;
        self.transaction = None;
    }
}

impl Default for NativeCommand {
    fn default() -> Self {
        Self::new("")
    }
}
