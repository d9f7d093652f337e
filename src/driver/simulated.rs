//! An in-process driver with a scriptable server.
//!
//! `SimulatedDriver` behaves like a network driver whose server can be
//! paused, can sever live sessions, and can be told to fail the next
//! operations with chosen error numbers. It records every command it runs
//! and counts live physical handles, which makes reconnect and retry
//! behavior observable without a real database.
//!
//! ```
//! use reliabledb::driver::simulated::{Operation, SimulatedDriver};
//!
//! let driver = SimulatedDriver::new("sim01");
//! let server = driver.server();
//! server.fail_next(Operation::Execute, 40501, 2);
//! server.pause();
//! server.resume();
//! assert_eq!(server.live_connections(), 0);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::connection::ConnectionSettings;
use crate::core::{
    CommandBehavior, ConnectionState, HandleId, IsolationLevel, TransactionId, Value,
};
use crate::result::QueryResult;

use super::{
    Driver, ErrorRecord, NativeCommand, NativeConnection, NativeError, NativeProviderServices,
    NativeResult, NativeTransaction,
};

/// Error number used when a handle is used after the server dropped it.
pub const TRANSPORT_ERROR: i32 = 10054;
/// Error number used by a paused server that refuses logins.
pub const DATABASE_UNAVAILABLE: i32 = 40613;
/// Error number for requests the simulated server does not understand.
pub const GENERAL_ERROR: i32 = 50000;

const SERVER_VERSION: &str = "15.00.2000";

/// Operation a scripted fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Open,
    Execute,
    BeginTransaction,
    Commit,
    Schema,
}

/// A scripted failure.
#[derive(Debug, Clone)]
pub struct Fault {
    pub operation: Operation,
    pub error: NativeError,
    /// Whether the failing handle is left broken
    pub breaks_connection: bool,
}

impl Fault {
    pub fn new(operation: Operation, number: i32) -> Self {
        Self {
            operation,
            error: NativeError::single(number, format!("Simulated failure {}", number)),
            breaks_connection: false,
        }
    }

    pub fn with_error(operation: Operation, error: NativeError) -> Self {
        Self {
            operation,
            error,
            breaks_connection: false,
        }
    }

    pub fn breaking(mut self) -> Self {
        self.breaks_connection = true;
        self
    }
}

/// Canned answer for a command text.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Rows(QueryResult),
    Scalar(Value),
    Affected(u64),
}

/// One command the server ran.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub text: String,
    pub handle: HandleId,
    pub transaction: Option<TransactionId>,
}

#[derive(Debug)]
struct HandleState {
    state: ConnectionState,
    database: String,
    live: bool,
    transaction: Option<TransactionId>,
}

#[derive(Debug, Default)]
struct TransactionState {
    handle: Option<HandleId>,
    pending: Vec<String>,
}

#[derive(Debug)]
struct ServerState {
    name: String,
    paused: bool,
    pause_error: i32,
    faults: VecDeque<Fault>,
    responses: HashMap<String, Response>,
    handles: HashMap<HandleId, HandleState>,
    transactions: HashMap<TransactionId, TransactionState>,
    databases: HashSet<String>,
    log: Vec<ExecutionRecord>,
    committed: Vec<String>,
    open_attempts: usize,
    connections_created: usize,
}

impl ServerState {
    fn take_fault(&mut self, operation: Operation) -> Option<Fault> {
        let index = self.faults.iter().position(|f| f.operation == operation)?;
        self.faults.remove(index)
    }

    fn handle(&mut self, id: HandleId) -> NativeResult<&mut HandleState> {
        self.handles
            .get_mut(&id)
            .ok_or_else(|| NativeError::single(GENERAL_ERROR, format!("Unknown connection {}", id)))
    }

    /// Fail unless `id` is open; a handle severed by the server surfaces a
    /// transport error and stays broken.
    fn ensure_open(&mut self, id: HandleId) -> NativeResult<()> {
        let handle = self.handle(id)?;
        match handle.state {
            ConnectionState::Broken => Err(transport_error()),
            state if state.is_open() => Ok(()),
            _ => Err(NativeError::new(vec![
                ErrorRecord::new(0, "Invalid operation. The connection is closed.").class(20),
            ])),
        }
    }

    fn apply_fault(&mut self, id: HandleId, operation: Operation) -> NativeResult<()> {
        if self.paused {
            self.break_handle(id);
            return Err(transport_error());
        }
        if let Some(fault) = self.take_fault(operation) {
            if fault.breaks_connection {
                self.break_handle(id);
            }
            return Err(fault.error);
        }
        Ok(())
    }

    fn break_handle(&mut self, id: HandleId) {
        if let Some(handle) = self.handles.get_mut(&id) {
            if handle.state.is_open() {
                handle.state = ConnectionState::Broken;
            }
            if let Some(txn) = handle.transaction.take() {
                self.transactions.remove(&txn);
            }
        }
    }

    fn release(&mut self, id: HandleId) {
        if let Some(handle) = self.handles.get_mut(&id) {
            handle.live = false;
            handle.state = ConnectionState::Closed;
            if let Some(txn) = handle.transaction.take() {
                self.transactions.remove(&txn);
            }
        }
    }

    fn run(&mut self, id: HandleId, command: &NativeCommand) -> NativeResult<Option<Response>> {
        self.ensure_open(id)?;

        if command.connection() != Some(id) {
            return Err(NativeError::single(
                0,
                "ExecuteReader: Connection property has not been initialized.",
            ));
        }

        let active = self.handle(id)?.transaction;
        if active.is_some() && command.transaction() != active {
            return Err(NativeError::single(
                0,
                "ExecuteReader requires the command to have a transaction when the connection \
                 assigned to the command is in a pending local transaction.",
            ));
        }

        self.apply_fault(id, Operation::Execute)?;

        let text = command.text().to_string();
        self.log.push(ExecutionRecord {
            text: text.clone(),
            handle: id,
            transaction: active,
        });
        match active.and_then(|txn| self.transactions.get_mut(&txn)) {
            Some(txn) => txn.pending.push(text.clone()),
            None => self.committed.push(text.clone()),
        }

        if let Some(name) = database_name(&text, "CREATE DATABASE ") {
            self.databases.insert(name);
        } else if let Some(name) = database_name(&text, "DROP DATABASE ") {
            self.databases.remove(&name);
        }

        Ok(self.responses.get(&text).cloned())
    }
}

fn database_name(text: &str, prefix: &str) -> Option<String> {
    let rest = text.strip_prefix(prefix)?;
    Some(rest.trim_matches(|c| c == '[' || c == ']').to_string())
}

fn transport_error() -> NativeError {
    NativeError::new(vec![
        ErrorRecord::new(
            TRANSPORT_ERROR,
            "A transport-level error has occurred when sending the request to the server.",
        )
        .class(20),
    ])
}

/// Handle to the simulated server shared by a driver and its connections.
#[derive(Debug, Clone)]
pub struct SimulatedServer {
    inner: Arc<Mutex<ServerState>>,
}

impl SimulatedServer {
    fn new(name: &str) -> Self {
        let mut databases = HashSet::new();
        databases.insert("master".to_string());

        Self {
            inner: Arc::new(Mutex::new(ServerState {
                name: name.to_string(),
                paused: false,
                pause_error: DATABASE_UNAVAILABLE,
                faults: VecDeque::new(),
                responses: HashMap::new(),
                handles: HashMap::new(),
                transactions: HashMap::new(),
                databases,
                log: Vec::new(),
                committed: Vec::new(),
                open_attempts: 0,
                connections_created: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        // A panicking test thread must not take the whole server down with it
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a fault; faults for one operation fire in insertion order.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    /// Fail the next `times` occurrences of `operation` with `number`.
    pub fn fail_next(&self, operation: Operation, number: i32, times: usize) {
        let mut state = self.lock();
        for _ in 0..times {
            state.faults.push_back(Fault::new(operation, number));
        }
    }

    pub fn pending_faults(&self) -> usize {
        self.lock().faults.len()
    }

    /// Stop accepting logins and sever every open session.
    pub fn pause(&self) {
        let mut state = self.lock();
        state.paused = true;
        let open: Vec<HandleId> = state
            .handles
            .iter()
            .filter(|(_, h)| h.state.is_open())
            .map(|(id, _)| *id)
            .collect();
        for id in open {
            state.break_handle(id);
        }
    }

    /// Error number reported to logins while paused.
    pub fn set_pause_error(&self, number: i32) {
        self.lock().pause_error = number;
    }

    pub fn resume(&self) {
        self.lock().paused = false;
    }

    /// Drop every open session without pausing the server.
    pub fn sever_connections(&self) {
        let mut state = self.lock();
        let open: Vec<HandleId> = state
            .handles
            .iter()
            .filter(|(_, h)| h.state.is_open())
            .map(|(id, _)| *id)
            .collect();
        for id in open {
            state.break_handle(id);
        }
    }

    pub fn respond(&self, text: impl Into<String>, response: Response) {
        self.lock().responses.insert(text.into(), response);
    }

    pub fn add_database(&self, name: &str) {
        self.lock().databases.insert(name.to_string());
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.lock().databases.contains(name)
    }

    /// Every command run, committed or not.
    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.lock().log.clone()
    }

    pub fn execution_count(&self, text: &str) -> usize {
        self.lock().log.iter().filter(|r| r.text == text).count()
    }

    /// Commands whose effects are durable: run outside a transaction or
    /// in one that committed.
    pub fn committed(&self) -> Vec<String> {
        self.lock().committed.clone()
    }

    /// Physical handles created and not yet released.
    pub fn live_connections(&self) -> usize {
        self.lock().handles.values().filter(|h| h.live).count()
    }

    pub fn connections_created(&self) -> usize {
        self.lock().connections_created
    }

    pub fn open_attempts(&self) -> usize {
        self.lock().open_attempts
    }

    pub fn active_transactions(&self) -> usize {
        self.lock().transactions.len()
    }
}

/// Driver over a [`SimulatedServer`].
#[derive(Debug, Clone)]
pub struct SimulatedDriver {
    server: SimulatedServer,
}

impl SimulatedDriver {
    pub fn new(server_name: &str) -> Self {
        Self {
            server: SimulatedServer::new(server_name),
        }
    }

    pub fn server(&self) -> SimulatedServer {
        self.server.clone()
    }
}

impl Driver for SimulatedDriver {
    fn name(&self) -> &str {
        "simulated"
    }

    fn create_connection(&self, connection_string: &str) -> NativeResult<Box<dyn NativeConnection>> {
        let settings = ConnectionSettings::parse(connection_string)
            .map_err(|e| NativeError::single(0, e.to_string()))?;

        let id = HandleId::next();
        let database = if settings.database.is_empty() {
            "master".to_string()
        } else {
            settings.database.clone()
        };

        let mut state = self.server.lock();
        state.connections_created += 1;
        state.handles.insert(
            id,
            HandleState {
                state: ConnectionState::Closed,
                database,
                live: true,
                transaction: None,
            },
        );

        Ok(Box::new(SimulatedConnection {
            id,
            data_source: settings.data_source,
            server: self.server.clone(),
        }))
    }

    fn provider_services(&self) -> Option<&dyn NativeProviderServices> {
        Some(&SimulatedServices)
    }
}

/// Physical handle of the simulated driver.
#[derive(Debug)]
pub struct SimulatedConnection {
    id: HandleId,
    data_source: String,
    server: SimulatedServer,
}

impl NativeConnection for SimulatedConnection {
    fn handle_id(&self) -> HandleId {
        self.id
    }

    fn open(&mut self) -> NativeResult<()> {
        let mut state = self.server.lock();
        state.open_attempts += 1;

        if state.handle(self.id)?.state != ConnectionState::Closed {
            return Err(NativeError::single(0, "The connection was not closed."));
        }
        if state.paused {
            let number = state.pause_error;
            let server = state.name.clone();
            return Err(NativeError::new(vec![
                ErrorRecord::new(number, "Database is not currently available.").server(server),
            ]));
        }
        if let Some(fault) = state.take_fault(Operation::Open) {
            return Err(fault.error);
        }

        state.handle(self.id)?.state = ConnectionState::Open;
        Ok(())
    }

    fn close(&mut self) -> NativeResult<()> {
        let mut state = self.server.lock();
        state.release(self.id);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        let mut state = self.server.lock();
        state
            .handle(self.id)
            .map(|h| h.state)
            .unwrap_or(ConnectionState::Closed)
    }

    fn database(&self) -> String {
        let mut state = self.server.lock();
        state
            .handle(self.id)
            .map(|h| h.database.clone())
            .unwrap_or_default()
    }

    fn data_source(&self) -> String {
        self.data_source.clone()
    }

    fn server_version(&self) -> NativeResult<String> {
        let mut state = self.server.lock();
        state.ensure_open(self.id)?;
        Ok(SERVER_VERSION.to_string())
    }

    fn change_database(&mut self, database: &str) -> NativeResult<()> {
        let mut state = self.server.lock();
        state.ensure_open(self.id)?;
        if !state.databases.contains(database) {
            return Err(NativeError::single(
                911,
                format!("Database '{}' does not exist.", database),
            ));
        }
        state.handle(self.id)?.database = database.to_string();
        Ok(())
    }

    fn begin_transaction(
        &mut self,
        isolation_level: IsolationLevel,
    ) -> NativeResult<Box<dyn NativeTransaction>> {
        let mut state = self.server.lock();
        state.ensure_open(self.id)?;
        if state.handle(self.id)?.transaction.is_some() {
            return Err(NativeError::single(
                0,
                "SqlConnection does not support parallel transactions.",
            ));
        }
        state.apply_fault(self.id, Operation::BeginTransaction)?;

        let id = TransactionId::next();
        state.handle(self.id)?.transaction = Some(id);
        state.transactions.insert(
            id,
            TransactionState {
                handle: Some(self.id),
                pending: Vec::new(),
            },
        );

        Ok(Box::new(SimulatedTransaction {
            id,
            handle: self.id,
            isolation_level,
            server: self.server.clone(),
        }))
    }

    fn get_schema(
        &mut self,
        collection: Option<&str>,
        _restrictions: &[Option<String>],
    ) -> NativeResult<QueryResult> {
        let mut state = self.server.lock();
        state.ensure_open(self.id)?;
        state.apply_fault(self.id, Operation::Schema)?;

        match collection {
            None => Ok(QueryResult::new(
                vec!["CollectionName".into()],
                ["MetaDataCollections", "Databases"]
                    .iter()
                    .map(|name| vec![Value::from(*name)])
                    .collect(),
            )),
            Some(name) if name.eq_ignore_ascii_case("Databases") => {
                let mut names: Vec<&String> = state.databases.iter().collect();
                names.sort();
                Ok(QueryResult::new(
                    vec!["database_name".into()],
                    names.into_iter().map(|n| vec![Value::from(n.as_str())]).collect(),
                ))
            }
            Some(name) => Err(NativeError::single(
                0,
                format!("The requested collection ({}) is not defined.", name),
            )),
        }
    }

    fn execute_reader(
        &mut self,
        command: &NativeCommand,
        _behavior: CommandBehavior,
    ) -> NativeResult<QueryResult> {
        let mut state = self.server.lock();
        Ok(match state.run(self.id, command)? {
            Some(Response::Rows(rows)) => rows,
            Some(Response::Scalar(value)) => QueryResult::new(vec!["".into()], vec![vec![value]]),
            Some(Response::Affected(_)) | None => QueryResult::empty(),
        })
    }

    fn execute_non_query(&mut self, command: &NativeCommand) -> NativeResult<u64> {
        let mut state = self.server.lock();
        Ok(match state.run(self.id, command)? {
            Some(Response::Affected(n)) => n,
            Some(Response::Rows(rows)) => rows.row_count() as u64,
            Some(Response::Scalar(_)) | None => 0,
        })
    }

    fn execute_scalar(&mut self, command: &NativeCommand) -> NativeResult<Option<Value>> {
        let mut state = self.server.lock();
        Ok(match state.run(self.id, command)? {
            Some(Response::Scalar(value)) => Some(value),
            Some(Response::Rows(rows)) => rows.first_value().cloned(),
            Some(Response::Affected(_)) | None => None,
        })
    }

    fn prepare(&mut self, command: &NativeCommand) -> NativeResult<()> {
        let mut state = self.server.lock();
        state.ensure_open(self.id)?;
        if command.connection() != Some(self.id) {
            return Err(NativeError::single(
                0,
                "Prepare: Connection property has not been initialized.",
            ));
        }
        Ok(())
    }
}

impl Drop for SimulatedConnection {
    fn drop(&mut self) {
        self.server.lock().release(self.id);
    }
}

#[derive(Debug)]
struct SimulatedTransaction {
    id: TransactionId,
    handle: HandleId,
    isolation_level: IsolationLevel,
    server: SimulatedServer,
}

impl SimulatedTransaction {
    fn finish(&self, commit: bool) -> NativeResult<()> {
        let mut state = self.server.lock();
        state.ensure_open(self.handle)?;
        if commit {
            state.apply_fault(self.handle, Operation::Commit)?;
        }

        let txn = state.transactions.remove(&self.id).ok_or_else(|| {
            NativeError::single(
                0,
                "This SqlTransaction has completed; it is no longer usable.",
            )
        })?;
        if let Some(handle) = txn.handle.and_then(|h| state.handles.get_mut(&h)) {
            handle.transaction = None;
        }
        if commit {
            state.committed.extend(txn.pending);
        }
        Ok(())
    }
}

impl NativeTransaction for SimulatedTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    fn commit(&mut self) -> NativeResult<()> {
        self.finish(true)
    }

    fn rollback(&mut self) -> NativeResult<()> {
        self.finish(false)
    }
}

#[derive(Debug)]
struct SimulatedServices;

impl NativeProviderServices for SimulatedServices {
    fn manifest_token(&self, connection: &mut dyn NativeConnection) -> NativeResult<String> {
        let version = connection.server_version()?;
        Ok(if version.starts_with("15.") { "2019" } else { "2008" }.to_string())
    }

    fn database_exists(
        &self,
        connection: &mut dyn NativeConnection,
        database: &str,
    ) -> NativeResult<bool> {
        let databases = connection.get_schema(Some("Databases"), &[])?;
        Ok(databases
            .rows
            .iter()
            .any(|row| row.first().and_then(Value::as_str) == Some(database)))
    }

    fn create_database(
        &self,
        connection: &mut dyn NativeConnection,
        database: &str,
    ) -> NativeResult<()> {
        let mut command = NativeCommand::new(format!("CREATE DATABASE [{}]", database));
        command.bind(connection.handle_id(), None);
        connection.execute_non_query(&command)?;
        Ok(())
    }

    fn delete_database(
        &self,
        connection: &mut dyn NativeConnection,
        database: &str,
    ) -> NativeResult<()> {
        let mut command = NativeCommand::new(format!("DROP DATABASE [{}]", database));
        command.bind(connection.handle_id(), None);
        connection.execute_non_query(&command)?;
        Ok(())
    }
}
