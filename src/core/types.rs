use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::Value;

pub type Row = Vec<Value>;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one physical connection created by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl HandleId {
    /// Generate a new process-unique handle id
    pub fn next() -> Self {
        HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// Identity of one native transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn next() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Connection state as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Executing,
    Fetching,
    Broken,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open | Self::Executing | Self::Fetching)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "Closed",
            Self::Connecting => "Connecting",
            Self::Open => "Open",
            Self::Executing => "Executing",
            Self::Fetching => "Fetching",
            Self::Broken => "Broken",
        };
        f.write_str(name)
    }
}

/// Payload of a state-change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub original: ConnectionState,
    pub current: ConnectionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    Unspecified,
    Chaos,
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandType {
    #[default]
    Text,
    StoredProcedure,
    TableDirect,
}

/// Hints passed through to `execute_reader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandBehavior {
    #[default]
    Default,
    SingleResult,
    SchemaOnly,
    KeyInfo,
    SingleRow,
    SequentialAccess,
    CloseConnection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateRowSource {
    None,
    OutputParameters,
    FirstReturnedRecord,
    #[default]
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterDirection {
    #[default]
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

/// A named command parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: Value,
    pub direction: ParameterDirection,
    pub size: Option<usize>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            direction: ParameterDirection::Input,
            size: None,
        }
    }

    pub fn direction(mut self, direction: ParameterDirection) -> Self {
        self.direction = direction;
        self
    }
}

/// Ordered parameter list; names are matched case-insensitively.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterCollection {
    items: Vec<Parameter>,
}

impl ParameterCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter, replacing any existing one with the same name
    pub fn add(&mut self, parameter: Parameter) {
        match self.position(&parameter.name) {
            Some(index) => self.items[index] = parameter,
            None => self.items.push(parameter),
        }
    }

    pub fn add_with_value(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.add(Parameter::new(name, value));
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.position(name).map(|i| &self.items[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.position(name).map(move |i| &mut self.items[i])
    }

    pub fn remove(&mut self, name: &str) -> Option<Parameter> {
        self.position(name).map(|i| self.items.remove(i))
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.items.iter()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.items
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name))
    }
}

/// Default command timeout used by drivers when none is configured.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_collection_replaces_by_name() {
        let mut params = ParameterCollection::new();
        params.add_with_value("@id", 1);
        params.add_with_value("@ID", 2);

        assert_eq!(params.len(), 1);
        assert_eq!(params.get("@id").unwrap().value, Value::Integer(2));
    }

    #[test]
    fn test_connection_state_open_family() {
        assert!(ConnectionState::Executing.is_open());
        assert!(!ConnectionState::Broken.is_open());
        assert!(!ConnectionState::Connecting.is_open());
    }
}
