use std::fmt;

use thiserror::Error;

/// One entry of a driver error collection, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub number: i32,
    pub class: u8,
    pub state: u8,
    pub server: String,
    pub procedure: String,
    pub line: u32,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(number: i32, message: impl Into<String>) -> Self {
        Self {
            number,
            class: 16,
            state: 1,
            server: String::new(),
            procedure: String::new(),
            line: 0,
            message: message.into(),
        }
    }

    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = server.into();
        self
    }

    pub fn class(mut self, class: u8) -> Self {
        self.class = class;
        self
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Msg {}, Level {}, State {}: {}", self.number, self.class, self.state, self.message)
    }
}

/// Error raised by a native driver: a message plus the server's error
/// collection. The reliable layer classifies it by the record numbers and
/// otherwise hands it back to callers untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct NativeError {
    message: String,
    errors: Vec<ErrorRecord>,
}

impl NativeError {
    /// Build an error from a record collection; the message is taken from
    /// the records, one per line.
    pub fn new(errors: Vec<ErrorRecord>) -> Self {
        let message = errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Self { message, errors }
    }

    pub fn single(number: i32, message: impl Into<String>) -> Self {
        Self::new(vec![ErrorRecord::new(number, message)])
    }

    /// Number of the first record, `0` when the collection is empty.
    pub fn number(&self) -> i32 {
        self.errors.first().map(|e| e.number).unwrap_or(0)
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn has_number(&self, number: i32) -> bool {
        self.errors.iter().any(|e| e.number == number)
    }
}

pub type NativeResult<T> = std::result::Result<T, NativeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_joins_records() {
        let err = NativeError::new(vec![
            ErrorRecord::new(40501, "The service is currently busy."),
            ErrorRecord::new(3621, "The statement has been terminated."),
        ]);

        assert_eq!(err.number(), 40501);
        assert!(err.has_number(3621));
        assert_eq!(
            err.to_string(),
            "The service is currently busy.\nThe statement has been terminated."
        );
    }

    #[test]
    fn test_empty_collection_reports_zero() {
        let err = NativeError::new(Vec::new());
        assert_eq!(err.number(), 0);
    }
}
