pub mod error;
pub mod types;
pub mod value;

pub use error::{DbError, Result};
pub use types::{
    CommandBehavior, CommandType, ConnectionState, DEFAULT_COMMAND_TIMEOUT, HandleId,
    IsolationLevel, Parameter, ParameterCollection, ParameterDirection, Row, StateChange,
    TransactionId, UpdateRowSource,
};
pub use value::Value;
