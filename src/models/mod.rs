//! Data models for the connection coordinator.

pub mod connection;
pub mod query;

pub use connection::{
    ConnectionMode, ConnectionRole, DatabaseProduct, DriverKind, ExecutionKind, LockKind,
    ModeRequest, TransactionState,
};
pub use query::{MAX_QUERY_TIMEOUT_SECS, QueryParam};
