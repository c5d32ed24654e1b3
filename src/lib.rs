//! Database connection coordinator.
//!
//! Given one database target, the coordinator decides per operation whether a
//! fresh pooled connection or a long-lived pinned one serves it, and keeps
//! concurrent callers from corrupting shared connection and transaction state
//! (SQLite, PostgreSQL, MySQL).

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, CoordinatorConfig, PoolOptions};
pub use db::{ConnectionCoordinator, StatementContainer, TransactionScope};
pub use error::{DbError, DbResult};
