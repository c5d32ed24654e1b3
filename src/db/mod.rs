//! Database coordination layer.
//!
//! This module provides:
//! - Dialect facts and product detection (`dialect`)
//! - Mode resolution (`mode`) and isolation resolution (`isolation`)
//! - Physical connectivity over sqlx (`pool`, `executor`, `params`, `row`)
//! - Tracked connections, leases and the four strategies (`tracked`, `strategy`)
//! - Leased readers, transaction scopes and statement containers
//! - The coordinator façade and its lock-free metrics

pub mod coordinator;
pub mod dialect;
pub mod executor;
pub mod isolation;
#[macro_use]
pub mod macros;
pub mod metrics;
pub mod mode;
pub mod params;
pub mod pool;
pub mod reader;
pub mod row;
pub mod statement;
pub mod strategy;
pub mod tracked;
pub mod transaction;

pub use coordinator::ConnectionCoordinator;
pub use dialect::{ConnectionShape, Dialect, ProductIdentity, Storage};
pub use executor::DbConnection;
pub use isolation::{
    IsolationCapabilities, IsolationLevel, IsolationProfile, IsolationResolver, ResolvedIsolation,
};
pub use metrics::{ConnectionMetrics, MetricsSnapshot};
pub use mode::{CoercionReason, MismatchReason, ModeResolution, ResolutionOutcome};
pub use pool::DbPool;
pub use reader::{LeasedReader, ReaderState};
pub use row::DbRow;
pub use statement::StatementContainer;
pub use strategy::ConnectionStrategy;
pub use tracked::{CancelSignal, ConnectionLease, LockHandle, TrackedConnection};
pub use transaction::TransactionScope;
