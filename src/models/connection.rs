//! Connection-related data models.
//!
//! This module defines the vocabulary shared by the mode resolver, the
//! connection strategies and the transaction scope.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Database products the coordinator knows how to classify.
///
/// Only products backed by an sqlx driver can actually be connected to; the
/// others are still classified so that mode resolution stays total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseProduct {
    PostgreSql,
    CockroachDb,
    MySql,
    MariaDb,
    SqlServer,
    /// SQL Server Express LocalDB: the instance unloads when the last connection closes.
    LocalDb,
    Oracle,
    Sqlite,
    DuckDb,
    Unknown,
}

/// Which sqlx driver serves a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    MySql,
    Postgres,
    SQLite,
}

impl DatabaseProduct {
    /// Parse the product from a connection string scheme.
    pub fn from_connection_string(connection_string: &str) -> Self {
        let lower = connection_string.trim().to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Self::PostgreSql
        } else if lower.starts_with("cockroachdb://") || lower.starts_with("cockroach://") {
            Self::CockroachDb
        } else if lower.starts_with("mysql://") {
            Self::MySql
        } else if lower.starts_with("mariadb://") {
            Self::MariaDb
        } else if lower.starts_with("sqlserver://") || lower.starts_with("mssql://") {
            if lower.contains("(localdb)") {
                Self::LocalDb
            } else {
                Self::SqlServer
            }
        } else if lower.starts_with("oracle://") {
            Self::Oracle
        } else if lower.starts_with("sqlite:") {
            Self::Sqlite
        } else if lower.starts_with("duckdb:") {
            Self::DuckDb
        } else {
            Self::Unknown
        }
    }

    /// Get the display name for this product.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSql => "PostgreSQL",
            Self::CockroachDb => "CockroachDB",
            Self::MySql => "MySQL",
            Self::MariaDb => "MariaDB",
            Self::SqlServer => "SQL Server",
            Self::LocalDb => "SQL Server LocalDB",
            Self::Oracle => "Oracle",
            Self::Sqlite => "SQLite",
            Self::DuckDb => "DuckDB",
            Self::Unknown => "Unknown",
        }
    }

    /// The sqlx driver that can open connections for this product.
    pub fn driver(&self) -> Option<DriverKind> {
        match self {
            Self::PostgreSql | Self::CockroachDb => Some(DriverKind::Postgres),
            Self::MySql | Self::MariaDb => Some(DriverKind::MySql),
            Self::Sqlite => Some(DriverKind::SQLite),
            Self::SqlServer | Self::LocalDb | Self::Oracle | Self::DuckDb | Self::Unknown => None,
        }
    }

    /// True for full network server products.
    pub fn is_network_server(&self) -> bool {
        matches!(
            self,
            Self::PostgreSql
                | Self::CockroachDb
                | Self::MySql
                | Self::MariaDb
                | Self::SqlServer
                | Self::Oracle
        )
    }

    /// True for single-file engines that run inside the calling process.
    pub fn is_embedded_file_engine(&self) -> bool {
        matches!(self, Self::Sqlite | Self::DuckDb)
    }
}

impl std::fmt::Display for DatabaseProduct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Physical connection-sharing strategy of a coordinator.
///
/// Immutable once the coordinator is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Fresh pooled connection per operation.
    Standard,
    /// Like `Standard`, plus one sentinel connection that keeps the engine resident.
    KeepAlive,
    /// One pinned writer; reads use fresh pooled connections.
    SingleWriter,
    /// Every operation shares one pinned connection.
    SingleConnection,
}

impl ConnectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::KeepAlive => "keep_alive",
            Self::SingleWriter => "single_writer",
            Self::SingleConnection => "single_connection",
        }
    }
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested mode. `Best` lets the resolver pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeRequest {
    #[default]
    Best,
    Standard,
    KeepAlive,
    SingleWriter,
    SingleConnection,
}

impl ModeRequest {
    /// The concrete mode named by this request, `None` for `Best`.
    pub fn as_mode(&self) -> Option<ConnectionMode> {
        match self {
            Self::Best => None,
            Self::Standard => Some(ConnectionMode::Standard),
            Self::KeepAlive => Some(ConnectionMode::KeepAlive),
            Self::SingleWriter => Some(ConnectionMode::SingleWriter),
            Self::SingleConnection => Some(ConnectionMode::SingleConnection),
        }
    }

    /// True if the request names exactly `mode`.
    pub fn is(&self, mode: ConnectionMode) -> bool {
        self.as_mode() == Some(mode)
    }
}

impl From<ConnectionMode> for ModeRequest {
    fn from(mode: ConnectionMode) -> Self {
        match mode {
            ConnectionMode::Standard => Self::Standard,
            ConnectionMode::KeepAlive => Self::KeepAlive,
            ConnectionMode::SingleWriter => Self::SingleWriter,
            ConnectionMode::SingleConnection => Self::SingleConnection,
        }
    }
}

impl std::fmt::Display for ModeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.as_mode() {
            Some(mode) => write!(f, "{}", mode),
            None => f.write_str("best"),
        }
    }
}

impl FromStr for ModeRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "best" | "auto" => Ok(Self::Best),
            "standard" => Ok(Self::Standard),
            "keep_alive" | "keepalive" => Ok(Self::KeepAlive),
            "single_writer" | "singlewriter" => Ok(Self::SingleWriter),
            "single_connection" | "singleconnection" => Ok(Self::SingleConnection),
            other => Err(format!(
                "Unknown connection mode '{}'. Expected best, standard, keep_alive, single_writer or single_connection",
                other
            )),
        }
    }
}

/// Whether an operation reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    Read,
    Write,
}

impl std::fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Lifetime class of a tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    /// Created, used and released within one call.
    Ephemeral,
    /// Opened at coordinator construction, released at coordinator close.
    Pinned,
}

/// Synchronization attached to a tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    /// Zero-cost placeholder; the connection has a single owner.
    None,
    /// A mutex serializing every caller of a shared connection.
    Real,
}

impl ConnectionRole {
    /// Pinned connections are reachable from several callers and need a real lock.
    pub fn lock_kind(&self) -> LockKind {
        match self {
            Self::Ephemeral => LockKind::None,
            Self::Pinned => LockKind::Real,
        }
    }
}

/// Transaction state for a transaction scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TransactionState {
    Active = 0,
    Committed = 1,
    RolledBack = 2,
    Disposed = 3,
}

impl TransactionState {
    /// Decode a state stored in an atomic.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Committed,
            2 => Self::RolledBack,
            _ => Self::Disposed,
        }
    }

    /// Check if the transaction is still active.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if the transaction has ended (committed, rolled back, or disposed).
    pub fn is_ended(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Committed => f.write_str("committed"),
            Self::RolledBack => f.write_str("rolled_back"),
            Self::Disposed => f.write_str("disposed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_from_connection_string() {
        assert_eq!(
            DatabaseProduct::from_connection_string("postgres://localhost/db"),
            DatabaseProduct::PostgreSql
        );
        assert_eq!(
            DatabaseProduct::from_connection_string("postgresql://localhost/db"),
            DatabaseProduct::PostgreSql
        );
        assert_eq!(
            DatabaseProduct::from_connection_string("mysql://localhost/db"),
            DatabaseProduct::MySql
        );
        assert_eq!(
            DatabaseProduct::from_connection_string("mariadb://localhost/db"),
            DatabaseProduct::MariaDb
        );
        assert_eq!(
            DatabaseProduct::from_connection_string("sqlite:test.db"),
            DatabaseProduct::Sqlite
        );
        assert_eq!(
            DatabaseProduct::from_connection_string("sqlite::memory:"),
            DatabaseProduct::Sqlite
        );
        assert_eq!(
            DatabaseProduct::from_connection_string("mssql://(localdb)\\MSSQLLocalDB/app"),
            DatabaseProduct::LocalDb
        );
        assert_eq!(
            DatabaseProduct::from_connection_string("sqlserver://db.internal/app"),
            DatabaseProduct::SqlServer
        );
        assert_eq!(
            DatabaseProduct::from_connection_string("unknown://localhost"),
            DatabaseProduct::Unknown
        );
    }

    #[test]
    fn test_product_driver() {
        assert_eq!(DatabaseProduct::CockroachDb.driver(), Some(DriverKind::Postgres));
        assert_eq!(DatabaseProduct::MariaDb.driver(), Some(DriverKind::MySql));
        assert_eq!(DatabaseProduct::Sqlite.driver(), Some(DriverKind::SQLite));
        assert_eq!(DatabaseProduct::Oracle.driver(), None);
        assert_eq!(DatabaseProduct::Unknown.driver(), None);
    }

    #[test]
    fn test_mode_request_parse() {
        assert_eq!("best".parse::<ModeRequest>().unwrap(), ModeRequest::Best);
        assert_eq!(
            "single-writer".parse::<ModeRequest>().unwrap(),
            ModeRequest::SingleWriter
        );
        assert_eq!(
            "KeepAlive".parse::<ModeRequest>().unwrap(),
            ModeRequest::KeepAlive
        );
        assert!("pooled".parse::<ModeRequest>().is_err());
    }

    #[test]
    fn test_mode_request_display() {
        assert_eq!(ModeRequest::Best.to_string(), "best");
        assert_eq!(ModeRequest::SingleConnection.to_string(), "single_connection");
    }

    #[test]
    fn test_lock_kind_follows_role() {
        assert_eq!(ConnectionRole::Ephemeral.lock_kind(), LockKind::None);
        assert_eq!(ConnectionRole::Pinned.lock_kind(), LockKind::Real);
    }

    #[test]
    fn test_transaction_state() {
        assert!(TransactionState::Active.is_active());
        assert!(!TransactionState::Committed.is_active());
        assert!(TransactionState::Committed.is_ended());
        for state in [
            TransactionState::Active,
            TransactionState::Committed,
            TransactionState::RolledBack,
            TransactionState::Disposed,
        ] {
            assert_eq!(TransactionState::from_u8(state as u8), state);
        }
    }
}
