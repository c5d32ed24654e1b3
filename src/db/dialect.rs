//! Per-product dialect knowledge consumed by the coordinator.
//!
//! Everything here is static or derived from the connection string, except
//! [`detect_product`], which runs a version query on an already open connection.

use crate::db::executor::DbConnection;
use crate::db::isolation::IsolationLevel;
use crate::error::DbResult;
use crate::models::{DatabaseProduct, DriverKind, ExecutionKind};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Lowest common parameter limit, used when the product is not known.
pub const SQL92_MAX_PARAMETERS: usize = 255;

const DETECT_TIMEOUT: Duration = Duration::from_secs(10);

/// What the coordinator knows about the database it talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductIdentity {
    pub product: DatabaseProduct,
    /// Raw version banner, when detection succeeded.
    pub version: Option<String>,
}

impl ProductIdentity {
    /// Identity derived from the connection string alone.
    pub fn from_scheme(product: DatabaseProduct) -> Self {
        Self {
            product,
            version: None,
        }
    }
}

/// Static capability values for one product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dialect {
    pub product: DatabaseProduct,
    pub max_parameters: usize,
    /// Initial value only; a server refusal disables preparation per connection.
    pub supports_prepared_statements: bool,
    pub default_isolation: IsolationLevel,
}

impl Dialect {
    pub fn for_product(product: DatabaseProduct) -> Self {
        let (max_parameters, default_isolation) = match product {
            DatabaseProduct::PostgreSql => (65535, IsolationLevel::ReadCommitted),
            DatabaseProduct::CockroachDb => (65535, IsolationLevel::Serializable),
            DatabaseProduct::MySql | DatabaseProduct::MariaDb => {
                (65535, IsolationLevel::RepeatableRead)
            }
            DatabaseProduct::Sqlite => (32766, IsolationLevel::Serializable),
            DatabaseProduct::DuckDb => (65535, IsolationLevel::Serializable),
            DatabaseProduct::SqlServer | DatabaseProduct::LocalDb => {
                (2100, IsolationLevel::ReadCommitted)
            }
            DatabaseProduct::Oracle => (65535, IsolationLevel::ReadCommitted),
            DatabaseProduct::Unknown => return Self::sql92(),
        };
        Self {
            product,
            max_parameters,
            supports_prepared_statements: true,
            default_isolation,
        }
    }

    /// Generic SQL-92 profile used when the product cannot be identified.
    pub fn sql92() -> Self {
        Self {
            product: DatabaseProduct::Unknown,
            max_parameters: SQL92_MAX_PARAMETERS,
            supports_prepared_statements: true,
            default_isolation: IsolationLevel::ReadCommitted,
        }
    }
}

/// Where the data of a connection string lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Storage {
    /// Every physical connection sees its own private database.
    InMemory,
    File,
    Network,
}

/// Structural classification of a connection string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionShape {
    pub storage: Storage,
    /// The engine takes a process-exclusive lock on its file.
    pub exclusive_lock: bool,
}

impl ConnectionShape {
    pub fn classify(product: DatabaseProduct, connection_string: &str) -> Self {
        let storage = if is_memory_only(connection_string) {
            Storage::InMemory
        } else if product.is_embedded_file_engine() {
            Storage::File
        } else {
            Storage::Network
        };
        Self {
            storage,
            exclusive_lock: is_embedded_single_writer(connection_string),
        }
    }

    pub fn network() -> Self {
        Self {
            storage: Storage::Network,
            exclusive_lock: false,
        }
    }

    pub fn file() -> Self {
        Self {
            storage: Storage::File,
            exclusive_lock: false,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            storage: Storage::InMemory,
            exclusive_lock: false,
        }
    }
}

/// True if each physical connection to this target is an isolated database.
pub fn is_memory_only(connection_string: &str) -> bool {
    let lower = connection_string.trim().to_lowercase();
    match DatabaseProduct::from_connection_string(&lower) {
        DatabaseProduct::Sqlite => {
            let body = lower.trim_start_matches("sqlite:").trim_start_matches("//");
            body.is_empty()
                || body.starts_with(":memory:")
                || body.starts_with("file::memory:")
                || query_flag(&lower, "mode", "memory")
        }
        DatabaseProduct::DuckDb => {
            let body = lower.trim_start_matches("duckdb:").trim_start_matches("//");
            body.is_empty() || body.starts_with(":memory:")
        }
        _ => false,
    }
}

/// True for embedded engines that lock their file for one process and one writer.
pub fn is_embedded_single_writer(connection_string: &str) -> bool {
    let lower = connection_string.trim().to_lowercase();
    match DatabaseProduct::from_connection_string(&lower) {
        DatabaseProduct::DuckDb => !is_memory_only(&lower),
        DatabaseProduct::Sqlite => query_flag(&lower, "locking_mode", "exclusive"),
        _ => false,
    }
}

/// True when the engine unloads itself once its last connection closes.
pub fn requires_keep_alive(product: DatabaseProduct) -> bool {
    matches!(product, DatabaseProduct::LocalDb)
}

fn query_flag(lower: &str, key: &str, value: &str) -> bool {
    let Some((_, query)) = lower.split_once('?') else {
        return false;
    };
    query.split('&').any(|pair| match pair.split_once('=') {
        Some((k, v)) => k == key && v == value,
        None => false,
    })
}

/// Statements applied once to every freshly opened physical connection.
pub fn session_preamble(product: DatabaseProduct) -> Vec<String> {
    match product {
        DatabaseProduct::Sqlite => vec!["PRAGMA foreign_keys = ON".to_string()],
        DatabaseProduct::PostgreSql | DatabaseProduct::CockroachDb => {
            vec!["SET TIME ZONE 'UTC'".to_string()]
        }
        DatabaseProduct::MySql | DatabaseProduct::MariaDb => {
            vec!["SET time_zone = '+00:00'".to_string()]
        }
        _ => Vec::new(),
    }
}

/// Statements that open a transaction on `driver` at `level`.
pub fn begin_statements(
    driver: DriverKind,
    level: IsolationLevel,
    kind: ExecutionKind,
) -> Vec<String> {
    match driver {
        DriverKind::Postgres => {
            let access = match kind {
                ExecutionKind::Read => " READ ONLY",
                ExecutionKind::Write => "",
            };
            vec![format!("BEGIN ISOLATION LEVEL {}{}", level.to_sql(), access)]
        }
        DriverKind::MySql => {
            let start = match kind {
                ExecutionKind::Read => "START TRANSACTION READ ONLY",
                ExecutionKind::Write => "START TRANSACTION",
            };
            vec![
                format!("SET TRANSACTION ISOLATION LEVEL {}", level.to_sql()),
                start.to_string(),
            ]
        }
        // SQLite is always serializable; IMMEDIATE takes the write lock up front.
        DriverKind::SQLite => match kind {
            ExecutionKind::Read => vec!["BEGIN DEFERRED".to_string()],
            ExecutionKind::Write => vec!["BEGIN IMMEDIATE".to_string()],
        },
    }
}

/// Refine the scheme-derived product with the server's own version banner.
pub async fn detect_product(
    connection: &mut DbConnection,
    scheme_product: DatabaseProduct,
) -> DbResult<ProductIdentity> {
    let sql = match connection.driver() {
        DriverKind::SQLite => "SELECT sqlite_version()",
        DriverKind::MySql | DriverKind::Postgres => "SELECT version()",
    };
    let rows = connection.fetch_all(sql, &[], false, DETECT_TIMEOUT).await?;
    let version: Option<String> = match rows.first() {
        Some(row) => row.try_get(0)?,
        None => None,
    };

    let product = match (&version, connection.driver()) {
        (Some(banner), DriverKind::MySql) if banner.to_lowercase().contains("mariadb") => {
            DatabaseProduct::MariaDb
        }
        (Some(banner), DriverKind::Postgres) if banner.to_lowercase().contains("cockroachdb") => {
            DatabaseProduct::CockroachDb
        }
        _ => scheme_product,
    };

    if product != scheme_product {
        warn!(
            scheme = %scheme_product,
            detected = %product,
            "Detected product differs from connection string scheme"
        );
    }
    debug!(product = %product, version = ?version, "Detected database product");

    Ok(ProductIdentity { product, version })
}
