//! Statement execution on a single physical connection.
//!
//! This module provides execution on one checked-out connection with support for:
//! - Parameterized statements, with prepared-statement caching switchable per call
//! - Statement timeouts
//! - Row streaming into a bounded channel (used by leased readers)
//!
//! # Architecture
//!
//! The executor uses database-specific implementations organized in submodules:
//! - `mysql`: MySQL-specific execution
//! - `postgres`: PostgreSQL-specific execution
//! - `sqlite`: SQLite-specific execution
//!
//! Each submodule provides identical functionality adapted to the database's type system.

use crate::db::row::DbRow;
use crate::error::{DbError, DbResult};
use crate::impl_db_dispatch;
use crate::models::{DriverKind, QueryParam};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Database, MySql, Postgres, Sqlite};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

/// Sending half of a leased reader's row channel.
///
/// `Ok(None)` marks the end of the cursor; the pump itself never sends it.
pub(crate) type RowSink = mpsc::Sender<DbResult<Option<DbRow>>>;

/// A physical connection, either borrowed from the driver pool or owned outright.
pub enum Handle<DB: Database> {
    /// Returned to the driver pool when dropped.
    Pooled(PoolConnection<DB>),
    /// Opened directly; lives until closed.
    Detached(DB::Connection),
}

impl<DB: Database> Handle<DB> {
    pub fn connection_mut(&mut self) -> &mut DB::Connection {
        match self {
            Handle::Pooled(conn) => &mut **conn,
            Handle::Detached(conn) => conn,
        }
    }

    async fn close(self) -> DbResult<()> {
        match self {
            Handle::Pooled(conn) => conn.close().await.map_err(DbError::from),
            Handle::Detached(conn) => conn.close().await.map_err(DbError::from),
        }
    }

    fn is_pooled(&self) -> bool {
        matches!(self, Handle::Pooled(_))
    }
}

/// One physical connection of any driver.
pub enum DbConnection {
    MySql(Handle<MySql>),
    Postgres(Handle<Postgres>),
    SQLite(Handle<Sqlite>),
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pooled = impl_db_dispatch!(DbConnection, self, {
            MySql(h) => h.is_pooled(),
            Postgres(h) => h.is_pooled(),
            SQLite(h) => h.is_pooled(),
        });
        f.debug_struct("DbConnection")
            .field("driver", &self.driver())
            .field("pooled", &pooled)
            .finish()
    }
}

/// How a row pump ended.
#[derive(Debug)]
pub(crate) enum PumpEnd {
    /// The cursor returned no further rows.
    Exhausted,
    /// The receiving side went away first.
    Abandoned,
    Failed { error: DbError, rows_sent: u64 },
}

impl DbConnection {
    pub fn driver(&self) -> DriverKind {
        match self {
            DbConnection::MySql(_) => DriverKind::MySql,
            DbConnection::Postgres(_) => DriverKind::Postgres,
            DbConnection::SQLite(_) => DriverKind::SQLite,
        }
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        prepared: bool,
        query_timeout: Duration,
    ) -> DbResult<u64> {
        debug!(
            sql = %sql,
            params = params.len(),
            prepared = prepared,
            timeout_secs = query_timeout.as_secs(),
            "Executing statement"
        );

        impl_db_dispatch!(DbConnection, self, {
            MySql(h) => mysql::execute(h.connection_mut(), sql, params, prepared, query_timeout).await,
            Postgres(h) => postgres::execute(h.connection_mut(), sql, params, prepared, query_timeout).await,
            SQLite(h) => sqlite::execute(h.connection_mut(), sql, params, prepared, query_timeout).await,
        })
    }

    /// Run a query and buffer every row.
    pub async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        prepared: bool,
        query_timeout: Duration,
    ) -> DbResult<Vec<DbRow>> {
        debug!(
            sql = %sql,
            params = params.len(),
            prepared = prepared,
            timeout_secs = query_timeout.as_secs(),
            "Fetching rows"
        );

        impl_db_dispatch!(DbConnection, self, {
            MySql(h) => mysql::fetch_all(h.connection_mut(), sql, params, prepared, query_timeout).await,
            Postgres(h) => postgres::fetch_all(h.connection_mut(), sql, params, prepared, query_timeout).await,
            SQLite(h) => sqlite::fetch_all(h.connection_mut(), sql, params, prepared, query_timeout).await,
        })
    }

    /// Run an unparameterized control statement (BEGIN, COMMIT, SAVEPOINT, ...).
    pub async fn execute_raw(&mut self, sql: &str, query_timeout: Duration) -> DbResult<()> {
        debug!(sql = %sql, "Executing control statement");
        self.execute(sql, &[], false, query_timeout).await.map(|_| ())
    }

    /// Stream rows into `sink` until the cursor ends, fails, or the receiver leaves.
    ///
    /// `row_timeout` bounds the wait for each individual row.
    pub(crate) async fn pump(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        prepared: bool,
        row_timeout: Duration,
        sink: &RowSink,
    ) -> PumpEnd {
        impl_db_dispatch!(DbConnection, self, {
            MySql(h) => {
                let rows = mysql::fetch(h.connection_mut(), sql, params, prepared);
                drain(rows, DbRow::MySql, row_timeout, sink).await
            },
            Postgres(h) => {
                let rows = postgres::fetch(h.connection_mut(), sql, params, prepared);
                drain(rows, DbRow::Postgres, row_timeout, sink).await
            },
            SQLite(h) => {
                let rows = sqlite::fetch(h.connection_mut(), sql, params, prepared);
                drain(rows, DbRow::SQLite, row_timeout, sink).await
            },
        })
    }

    /// Close the physical connection (pooled connections are dropped from the pool).
    pub async fn close(self) -> DbResult<()> {
        impl_db_dispatch!(DbConnection, self, {
            MySql(h) => h.close().await,
            Postgres(h) => h.close().await,
            SQLite(h) => h.close().await,
        })
    }
}

async fn drain<R>(
    mut rows: BoxStream<'_, Result<R, sqlx::Error>>,
    wrap: fn(R) -> DbRow,
    row_timeout: Duration,
    sink: &RowSink,
) -> PumpEnd {
    let mut rows_sent = 0u64;
    loop {
        let next = tokio::select! {
            _ = sink.closed() => return PumpEnd::Abandoned,
            next = timeout(row_timeout, rows.next()) => next,
        };

        match next {
            Err(_) => {
                return PumpEnd::Failed {
                    error: timeout_error("row fetch", row_timeout),
                    rows_sent,
                };
            }
            Ok(None) => return PumpEnd::Exhausted,
            Ok(Some(Err(e))) => {
                return PumpEnd::Failed {
                    error: DbError::from(e),
                    rows_sent,
                };
            }
            Ok(Some(Ok(row))) => {
                if sink.send(Ok(Some(wrap(row)))).await.is_err() {
                    return PumpEnd::Abandoned;
                }
                rows_sent += 1;
            }
        }
    }
}

fn timeout_error(operation: &str, timeout: Duration) -> DbError {
    DbError::timeout(operation, timeout)
}

fn finish<T>(
    result: Result<Result<T, sqlx::Error>, tokio::time::error::Elapsed>,
    operation: &str,
    query_timeout: Duration,
) -> DbResult<T> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(DbError::from(e)),
        Err(_) => Err(timeout_error(operation, query_timeout)),
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.
// Statements without parameters go through the simple-query path, so control
// statements never occupy a prepared-statement slot.

mod mysql {
    use super::*;
    use crate::db::params::mysql_query;
    use sqlx::mysql::{MySqlConnection, MySqlRow};
    use sqlx::Executor;

    pub async fn execute(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[QueryParam],
        prepared: bool,
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let result = if params.is_empty() {
            timeout(query_timeout, conn.execute(sql)).await
        } else {
            timeout(
                query_timeout,
                mysql_query(sql, params, prepared).execute(&mut *conn),
            )
            .await
        };
        finish(result, "statement execution", query_timeout).map(|r| r.rows_affected())
    }

    pub async fn fetch_all(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[QueryParam],
        prepared: bool,
        query_timeout: Duration,
    ) -> DbResult<Vec<DbRow>> {
        let rows = timeout(
            query_timeout,
            fetch(conn, sql, params, prepared).collect::<Vec<_>>(),
        )
        .await
        .map_err(|_| timeout_error("query execution", query_timeout))?;
        rows.into_iter()
            .map(|r| r.map(DbRow::MySql).map_err(DbError::from))
            .collect()
    }

    pub fn fetch<'e>(
        conn: &'e mut MySqlConnection,
        sql: &'e str,
        params: &'e [QueryParam],
        prepared: bool,
    ) -> BoxStream<'e, Result<MySqlRow, sqlx::Error>> {
        if params.is_empty() {
            conn.fetch(sql)
        } else {
            mysql_query(sql, params, prepared).fetch(conn)
        }
    }
}

mod postgres {
    use super::*;
    use crate::db::params::postgres_query;
    use sqlx::postgres::{PgConnection, PgRow};
    use sqlx::Executor;

    pub async fn execute(
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
        prepared: bool,
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let result = if params.is_empty() {
            timeout(query_timeout, conn.execute(sql)).await
        } else {
            timeout(
                query_timeout,
                postgres_query(sql, params, prepared).execute(&mut *conn),
            )
            .await
        };
        finish(result, "statement execution", query_timeout).map(|r| r.rows_affected())
    }

    pub async fn fetch_all(
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
        prepared: bool,
        query_timeout: Duration,
    ) -> DbResult<Vec<DbRow>> {
        let rows = timeout(
            query_timeout,
            fetch(conn, sql, params, prepared).collect::<Vec<_>>(),
        )
        .await
        .map_err(|_| timeout_error("query execution", query_timeout))?;
        rows.into_iter()
            .map(|r| r.map(DbRow::Postgres).map_err(DbError::from))
            .collect()
    }

    pub fn fetch<'e>(
        conn: &'e mut PgConnection,
        sql: &'e str,
        params: &'e [QueryParam],
        prepared: bool,
    ) -> BoxStream<'e, Result<PgRow, sqlx::Error>> {
        if params.is_empty() {
            conn.fetch(sql)
        } else {
            postgres_query(sql, params, prepared).fetch(conn)
        }
    }
}

mod sqlite {
    use super::*;
    use crate::db::params::sqlite_query;
    use sqlx::sqlite::{SqliteConnection, SqliteRow};
    use sqlx::Executor;

    pub async fn execute(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
        prepared: bool,
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let result = if params.is_empty() {
            timeout(query_timeout, conn.execute(sql)).await
        } else {
            timeout(
                query_timeout,
                sqlite_query(sql, params, prepared).execute(&mut *conn),
            )
            .await
        };
        finish(result, "statement execution", query_timeout).map(|r| r.rows_affected())
    }

    pub async fn fetch_all(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
        prepared: bool,
        query_timeout: Duration,
    ) -> DbResult<Vec<DbRow>> {
        let rows = timeout(
            query_timeout,
            fetch(conn, sql, params, prepared).collect::<Vec<_>>(),
        )
        .await
        .map_err(|_| timeout_error("query execution", query_timeout))?;
        rows.into_iter()
            .map(|r| r.map(DbRow::SQLite).map_err(DbError::from))
            .collect()
    }

    pub fn fetch<'e>(
        conn: &'e mut SqliteConnection,
        sql: &'e str,
        params: &'e [QueryParam],
        prepared: bool,
    ) -> BoxStream<'e, Result<SqliteRow, sqlx::Error>> {
        if params.is_empty() {
            conn.fetch(sql)
        } else {
            sqlite_query(sql, params, prepared).fetch(conn)
        }
    }
}
