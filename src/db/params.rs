//! Statement construction with bound `QueryParam` values.
//!
//! Each driver gets its own builder because the argument buffers differ.
//! `persistent` controls whether the driver caches a named prepared statement.

use crate::models::QueryParam;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};

pub(crate) fn mysql_query<'q>(
    sql: &'q str,
    params: &'q [QueryParam],
    persistent: bool,
) -> Query<'q, MySql, MySqlArguments> {
    params
        .iter()
        .fold(sqlx::query(sql).persistent(persistent), |query, param| {
            match param {
                QueryParam::Null => query.bind(None::<String>),
                QueryParam::Bool(v) => query.bind(*v),
                QueryParam::Int(v) => query.bind(*v),
                QueryParam::Float(v) => query.bind(*v),
                QueryParam::String(v) => query.bind(v.as_str()),
                QueryParam::Bytes(v) => query.bind(v.as_slice()),
                QueryParam::Json(v) => query.bind(Json(v)),
            }
        })
}

pub(crate) fn postgres_query<'q>(
    sql: &'q str,
    params: &'q [QueryParam],
    persistent: bool,
) -> Query<'q, Postgres, PgArguments> {
    params
        .iter()
        .fold(sqlx::query(sql).persistent(persistent), |query, param| {
            match param {
                QueryParam::Null => query.bind(None::<String>),
                QueryParam::Bool(v) => query.bind(*v),
                QueryParam::Int(v) => query.bind(*v),
                QueryParam::Float(v) => query.bind(*v),
                QueryParam::String(v) => query.bind(v.as_str()),
                QueryParam::Bytes(v) => query.bind(v.as_slice()),
                QueryParam::Json(v) => query.bind(Json(v)),
            }
        })
}

pub(crate) fn sqlite_query<'q>(
    sql: &'q str,
    params: &'q [QueryParam],
    persistent: bool,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    params
        .iter()
        .fold(sqlx::query(sql).persistent(persistent), |query, param| {
            match param {
                QueryParam::Null => query.bind(None::<String>),
                QueryParam::Bool(v) => query.bind(*v),
                QueryParam::Int(v) => query.bind(*v),
                QueryParam::Float(v) => query.bind(*v),
                QueryParam::String(v) => query.bind(v.as_str()),
                QueryParam::Bytes(v) => query.bind(v.as_slice()),
                // stored as TEXT; SQLite has no JSON column type
                QueryParam::Json(v) => query.bind(v.to_string()),
            }
        })
}
