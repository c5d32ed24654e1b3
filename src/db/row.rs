//! Driver-independent result rows.

use crate::error::{DbError, DbResult};
use crate::impl_db_dispatch;
use crate::models::DriverKind;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::{Map, Value as JsonValue};
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, MySql, Postgres, Row, Sqlite, Type};

/// Try common scalar types in order until one decodes.
macro_rules! json_value {
    ($row:expr, $index:expr) => {{
        let row = $row;
        let index = $index;
        if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = row.try_get::<Option<i32>, _>(index) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(index) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = row.try_get::<Option<sqlx::types::Json<JsonValue>>, _>(index) {
            v.map(|j| j.0).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index) {
            v.map(|t| JsonValue::from(t.to_rfc3339())).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(index) {
            v.map(|t| JsonValue::from(t.to_string())).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
            v.map(|b| JsonValue::from(STANDARD.encode(b)))
                .unwrap_or(JsonValue::Null)
        } else {
            JsonValue::Null
        }
    }};
}

/// One row returned by any driver.
pub enum DbRow {
    MySql(MySqlRow),
    Postgres(PgRow),
    SQLite(SqliteRow),
}

impl std::fmt::Debug for DbRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbRow")
            .field("driver", &self.driver())
            .field("columns", &self.column_names())
            .finish()
    }
}

impl DbRow {
    pub fn driver(&self) -> DriverKind {
        match self {
            DbRow::MySql(_) => DriverKind::MySql,
            DbRow::Postgres(_) => DriverKind::Postgres,
            DbRow::SQLite(_) => DriverKind::SQLite,
        }
    }

    pub fn len(&self) -> usize {
        impl_db_dispatch!(DbRow, self, {
            MySql(r) => r.len(),
            Postgres(r) => r.len(),
            SQLite(r) => r.len(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_names(&self) -> Vec<String> {
        impl_db_dispatch!(DbRow, self, {
            MySql(r) => r.columns().iter().map(|c| c.name().to_string()).collect(),
            Postgres(r) => r.columns().iter().map(|c| c.name().to_string()).collect(),
            SQLite(r) => r.columns().iter().map(|c| c.name().to_string()).collect(),
        })
    }

    /// Decode column `index` as `T`.
    pub fn try_get<T>(&self, index: usize) -> DbResult<T>
    where
        T: for<'r> Decode<'r, MySql>
            + Type<MySql>
            + for<'r> Decode<'r, Postgres>
            + Type<Postgres>
            + for<'r> Decode<'r, Sqlite>
            + Type<Sqlite>,
    {
        let decoded = impl_db_dispatch!(DbRow, self, {
            MySql(r) => r.try_get::<T, _>(index),
            Postgres(r) => r.try_get::<T, _>(index),
            SQLite(r) => r.try_get::<T, _>(index),
        });
        decoded.map_err(DbError::from)
    }

    /// Decode the column named `name` as `T`.
    pub fn try_get_by_name<T>(&self, name: &str) -> DbResult<T>
    where
        T: for<'r> Decode<'r, MySql>
            + Type<MySql>
            + for<'r> Decode<'r, Postgres>
            + Type<Postgres>
            + for<'r> Decode<'r, Sqlite>
            + Type<Sqlite>,
    {
        let decoded = impl_db_dispatch!(DbRow, self, {
            MySql(r) => r.try_get::<T, _>(name),
            Postgres(r) => r.try_get::<T, _>(name),
            SQLite(r) => r.try_get::<T, _>(name),
        });
        decoded.map_err(DbError::from)
    }

    /// Best-effort JSON rendering keyed by column name.
    ///
    /// Columns whose type matches none of the common scalar types render as `null`.
    pub fn to_json_map(&self) -> Map<String, JsonValue> {
        let names = self.column_names();
        let mut map = Map::with_capacity(names.len());
        for (index, name) in names.into_iter().enumerate() {
            let value = impl_db_dispatch!(DbRow, self, {
                MySql(r) => json_value!(r, index),
                Postgres(r) => json_value!(r, index),
                SQLite(r) => json_value!(r, index),
            });
            map.insert(name, value);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use crate::db::executor::{DbConnection, Handle};
    use sqlx::ConnectOptions;
    use sqlx::sqlite::SqliteConnectOptions;
    use std::str::FromStr;
    use std::time::Duration;

    async fn rows(sql: &str) -> Vec<super::DbRow> {
        let conn = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .connect()
            .await
            .unwrap();
        let mut conn = DbConnection::SQLite(Handle::Detached(conn));
        conn.fetch_all(sql, &[], false, Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_debug_lists_columns() {
        let rows = rows("SELECT 1 AS id, 'note' AS body").await;
        let rendered = format!("{:?}", rows[0]);
        assert!(rendered.contains("SQLite"), "{}", rendered);
        assert!(rendered.contains("\"id\""), "{}", rendered);
        assert!(rendered.contains("\"body\""), "{}", rendered);
        assert!(!rendered.contains("note"), "{}", rendered);
    }

    #[tokio::test]
    async fn test_json_map_by_column_name() {
        let rows = rows("SELECT 7 AS id, 'note' AS body, NULL AS missing").await;
        let map = rows[0].to_json_map();
        assert_eq!(map["id"], serde_json::json!(7));
        assert_eq!(map["body"], serde_json::json!("note"));
        assert!(map["missing"].is_null());
        assert_eq!(rows[0].try_get_by_name::<String>("body").unwrap(), "note");
    }
}
