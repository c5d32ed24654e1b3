//! Driver dispatch macro.
//!
//! `DbPool`, `DbConnection` and `DbRow` all carry one variant per sqlx driver.
//! The macro expands a per-variant body into the matching `match` arms.

/// Dispatch over the driver variants of a per-driver enum.
///
/// The enum name must be in scope at the call site.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(DbPool, self, {
///     MySql(p) => p.size(),
///     Postgres(p) => p.size(),
///     SQLite(p) => p.size(),
/// })
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($kind:ident, $value:expr, { $($variant:ident($p:pat) => $body:expr),+ $(,)? }) => {
        match $value {
            $(
                $kind::$variant($p) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
