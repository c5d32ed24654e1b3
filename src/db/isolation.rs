//! Isolation-level resolution.
//!
//! Maps an abstract [`IsolationProfile`] onto a concrete [`IsolationLevel`] for
//! one product, degrading to the next-safest level instead of failing when
//! the ideal level is not available.

use crate::error::{DbError, DbResult};
use crate::models::DatabaseProduct;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
    /// MVCC snapshot (SQL Server `ALLOW_SNAPSHOT_ISOLATION`).
    Snapshot,
}

impl IsolationLevel {
    /// The keyword used after `ISOLATION LEVEL`.
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
            Self::Snapshot => "SNAPSHOT",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_sql())
    }
}

/// Database-side switches that change which levels are usable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationCapabilities {
    /// Snapshot isolation is enabled on the database.
    pub snapshot_isolation: bool,
    /// READ COMMITTED uses row versioning instead of shared locks.
    pub read_committed_snapshot: bool,
}

/// What the caller wants from isolation, independent of vendor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationProfile {
    /// Whatever the product uses when nothing is specified.
    #[default]
    ProductDefault,
    /// Readers never block on writers and never see uncommitted data.
    SafeNonBlockingReads,
    /// Lowest available isolation.
    FastReads,
    RepeatableReads,
    Strict,
}

impl FromStr for IsolationProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "default" | "product_default" => Ok(Self::ProductDefault),
            "safe_non_blocking_reads" | "safe" => Ok(Self::SafeNonBlockingReads),
            "fast_reads" | "fast" => Ok(Self::FastReads),
            "repeatable_reads" | "repeatable" => Ok(Self::RepeatableReads),
            "strict" | "serializable" => Ok(Self::Strict),
            other => Err(format!("Unknown isolation profile '{}'", other)),
        }
    }
}

/// A resolved isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedIsolation {
    pub level: IsolationLevel,
    /// The ideal level for the profile was unavailable.
    pub degraded: bool,
}

const SQL92_LEVELS: &[IsolationLevel] = &[
    IsolationLevel::ReadUncommitted,
    IsolationLevel::ReadCommitted,
    IsolationLevel::RepeatableRead,
    IsolationLevel::Serializable,
];

/// Levels a product accepts given its capability flags.
pub fn supported_levels(
    product: DatabaseProduct,
    caps: IsolationCapabilities,
) -> Vec<IsolationLevel> {
    use IsolationLevel::*;

    match product {
        DatabaseProduct::PostgreSql
        | DatabaseProduct::MySql
        | DatabaseProduct::MariaDb
        | DatabaseProduct::Unknown => SQL92_LEVELS.to_vec(),
        DatabaseProduct::CockroachDb | DatabaseProduct::Oracle => {
            vec![ReadCommitted, Serializable]
        }
        DatabaseProduct::SqlServer | DatabaseProduct::LocalDb => {
            let mut levels = SQL92_LEVELS.to_vec();
            if caps.snapshot_isolation {
                levels.push(Snapshot);
            }
            levels
        }
        DatabaseProduct::Sqlite | DatabaseProduct::DuckDb => vec![Serializable],
    }
}

/// Pure resolver for one product and capability set.
#[derive(Debug, Clone)]
pub struct IsolationResolver {
    product: DatabaseProduct,
    caps: IsolationCapabilities,
    default_level: IsolationLevel,
    supported: Vec<IsolationLevel>,
}

impl IsolationResolver {
    pub fn new(
        product: DatabaseProduct,
        caps: IsolationCapabilities,
        default_level: IsolationLevel,
    ) -> Self {
        Self {
            product,
            caps,
            default_level,
            supported: supported_levels(product, caps),
        }
    }

    pub fn product(&self) -> DatabaseProduct {
        self.product
    }

    pub fn supported_levels(&self) -> &[IsolationLevel] {
        &self.supported
    }

    pub fn supports(&self, level: IsolationLevel) -> bool {
        self.supported.contains(&level)
    }

    /// Reject a level the product cannot run at all.
    pub fn validate(&self, level: IsolationLevel) -> DbResult<IsolationLevel> {
        if self.supports(level) {
            Ok(level)
        } else {
            Err(DbError::unsupported_isolation(level, self.product))
        }
    }

    /// Pick the best level for `profile`, degrading instead of failing.
    pub fn resolve(&self, profile: IsolationProfile) -> ResolvedIsolation {
        use IsolationLevel::*;

        let resolved = match profile {
            IsolationProfile::ProductDefault => self.first_of(&[self.default_level], false),
            IsolationProfile::SafeNonBlockingReads => self.safe_non_blocking_reads(),
            IsolationProfile::FastReads => {
                self.first_of(&[ReadUncommitted, ReadCommitted, RepeatableRead, Serializable], false)
            }
            IsolationProfile::RepeatableReads => self.first_of(&[RepeatableRead, Serializable], true),
            IsolationProfile::Strict => self.first_of(&[Serializable], true),
        };

        if resolved.degraded {
            warn!(
                product = %self.product,
                profile = ?profile,
                level = %resolved.level,
                "Isolation degraded: ideal level unavailable"
            );
        }
        resolved
    }

    fn safe_non_blocking_reads(&self) -> ResolvedIsolation {
        use IsolationLevel::*;

        match self.product {
            // MVCC engines: readers already see committed snapshots without blocking.
            DatabaseProduct::PostgreSql
            | DatabaseProduct::CockroachDb
            | DatabaseProduct::MySql
            | DatabaseProduct::MariaDb
            | DatabaseProduct::Oracle => self.first_of(&[ReadCommitted, Serializable], false),
            DatabaseProduct::Sqlite | DatabaseProduct::DuckDb => ResolvedIsolation {
                level: Serializable,
                degraded: false,
            },
            DatabaseProduct::SqlServer | DatabaseProduct::LocalDb => {
                if self.caps.snapshot_isolation {
                    ResolvedIsolation {
                        level: Snapshot,
                        degraded: false,
                    }
                } else {
                    ResolvedIsolation {
                        level: ReadCommitted,
                        degraded: !self.caps.read_committed_snapshot,
                    }
                }
            }
            DatabaseProduct::Unknown => ResolvedIsolation {
                level: ReadCommitted,
                degraded: true,
            },
        }
    }

    /// First supported level of `chain`; later entries count as degraded when `strict`.
    fn first_of(&self, chain: &[IsolationLevel], strict: bool) -> ResolvedIsolation {
        for (position, level) in chain.iter().enumerate() {
            if self.supports(*level) {
                return ResolvedIsolation {
                    level: *level,
                    degraded: strict && position > 0,
                };
            }
        }
        // Every product supports at least one level; fall back to its strongest.
        let level = self
            .supported
            .iter()
            .copied()
            .find(|l| *l == IsolationLevel::Serializable)
            .unwrap_or(self.default_level);
        ResolvedIsolation {
            level,
            degraded: true,
        }
    }
}
