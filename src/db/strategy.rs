//! The four connection strategies.
//!
//! The variant is picked once, at coordinator construction, from the resolved
//! [`ConnectionMode`]; after that `acquire` only matches on the stored variant.
//!
//! | Mode             | Write                 | Read                  |
//! |------------------|-----------------------|-----------------------|
//! | Standard         | ephemeral             | ephemeral             |
//! | KeepAlive        | ephemeral             | ephemeral             |
//! | SingleWriter     | pinned writer         | ephemeral (read-only) |
//! | SingleConnection | the pinned connection | the pinned connection |
//!
//! Transactional and non-transactional requests route the same way.

use crate::db::metrics::ConnectionMetrics;
use crate::db::pool::{ConnectTarget, DbPool, PinnedPurpose, PoolAccess};
use crate::db::tracked::{PinnedConnection, TrackedConnection};
use crate::error::DbResult;
use crate::models::{ConnectionMode, ExecutionKind};
use std::sync::Arc;
use tracing::{info, trace};

#[derive(Debug)]
enum Variant {
    Standard {
        pool: DbPool,
    },
    KeepAlive {
        pool: DbPool,
        /// Never handed out; keeps the engine resident.
        sentinel: Arc<PinnedConnection>,
    },
    SingleWriter {
        readers: DbPool,
        writer: Arc<PinnedConnection>,
    },
    SingleConnection {
        connection: Arc<PinnedConnection>,
    },
}

/// Decides which tracked connection serves each request.
#[derive(Debug)]
pub struct ConnectionStrategy {
    mode: ConnectionMode,
    variant: Variant,
    metrics: Arc<ConnectionMetrics>,
    supports_prepared: bool,
}

impl ConnectionStrategy {
    /// Build the strategy for `mode`.
    ///
    /// Pinned connections open here and a failure aborts construction. Pools are
    /// lazy, so ephemeral failures only show up at first use.
    pub async fn build(
        mode: ConnectionMode,
        target: &ConnectTarget,
        supports_prepared: bool,
    ) -> DbResult<Self> {
        let variant = match mode {
            ConnectionMode::Standard => Variant::Standard {
                pool: target.build_pool(PoolAccess::ReadWrite)?,
            },
            ConnectionMode::KeepAlive => {
                let sentinel =
                    PinnedConnection::open(target, PinnedPurpose::Sentinel, supports_prepared)
                        .await?;
                Variant::KeepAlive {
                    pool: target.build_pool(PoolAccess::ReadWrite)?,
                    sentinel,
                }
            }
            ConnectionMode::SingleWriter => {
                // the writer goes first so a new database file exists for the readers
                let writer =
                    PinnedConnection::open(target, PinnedPurpose::Writer, supports_prepared)
                        .await?;
                Variant::SingleWriter {
                    readers: target.build_pool(PoolAccess::ReadOnly)?,
                    writer,
                }
            }
            ConnectionMode::SingleConnection => Variant::SingleConnection {
                connection: PinnedConnection::open(
                    target,
                    PinnedPurpose::Shared,
                    supports_prepared,
                )
                .await?,
            },
        };

        info!(mode = %mode, driver = ?target.driver(), "Connection strategy ready");

        Ok(Self {
            mode,
            variant,
            metrics: Arc::clone(target.metrics()),
            supports_prepared,
        })
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    /// Pick the connection for one request. Never opens anything.
    pub fn acquire(&self, kind: ExecutionKind, transactional: bool) -> TrackedConnection {
        let tracked = match &self.variant {
            Variant::Standard { pool } | Variant::KeepAlive { pool, .. } => {
                TrackedConnection::ephemeral(pool, &self.metrics, self.supports_prepared)
            }
            Variant::SingleWriter { readers, writer } => match kind {
                ExecutionKind::Write => TrackedConnection::pinned(writer),
                ExecutionKind::Read => {
                    TrackedConnection::ephemeral(readers, &self.metrics, self.supports_prepared)
                }
            },
            Variant::SingleConnection { connection } => TrackedConnection::pinned(connection),
        };

        trace!(
            mode = %self.mode,
            kind = %kind,
            transactional = transactional,
            connection_id = tracked.id(),
            role = ?tracked.role(),
            "Connection routed"
        );
        tracked
    }

    /// Close pools and pinned connections. Waits for pinned leases to end.
    pub async fn close(&self) {
        match &self.variant {
            Variant::Standard { pool } => pool.close().await,
            Variant::KeepAlive { pool, sentinel } => {
                pool.close().await;
                sentinel.close().await;
            }
            Variant::SingleWriter { readers, writer } => {
                readers.close().await;
                writer.close().await;
            }
            Variant::SingleConnection { connection } => connection.close().await,
        }
    }
}
