//! Tracked connections, their locks and the leases handed to callers.
//!
//! A [`TrackedConnection`] is what a strategy hands out. Leasing it yields a
//! [`ConnectionLease`], the only way to run statements:
//!
//! - Ephemeral connections carry no lock. Leasing checks a connection out of
//!   the driver pool and the lease returns it when dropped.
//! - Pinned connections sit behind a real `tokio::sync::Mutex`. Leasing waits
//!   for that mutex and the lease holds the guard until dropped, so two leases
//!   of the same pinned connection never overlap.
//!
//! Every wait here is cooperative: a [`CancelSignal`] firing drops the pending
//! acquisition, which releases nothing because nothing was acquired yet.

use crate::db::executor::{DbConnection, PumpEnd, RowSink};
use crate::db::metrics::ConnectionMetrics;
use crate::db::pool::{ConnectTarget, DbPool, PinnedPurpose};
use crate::db::row::DbRow;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionRole, DriverKind, LockKind, QueryParam};
use futures_util::future::select_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Slot holding a pinned physical connection; `None` once closed.
pub(crate) type PinnedSlot = Arc<Mutex<Option<DbConnection>>>;

/// How long `close` waits for an outstanding lease on a pinned connection.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// A set of cancellation tokens; firing any of them cancels the wait.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tokens: Vec<CancellationToken>,
}

impl CancelSignal {
    pub(crate) fn new(primary: CancellationToken) -> Self {
        Self {
            tokens: vec![primary],
        }
    }

    /// Also observe `token`, when given.
    pub(crate) fn also(mut self, token: Option<&CancellationToken>) -> Self {
        if let Some(token) = token {
            self.tokens.push(token.clone());
        }
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.tokens.iter().any(CancellationToken::is_cancelled)
    }

    /// Resolves once any token is cancelled.
    pub async fn cancelled(&self) {
        let waits = self.tokens.iter().map(|t| Box::pin(t.cancelled()));
        // never empty: `new` always stores the primary token
        select_all(waits).await;
    }
}

/// Wait for `mutex`, giving up on cancellation or after `lock_timeout`.
pub(crate) async fn lock_within<T>(
    mutex: Arc<Mutex<T>>,
    signal: &CancelSignal,
    lock_timeout: Option<Duration>,
    operation: &str,
) -> DbResult<OwnedMutexGuard<T>> {
    let wait = async move {
        match lock_timeout {
            Some(limit) => tokio::time::timeout(limit, mutex.lock_owned())
                .await
                .map_err(|_| DbError::timeout(operation, limit)),
            None => Ok(mutex.lock_owned().await),
        }
    };

    tokio::select! {
        biased;
        _ = signal.cancelled() => Err(DbError::canceled(operation)),
        guard = wait => guard,
    }
}

/// A long-lived physical connection shared by every caller that leases it.
#[derive(Debug)]
pub struct PinnedConnection {
    id: u64,
    purpose: PinnedPurpose,
    driver: DriverKind,
    slot: PinnedSlot,
    prepared: Arc<AtomicBool>,
    metrics: Arc<ConnectionMetrics>,
}

impl PinnedConnection {
    /// Open the connection now; failure is fatal to the caller.
    pub async fn open(
        target: &ConnectTarget,
        purpose: PinnedPurpose,
        supports_prepared: bool,
    ) -> DbResult<Arc<Self>> {
        let conn = target.open_pinned(purpose).await?;
        let metrics = Arc::clone(target.metrics());
        let id = metrics.next_connection_id();
        metrics.record_opened();

        info!(
            connection_id = id,
            purpose = ?purpose,
            driver = ?target.driver(),
            "Pinned connection opened"
        );

        Ok(Arc::new(Self {
            id,
            purpose,
            driver: target.driver(),
            slot: Arc::new(Mutex::new(Some(conn))),
            prepared: Arc::new(AtomicBool::new(supports_prepared)),
            metrics,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn purpose(&self) -> PinnedPurpose {
        self.purpose
    }

    /// Close the physical connection once every outstanding lease is gone.
    ///
    /// Waits at most `CLOSE_GRACE`. A lease still held after that (an
    /// undisposed transaction or reader) closes the connection when released.
    pub async fn close(&self) {
        match tokio::time::timeout(CLOSE_GRACE, Arc::clone(&self.slot).lock_owned()).await {
            Ok(slot) => close_slot(slot, self.id, &self.metrics).await,
            Err(_) => {
                warn!(
                    connection_id = self.id,
                    purpose = ?self.purpose,
                    grace = ?CLOSE_GRACE,
                    "Pinned connection still leased at close; it will close when released"
                );
                let slot = Arc::clone(&self.slot);
                let metrics = Arc::clone(&self.metrics);
                let id = self.id;
                tokio::spawn(async move {
                    close_slot(slot.lock_owned().await, id, &metrics).await;
                });
            }
        }
    }
}

async fn close_slot(
    mut slot: OwnedMutexGuard<Option<DbConnection>>,
    id: u64,
    metrics: &ConnectionMetrics,
) {
    let Some(conn) = slot.take() else {
        return;
    };
    if let Err(e) = conn.close().await {
        warn!(connection_id = id, error = %e, "Error closing pinned connection");
    }
    metrics.record_closed();
    debug!(connection_id = id, "Pinned connection closed");
}

#[derive(Debug, Clone)]
enum Source {
    Pool(DbPool),
    Pinned(Arc<PinnedConnection>),
}

/// The lock guarding a tracked connection.
#[derive(Debug, Clone)]
pub enum LockHandle {
    /// Only the creating caller can reach the connection.
    None,
    Real(PinnedSlot),
}

impl LockHandle {
    pub fn kind(&self) -> LockKind {
        match self {
            LockHandle::None => LockKind::None,
            LockHandle::Real(_) => LockKind::Real,
        }
    }
}

/// A connection handed out by a strategy, not yet leased.
#[derive(Debug, Clone)]
pub struct TrackedConnection {
    id: u64,
    role: ConnectionRole,
    driver: DriverKind,
    source: Source,
    metrics: Arc<ConnectionMetrics>,
    supports_prepared: bool,
}

impl TrackedConnection {
    pub(crate) fn ephemeral(
        pool: &DbPool,
        metrics: &Arc<ConnectionMetrics>,
        supports_prepared: bool,
    ) -> Self {
        Self {
            id: metrics.next_connection_id(),
            role: ConnectionRole::Ephemeral,
            driver: pool.driver(),
            source: Source::Pool(pool.clone()),
            metrics: Arc::clone(metrics),
            supports_prepared,
        }
    }

    pub(crate) fn pinned(connection: &Arc<PinnedConnection>) -> Self {
        Self {
            id: connection.id,
            role: ConnectionRole::Pinned,
            driver: connection.driver,
            source: Source::Pinned(Arc::clone(connection)),
            metrics: Arc::clone(&connection.metrics),
            supports_prepared: connection.prepared.load(Ordering::Acquire),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn driver(&self) -> DriverKind {
        self.driver
    }

    /// Whether statements on this connection currently go through the prepare path.
    pub fn prepared_statements_enabled(&self) -> bool {
        match &self.source {
            Source::Pool(_) => self.supports_prepared,
            Source::Pinned(pinned) => pinned.prepared.load(Ordering::Acquire),
        }
    }

    pub fn get_lock(&self) -> LockHandle {
        match &self.source {
            Source::Pool(_) => LockHandle::None,
            Source::Pinned(pinned) => LockHandle::Real(Arc::clone(&pinned.slot)),
        }
    }

    pub fn lock_kind(&self) -> LockKind {
        self.role.lock_kind()
    }

    /// Take exclusive use of the connection.
    ///
    /// Ephemeral connections open (or reuse from the pool) here, so their
    /// failures surface at this point. Pinned connections wait for their lock.
    pub async fn lease(
        &self,
        signal: &CancelSignal,
        lock_timeout: Option<Duration>,
    ) -> DbResult<ConnectionLease> {
        let (guard, prepared) = match &self.source {
            Source::Pool(pool) => {
                let conn = tokio::select! {
                    biased;
                    _ = signal.cancelled() => return Err(DbError::canceled("connection acquire")),
                    conn = pool.acquire() => conn,
                };
                let conn = conn.inspect_err(|e| {
                    self.metrics.record_failure();
                    warn!(connection_id = self.id, error = %e, "Ephemeral connection failed to open");
                })?;
                self.metrics.record_opened();
                (
                    LeaseGuard::Owned(conn),
                    Arc::new(AtomicBool::new(self.supports_prepared)),
                )
            }
            Source::Pinned(pinned) => {
                let guard = lock_within(
                    Arc::clone(&pinned.slot),
                    signal,
                    lock_timeout,
                    "connection lock wait",
                )
                .await?;
                if guard.is_none() {
                    return Err(DbError::Closed);
                }
                self.metrics.record_reused();
                (LeaseGuard::Locked(guard), Arc::clone(&pinned.prepared))
            }
        };

        debug!(connection_id = self.id, role = ?self.role, "Connection leased");

        Ok(ConnectionLease {
            id: self.id,
            role: self.role,
            guard,
            prepared,
            metrics: Arc::clone(&self.metrics),
        })
    }
}

enum LeaseGuard {
    Owned(DbConnection),
    Locked(OwnedMutexGuard<Option<DbConnection>>),
    Released,
}

/// Exclusive use of one connection; released on drop.
pub struct ConnectionLease {
    id: u64,
    role: ConnectionRole,
    guard: LeaseGuard,
    prepared: Arc<AtomicBool>,
    metrics: Arc<ConnectionMetrics>,
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("prepared", &self.prepared.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConnectionLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn lock_kind(&self) -> LockKind {
        self.role.lock_kind()
    }

    pub fn prepared_statements_enabled(&self) -> bool {
        self.prepared.load(Ordering::Acquire)
    }

    pub fn connection_mut(&mut self) -> DbResult<&mut DbConnection> {
        match &mut self.guard {
            LeaseGuard::Owned(conn) => Ok(conn),
            LeaseGuard::Locked(guard) => (**guard).as_mut().ok_or(DbError::Closed),
            LeaseGuard::Released => Err(DbError::Closed),
        }
    }

    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let prepared = self.prepared_statements_enabled();
        let result = self
            .connection_mut()?
            .execute(sql, params, prepared, query_timeout)
            .await;
        match result {
            Err(e) if prepared && e.is_prepare_unsupported() => {
                self.disable_prepared(&e);
                self.connection_mut()?
                    .execute(sql, params, false, query_timeout)
                    .await
            }
            other => other,
        }
    }

    pub async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<Vec<DbRow>> {
        let prepared = self.prepared_statements_enabled();
        let result = self
            .connection_mut()?
            .fetch_all(sql, params, prepared, query_timeout)
            .await;
        match result {
            Err(e) if prepared && e.is_prepare_unsupported() => {
                self.disable_prepared(&e);
                self.connection_mut()?
                    .fetch_all(sql, params, false, query_timeout)
                    .await
            }
            other => other,
        }
    }

    pub async fn execute_raw(&mut self, sql: &str, query_timeout: Duration) -> DbResult<()> {
        self.connection_mut()?.execute_raw(sql, query_timeout).await
    }

    /// Stream rows into `sink`. A refused prepare is only re-issued when no
    /// row has been delivered yet.
    pub(crate) async fn pump(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        row_timeout: Duration,
        sink: &RowSink,
    ) -> PumpEnd {
        let prepared = self.prepared_statements_enabled();
        let end = match self.connection_mut() {
            Ok(conn) => conn.pump(sql, params, prepared, row_timeout, sink).await,
            Err(error) => return PumpEnd::Failed { error, rows_sent: 0 },
        };
        match end {
            PumpEnd::Failed {
                error,
                rows_sent: 0,
            } if prepared && error.is_prepare_unsupported() => {
                self.disable_prepared(&error);
                match self.connection_mut() {
                    Ok(conn) => conn.pump(sql, params, false, row_timeout, sink).await,
                    Err(error) => PumpEnd::Failed { error, rows_sent: 0 },
                }
            }
            end => end,
        }
    }

    /// Close an ephemeral connection instead of returning it to the pool.
    ///
    /// Pinned connections stay open; only the lock is released.
    pub(crate) async fn discard(mut self) {
        if !matches!(self.guard, LeaseGuard::Owned(_)) {
            return;
        }
        if let LeaseGuard::Owned(conn) = std::mem::replace(&mut self.guard, LeaseGuard::Released) {
            if let Err(e) = conn.close().await {
                debug!(connection_id = self.id, error = %e, "Error closing discarded connection");
            }
        }
    }

    fn disable_prepared(&self, cause: &DbError) {
        if self.prepared.swap(false, Ordering::AcqRel) {
            warn!(
                connection_id = self.id,
                error = %cause,
                "Server refused prepared statements; disabled for this connection"
            );
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if self.role == ConnectionRole::Ephemeral {
            self.metrics.record_closed();
        }
    }
}

/// Something a leased reader can own for its whole lifetime.
pub(crate) trait LeaseTarget: Send + 'static {
    fn lease_mut(&mut self) -> DbResult<&mut ConnectionLease>;
}

impl LeaseTarget for ConnectionLease {
    fn lease_mut(&mut self) -> DbResult<&mut ConnectionLease> {
        Ok(self)
    }
}

/// A transaction's operation lock, holding the transaction's lease.
impl LeaseTarget for OwnedMutexGuard<Option<ConnectionLease>> {
    fn lease_mut(&mut self) -> DbResult<&mut ConnectionLease> {
        (**self)
            .as_mut()
            .ok_or_else(|| DbError::internal("transaction connection already released"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;
    use crate::db::pool::PoolAccess;
    use crate::models::DatabaseProduct;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn memory_target(metrics: &Arc<ConnectionMetrics>) -> ConnectTarget {
        ConnectTarget::new(
            "sqlite::memory:",
            DatabaseProduct::Sqlite,
            PoolOptions::default(),
            Vec::new(),
            Arc::clone(metrics),
        )
        .unwrap()
    }

    fn signal() -> CancelSignal {
        CancelSignal::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn test_pinned_lease_is_exclusive() {
        let metrics = Arc::new(ConnectionMetrics::new());
        let target = memory_target(&metrics);
        let pinned = PinnedConnection::open(&target, PinnedPurpose::Shared, true)
            .await
            .unwrap();
        let tracked = TrackedConnection::pinned(&pinned);
        assert_eq!(tracked.lock_kind(), LockKind::Real);
        assert_eq!(tracked.get_lock().kind(), LockKind::Real);

        let first = tracked.lease(&signal(), None).await.unwrap();
        let second = tracked
            .lease(&signal(), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(second, DbError::Timeout { .. }));

        drop(first);
        let again = tracked.lease(&signal(), None).await.unwrap();
        assert_eq!(again.id(), pinned.id());
    }

    #[tokio::test]
    async fn test_cancelled_lock_wait() {
        let metrics = Arc::new(ConnectionMetrics::new());
        let target = memory_target(&metrics);
        let pinned = PinnedConnection::open(&target, PinnedPurpose::Shared, true)
            .await
            .unwrap();
        let tracked = TrackedConnection::pinned(&pinned);
        let _held = tracked.lease(&signal(), None).await.unwrap();

        let token = CancellationToken::new();
        let waiter = {
            let tracked = tracked.clone();
            let signal = CancelSignal::new(token.clone());
            tokio::spawn(async move { tracked.lease(&signal, None).await })
        };
        token.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn test_ephemeral_lease_counts_open() {
        let metrics = Arc::new(ConnectionMetrics::new());
        let target = memory_target(&metrics);
        let pool = target.build_pool(PoolAccess::ReadWrite).unwrap();
        let tracked = TrackedConnection::ephemeral(&pool, &metrics, true);
        assert_eq!(tracked.lock_kind(), LockKind::None);
        assert!(matches!(tracked.get_lock(), LockHandle::None));

        let mut lease = tracked.lease(&signal(), None).await.unwrap();
        assert_eq!(metrics.snapshot().open, 1);
        lease.execute_raw("SELECT 1", TIMEOUT).await.unwrap();
        drop(lease);
        assert_eq!(metrics.snapshot().open, 0);
    }

    #[tokio::test]
    async fn test_closed_pinned_connection_refuses_lease() {
        let metrics = Arc::new(ConnectionMetrics::new());
        let target = memory_target(&metrics);
        let pinned = PinnedConnection::open(&target, PinnedPurpose::Shared, true)
            .await
            .unwrap();
        pinned.close().await;
        pinned.close().await;

        let err = TrackedConnection::pinned(&pinned)
            .lease(&signal(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Closed));
        assert_eq!(metrics.snapshot().open, 0);
    }

    #[tokio::test]
    async fn test_refused_prepare_disables_the_pinned_connection() {
        let metrics = Arc::new(ConnectionMetrics::new());
        let target = memory_target(&metrics);
        let pinned = PinnedConnection::open(&target, PinnedPurpose::Shared, true)
            .await
            .unwrap();
        let tracked = TrackedConnection::pinned(&pinned);
        assert!(tracked.prepared_statements_enabled());

        let lease = tracked.lease(&signal(), None).await.unwrap();
        let refused = DbError::database(
            "prepared statement \"sqlx_s_1\" does not exist",
            Some("26000".to_string()),
            "",
        );
        lease.disable_prepared(&refused);
        lease.disable_prepared(&refused);
        assert!(!lease.prepared_statements_enabled());
        drop(lease);

        // the flag belongs to the physical connection, not the lease
        assert!(!tracked.prepared_statements_enabled());
        assert!(!TrackedConnection::pinned(&pinned).prepared_statements_enabled());
        let mut again = tracked.lease(&signal(), None).await.unwrap();
        assert!(!again.prepared_statements_enabled());
        let rows = again
            .fetch_all("SELECT ?", &[QueryParam::from(7i64)], TIMEOUT)
            .await
            .unwrap();
        assert_eq!(rows[0].try_get::<i64>(0).unwrap(), 7);
    }

    #[tokio::test]
    async fn test_close_gives_up_waiting_on_a_held_lease() {
        let metrics = Arc::new(ConnectionMetrics::new());
        let target = memory_target(&metrics);
        let pinned = PinnedConnection::open(&target, PinnedPurpose::Shared, true)
            .await
            .unwrap();
        let held = TrackedConnection::pinned(&pinned)
            .lease(&signal(), None)
            .await
            .unwrap();

        tokio::time::timeout(CLOSE_GRACE * 3, pinned.close())
            .await
            .expect("close waited on the held lease");
        assert_eq!(metrics.snapshot().open, 1);

        drop(held);
        tokio::time::timeout(TIMEOUT, async {
            while metrics.snapshot().open != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("deferred close never ran");
    }

    #[tokio::test]
    async fn test_cancel_signal_observes_any_token() {
        let primary = CancellationToken::new();
        let extra = CancellationToken::new();
        let signal = CancelSignal::new(primary).also(Some(&extra));
        assert!(!signal.is_cancelled());
        extra.cancel();
        assert!(signal.is_cancelled());
        signal.cancelled().await;
    }
}
