//! Transaction scopes: one logical transaction on one leased connection.
//!
//! # Locking
//!
//! Two independent `tokio::sync::Mutex`es guard a scope:
//!
//! - The **operation lock** owns the lease. Every statement, savepoint and
//!   reader takes it, so nothing interleaves on the transaction's connection.
//!   A reader keeps it until it is exhausted or disposed.
//! - The **completion lock** is taken only by commit, rollback and dispose.
//!
//! Leaving `Active` is a single compare-and-swap on the state byte, done while
//! both locks are held. Whoever wins the swap runs `COMMIT`/`ROLLBACK`; everyone
//! else sees a terminal state and never touches the connection again.
//!
//! ```text
//! Active --commit--> Committed --+
//!   |                            +--dispose--> Disposed
//!   +----rollback--> RolledBack -+
//!   +-------------dispose-------------------> Disposed
//! ```

use crate::db::dialect::begin_statements;
use crate::db::isolation::IsolationLevel;
use crate::db::reader::LeasedReader;
use crate::db::row::DbRow;
use crate::db::statement::StatementContainer;
use crate::db::tracked::{CancelSignal, ConnectionLease, TrackedConnection, lock_within};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionRole, DriverKind, ExecutionKind, LockKind, QueryParam, TransactionState};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_SAVEPOINT_NAME_LEN: usize = 63;

/// Settings fixed when a transaction begins.
#[derive(Debug, Clone)]
pub(crate) struct ScopeSettings {
    pub kind: ExecutionKind,
    pub isolation: IsolationLevel,
    pub degraded: bool,
    pub max_parameters: usize,
    pub query_timeout: Duration,
    pub lock_timeout: Option<Duration>,
    /// Token of the owning coordinator; the scope's own token is its child.
    pub coordinator: CancellationToken,
    pub caller: Option<CancellationToken>,
}

type OperationGuard = OwnedMutexGuard<Option<ConnectionLease>>;

struct ScopeInner {
    id: String,
    kind: ExecutionKind,
    isolation: IsolationLevel,
    degraded: bool,
    started_at: DateTime<Utc>,
    connection_id: u64,
    role: ConnectionRole,
    driver: DriverKind,
    max_parameters: usize,
    query_timeout: Duration,
    lock_timeout: Option<Duration>,
    state: AtomicU8,
    operation: Arc<Mutex<Option<ConnectionLease>>>,
    completion: Mutex<()>,
    token: CancellationToken,
    signal: CancelSignal,
}

impl ScopeInner {
    fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// A unit of work. Cheap to clone; all clones share one transaction.
///
/// Call [`commit`](Self::commit) or [`rollback`](Self::rollback), then
/// [`dispose`](Self::dispose). A scope dropped while still active is rolled
/// back in the background.
#[derive(Clone)]
pub struct TransactionScope {
    inner: Arc<ScopeInner>,
}

impl std::fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("isolation", &self.inner.isolation)
            .field("connection_id", &self.inner.connection_id)
            .finish()
    }
}

impl TransactionScope {
    /// Lease `tracked` and open a transaction on it.
    pub(crate) async fn begin(
        tracked: TrackedConnection,
        settings: ScopeSettings,
    ) -> DbResult<Self> {
        let token = settings.coordinator.child_token();
        let signal = CancelSignal::new(token.clone()).also(settings.caller.as_ref());
        let mut lease = tracked.lease(&signal, settings.lock_timeout).await?;

        let id = format!("tx_{}", uuid::Uuid::new_v4().simple());
        let statements = begin_statements(tracked.driver(), settings.isolation, settings.kind);
        let begun = tokio::select! {
            biased;
            _ = signal.cancelled() => Err(DbError::canceled("transaction begin")),
            result = run_all(&mut lease, &statements, settings.query_timeout) => result,
        };
        if let Err(e) = begun {
            // the connection may be half-way into BEGIN
            let _ = lease.execute_raw("ROLLBACK", settings.query_timeout).await;
            lease.discard().await;
            return Err(e);
        }

        info!(
            transaction_id = %id,
            connection_id = tracked.id(),
            role = ?tracked.role(),
            isolation = %settings.isolation,
            degraded = settings.degraded,
            kind = %settings.kind,
            "Transaction started"
        );

        Ok(Self {
            inner: Arc::new(ScopeInner {
                id,
                kind: settings.kind,
                isolation: settings.isolation,
                degraded: settings.degraded,
                started_at: Utc::now(),
                connection_id: tracked.id(),
                role: tracked.role(),
                driver: tracked.driver(),
                max_parameters: settings.max_parameters,
                query_timeout: settings.query_timeout,
                lock_timeout: settings.lock_timeout,
                state: AtomicU8::new(TransactionState::Active as u8),
                operation: Arc::new(Mutex::new(Some(lease))),
                completion: Mutex::new(()),
                token,
                signal,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> TransactionState {
        self.inner.state()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.inner.isolation
    }

    /// The requested isolation profile was unavailable and a safer level was used.
    pub fn degraded(&self) -> bool {
        self.inner.degraded
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn connection_id(&self) -> u64 {
        self.inner.connection_id
    }

    pub fn connection_role(&self) -> ConnectionRole {
        self.inner.role
    }

    /// Lock kind of the underlying connection (the operation lock is always real).
    pub fn lock_kind(&self) -> LockKind {
        self.inner.role.lock_kind()
    }

    pub fn execution_kind(&self) -> ExecutionKind {
        self.inner.kind
    }

    pub fn driver(&self) -> DriverKind {
        self.inner.driver
    }

    /// A statement container bound to this transaction.
    pub fn statement(&self) -> StatementContainer {
        StatementContainer::for_transaction(
            self.clone(),
            self.inner.max_parameters,
            self.inner.query_timeout,
        )
    }

    /// Run one unparameterized statement inside the transaction.
    pub async fn execute(&self, sql: &str) -> DbResult<u64> {
        self.run_execute(sql, &[], self.inner.query_timeout, None)
            .await
    }

    pub async fn savepoint(&self, name: &str) -> DbResult<()> {
        let name = validate_savepoint_name(name)?;
        self.run_control(&format!("SAVEPOINT {}", name)).await
    }

    pub async fn rollback_to_savepoint(&self, name: &str) -> DbResult<()> {
        let name = validate_savepoint_name(name)?;
        self.run_control(&format!("ROLLBACK TO SAVEPOINT {}", name))
            .await
    }

    pub async fn release_savepoint(&self, name: &str) -> DbResult<()> {
        let name = validate_savepoint_name(name)?;
        self.run_control(&format!("RELEASE SAVEPOINT {}", name))
            .await
    }

    pub async fn commit(&self) -> DbResult<()> {
        self.complete(TransactionState::Committed).await
    }

    pub async fn rollback(&self) -> DbResult<()> {
        self.complete(TransactionState::RolledBack).await
    }

    /// End the scope and release its connection. Never fails; idempotent.
    ///
    /// An active transaction is rolled back. In-flight operations and readers
    /// of this transaction are cancelled first.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        inner.token.cancel();

        let _completion = inner.completion.lock().await;
        let previous = TransactionState::from_u8(
            inner
                .state
                .swap(TransactionState::Disposed as u8, Ordering::AcqRel),
        );
        if previous == TransactionState::Disposed {
            return;
        }

        let mut guard = inner.operation.lock().await;
        if let Some(lease) = guard.take() {
            roll_back_quietly(&inner.id, lease, inner.query_timeout).await;
        }
        debug!(transaction_id = %inner.id, previous = %previous, "Transaction disposed");
    }

    pub(crate) async fn run_execute(
        &self,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
        caller: Option<&CancellationToken>,
    ) -> DbResult<u64> {
        let signal = self.inner.signal.clone().also(caller);
        let mut guard = self.operation(&signal, "transaction statement").await?;
        let lease = lease_of(&mut guard)?;
        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(DbError::canceled("transaction statement")),
            result = lease.execute(sql, params, query_timeout) => result,
        }
    }

    pub(crate) async fn run_fetch_all(
        &self,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
        caller: Option<&CancellationToken>,
    ) -> DbResult<Vec<DbRow>> {
        let signal = self.inner.signal.clone().also(caller);
        let mut guard = self.operation(&signal, "transaction query").await?;
        let lease = lease_of(&mut guard)?;
        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(DbError::canceled("transaction query")),
            result = lease.fetch_all(sql, params, query_timeout) => result,
        }
    }

    /// Open a reader that holds the operation lock until it ends.
    pub(crate) async fn run_read(
        &self,
        sql: String,
        params: Vec<QueryParam>,
        row_timeout: Duration,
        caller: Option<&CancellationToken>,
    ) -> DbResult<LeasedReader> {
        let signal = self.inner.signal.clone().also(caller);
        let guard = self.operation(&signal, "transaction reader").await?;
        LeasedReader::start(guard, sql, params, row_timeout, signal)
    }

    async fn run_control(&self, sql: &str) -> DbResult<()> {
        let signal = self.inner.signal.clone();
        let mut guard = self.operation(&signal, "transaction savepoint").await?;
        let lease = lease_of(&mut guard)?;
        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(DbError::canceled("transaction savepoint")),
            result = lease.execute_raw(sql, self.inner.query_timeout) => result,
        }
    }

    /// Take the operation lock of an active transaction.
    async fn operation(&self, signal: &CancelSignal, what: &str) -> DbResult<OperationGuard> {
        let inner = &self.inner;
        self.ensure_active()?;
        let guard = lock_within(
            Arc::clone(&inner.operation),
            signal,
            inner.lock_timeout,
            what,
        )
        .await?;
        // completion may have won while we waited
        self.ensure_active()?;
        if guard.is_none() {
            return Err(DbError::transaction_not_active(&inner.id, self.state()));
        }
        Ok(guard)
    }

    fn ensure_active(&self) -> DbResult<()> {
        let state = self.state();
        if state.is_active() {
            Ok(())
        } else {
            Err(DbError::transaction_not_active(&self.inner.id, state))
        }
    }

    async fn complete(&self, target: TransactionState) -> DbResult<()> {
        let inner = &self.inner;
        let _completion = inner.completion.lock().await;
        self.ensure_active()?;

        // a cancelled wait here leaves the transaction active
        let mut guard = lock_within(
            Arc::clone(&inner.operation),
            &inner.signal,
            inner.lock_timeout,
            "transaction completion",
        )
        .await?;

        if let Err(current) = inner.state.compare_exchange(
            TransactionState::Active as u8,
            target as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(DbError::transaction_not_active(
                &inner.id,
                TransactionState::from_u8(current),
            ));
        }

        let Some(mut lease) = guard.take() else {
            return Err(DbError::internal(format!(
                "transaction {} lost its connection",
                inner.id
            )));
        };
        drop(guard);

        let statement = match target {
            TransactionState::Committed => "COMMIT",
            _ => "ROLLBACK",
        };
        match lease.execute_raw(statement, inner.query_timeout).await {
            Ok(()) => {
                info!(transaction_id = %inner.id, state = %target, "Transaction completed");
                Ok(())
            }
            Err(e) if target == TransactionState::Committed => {
                warn!(transaction_id = %inner.id, error = %e, "Commit failed; rolling back");
                inner
                    .state
                    .store(TransactionState::RolledBack as u8, Ordering::Release);
                roll_back_quietly(&inner.id, lease, inner.query_timeout).await;
                Err(DbError::transaction(format!("Commit failed: {}", e), &inner.id))
            }
            Err(e) => {
                warn!(transaction_id = %inner.id, error = %e, "Rollback failed");
                lease.discard().await;
                Err(e)
            }
        }
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        if TransactionState::from_u8(*self.state.get_mut()) != TransactionState::Active {
            return;
        }
        self.token.cancel();

        let id = self.id.clone();
        let operation = Arc::clone(&self.operation);
        let query_timeout = self.query_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let lease = operation.lock().await.take();
                    if let Some(lease) = lease {
                        roll_back_quietly(&id, lease, query_timeout).await;
                    }
                    warn!(
                        transaction_id = %id,
                        "Transaction rolled back via Drop - consider calling dispose()"
                    );
                });
            }
            Err(_) => {
                warn!(
                    transaction_id = %id,
                    "Transaction dropped outside a runtime; connection released without rollback"
                );
            }
        }
    }
}

async fn run_all(
    lease: &mut ConnectionLease,
    statements: &[String],
    query_timeout: Duration,
) -> DbResult<()> {
    for statement in statements {
        lease.execute_raw(statement, query_timeout).await?;
    }
    Ok(())
}

fn lease_of(guard: &mut OperationGuard) -> DbResult<&mut ConnectionLease> {
    (**guard)
        .as_mut()
        .ok_or_else(|| DbError::internal("transaction connection already released"))
}

/// Best-effort rollback; a connection that refuses it is not reused.
async fn roll_back_quietly(id: &str, mut lease: ConnectionLease, query_timeout: Duration) {
    if let Err(e) = lease.execute_raw("ROLLBACK", query_timeout).await {
        warn!(transaction_id = %id, error = %e, "Rollback failed; discarding connection");
        lease.discard().await;
    }
}

fn validate_savepoint_name(name: &str) -> DbResult<&str> {
    let mut chars = name.chars();
    let starts_well = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if starts_well && rest_ok && name.len() <= MAX_SAVEPOINT_NAME_LEN {
        Ok(name)
    } else {
        Err(DbError::invalid_input(format!(
            "Invalid savepoint name '{}': use letters, digits and '_' (max {} chars)",
            name, MAX_SAVEPOINT_NAME_LEN
        )))
    }
}
