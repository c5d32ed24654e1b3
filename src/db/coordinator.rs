//! The connection coordinator: the long-lived façade for one database target.
//!
//! # Design
//!
//! - The mode is resolved once, in [`ConnectionCoordinator::with_config`], and
//!   the matching [`ConnectionStrategy`] is built right after. Neither changes
//!   for the coordinator's lifetime.
//! - The coordinator holds no lock. Its fields are immutable after
//!   construction except the [`ConnectionMetrics`] atomics and the `closed`
//!   flag. Mutual exclusion lives on the pinned connections themselves.
//! - Metrics snapshots go out on a broadcast channel without any lock held.
//!   A subscriber that calls back into the coordinator while holding a lock
//!   of its own can deadlock; the coordinator does not guard against it.

use crate::config::CoordinatorConfig;
use crate::db::dialect::{
    ConnectionShape, Dialect, ProductIdentity, detect_product, session_preamble,
};
use crate::db::isolation::{IsolationLevel, IsolationProfile, IsolationResolver};
use crate::db::metrics::{ConnectionMetrics, MetricsSnapshot};
use crate::db::mode::{self, ModeResolution};
use crate::db::pool::ConnectTarget;
use crate::db::statement::StatementContainer;
use crate::db::strategy::ConnectionStrategy;
use crate::db::tracked::{CancelSignal, ConnectionLease, TrackedConnection};
use crate::db::transaction::{ScopeSettings, TransactionScope};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionMode, DatabaseProduct, ExecutionKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct CoordinatorInner {
    config: CoordinatorConfig,
    identity: ProductIdentity,
    dialect: Dialect,
    resolution: ModeResolution,
    isolation: IsolationResolver,
    strategy: ConnectionStrategy,
    metrics: Arc<ConnectionMetrics>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

/// Cheap to clone; every clone drives the same strategy and metrics.
#[derive(Clone)]
pub struct ConnectionCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for ConnectionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCoordinator")
            .field("product", &self.inner.identity.product)
            .field("mode", &self.inner.strategy.mode())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionCoordinator {
    /// Connect using a URL that may carry coordinator options.
    pub async fn connect(connection_string: &str) -> DbResult<Self> {
        let config = CoordinatorConfig::parse(connection_string).map_err(DbError::invalid_input)?;
        Self::with_config(config).await
    }

    pub async fn with_config(config: CoordinatorConfig) -> DbResult<Self> {
        config
            .pool_options
            .validate()
            .map_err(DbError::invalid_input)?;

        let product = config.product;
        let metrics = Arc::new(ConnectionMetrics::new());
        let target = ConnectTarget::new(
            config.connection_string.clone(),
            product,
            config.pool_options.clone(),
            session_preamble(product),
            Arc::clone(&metrics),
        )?;

        let shape = ConnectionShape::classify(product, &config.connection_string);
        let resolution = mode::resolve(config.mode, product, &shape);
        resolution.report(product);

        let scheme_dialect = Dialect::for_product(product);
        let strategy = ConnectionStrategy::build(
            resolution.resolved,
            &target,
            scheme_dialect.supports_prepared_statements,
        )
        .await
        .map_err(DbError::into_startup)?;

        let cancel = CancellationToken::new();
        let (identity, dialect) = match identify_product(&strategy, &config, &cancel).await {
            Ok(identity) => {
                let dialect = Dialect::for_product(identity.product);
                (identity, dialect)
            }
            Err(e) => {
                warn!(
                    product = %product,
                    error = %e,
                    "Product detection failed; using the SQL-92 capability profile"
                );
                (ProductIdentity::from_scheme(product), Dialect::sql92())
            }
        };

        let isolation =
            IsolationResolver::new(identity.product, config.isolation, dialect.default_isolation);

        info!(
            product = %identity.product,
            version = ?identity.version,
            mode = %resolution.resolved,
            max_parameters = dialect.max_parameters,
            "Connection coordinator ready"
        );

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                config,
                identity,
                dialect,
                resolution,
                isolation,
                strategy,
                metrics,
                cancel,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn mode(&self) -> ConnectionMode {
        self.inner.strategy.mode()
    }

    pub fn resolution(&self) -> &ModeResolution {
        &self.inner.resolution
    }

    pub fn product(&self) -> DatabaseProduct {
        self.inner.identity.product
    }

    pub fn identity(&self) -> &ProductIdentity {
        &self.inner.identity
    }

    pub fn dialect(&self) -> &Dialect {
        &self.inner.dialect
    }

    pub fn isolation(&self) -> &IsolationResolver {
        &self.inner.isolation
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn create_statement_container(&self) -> StatementContainer {
        StatementContainer::for_coordinator(
            self.clone(),
            self.inner.dialect.max_parameters,
            self.inner.config.query_timeout(),
        )
    }

    /// Begin a transaction at the level `profile` resolves to.
    ///
    /// Without a profile the product's default level is used.
    pub async fn begin_transaction(
        &self,
        profile: Option<IsolationProfile>,
        kind: ExecutionKind,
    ) -> DbResult<TransactionScope> {
        self.begin_with(profile, kind, None).await
    }

    /// Like [`begin_transaction`](Self::begin_transaction), cancellable through `token`.
    ///
    /// The token stays attached to the scope: cancelling it later interrupts
    /// whatever the transaction is waiting on.
    pub async fn begin_transaction_with_cancel(
        &self,
        profile: Option<IsolationProfile>,
        kind: ExecutionKind,
        token: &CancellationToken,
    ) -> DbResult<TransactionScope> {
        self.begin_with(profile, kind, Some(token)).await
    }

    /// Begin at an explicit level; a level the product cannot run is rejected.
    pub async fn begin_transaction_with_level(
        &self,
        level: IsolationLevel,
        kind: ExecutionKind,
    ) -> DbResult<TransactionScope> {
        let level = self.inner.isolation.validate(level)?;
        self.begin_at(level, false, kind, None).await
    }

    /// The strategy's routing decision for one request. Nothing is opened.
    pub fn acquire(&self, kind: ExecutionKind, transactional: bool) -> DbResult<TrackedConnection> {
        self.ensure_open()?;
        Ok(self.inner.strategy.acquire(kind, transactional))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Snapshots published after every counter change.
    pub fn subscribe_metrics(&self) -> broadcast::Receiver<MetricsSnapshot> {
        self.inner.metrics.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Cancel pending waits, then close pinned connections and pools.
    ///
    /// Idempotent. Waits a short grace period for pinned leases to come back;
    /// a connection still held by an undisposed transaction or reader after that
    /// is closed in the background once the caller releases it.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.strategy.close().await;
        info!(
            product = %self.inner.identity.product,
            mode = %self.mode(),
            "Connection coordinator closed"
        );
    }

    pub(crate) fn signal(&self, caller: Option<&CancellationToken>) -> CancelSignal {
        CancelSignal::new(self.inner.cancel.clone()).also(caller)
    }

    /// Route and lease a connection for a single operation.
    pub(crate) async fn lease(
        &self,
        kind: ExecutionKind,
        transactional: bool,
        signal: &CancelSignal,
    ) -> DbResult<ConnectionLease> {
        let tracked = self.acquire(kind, transactional)?;
        let leased = tracked.lease(signal, self.inner.config.lock_timeout()).await;
        self.closed_if_shut(leased)
    }

    async fn begin_with(
        &self,
        profile: Option<IsolationProfile>,
        kind: ExecutionKind,
        caller: Option<&CancellationToken>,
    ) -> DbResult<TransactionScope> {
        let resolved = self.inner.isolation.resolve(profile.unwrap_or_default());
        self.begin_at(resolved.level, resolved.degraded, kind, caller)
            .await
    }

    async fn begin_at(
        &self,
        isolation: IsolationLevel,
        degraded: bool,
        kind: ExecutionKind,
        caller: Option<&CancellationToken>,
    ) -> DbResult<TransactionScope> {
        let tracked = self.acquire(kind, true)?;
        let settings = ScopeSettings {
            kind,
            isolation,
            degraded,
            max_parameters: self.inner.dialect.max_parameters,
            query_timeout: self.inner.config.query_timeout(),
            lock_timeout: self.inner.config.lock_timeout(),
            coordinator: self.inner.cancel.clone(),
            caller: caller.cloned(),
        };
        let scope = TransactionScope::begin(tracked, settings).await;
        self.closed_if_shut(scope)
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.is_closed() {
            Err(DbError::Closed)
        } else {
            Ok(())
        }
    }

    /// A wait interrupted by `close()` reports `Closed`, not cancellation.
    fn closed_if_shut<T>(&self, result: DbResult<T>) -> DbResult<T> {
        match result {
            Err(e) if e.is_canceled() && self.is_closed() => Err(DbError::Closed),
            other => other,
        }
    }
}

/// Identify the product over a short-lived read lease.
async fn identify_product(
    strategy: &ConnectionStrategy,
    config: &CoordinatorConfig,
    cancel: &CancellationToken,
) -> DbResult<ProductIdentity> {
    let signal = CancelSignal::new(cancel.clone());
    let mut lease = strategy
        .acquire(ExecutionKind::Read, false)
        .lease(&signal, config.lock_timeout())
        .await?;
    detect_product(lease.connection_mut()?, config.product).await
}
