//! Statement containers: one SQL statement, its parameters and how to run it.
//!
//! A container is owned by the call that built it. Bound to the coordinator it
//! leases a connection per operation (the strategy decides which one); bound
//! to a transaction it runs under the transaction's operation lock.

use crate::db::coordinator::ConnectionCoordinator;
use crate::db::reader::LeasedReader;
use crate::db::row::DbRow;
use crate::db::transaction::TransactionScope;
use crate::error::{DbError, DbResult};
use crate::models::{ExecutionKind, MAX_QUERY_TIMEOUT_SECS, QueryParam};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
enum Target {
    Coordinator(ConnectionCoordinator),
    Transaction(TransactionScope),
}

#[derive(Debug, Clone)]
pub struct StatementContainer {
    target: Target,
    sql: String,
    params: Vec<QueryParam>,
    kind: Option<ExecutionKind>,
    timeout: Duration,
    cancel: Option<CancellationToken>,
    max_parameters: usize,
}

impl StatementContainer {
    pub(crate) fn for_coordinator(
        coordinator: ConnectionCoordinator,
        max_parameters: usize,
        timeout: Duration,
    ) -> Self {
        Self::new(Target::Coordinator(coordinator), max_parameters, timeout)
    }

    pub(crate) fn for_transaction(
        scope: TransactionScope,
        max_parameters: usize,
        timeout: Duration,
    ) -> Self {
        Self::new(Target::Transaction(scope), max_parameters, timeout)
    }

    fn new(target: Target, max_parameters: usize, timeout: Duration) -> Self {
        Self {
            target,
            sql: String::new(),
            params: Vec::new(),
            kind: None,
            timeout,
            cancel: None,
            max_parameters,
        }
    }

    pub fn sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = sql.into();
        self
    }

    pub fn bind(mut self, param: impl Into<QueryParam>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn bind_all<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<QueryParam>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    /// Route as a read or a write regardless of the operation used.
    ///
    /// Ignored inside a transaction, which keeps the kind it began with.
    pub fn kind(mut self, kind: ExecutionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Statement timeout, capped at the maximum allowed.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.min(Duration::from_secs(MAX_QUERY_TIMEOUT_SECS as u64));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn params(&self) -> &[QueryParam] {
        &self.params
    }

    /// Run the statement and return the number of affected rows.
    pub async fn execute(&self) -> DbResult<u64> {
        self.validate()?;
        match &self.target {
            Target::Coordinator(coordinator) => {
                let kind = self.kind.unwrap_or(ExecutionKind::Write);
                let signal = coordinator.signal(self.cancel.as_ref());
                let mut lease = coordinator.lease(kind, false, &signal).await?;
                tokio::select! {
                    biased;
                    _ = signal.cancelled() => Err(DbError::canceled("statement execution")),
                    result = lease.execute(&self.sql, &self.params, self.timeout) => result,
                }
            }
            Target::Transaction(scope) => {
                scope
                    .run_execute(&self.sql, &self.params, self.timeout, self.cancel.as_ref())
                    .await
            }
        }
    }

    /// Run the query and buffer every row.
    pub async fn fetch_all(&self) -> DbResult<Vec<DbRow>> {
        self.validate()?;
        match &self.target {
            Target::Coordinator(coordinator) => {
                let kind = self.kind.unwrap_or(ExecutionKind::Read);
                let signal = coordinator.signal(self.cancel.as_ref());
                let mut lease = coordinator.lease(kind, false, &signal).await?;
                tokio::select! {
                    biased;
                    _ = signal.cancelled() => Err(DbError::canceled("query execution")),
                    result = lease.fetch_all(&self.sql, &self.params, self.timeout) => result,
                }
            }
            Target::Transaction(scope) => {
                scope
                    .run_fetch_all(&self.sql, &self.params, self.timeout, self.cancel.as_ref())
                    .await
            }
        }
    }

    /// First row, if any. The rest of the cursor is discarded.
    pub async fn fetch_optional(&self) -> DbResult<Option<DbRow>> {
        let mut reader = self.read().await?;
        let row = reader.next().await;
        reader.dispose().await;
        row
    }

    /// Open a leased reader over the query.
    ///
    /// The reader holds its connection (and that connection's lock) until it
    /// is exhausted or disposed.
    pub async fn read(&self) -> DbResult<LeasedReader> {
        self.validate()?;
        match &self.target {
            Target::Coordinator(coordinator) => {
                let kind = self.kind.unwrap_or(ExecutionKind::Read);
                let signal = coordinator.signal(self.cancel.as_ref());
                let lease = coordinator.lease(kind, false, &signal).await?;
                LeasedReader::start(
                    lease,
                    self.sql.clone(),
                    self.params.clone(),
                    self.timeout,
                    signal,
                )
            }
            Target::Transaction(scope) => {
                scope
                    .run_read(
                        self.sql.clone(),
                        self.params.clone(),
                        self.timeout,
                        self.cancel.as_ref(),
                    )
                    .await
            }
        }
    }

    fn validate(&self) -> DbResult<()> {
        if self.sql.trim().is_empty() {
            return Err(DbError::invalid_input("SQL statement cannot be empty"));
        }
        if self.params.len() > self.max_parameters {
            return Err(DbError::invalid_input(format!(
                "Too many parameters: {} (limit {})",
                self.params.len(),
                self.max_parameters
            )));
        }
        Ok(())
    }
}
