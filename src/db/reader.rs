//! Leased readers: a forward-only cursor that owns its connection's lock.
//!
//! # Lifecycle
//!
//! ```text
//! Created --next()--> Reading --next() = None--> Exhausted
//!    |                   |
//!    +-----dispose()-----+-------------------> Disposed
//! ```
//!
//! A background task owns the lease (and with it the lock of a pinned
//! connection or a transaction's operation lock) and pumps rows through a
//! one-slot channel. When the cursor ends the task sends an end marker and
//! keeps the lease until the reader closes its side. `next()` closes the
//! channel and joins the task before returning `None`, so by the time a caller
//! observes exhaustion the lock is already free.
//!
//! While the reader is alive every other operation on a pinned connection
//! waits behind it.

use crate::db::executor::PumpEnd;
use crate::db::row::DbRow;
use crate::db::tracked::{CancelSignal, LeaseTarget};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionRole, LockKind, QueryParam};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Created,
    Reading,
    /// The cursor ended and everything was released.
    Exhausted,
    Disposed,
}

pub struct LeasedReader {
    connection_id: u64,
    role: ConnectionRole,
    state: ReaderState,
    rows: mpsc::Receiver<DbResult<Option<DbRow>>>,
    task: Option<JoinHandle<()>>,
    signal: CancelSignal,
}

impl std::fmt::Debug for LeasedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedReader")
            .field("connection_id", &self.connection_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .finish()
    }
}

impl LeasedReader {
    /// Start streaming `sql` over the connection held by `target`.
    ///
    /// `row_timeout` bounds the wait for each row.
    pub(crate) fn start<T: LeaseTarget>(
        mut target: T,
        sql: String,
        params: Vec<QueryParam>,
        row_timeout: Duration,
        signal: CancelSignal,
    ) -> DbResult<Self> {
        let (connection_id, role) = {
            let lease = target.lease_mut()?;
            (lease.id(), lease.role())
        };
        let (tx, rx) = mpsc::channel(1);
        let task_signal = signal.clone();

        let task = tokio::spawn(async move {
            let last = match target.lease_mut() {
                Err(e) => Some(Err(e)),
                Ok(lease) => {
                    let end = tokio::select! {
                        biased;
                        _ = task_signal.cancelled() => PumpEnd::Failed {
                            error: DbError::canceled("leased reader"),
                            rows_sent: 0,
                        },
                        end = lease.pump(&sql, &params, row_timeout, &tx) => end,
                    };
                    match end {
                        PumpEnd::Exhausted => Some(Ok(None)),
                        PumpEnd::Abandoned => None,
                        PumpEnd::Failed { error, .. } => Some(Err(error)),
                    }
                }
            };

            // hold the lease until the reader has seen the end, unless cancelled
            if let Some(last) = last {
                let delivered = tokio::select! {
                    biased;
                    _ = task_signal.cancelled() => false,
                    sent = tx.send(last) => sent.is_ok(),
                };
                if delivered {
                    tokio::select! {
                        _ = task_signal.cancelled() => {}
                        _ = tx.closed() => {}
                    }
                }
            }
            drop(target);
            debug!(connection_id = connection_id, "Reader released its connection");
        });

        debug!(connection_id = connection_id, role = ?role, "Leased reader started");

        Ok(Self {
            connection_id,
            role,
            state: ReaderState::Created,
            rows: rx,
            task: Some(task),
            signal,
        })
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn lock_kind(&self) -> LockKind {
        self.role.lock_kind()
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Advance the cursor.
    ///
    /// `Ok(None)` means exhausted: the connection and its lock have been released.
    pub async fn next(&mut self) -> DbResult<Option<DbRow>> {
        match self.state {
            ReaderState::Exhausted | ReaderState::Disposed => return Ok(None),
            ReaderState::Created => self.state = ReaderState::Reading,
            ReaderState::Reading => {}
        }

        let item = tokio::select! {
            biased;
            _ = self.signal.cancelled() => None,
            item = self.rows.recv() => Some(item),
        };

        match item {
            None => {
                self.dispose().await;
                Err(DbError::canceled("reader advance"))
            }
            Some(Some(Ok(Some(row)))) => Ok(Some(row)),
            Some(Some(Ok(None))) | Some(None) => {
                self.state = ReaderState::Exhausted;
                self.release().await;
                Ok(None)
            }
            Some(Some(Err(e))) => {
                self.dispose().await;
                Err(e)
            }
        }
    }

    /// Read every remaining row.
    pub async fn collect(mut self) -> DbResult<Vec<DbRow>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Release the cursor, connection and lock. Idempotent.
    pub async fn dispose(&mut self) {
        if self.state == ReaderState::Disposed {
            return;
        }
        self.state = ReaderState::Disposed;
        self.release().await;
    }

    async fn release(&mut self) {
        self.rows.close();
        let Some(task) = self.task.take() else {
            return;
        };
        if let Err(e) = task.await {
            warn!(connection_id = self.connection_id, error = %e, "Reader task failed");
        }
    }
}
