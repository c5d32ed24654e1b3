//! Lock-free connection metrics.
//!
//! # Design
//!
//! - Every counter is an atomic; no mutex guards any of them.
//! - `open` saturates at zero on decrement so a double release cannot wrap.
//! - Each change publishes a [`MetricsSnapshot`] on a broadcast channel. Publishing
//!   never holds a lock, but subscribers must not call back into the coordinator
//!   synchronously while holding a lock of their own.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Physical connections currently held: pinned ones plus ephemeral leases.
    pub open: usize,
    /// Physical connections opened since the coordinator started.
    pub total_created: u64,
    /// Hand-outs of an already open connection (idle pool reuse or pinned lease).
    pub total_reused: u64,
    /// Failed opens or acquires.
    pub total_failures: u64,
}

#[derive(Debug)]
pub struct ConnectionMetrics {
    open: AtomicUsize,
    total_created: AtomicU64,
    total_reused: AtomicU64,
    total_failures: AtomicU64,
    next_id: AtomicU64,
    events: broadcast::Sender<MetricsSnapshot>,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            open: AtomicUsize::new(0),
            total_created: AtomicU64::new(0),
            total_reused: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    /// Allocate a process-unique identity for a tracked connection.
    pub fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn record_opened(&self) {
        self.open.fetch_add(1, Ordering::AcqRel);
        self.publish();
    }

    pub fn record_closed(&self) {
        // Use fetch_update to saturate at 0
        let _ = self
            .open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });
        self.publish();
    }

    pub fn record_created(&self) {
        self.total_created.fetch_add(1, Ordering::AcqRel);
        self.publish();
    }

    pub fn record_reused(&self) {
        self.total_reused.fetch_add(1, Ordering::AcqRel);
        self.publish();
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::AcqRel);
        self.publish();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            open: self.open.load(Ordering::Acquire),
            total_created: self.total_created.load(Ordering::Acquire),
            total_reused: self.total_reused.load(Ordering::Acquire),
            total_failures: self.total_failures.load(Ordering::Acquire),
        }
    }

    /// Receive a snapshot after every counter change.
    ///
    /// Slow receivers skip intermediate snapshots (`RecvError::Lagged`).
    pub fn subscribe(&self) -> broadcast::Receiver<MetricsSnapshot> {
        self.events.subscribe()
    }

    fn publish(&self) {
        // no subscribers is not an error
        let _ = self.events.send(self.snapshot());
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}
