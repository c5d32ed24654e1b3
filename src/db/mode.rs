//! Connection-mode resolution.
//!
//! [`resolve`] is a pure function of the requested mode, the product and the
//! connection-string shape. Forced coercions exist for correctness; mismatches
//! leave the request intact and only warn.

use crate::db::dialect::{ConnectionShape, Storage, requires_keep_alive};
use crate::models::{ConnectionMode, DatabaseProduct, ModeRequest};
use serde::Serialize;
use tracing::{info, warn};

/// Why a requested mode was overridden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoercionReason {
    /// Each physical connection to an in-memory engine is its own database.
    MemoryIsolatedPerConnection,
    /// The engine locks its file for exclusive use by one connection.
    EmbeddedExclusiveFileLock,
    /// The file engine allows one writer alongside concurrent WAL readers.
    SingleWriterWal,
    /// The local instance unloads when its last connection closes.
    KeepAliveRequired,
}

impl CoercionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MemoryIsolatedPerConnection => "memory-isolated-per-connection",
            Self::EmbeddedExclusiveFileLock => "embedded-exclusive-file-lock",
            Self::SingleWriterWal => "single-writer-wal",
            Self::KeepAliveRequired => "keep-alive-required",
        }
    }
}

impl std::fmt::Display for CoercionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an honored request is still worth a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MismatchReason {
    /// A persistent mode on a network server serializes work that could run in parallel.
    SuboptimalConcurrency,
}

impl MismatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SuboptimalConcurrency => "suboptimal-concurrency",
        }
    }
}

impl std::fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Honored,
    Coerced(CoercionReason),
    Mismatch(MismatchReason),
}

/// Result of mode resolution for one coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModeResolution {
    pub requested: ModeRequest,
    pub resolved: ConnectionMode,
    pub outcome: ResolutionOutcome,
}

impl ModeResolution {
    fn honored(requested: ModeRequest, resolved: ConnectionMode) -> Self {
        Self {
            requested,
            resolved,
            outcome: ResolutionOutcome::Honored,
        }
    }

    /// A correctness-forced mode. Carries a reason whenever the request differs.
    fn forced(requested: ModeRequest, resolved: ConnectionMode, reason: CoercionReason) -> Self {
        let outcome = if requested.is(resolved) {
            ResolutionOutcome::Honored
        } else {
            ResolutionOutcome::Coerced(reason)
        };
        Self {
            requested,
            resolved,
            outcome,
        }
    }

    pub fn coercion_reason(&self) -> Option<CoercionReason> {
        match self.outcome {
            ResolutionOutcome::Coerced(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_coerced(&self) -> bool {
        self.coercion_reason().is_some()
    }

    pub fn is_mismatch(&self) -> bool {
        matches!(self.outcome, ResolutionOutcome::Mismatch(_))
    }

    /// The reason string attached to the resolution, if any.
    pub fn reason(&self) -> Option<&'static str> {
        match self.outcome {
            ResolutionOutcome::Honored => None,
            ResolutionOutcome::Coerced(reason) => Some(reason.as_str()),
            ResolutionOutcome::Mismatch(reason) => Some(reason.as_str()),
        }
    }

    /// Emit the structured log event for a coercion or mismatch.
    ///
    /// Never fails. A `Best` hint that lands on a forced mode is informational.
    pub fn report(&self, product: DatabaseProduct) {
        match self.outcome {
            ResolutionOutcome::Honored => {}
            ResolutionOutcome::Coerced(reason) if self.requested == ModeRequest::Best => {
                info!(
                    requested = %self.requested,
                    resolved = %self.resolved,
                    reason = %reason,
                    product = %product,
                    "mode override: requested={}, resolved={}, reason={}",
                    self.requested,
                    self.resolved,
                    reason
                );
            }
            ResolutionOutcome::Coerced(reason) => {
                warn!(
                    requested = %self.requested,
                    resolved = %self.resolved,
                    reason = %reason,
                    product = %product,
                    "mode override: requested={}, resolved={}, reason={}",
                    self.requested,
                    self.resolved,
                    reason
                );
            }
            ResolutionOutcome::Mismatch(reason) => {
                warn!(
                    requested = %self.requested,
                    resolved = %self.resolved,
                    reason = %reason,
                    product = %product,
                    "mode mismatch: requested={}, resolved={}, reason={}",
                    self.requested,
                    self.resolved,
                    reason
                );
            }
        }
    }
}

/// Decide the connection mode for a coordinator.
///
/// Rules are evaluated in order; the first that applies wins.
pub fn resolve(
    requested: ModeRequest,
    product: DatabaseProduct,
    shape: &ConnectionShape,
) -> ModeResolution {
    if shape.storage == Storage::InMemory {
        return ModeResolution::forced(
            requested,
            ConnectionMode::SingleConnection,
            CoercionReason::MemoryIsolatedPerConnection,
        );
    }

    if shape.exclusive_lock {
        return ModeResolution::forced(
            requested,
            ConnectionMode::SingleConnection,
            CoercionReason::EmbeddedExclusiveFileLock,
        );
    }

    if requires_keep_alive(product) {
        return ModeResolution::forced(
            requested,
            ConnectionMode::KeepAlive,
            CoercionReason::KeepAliveRequired,
        );
    }

    if shape.storage == Storage::File {
        return match requested {
            ModeRequest::Best => ModeResolution::honored(requested, ConnectionMode::SingleWriter),
            ModeRequest::Standard | ModeRequest::KeepAlive => ModeResolution::forced(
                requested,
                ConnectionMode::SingleWriter,
                CoercionReason::SingleWriterWal,
            ),
            ModeRequest::SingleWriter => {
                ModeResolution::honored(requested, ConnectionMode::SingleWriter)
            }
            ModeRequest::SingleConnection => {
                ModeResolution::honored(requested, ConnectionMode::SingleConnection)
            }
        };
    }

    if product.is_network_server() {
        return match requested.as_mode() {
            None | Some(ConnectionMode::Standard) => {
                ModeResolution::honored(requested, ConnectionMode::Standard)
            }
            // Persistent modes are allowed on servers; only advise.
            Some(mode) => ModeResolution {
                requested,
                resolved: mode,
                outcome: ResolutionOutcome::Mismatch(MismatchReason::SuboptimalConcurrency),
            },
        };
    }

    ModeResolution::honored(
        requested,
        requested.as_mode().unwrap_or(ConnectionMode::Standard),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_REQUESTS: [ModeRequest; 5] = [
        ModeRequest::Best,
        ModeRequest::Standard,
        ModeRequest::KeepAlive,
        ModeRequest::SingleWriter,
        ModeRequest::SingleConnection,
    ];

    #[test]
    fn test_memory_always_single_connection() {
        for requested in ALL_REQUESTS {
            let r = resolve(requested, DatabaseProduct::Sqlite, &ConnectionShape::in_memory());
            assert_eq!(r.resolved, ConnectionMode::SingleConnection);
            if requested != ModeRequest::SingleConnection {
                assert_eq!(
                    r.coercion_reason(),
                    Some(CoercionReason::MemoryIsolatedPerConnection)
                );
            }
        }
    }

    #[test]
    fn test_best_memory_reports_reason() {
        let r = resolve(
            ModeRequest::Best,
            DatabaseProduct::Sqlite,
            &ConnectionShape::in_memory(),
        );
        assert_eq!(r.reason(), Some("memory-isolated-per-connection"));
    }

    #[test]
    fn test_file_engine_best_is_single_writer() {
        let r = resolve(ModeRequest::Best, DatabaseProduct::Sqlite, &ConnectionShape::file());
        assert_eq!(r.resolved, ConnectionMode::SingleWriter);
        assert!(!r.is_coerced());
    }

    #[test]
    fn test_file_engine_coerces_pooled_requests() {
        for requested in [ModeRequest::Standard, ModeRequest::KeepAlive] {
            let r = resolve(requested, DatabaseProduct::Sqlite, &ConnectionShape::file());
            assert_eq!(r.resolved, ConnectionMode::SingleWriter);
            assert_eq!(r.coercion_reason(), Some(CoercionReason::SingleWriterWal));
        }
    }

    #[test]
    fn test_network_persistent_is_mismatch_not_coercion() {
        let r = resolve(
            ModeRequest::SingleConnection,
            DatabaseProduct::PostgreSql,
            &ConnectionShape::network(),
        );
        assert_eq!(r.resolved, ConnectionMode::SingleConnection);
        assert!(r.is_mismatch());
        assert!(!r.is_coerced());
        assert_eq!(r.reason(), Some("suboptimal-concurrency"));
    }

    #[test]
    fn test_unknown_product_defaults_to_standard() {
        let r = resolve(
            ModeRequest::Best,
            DatabaseProduct::Unknown,
            &ConnectionShape::network(),
        );
        assert_eq!(r.resolved, ConnectionMode::Standard);
        assert_eq!(r.outcome, ResolutionOutcome::Honored);
    }

    #[test]
    fn test_report_never_panics() {
        for requested in ALL_REQUESTS {
            for (product, shape) in [
                (DatabaseProduct::Sqlite, ConnectionShape::in_memory()),
                (DatabaseProduct::Sqlite, ConnectionShape::file()),
                (DatabaseProduct::MySql, ConnectionShape::network()),
                (DatabaseProduct::LocalDb, ConnectionShape::network()),
            ] {
                resolve(requested, product, &shape).report(product);
            }
        }
    }
}
