//! Isolation resolution, standalone and through a live coordinator.

use db_conn_coordinator::DbError;
use db_conn_coordinator::db::{
    ConnectionCoordinator, IsolationCapabilities, IsolationLevel, IsolationProfile,
    IsolationResolver,
};
use db_conn_coordinator::models::{DatabaseProduct, ExecutionKind};

#[test]
fn test_sql_server_without_row_versioning_degrades() {
    let resolver = IsolationResolver::new(
        DatabaseProduct::SqlServer,
        IsolationCapabilities::default(),
        IsolationLevel::ReadCommitted,
    );
    let resolved = resolver.resolve(IsolationProfile::SafeNonBlockingReads);
    assert_eq!(resolved.level, IsolationLevel::ReadCommitted);
    assert!(resolved.degraded);
    assert!(resolver.validate(IsolationLevel::Snapshot).is_err());
}

#[test]
fn test_sql_server_with_snapshot_is_not_degraded() {
    let resolver = IsolationResolver::new(
        DatabaseProduct::SqlServer,
        IsolationCapabilities {
            snapshot_isolation: true,
            read_committed_snapshot: false,
        },
        IsolationLevel::ReadCommitted,
    );
    let resolved = resolver.resolve(IsolationProfile::SafeNonBlockingReads);
    assert_eq!(resolved.level, IsolationLevel::Snapshot);
    assert!(!resolved.degraded);
}

#[test]
fn test_read_committed_snapshot_satisfies_non_blocking_reads() {
    let resolver = IsolationResolver::new(
        DatabaseProduct::LocalDb,
        IsolationCapabilities {
            snapshot_isolation: false,
            read_committed_snapshot: true,
        },
        IsolationLevel::ReadCommitted,
    );
    let resolved = resolver.resolve(IsolationProfile::SafeNonBlockingReads);
    assert_eq!(resolved.level, IsolationLevel::ReadCommitted);
    assert!(!resolved.degraded);
}

#[test]
fn test_sqlite_only_runs_serializable() {
    let resolver = IsolationResolver::new(
        DatabaseProduct::Sqlite,
        IsolationCapabilities::default(),
        IsolationLevel::Serializable,
    );
    for profile in [
        IsolationProfile::ProductDefault,
        IsolationProfile::SafeNonBlockingReads,
        IsolationProfile::FastReads,
        IsolationProfile::Strict,
    ] {
        let resolved = resolver.resolve(profile);
        assert_eq!(resolved.level, IsolationLevel::Serializable, "{:?}", profile);
        assert!(!resolved.degraded, "{:?}", profile);
    }
    assert_eq!(resolver.supported_levels(), &[IsolationLevel::Serializable]);
}

#[test]
fn test_cockroach_repeatable_reads_upgrade_is_degraded() {
    let resolver = IsolationResolver::new(
        DatabaseProduct::CockroachDb,
        IsolationCapabilities::default(),
        IsolationLevel::Serializable,
    );
    let resolved = resolver.resolve(IsolationProfile::RepeatableReads);
    assert_eq!(resolved.level, IsolationLevel::Serializable);
    assert!(resolved.degraded);
}

#[tokio::test]
async fn test_coordinator_transactions_report_their_isolation() {
    let coordinator = ConnectionCoordinator::connect("sqlite::memory:")
        .await
        .unwrap();
    assert_eq!(coordinator.isolation().product(), DatabaseProduct::Sqlite);

    let tx = coordinator
        .begin_transaction(
            Some(IsolationProfile::SafeNonBlockingReads),
            ExecutionKind::Read,
        )
        .await
        .unwrap();
    assert_eq!(tx.isolation(), IsolationLevel::Serializable);
    assert!(!tx.degraded());
    tx.dispose().await;

    let err = coordinator
        .begin_transaction_with_level(IsolationLevel::ReadCommitted, ExecutionKind::Write)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::UnsupportedIsolation { .. }));

    coordinator.close().await;
}

#[test]
fn test_profile_names_parse() {
    assert_eq!(
        "safe-non-blocking-reads".parse::<IsolationProfile>().unwrap(),
        IsolationProfile::SafeNonBlockingReads
    );
    assert_eq!(
        "serializable".parse::<IsolationProfile>().unwrap(),
        IsolationProfile::Strict
    );
    assert!("chaos".parse::<IsolationProfile>().is_err());
}
