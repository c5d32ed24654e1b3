//! Integration tests for transaction scopes.

use db_conn_coordinator::db::{ConnectionCoordinator, IsolationLevel, ReaderState};
use db_conn_coordinator::models::{ExecutionKind, TransactionState};
use db_conn_coordinator::{DbError, error::ErrorClass};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn coordinator_with_table() -> ConnectionCoordinator {
    let coordinator = ConnectionCoordinator::connect("sqlite::memory:")
        .await
        .unwrap();
    coordinator
        .create_statement_container()
        .sql("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)")
        .execute()
        .await
        .unwrap();
    coordinator
}

async fn count_notes(coordinator: &ConnectionCoordinator) -> i64 {
    coordinator
        .create_statement_container()
        .sql("SELECT COUNT(*) FROM notes")
        .fetch_optional()
        .await
        .unwrap()
        .unwrap()
        .try_get(0)
        .unwrap()
}

#[tokio::test]
async fn test_commit_then_dispose() {
    let coordinator = coordinator_with_table().await;

    let tx = coordinator
        .begin_transaction(None, ExecutionKind::Write)
        .await
        .unwrap();
    assert!(tx.id().starts_with("tx_"));
    assert_eq!(tx.state(), TransactionState::Active);
    assert_eq!(tx.isolation(), IsolationLevel::Serializable);
    assert!(!tx.degraded());
    assert_eq!(tx.execution_kind(), ExecutionKind::Write);

    let affected = tx
        .statement()
        .sql("INSERT INTO notes (body) VALUES (?), (?)")
        .bind("first")
        .bind("second")
        .execute()
        .await
        .unwrap();
    assert_eq!(affected, 2);

    tx.commit().await.unwrap();
    assert_eq!(tx.state(), TransactionState::Committed);
    tx.dispose().await;
    assert_eq!(tx.state(), TransactionState::Disposed);

    assert_eq!(count_notes(&coordinator).await, 2);
    coordinator.close().await;
}

#[tokio::test]
async fn test_rollback_discards_changes() {
    let coordinator = coordinator_with_table().await;

    let tx = coordinator
        .begin_transaction(None, ExecutionKind::Write)
        .await
        .unwrap();
    tx.execute("INSERT INTO notes (body) VALUES ('gone')")
        .await
        .unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(tx.state(), TransactionState::RolledBack);
    tx.dispose().await;

    assert_eq!(count_notes(&coordinator).await, 0);
    coordinator.close().await;
}

#[tokio::test]
async fn test_second_completion_is_rejected() {
    let coordinator = coordinator_with_table().await;

    let tx = coordinator
        .begin_transaction(None, ExecutionKind::Write)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, DbError::TransactionNotActive { .. }));
    assert_eq!(err.class(), ErrorClass::Misuse);
    let err = tx.rollback().await.unwrap_err();
    assert!(matches!(err, DbError::TransactionNotActive { .. }));
    assert_eq!(tx.state(), TransactionState::Committed);

    let err = tx.execute("SELECT 1").await.unwrap_err();
    assert!(matches!(err, DbError::TransactionNotActive { .. }));

    tx.dispose().await;
    tx.dispose().await;
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, DbError::TransactionNotActive { .. }));

    coordinator.close().await;
}

#[tokio::test]
async fn test_dispose_rolls_back_an_active_transaction() {
    let coordinator = coordinator_with_table().await;

    let tx = coordinator
        .begin_transaction(None, ExecutionKind::Write)
        .await
        .unwrap();
    tx.execute("INSERT INTO notes (body) VALUES ('uncommitted')")
        .await
        .unwrap();
    tx.dispose().await;
    assert_eq!(tx.state(), TransactionState::Disposed);

    assert_eq!(count_notes(&coordinator).await, 0);
    coordinator.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_commit_and_dispose_complete_once() {
    let coordinator = coordinator_with_table().await;

    for round in 0..20 {
        let tx = coordinator
            .begin_transaction(None, ExecutionKind::Write)
            .await
            .unwrap();
        tx.statement()
            .sql("INSERT INTO notes (id, body) VALUES (?, 'race')")
            .bind(round as i64)
            .execute()
            .await
            .unwrap();

        let committer = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.commit().await })
        };
        let disposer = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.dispose().await })
        };
        let committed = committer.await.unwrap().is_ok();
        disposer.await.unwrap();
        assert_eq!(tx.state(), TransactionState::Disposed);

        let present = coordinator
            .create_statement_container()
            .sql("SELECT 1 FROM notes WHERE id = ?")
            .bind(round as i64)
            .fetch_optional()
            .await
            .unwrap()
            .is_some();
        assert_eq!(present, committed, "round {}", round);
    }

    coordinator.close().await;
}

#[tokio::test]
async fn test_savepoints() {
    let coordinator = coordinator_with_table().await;

    let tx = coordinator
        .begin_transaction(None, ExecutionKind::Write)
        .await
        .unwrap();
    tx.execute("INSERT INTO notes (body) VALUES ('kept')")
        .await
        .unwrap();
    tx.savepoint("inner").await.unwrap();
    tx.execute("INSERT INTO notes (body) VALUES ('undone')")
        .await
        .unwrap();
    tx.rollback_to_savepoint("inner").await.unwrap();
    tx.release_savepoint("inner").await.unwrap();

    let err = tx.savepoint("bad name").await.unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));

    tx.commit().await.unwrap();
    tx.dispose().await;

    let rows = coordinator
        .create_statement_container()
        .sql("SELECT body FROM notes")
        .fetch_all()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].try_get::<String>(0).unwrap(), "kept");

    coordinator.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reader_holds_the_operation_lock() {
    let coordinator = coordinator_with_table().await;

    let tx = coordinator
        .begin_transaction(None, ExecutionKind::Write)
        .await
        .unwrap();
    tx.execute("INSERT INTO notes (body) VALUES ('a'), ('b'), ('c')")
        .await
        .unwrap();

    let mut reader = tx
        .statement()
        .sql("SELECT body FROM notes ORDER BY id")
        .read()
        .await
        .unwrap();
    assert!(reader.next().await.unwrap().is_some());

    let statement = {
        let tx = tx.clone();
        tokio::spawn(async move { tx.execute("DELETE FROM notes WHERE body = 'a'").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!statement.is_finished());

    while reader.next().await.unwrap().is_some() {}
    assert_eq!(reader.state(), ReaderState::Exhausted);
    assert_eq!(statement.await.unwrap().unwrap(), 1);

    tx.commit().await.unwrap();
    tx.dispose().await;
    assert_eq!(count_notes(&coordinator).await, 2);
    coordinator.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispose_cancels_an_open_reader() {
    let coordinator = coordinator_with_table().await;

    let tx = coordinator
        .begin_transaction(None, ExecutionKind::Write)
        .await
        .unwrap();
    tx.execute("INSERT INTO notes (body) VALUES ('a'), ('b'), ('c')")
        .await
        .unwrap();
    let mut reader = tx
        .statement()
        .sql("SELECT body FROM notes")
        .read()
        .await
        .unwrap();
    assert!(reader.next().await.unwrap().is_some());

    tokio::time::timeout(Duration::from_secs(5), tx.dispose())
        .await
        .expect("dispose waited on the reader");
    let err = reader.next().await.unwrap_err();
    assert!(err.is_canceled());

    assert_eq!(count_notes(&coordinator).await, 0);
    coordinator.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_begin_leaves_the_connection_free() {
    let coordinator = coordinator_with_table().await;

    let holder = coordinator
        .begin_transaction(None, ExecutionKind::Write)
        .await
        .unwrap();

    let token = CancellationToken::new();
    let waiting = {
        let coordinator = coordinator.clone();
        let token = token.clone();
        tokio::spawn(async move {
            coordinator
                .begin_transaction_with_cancel(None, ExecutionKind::Write, &token)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();
    let err = waiting.await.unwrap().unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(err.class(), ErrorClass::Canceled);

    holder.dispose().await;
    let tx = coordinator
        .begin_transaction(None, ExecutionKind::Write)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    tx.dispose().await;

    coordinator.close().await;
}

#[tokio::test]
async fn test_unsupported_level_is_rejected() {
    let coordinator = coordinator_with_table().await;

    let err = coordinator
        .begin_transaction_with_level(IsolationLevel::Snapshot, ExecutionKind::Write)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::UnsupportedIsolation { .. }));

    let tx = coordinator
        .begin_transaction_with_level(IsolationLevel::Serializable, ExecutionKind::Read)
        .await
        .unwrap();
    assert_eq!(tx.execution_kind(), ExecutionKind::Read);
    tx.dispose().await;

    coordinator.close().await;
}

#[tokio::test]
async fn test_dropped_scope_is_rolled_back() {
    let coordinator = coordinator_with_table().await;

    {
        let tx = coordinator
            .begin_transaction(None, ExecutionKind::Write)
            .await
            .unwrap();
        tx.execute("INSERT INTO notes (body) VALUES ('dropped')")
            .await
            .unwrap();
    }

    // the background rollback frees the pinned connection
    let next = tokio::time::timeout(
        Duration::from_secs(5),
        coordinator.begin_transaction(None, ExecutionKind::Write),
    )
    .await
    .expect("connection never released")
    .unwrap();
    next.dispose().await;

    assert_eq!(count_notes(&coordinator).await, 0);
    coordinator.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_with_an_undisposed_transaction_returns() {
    let coordinator = coordinator_with_table().await;

    let tx = coordinator
        .begin_transaction(None, ExecutionKind::Write)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), coordinator.close())
        .await
        .expect("close waited on the open transaction");
    assert!(coordinator.is_closed());
    assert_eq!(tx.state(), TransactionState::Active);
    assert_eq!(coordinator.metrics().open, 1);

    // releasing the lease lets the deferred close finish
    tx.dispose().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while coordinator.metrics().open != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pinned connection never closed");
}
