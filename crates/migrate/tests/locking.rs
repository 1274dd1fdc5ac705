mod common;

use common::*;
use elif_migrate::{MigrationConfig, MigrationError, MigrationErrorKind, MigrationRollback};
use std::time::Duration;

#[tokio::test]
async fn test_held_lock_refuses_run_without_waiting() {
    let db = TestDatabase::new();
    let runner = db.runner(org_registry()).await;
    runner.store().acquire_lock("other-process").await.unwrap();

    let outcome = runner.migrate_to_latest().await;
    assert!(!outcome.success);
    assert_eq!(outcome.error_kind(), Some(MigrationErrorKind::LockAcquisition));
    assert!(outcome.executed.is_empty());
    assert!(tables(&db.pool().await).await.is_empty());

    // The other holder's lock is left alone
    let holder = runner.store().lock_holder().await.unwrap().unwrap();
    assert_eq!(holder.holder_token, "other-process");

    let outcome = runner.rollback(1).await;
    assert!(outcome.success, "nothing applied, so no lock is needed");

    runner.store().release_lock("other-process").await.unwrap();
    assert!(runner.migrate_to_latest().await.success);
}

#[tokio::test]
async fn test_release_requires_matching_token() {
    let db = TestDatabase::new();
    let runner = db.runner(org_registry()).await;
    let store = runner.store();

    store.acquire_lock("first").await.unwrap();
    assert!(matches!(
        store.acquire_lock("second").await,
        Err(MigrationError::LockAcquisition(_))
    ));

    assert!(!store.release_lock("second").await.unwrap());
    assert!(store.lock_holder().await.unwrap().is_some());

    assert!(store.release_lock("first").await.unwrap());
    assert!(store.lock_holder().await.unwrap().is_none());
}

#[tokio::test]
async fn test_stale_lock_is_taken_over() {
    let db = TestDatabase::new();
    let runner = db.runner(org_registry()).await;
    let pool = db.pool().await;

    sqlx::query(
        "INSERT INTO elif_migrations_lock (lock_id, holder_token, acquired_at) \
         VALUES (1, 'crashed-process', '2000-01-01T00:00:00.000000Z')",
    )
    .execute(&pool)
    .await
    .unwrap();

    let outcome = runner.migrate_to_latest().await;
    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.executed.len(), 3);
    assert!(runner.store().lock_holder().await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_runs_do_not_interleave() {
    let db = TestDatabase::new();
    let first = db.runner(org_registry()).await;
    let second = db.runner(org_registry()).await;

    let (a, b) = tokio::join!(first.migrate_to_latest(), second.migrate_to_latest());

    let (winner, other) = if a.executed.is_empty() { (b, a) } else { (a, b) };
    assert!(winner.success, "{:?}", winner.error);
    assert_eq!(
        winner.executed,
        vec![CREATE_ORGS, CREATE_USERS, CREATE_USER_ORGS]
    );

    assert!(other.executed.is_empty());
    assert!(
        other.success || other.error_kind() == Some(MigrationErrorKind::LockAcquisition),
        "unexpected outcome: {:?}",
        other
    );

    let records = first.store().list_applied().await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.batch == 1));
    assert!(first.store().lock_holder().await.unwrap().is_none());
}

#[tokio::test]
async fn test_dropped_ledger_reports_corruption() {
    let db = TestDatabase::new();
    let runner = db.runner(org_registry()).await;
    assert!(runner.migrate_to_latest().await.success);

    sqlx::query("DROP TABLE elif_migrations")
        .execute(&db.pool().await)
        .await
        .unwrap();

    assert!(!runner.store().is_healthy().await);

    let outcome = runner.migrate_to_latest().await;
    assert!(!outcome.success);
    assert_eq!(outcome.error_kind(), Some(MigrationErrorKind::StateStoreCorrupted));

    let outcome = runner.rollback(1).await;
    assert_eq!(outcome.error_kind(), Some(MigrationErrorKind::StateStoreCorrupted));

    let outcome = runner.rollback_to_version(CREATE_ORGS).await;
    assert_eq!(outcome.error_kind(), Some(MigrationErrorKind::StateStoreCorrupted));

    assert!(matches!(
        runner.status().await,
        Err(MigrationError::StateStoreCorrupted(_))
    ));

    // Nothing was touched: the schema and lock are as before
    assert_eq!(tables(&db.pool().await).await, vec!["orgs", "user_orgs", "users"]);
    assert!(runner.store().lock_holder().await.unwrap().is_none());
}

#[tokio::test]
async fn test_garbage_ledger_rows_report_corruption() {
    let db = TestDatabase::new();
    let runner = db.runner(org_registry()).await;

    sqlx::query(
        "INSERT INTO elif_migrations (name, batch, applied_at) \
         VALUES ('20240101_120000_create_orgs', 1, 'last tuesday')",
    )
    .execute(&db.pool().await)
    .await
    .unwrap();

    let outcome = runner.migrate_to_latest().await;
    assert_eq!(outcome.error_kind(), Some(MigrationErrorKind::StateStoreCorrupted));
    assert!(runner.current_version().await.is_err());
}

#[tokio::test]
async fn test_sub_second_max_age_keeps_live_lock() {
    let db = TestDatabase::new();
    let config = MigrationConfig::default().with_lock_max_age(Duration::from_millis(900));
    let runner = db.runner_with_config(org_registry(), config).await;
    let store = runner.store();

    store.acquire_lock("live-holder").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(matches!(
        store.acquire_lock("second").await,
        Err(MigrationError::LockAcquisition(_))
    ));
    assert_eq!(
        store.lock_holder().await.unwrap().unwrap().holder_token,
        "live-holder"
    );

    // Past the max age the lock is abandoned and can be taken over
    tokio::time::sleep(Duration::from_millis(1000)).await;
    store.acquire_lock("second").await.unwrap();
    assert_eq!(
        store.lock_holder().await.unwrap().unwrap().holder_token,
        "second"
    );
}
