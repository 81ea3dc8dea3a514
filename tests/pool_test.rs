//! Integration tests for pool bounds under load.
//!
//! Tests verify that:
//! - Concurrent callers never push open connections past the cap
//! - Holders of a connection (transactions, cursors) make others wait
//! - Endpoint descriptors carry pool options through to the pool

use dbkit::config::{EndpointConfig, PoolOptions};
use dbkit::db::{ConnectionPool, StatementExecutor};
use dbkit::error::DbError;
use dbkit::models::NewUser;
use dbkit::UserStore;
use std::time::Duration;
use tempfile::NamedTempFile;

async fn setup_store(options: PoolOptions) -> (NamedTempFile, UserStore) {
    let file = NamedTempFile::new().unwrap();
    let config = EndpointConfig::sqlite(file.path())
        .unwrap()
        .with_pool_options(options);
    let pool = ConnectionPool::open(&config).await.unwrap();
    let store = UserStore::new(StatementExecutor::new(pool));
    store.ensure_schema().await.unwrap();
    (file, store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reads_respect_max_open() {
    let (_file, store) = setup_store(PoolOptions {
        max_open_connections: Some(3),
        max_idle_connections: Some(2),
        ..PoolOptions::default()
    })
    .await;
    let id = store.insert(&NewUser::new("shared", 33)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..24 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.get(id).await }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().age, 33);
    }

    let status = store.executor().pool().status();
    assert!(status.peak_open <= 3, "peak {} over cap", status.peak_open);
    assert!(status.idle <= 2);
    assert_eq!(status.in_use, 0);
}

#[tokio::test]
async fn test_open_transaction_holds_the_only_connection() {
    let (_file, store) = setup_store(PoolOptions {
        max_open_connections: Some(1),
        acquire_timeout: Some(Duration::from_millis(100)),
        ..PoolOptions::default()
    })
    .await;
    let id = store.insert(&NewUser::new("solo", 1)).await.unwrap();

    let mut tx = store.executor().begin().await.unwrap();
    let err = store.get(id).await.unwrap_err();
    assert!(
        matches!(err, DbError::PoolExhausted { max_open: 1, .. }),
        "got {err:?}"
    );
    assert!(err.is_retryable());

    tx.rollback().await.unwrap();
    assert_eq!(store.get(id).await.unwrap().name, "solo");
}

#[tokio::test]
async fn test_open_cursor_holds_its_connection() {
    let (_file, store) = setup_store(PoolOptions {
        max_open_connections: Some(1),
        acquire_timeout: Some(Duration::from_millis(100)),
        ..PoolOptions::default()
    })
    .await;
    let id = store.insert(&NewUser::new("solo", 1)).await.unwrap();
    // More rows than the worker can buffer, so it is still streaming
    for age in 2..=5 {
        store.insert(&NewUser::new("other", age)).await.unwrap();
    }

    let mut cursor = store.list_after(0).await.unwrap();
    cursor.next().await.unwrap().unwrap();
    assert!(matches!(
        store.get(id).await,
        Err(DbError::PoolExhausted { .. })
    ));

    cursor.close().await;
    assert_eq!(store.get(id).await.unwrap().age, 1);
}

#[tokio::test]
async fn test_waiter_gets_released_connection() {
    let (_file, store) = setup_store(PoolOptions {
        max_open_connections: Some(1),
        acquire_timeout: Some(Duration::from_secs(5)),
        ..PoolOptions::default()
    })
    .await;
    let id = store.insert(&NewUser::new("handoff", 4)).await.unwrap();
    let pool = store.executor().pool().clone();

    let held = pool.acquire().await.unwrap();
    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.get(id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    held.release().await;

    assert_eq!(waiter.await.unwrap().unwrap().age, 4);
    assert_eq!(pool.status().peak_open, 1);
}

#[tokio::test]
async fn test_descriptor_pool_options() {
    let file = NamedTempFile::new().unwrap();
    let descriptor = format!(
        "sqlite:{}?mode=rwc&max_open_connections=4&max_idle_connections=1",
        file.path().display()
    );
    let config = EndpointConfig::parse(&descriptor).unwrap();
    assert!(!config.url().as_str().contains("max_open_connections"));

    let pool = ConnectionPool::open(&config).await.unwrap();
    let status = pool.status();
    assert_eq!(status.max_open, 4);
    assert_eq!(status.max_idle, 1);

    pool.close().await;
    assert!(matches!(pool.acquire().await, Err(DbError::PoolClosed)));
}
