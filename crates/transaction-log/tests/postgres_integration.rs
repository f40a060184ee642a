//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p transaction-log --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{ProcessHandle, ResourceId, Xid};
use futures_util::StreamExt;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use transaction_log::{LogEntry, LogState, PostgresTransactionLog, TransactionLog};

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_transaction_log.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh log with its own pool and a cleared table
async fn get_test_log() -> PostgresTransactionLog {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE transaction_log")
        .execute(&pool)
        .await
        .unwrap();

    PostgresTransactionLog::new(pool)
}

fn owner() -> ProcessHandle {
    ProcessHandle::new(4242, 9)
}

#[tokio::test]
async fn test_begin_and_select() {
    let log = get_test_log().await;
    let xid = Xid::new();

    log.begin(LogEntry::begin(
        xid.clone(),
        owner(),
        Some(Duration::from_secs(30)),
    ))
    .await
    .unwrap();

    let entry = log.select(&xid).await.unwrap().unwrap();
    assert_eq!(entry.xid, xid);
    assert_eq!(entry.owner, owner());
    assert_eq!(entry.state, LogState::Begin);
    assert!(entry.deadline.is_some());
}

#[tokio::test]
async fn test_prepare_upserts() {
    let log = get_test_log().await;
    let begun = Xid::new();
    let unbegun = Xid::new();
    log.begin(LogEntry::begin(begun.clone(), owner(), None))
        .await
        .unwrap();

    let resources = [ResourceId::new(1), ResourceId::new(-2)];
    log.prepare(&begun, &owner(), &resources).await.unwrap();
    log.prepare(&unbegun, &owner(), &resources).await.unwrap();

    for xid in [&begun, &unbegun] {
        let entry = log.select(xid).await.unwrap().unwrap();
        assert_eq!(entry.state, LogState::Prepared);
        assert_eq!(entry.resources, resources.to_vec());
    }
}

#[tokio::test]
async fn test_timeout_and_remove() {
    let log = get_test_log().await;
    let xid = Xid::new();
    log.begin(LogEntry::begin(xid.clone(), owner(), None))
        .await
        .unwrap();

    log.timeout(&xid).await.unwrap();
    assert_eq!(
        log.select(&xid).await.unwrap().unwrap().state,
        LogState::Timeout
    );

    log.remove(&xid).await.unwrap();
    assert!(log.select(&xid).await.unwrap().is_none());
}

#[tokio::test]
async fn test_scan_streams_all_entries() {
    let log = get_test_log().await;
    for _ in 0..4 {
        log.begin(LogEntry::begin(Xid::new(), owner(), None))
            .await
            .unwrap();
    }

    let entries: Vec<_> = log.scan().await.unwrap().collect().await;
    assert_eq!(entries.len(), 4);
    assert!(entries.into_iter().all(|e| e.is_ok()));
}

#[tokio::test]
async fn test_passed_filters_by_deadline() {
    let log = get_test_log().await;
    let expiring = Xid::new();
    log.begin(LogEntry::begin(
        expiring.clone(),
        owner(),
        Some(Duration::from_secs(1)),
    ))
    .await
    .unwrap();
    log.begin(LogEntry::begin(Xid::new(), owner(), None))
        .await
        .unwrap();

    let passed = log
        .passed(Utc::now() + chrono::Duration::seconds(10))
        .await
        .unwrap();
    assert_eq!(passed.len(), 1);
    assert_eq!(passed[0].xid, expiring);
}
