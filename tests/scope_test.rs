//! Integration tests for connection switching against real SQLite databases.

use db_router::config::PoolOptions;
use db_router::db::{ConnectionRegistry, DbPool, MigrationRunner, active_identifier};
use db_router::error::RouterError;
use db_router::models::{ConnectionConfig, Migration};
use std::path::Path;
use std::sync::Arc;

async fn sqlite_registry(dir: &Path, identifiers: &[&str]) -> Arc<ConnectionRegistry> {
    let registry = Arc::new(ConnectionRegistry::new());
    for id in identifiers {
        let url = format!("sqlite:{}/{}.db", dir.display(), id);
        let config =
            ConnectionConfig::new(*id, url, Some((*id).to_string()), PoolOptions::default())
                .unwrap();
        registry.register(config).await.unwrap();
    }
    registry
}

async fn count_rows(pool: &DbPool, table: &str) -> i64 {
    match pool {
        DbPool::SQLite(p) => {
            sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(p)
                .await
                .unwrap()
        }
        _ => panic!("test registry only holds SQLite pools"),
    }
}

#[tokio::test]
async fn test_current_connection_inside_scope_resolves_scoped_identifier() {
    let dir = tempfile::tempdir().unwrap();
    let registry = sqlite_registry(dir.path(), &["primary", "reporting"]).await;

    let seen = registry
        .with_connection("reporting", |_| async {
            registry
                .current_connection()
                .await
                .map(|h| h.identifier().to_string())
        })
        .await
        .unwrap();
    assert_eq!(seen, "reporting");

    // After the call returns, current_connection reverts to the default
    let current = registry.current_connection().await.unwrap();
    assert_eq!(current.identifier(), "primary");

    registry.close_all().await;
}

#[tokio::test]
async fn test_scoped_writes_land_on_the_scoped_database() {
    let dir = tempfile::tempdir().unwrap();
    let registry = sqlite_registry(dir.path(), &["primary", "reporting"]).await;
    let runner = MigrationRunner::new(Arc::clone(&registry));

    // Same schema on both databases
    let migrations = vec![Migration::new(
        1,
        "create_events",
        "CREATE TABLE events (id INTEGER PRIMARY KEY, payload TEXT);",
    )];
    runner.migrate("primary", &migrations).await.unwrap();
    runner.migrate("reporting", &migrations).await.unwrap();

    registry
        .with_connection("reporting", |handle| async move {
            match handle.pool() {
                DbPool::SQLite(p) => {
                    sqlx::query("INSERT INTO events (payload) VALUES ('scoped')")
                        .execute(p)
                        .await?;
                }
                _ => unreachable!(),
            }
            Ok(())
        })
        .await
        .unwrap();

    let reporting = registry.handle("reporting").await.unwrap();
    let primary = registry.handle("primary").await.unwrap();
    assert_eq!(count_rows(reporting.pool(), "events").await, 1);
    assert_eq!(count_rows(primary.pool(), "events").await, 0);

    registry.close_all().await;
}

#[tokio::test]
async fn test_nested_scope_restores_outer_after_inner_failure() {
    let dir = tempfile::tempdir().unwrap();
    let registry = sqlite_registry(dir.path(), &["primary", "reporting"]).await;

    registry
        .with_connection("primary", |_| async {
            let inner: Result<(), RouterError> = registry
                .with_connection("reporting", |_| async {
                    Err(RouterError::internal("inner operation failed"))
                })
                .await;
            assert!(inner.is_err());

            // The outer scope is active again
            let current = registry.current_connection().await?;
            assert_eq!(current.identifier(), "primary");
            Ok(())
        })
        .await
        .unwrap();

    assert!(active_identifier().is_none());
    registry.close_all().await;
}

#[tokio::test]
async fn test_unknown_identifier_is_rejected_before_scoping() {
    let dir = tempfile::tempdir().unwrap();
    let registry = sqlite_registry(dir.path(), &["primary"]).await;

    let result = registry
        .with_connection("archive", |_| async { Ok(()) })
        .await;
    assert!(matches!(result, Err(RouterError::UnknownIdentifier { .. })));
    // No scope leaked
    assert!(active_identifier().is_none());

    registry.close_all().await;
}

#[tokio::test]
async fn test_concurrent_tasks_never_observe_each_others_scope() {
    let dir = tempfile::tempdir().unwrap();
    let registry = sqlite_registry(dir.path(), &["primary", "reporting"]).await;
    let barrier = Arc::new(tokio::sync::Barrier::new(2));

    let scoped_task = |id: &'static str| {
        let registry = Arc::clone(&registry);
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            registry
                .with_connection(id, |_| async {
                    // Both scopes are open at this point
                    barrier.wait().await;
                    registry
                        .current_connection()
                        .await
                        .map(|h| h.identifier().to_string())
                })
                .await
                .unwrap()
        })
    };

    let a = scoped_task("primary");
    let b = scoped_task("reporting");

    assert_eq!(a.await.unwrap(), "primary");
    assert_eq!(b.await.unwrap(), "reporting");

    registry.close_all().await;
}

#[tokio::test]
async fn test_explicit_default_connection() {
    let dir = tempfile::tempdir().unwrap();
    let registry = sqlite_registry(dir.path(), &["primary", "reporting"]).await;

    registry.set_default("reporting").await.unwrap();
    let current = registry.current_connection().await.unwrap();
    assert_eq!(current.identifier(), "reporting");

    registry.close_all().await;
}
