//! Task-local connection switching.
//!
//! A scope redirects data-access code to a specific logical database for the
//! duration of one operation, without threading an identifier through every
//! call site. The active identifier lives in tokio task-local storage: it is
//! confined to the calling task, restored on every exit path (the scope *is*
//! the future), and never visible to concurrently running tasks. Spawned
//! tasks do not inherit it.

use crate::db::pool::{ConnectionRegistry, DbPool};
use crate::error::{RouterError, RouterResult};
use crate::models::DatabaseType;
use tracing::debug;

tokio::task_local! {
    /// Identifier of the connection scoped to the current task, if any.
    static ACTIVE_IDENTIFIER: String;
}

/// The identifier scoped to the calling task, or `None` outside any scope.
pub fn active_identifier() -> Option<String> {
    ACTIVE_IDENTIFIER.try_with(Clone::clone).ok()
}

/// A pool resolved for one logical database.
///
/// Cheap to clone; holds the pool, not a checked-out connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    identifier: String,
    pool: DbPool,
}

impl ConnectionHandle {
    pub(crate) fn new(identifier: String, pool: DbPool) -> Self {
        Self { identifier, pool }
    }

    /// The logical database this handle is bound to.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The underlying pool, for running queries.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn db_type(&self) -> DatabaseType {
        self.pool.db_type()
    }

    /// Verify the pool can hand out a connection within its bounded acquire wait.
    pub async fn ping(&self) -> RouterResult<()> {
        let result = match &self.pool {
            DbPool::MySql(p) => p.acquire().await.map(drop),
            DbPool::Postgres(p) => p.acquire().await.map(drop),
            DbPool::SQLite(p) => p.acquire().await.map(drop),
        };
        result.map_err(|e| match e {
            sqlx::Error::PoolTimedOut => RouterError::connection_unavailable(
                &self.identifier,
                "connection pool acquire timed out",
            ),
            sqlx::Error::PoolClosed => RouterError::connection_unavailable(
                &self.identifier,
                "connection pool is closed",
            ),
            other => other.into(),
        })
    }
}

impl ConnectionRegistry {
    /// Resolve an identifier to a handle bound to it.
    pub async fn handle(&self, identifier: &str) -> RouterResult<ConnectionHandle> {
        let pool = self.resolve(identifier).await?;
        Ok(ConnectionHandle::new(identifier.to_string(), pool))
    }

    /// Run `op` with `identifier` as the active connection for the calling task.
    ///
    /// The identifier is resolved first (`UnknownIdentifier` otherwise), then
    /// `op` receives a handle bound to it and runs inside the scope. Nested
    /// calls re-scope; whatever was active before is visible again as soon as
    /// this future completes, whether `op` returned `Ok`, returned `Err`, or
    /// panicked.
    pub async fn with_connection<F, Fut, T>(&self, identifier: &str, op: F) -> RouterResult<T>
    where
        F: FnOnce(ConnectionHandle) -> Fut,
        Fut: Future<Output = RouterResult<T>>,
    {
        let handle = self.handle(identifier).await?;
        debug!(identifier = %identifier, "Entering connection scope");
        ACTIVE_IDENTIFIER
            .scope(identifier.to_string(), op(handle))
            .await
    }

    /// Handle for the calling task's active connection, or the default when
    /// no scope is active.
    pub async fn current_connection(&self) -> RouterResult<ConnectionHandle> {
        match active_identifier() {
            Some(identifier) => self.handle(&identifier).await,
            None => {
                let identifier = self.default_identifier().await?;
                self.handle(&identifier).await
            }
        }
    }
}
