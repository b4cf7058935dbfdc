//! Multi-database migration runner.
//!
//! Applies ordered, versioned schema scripts against one logical database at a
//! time. Every database keeps its own ledger table, so identifiers have
//! independent schema histories. A recorded version is never re-applied;
//! idempotence lives in the ledger check, not in the migration content.
//!
//! Runs are serialized per identifier: an in-process mutex covers tasks in
//! this process, and a database-side advisory lock (`pg_advisory_lock`,
//! `GET_LOCK`) held on one dedicated connection covers other processes.
//! SQLite has no server-side lock; the in-process mutex plus SQLite's own
//! file locking serialize it. Different identifiers migrate independently
//! and may run in parallel.

use crate::db::pool::{ConnectionRegistry, DbPool};
use crate::error::{RouterError, RouterResult};
use crate::models::{
    AppliedMigration, Migration, MigrationReport, MigrationStatus, check_unique_versions,
};
use chrono::{DateTime, Utc};
use sqlx::{Connection, MySqlConnection, PgConnection, SqliteConnection};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Ledger table created in every migrated database.
pub const MIGRATIONS_TABLE: &str = "_db_router_migrations";

/// Bounded wait for the MySQL named lock.
const LOCK_WAIT_SECS: i64 = 30;

const CREATE_LEDGER_POSTGRES: &str = "CREATE TABLE IF NOT EXISTS _db_router_migrations (\
    version BIGINT PRIMARY KEY, \
    name TEXT NOT NULL, \
    applied_at TIMESTAMPTZ NOT NULL)";

const CREATE_LEDGER_MYSQL: &str = "CREATE TABLE IF NOT EXISTS _db_router_migrations (\
    version BIGINT PRIMARY KEY, \
    name VARCHAR(255) NOT NULL, \
    applied_at TIMESTAMP NOT NULL)";

const CREATE_LEDGER_SQLITE: &str = "CREATE TABLE IF NOT EXISTS _db_router_migrations (\
    version INTEGER PRIMARY KEY, \
    name TEXT NOT NULL, \
    applied_at TEXT NOT NULL)";

/// Applies migration sets against registered databases.
pub struct MigrationRunner {
    registry: Arc<ConnectionRegistry>,
    /// Per-identifier serialization of runs within this process.
    run_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MigrationRunner {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Apply all pending migrations from `migrations` to `identifier`.
    ///
    /// Pending versions are applied in ascending order and recorded in the
    /// database's own ledger immediately after each one succeeds. A failure
    /// halts the remaining sequence for this identifier only.
    pub async fn migrate(
        &self,
        identifier: &str,
        migrations: &[Migration],
    ) -> RouterResult<MigrationReport> {
        let mut ordered: Vec<Migration> = migrations.to_vec();
        ordered.sort_by_key(|m| m.version);
        check_unique_versions(&ordered)?;

        let run_lock = self.run_lock(identifier).await;
        let _guard = run_lock.lock().await;

        let pool = self.registry.resolve(identifier).await?;
        // Coerce each backend future to a `Send` trait object so its auto-trait
        // obligations are discharged here, at a concrete lifetime, rather than
        // leaking through `migrate`'s own future. Without this the nested
        // `&mut Connection` executor borrows make `migrate`'s future fail the
        // higher-ranked `Send` check required by `tokio::spawn`.
        let run: Pin<Box<dyn Future<Output = RouterResult<MigrationReport>> + Send + '_>> = match &pool {
            DbPool::Postgres(p) => Box::pin(run_postgres(p, identifier, &ordered)),
            DbPool::MySql(p) => Box::pin(run_mysql(p, identifier, &ordered)),
            DbPool::SQLite(p) => Box::pin(run_sqlite(p, identifier, &ordered)),
        };
        let report = run.await?;

        if report.is_noop() {
            info!(identifier = %identifier, "No pending migrations");
        } else {
            info!(
                identifier = %identifier,
                applied = report.applied.len(),
                "Migrations applied"
            );
        }
        Ok(report)
    }

    /// Migrate several databases concurrently.
    ///
    /// Each identifier gets its own outcome; one failure does not block the
    /// others.
    pub async fn migrate_all(
        &self,
        sets: Vec<(String, Vec<Migration>)>,
    ) -> Vec<(String, RouterResult<MigrationReport>)> {
        let runs = sets.into_iter().map(|(identifier, migrations)| async move {
            let result = self.migrate(&identifier, &migrations).await;
            (identifier, result)
        });
        futures_util::future::join_all(runs).await
    }

    /// Applied/pending state of `migrations` on `identifier`, sorted by version.
    ///
    /// Ledger rows without a matching script are included, so drift between
    /// disk and database is visible.
    pub async fn status(
        &self,
        identifier: &str,
        migrations: &[Migration],
    ) -> RouterResult<Vec<MigrationStatus>> {
        let pool = self.registry.resolve(identifier).await?;
        let applied = match &pool {
            DbPool::Postgres(p) => fetch_applied_postgres(p, identifier).await?,
            DbPool::MySql(p) => fetch_applied_mysql(p, identifier).await?,
            DbPool::SQLite(p) => fetch_applied_sqlite(p, identifier).await?,
        };
        Ok(merge_status(migrations, applied))
    }

    async fn run_lock(&self, identifier: &str) -> Arc<Mutex<()>> {
        let mut locks = self.run_locks.lock().await;
        Arc::clone(
            locks
                .entry(identifier.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// Split a sorted migration set into pending scripts and the already-recorded count.
fn partition_pending<'a>(
    identifier: &str,
    migrations: &'a [Migration],
    applied: &[(i64, String)],
) -> (Vec<&'a Migration>, usize) {
    let recorded: HashMap<i64, &str> = applied
        .iter()
        .map(|(version, name)| (*version, name.as_str()))
        .collect();
    let max_applied = applied.iter().map(|(version, _)| *version).max();

    let mut pending = Vec::new();
    for migration in migrations {
        match recorded.get(&migration.version) {
            Some(recorded_name) => {
                if *recorded_name != migration.name {
                    warn!(
                        identifier = %identifier,
                        version = migration.version,
                        recorded = %recorded_name,
                        on_disk = %migration.name,
                        "Ledger records a different name for this version"
                    );
                }
            }
            None => {
                if let Some(max) = max_applied {
                    if migration.version < max {
                        warn!(
                            identifier = %identifier,
                            version = migration.version,
                            ledger_max = max,
                            "Applying out-of-order migration below the ledger maximum"
                        );
                    }
                }
                pending.push(migration);
            }
        }
    }
    (pending, applied.len())
}

/// Merge on-disk scripts with ledger rows into per-version status.
fn merge_status(migrations: &[Migration], applied: Vec<AppliedMigration>) -> Vec<MigrationStatus> {
    let mut by_version: BTreeMap<i64, MigrationStatus> = BTreeMap::new();
    for migration in migrations {
        by_version.insert(
            migration.version,
            MigrationStatus {
                version: migration.version,
                name: migration.name.clone(),
                applied_at: None,
            },
        );
    }
    for row in applied {
        match by_version.get_mut(&row.version) {
            Some(status) => status.applied_at = Some(row.applied_at),
            None => {
                by_version.insert(
                    row.version,
                    MigrationStatus {
                        version: row.version,
                        name: row.name,
                        applied_at: Some(row.applied_at),
                    },
                );
            }
        }
    }
    by_version.into_values().collect()
}

/// Advisory lock key for an identifier.
///
/// FNV-1a over the ledger table name and identifier. Must be stable across
/// processes, which rules out the randomly seeded std hasher.
fn advisory_key(identifier: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let bytes = MIGRATIONS_TABLE
        .bytes()
        .chain(std::iter::once(b'/'))
        .chain(identifier.bytes());
    for byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash as i64
}

fn acquire_error(identifier: &str, err: sqlx::Error) -> RouterError {
    match err {
        sqlx::Error::PoolTimedOut => RouterError::connection_unavailable(
            identifier,
            "connection pool acquire timed out",
        ),
        sqlx::Error::PoolClosed => {
            RouterError::connection_unavailable(identifier, "connection pool is closed")
        }
        other => other.into(),
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL
// ---------------------------------------------------------------------------

async fn run_postgres(
    pool: &sqlx::PgPool,
    identifier: &str,
    migrations: &[Migration],
) -> RouterResult<MigrationReport> {
    // One dedicated session: the advisory lock is session-scoped.
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| acquire_error(identifier, e))?;
    let key = advisory_key(identifier);

    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(key)
        .execute(&mut *conn)
        .await?;

    let result = apply_postgres(&mut conn, identifier, migrations).await;

    // Best effort: the lock dies with the session anyway.
    let _ = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(key)
        .execute(&mut *conn)
        .await;

    result
}

async fn apply_postgres(
    conn: &mut PgConnection,
    identifier: &str,
    migrations: &[Migration],
) -> RouterResult<MigrationReport> {
    sqlx::query(CREATE_LEDGER_POSTGRES).execute(&mut *conn).await?;

    let applied: Vec<(i64, String)> = sqlx::query_as(&format!(
        "SELECT version, name FROM {} ORDER BY version",
        MIGRATIONS_TABLE
    ))
    .fetch_all(&mut *conn)
    .await?;

    let (pending, previously_applied) = partition_pending(identifier, migrations, &applied);
    let mut report = MigrationReport {
        identifier: identifier.to_string(),
        applied: Vec::new(),
        previously_applied,
    };

    for migration in pending {
        info!(
            identifier = %identifier,
            version = migration.version,
            name = %migration.name,
            "Applying migration"
        );

        // Script and ledger row commit together; any failure rolls both back.
        let mut tx = conn.begin().await.map_err(|e| {
            RouterError::migration_failed(identifier, migration.version, e.to_string())
        })?;

        sqlx::raw_sql(&migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                RouterError::migration_failed(identifier, migration.version, e.to_string())
            })?;

        sqlx::query(&format!(
            "INSERT INTO {} (version, name, applied_at) VALUES ($1, $2, $3)",
            MIGRATIONS_TABLE
        ))
        .bind(migration.version)
        .bind(&migration.name)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            RouterError::migration_failed(
                identifier,
                migration.version,
                format!("ledger write failed, schema change rolled back: {}", e),
            )
        })?;

        tx.commit()
            .await
            .map_err(|_| RouterError::inconsistent_state(identifier, migration.version))?;

        report.applied.push(migration.version);
    }

    Ok(report)
}

async fn fetch_applied_postgres(
    pool: &sqlx::PgPool,
    identifier: &str,
) -> RouterResult<Vec<AppliedMigration>> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| acquire_error(identifier, e))?;
    sqlx::query(CREATE_LEDGER_POSTGRES).execute(&mut *conn).await?;
    let rows: Vec<(i64, String, DateTime<Utc>)> = sqlx::query_as(&format!(
        "SELECT version, name, applied_at FROM {} ORDER BY version",
        MIGRATIONS_TABLE
    ))
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(version, name, applied_at)| AppliedMigration {
            version,
            name,
            applied_at,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// MySQL
// ---------------------------------------------------------------------------

async fn run_mysql(
    pool: &sqlx::MySqlPool,
    identifier: &str,
    migrations: &[Migration],
) -> RouterResult<MigrationReport> {
    // One dedicated session: GET_LOCK is session-scoped.
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| acquire_error(identifier, e))?;
    let lock_name = format!("db_router/{}", identifier);

    let granted: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, ?)")
        .bind(&lock_name)
        .bind(LOCK_WAIT_SECS)
        .fetch_one(&mut *conn)
        .await?;
    if granted != Some(1) {
        return Err(RouterError::internal(format!(
            "Migration lock for '{}' is held by another process",
            identifier
        )));
    }

    let result = apply_mysql(&mut conn, identifier, migrations).await;

    let _ = sqlx::query("SELECT RELEASE_LOCK(?)")
        .bind(&lock_name)
        .execute(&mut *conn)
        .await;

    result
}

async fn apply_mysql(
    conn: &mut MySqlConnection,
    identifier: &str,
    migrations: &[Migration],
) -> RouterResult<MigrationReport> {
    sqlx::query(CREATE_LEDGER_MYSQL).execute(&mut *conn).await?;

    let applied: Vec<(i64, String)> = sqlx::query_as(&format!(
        "SELECT version, name FROM {} ORDER BY version",
        MIGRATIONS_TABLE
    ))
    .fetch_all(&mut *conn)
    .await?;

    let (pending, previously_applied) = partition_pending(identifier, migrations, &applied);
    let mut report = MigrationReport {
        identifier: identifier.to_string(),
        applied: Vec::new(),
        previously_applied,
    };

    for migration in pending {
        info!(
            identifier = %identifier,
            version = migration.version,
            name = %migration.name,
            "Applying migration"
        );

        sqlx::raw_sql(&migration.sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                RouterError::migration_failed(identifier, migration.version, e.to_string())
            })?;

        // DDL auto-committed above; a ledger failure here leaves the change
        // unrecorded and must never be silently re-run.
        sqlx::query(&format!(
            "INSERT INTO {} (version, name, applied_at) VALUES (?, ?, ?)",
            MIGRATIONS_TABLE
        ))
        .bind(migration.version)
        .bind(&migration.name)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            warn!(
                identifier = %identifier,
                version = migration.version,
                error = %e,
                "Schema change succeeded but the ledger write failed"
            );
            RouterError::inconsistent_state(identifier, migration.version)
        })?;

        report.applied.push(migration.version);
    }

    Ok(report)
}

async fn fetch_applied_mysql(
    pool: &sqlx::MySqlPool,
    identifier: &str,
) -> RouterResult<Vec<AppliedMigration>> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| acquire_error(identifier, e))?;
    sqlx::query(CREATE_LEDGER_MYSQL).execute(&mut *conn).await?;
    let rows: Vec<(i64, String, DateTime<Utc>)> = sqlx::query_as(&format!(
        "SELECT version, name, applied_at FROM {} ORDER BY version",
        MIGRATIONS_TABLE
    ))
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(version, name, applied_at)| AppliedMigration {
            version,
            name,
            applied_at,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

async fn run_sqlite(
    pool: &sqlx::SqlitePool,
    identifier: &str,
    migrations: &[Migration],
) -> RouterResult<MigrationReport> {
    let conn = pool
        .acquire()
        .await
        .map_err(|e| acquire_error(identifier, e))?;
    apply_sqlite(conn, identifier, migrations).await
}

fn apply_sqlite<'a>(
    mut conn: sqlx::pool::PoolConnection<sqlx::Sqlite>,
    identifier: &'a str,
    migrations: &'a [Migration],
) -> Pin<Box<dyn Future<Output = RouterResult<MigrationReport>> + Send + 'a>> {
    Box::pin(async move {
    let conn = &mut *conn;
    sqlx::query(CREATE_LEDGER_SQLITE).execute(&mut *conn).await?;

    let applied: Vec<(i64, String)> = sqlx::query_as(&format!(
        "SELECT version, name FROM {} ORDER BY version",
        MIGRATIONS_TABLE
    ))
    .fetch_all(&mut *conn)
    .await?;

    let (pending, previously_applied) = partition_pending(identifier, migrations, &applied);
    let mut report = MigrationReport {
        identifier: identifier.to_string(),
        applied: Vec::new(),
        previously_applied,
    };

    for migration in pending {
        info!(
            identifier = %identifier,
            version = migration.version,
            name = %migration.name,
            "Applying migration"
        );

        // Script and ledger row commit together; any failure rolls both back.
        let mut tx = conn.begin().await.map_err(|e| {
            RouterError::migration_failed(identifier, migration.version, e.to_string())
        })?;

        sqlx::raw_sql(&migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                RouterError::migration_failed(identifier, migration.version, e.to_string())
            })?;

        sqlx::query(&format!(
            "INSERT INTO {} (version, name, applied_at) VALUES (?, ?, ?)",
            MIGRATIONS_TABLE
        ))
        .bind(migration.version)
        .bind(&migration.name)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            RouterError::migration_failed(
                identifier,
                migration.version,
                format!("ledger write failed, schema change rolled back: {}", e),
            )
        })?;

        tx.commit()
            .await
            .map_err(|_| RouterError::inconsistent_state(identifier, migration.version))?;

        report.applied.push(migration.version);
    }

    Ok(report)
    })
}

async fn fetch_applied_sqlite(
    pool: &sqlx::SqlitePool,
    identifier: &str,
) -> RouterResult<Vec<AppliedMigration>> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| acquire_error(identifier, e))?;
    sqlx::query(CREATE_LEDGER_SQLITE).execute(&mut *conn).await?;
    let rows: Vec<(i64, String, DateTime<Utc>)> = sqlx::query_as(&format!(
        "SELECT version, name, applied_at FROM {} ORDER BY version",
        MIGRATIONS_TABLE
    ))
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(version, name, applied_at)| AppliedMigration {
            version,
            name,
            applied_at,
        })
        .collect())
}
