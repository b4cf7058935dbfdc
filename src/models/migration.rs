//! Migration data models.
//!
//! A migration is an ordered, versioned schema-change script. Scripts live on
//! disk as `V<version>__<name>.sql`, one directory per logical database.
//! Versions form a strict total order per database; the runner sorts by the
//! numeric stamp and rejects duplicate versions up front.

use crate::error::{RouterError, RouterResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;

/// A single schema-change script.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Monotonic version stamp. Defines the apply order.
    pub version: i64,
    pub name: String,
    /// Raw SQL body. May contain multiple statements.
    pub sql: String,
}

impl Migration {
    pub fn new(version: i64, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            sql: sql.into(),
        }
    }

    /// Parse a `V<version>__<name>.sql` filename into its version and name.
    ///
    /// Returns `None` for files that do not follow the convention, so stray
    /// files in a migrations directory are reported rather than guessed at.
    pub fn parse_filename(filename: &str) -> Option<(i64, String)> {
        let stem = filename.strip_suffix(".sql")?;
        let rest = stem.strip_prefix('V')?;
        let (version, name) = rest.split_once("__")?;
        let version: i64 = version.parse().ok()?;
        if version < 0 || name.is_empty() {
            return None;
        }
        Some((version, name.to_string()))
    }

    /// Load all migration scripts from a directory.
    ///
    /// Every `.sql` file must follow the `V<version>__<name>.sql` convention.
    /// The result is sorted by version; duplicate versions are rejected.
    pub fn load_dir(dir: &Path) -> RouterResult<Vec<Migration>> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            RouterError::invalid_migration(format!(
                "Cannot read migrations directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut migrations = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                RouterError::invalid_migration(format!(
                    "Cannot read migrations directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            let filename = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if !filename.ends_with(".sql") {
                continue;
            }

            let (version, name) = Migration::parse_filename(filename).ok_or_else(|| {
                RouterError::invalid_migration(format!(
                    "Migration filename '{}' does not match V<version>__<name>.sql",
                    filename
                ))
            })?;

            let sql = std::fs::read_to_string(&path).map_err(|e| {
                RouterError::invalid_migration(format!("Cannot read {}: {}", path.display(), e))
            })?;

            migrations.push(Migration::new(version, name, sql));
        }

        migrations.sort_by_key(|m| m.version);
        check_unique_versions(&migrations)?;
        Ok(migrations)
    }
}

/// Reject migration sets containing two scripts with the same version.
pub fn check_unique_versions(migrations: &[Migration]) -> RouterResult<()> {
    for pair in migrations.windows(2) {
        if pair[0].version == pair[1].version {
            return Err(RouterError::invalid_migration(format!(
                "Duplicate migration version {}: '{}' and '{}'",
                pair[0].version, pair[0].name, pair[1].name
            )));
        }
    }
    Ok(())
}

/// A ledger row: one migration recorded as applied on one database.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedMigration {
    pub version: i64,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// Applied/pending state of one migration on one database.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub version: i64,
    pub name: String,
    /// `None` while the migration is still pending.
    pub applied_at: Option<DateTime<Utc>>,
}

impl MigrationStatus {
    pub fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }
}

/// Outcome of one `migrate` run against one logical database.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub identifier: String,
    /// Versions applied during this run, in apply order.
    pub applied: Vec<i64>,
    /// Count of versions the ledger already recorded before this run.
    pub previously_applied: usize,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_filename() {
        assert_eq!(
            Migration::parse_filename("V1__create_users.sql"),
            Some((1, "create_users".to_string()))
        );
        assert_eq!(
            Migration::parse_filename("V20240115__add_index.sql"),
            Some((20240115, "add_index".to_string()))
        );
    }

    #[test]
    fn test_parse_filename_rejects_malformed() {
        assert_eq!(Migration::parse_filename("create_users.sql"), None);
        assert_eq!(Migration::parse_filename("V__no_version.sql"), None);
        assert_eq!(Migration::parse_filename("V1__.sql"), None);
        assert_eq!(Migration::parse_filename("V1__name.txt"), None);
        assert_eq!(Migration::parse_filename("Vx__name.sql"), None);
        assert_eq!(Migration::parse_filename("V-3__name.sql"), None);
    }

    #[test]
    fn test_check_unique_versions() {
        let ok = vec![
            Migration::new(1, "a", "SELECT 1"),
            Migration::new(2, "b", "SELECT 1"),
        ];
        assert!(check_unique_versions(&ok).is_ok());

        let dup = vec![
            Migration::new(1, "a", "SELECT 1"),
            Migration::new(1, "b", "SELECT 1"),
        ];
        let err = check_unique_versions(&dup).unwrap_err();
        assert!(matches!(err, RouterError::InvalidMigration { .. }));
    }

    #[test]
    fn test_load_dir_sorts_by_version() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("V2__second.sql"), "SELECT 2;").unwrap();
        fs::write(dir.path().join("V10__tenth.sql"), "SELECT 10;").unwrap();
        fs::write(dir.path().join("V1__first.sql"), "SELECT 1;").unwrap();

        let migrations = Migration::load_dir(dir.path()).unwrap();
        let versions: Vec<i64> = migrations.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2, 10]);
        assert_eq!(migrations[0].name, "first");
        assert_eq!(migrations[0].sql, "SELECT 1;");
    }

    #[test]
    fn test_load_dir_rejects_stray_sql_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("V1__ok.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("notes.sql"), "-- scratch").unwrap();

        let err = Migration::load_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("notes.sql"));
    }

    #[test]
    fn test_load_dir_ignores_non_sql_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("V1__ok.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("README.md"), "docs").unwrap();

        let migrations = Migration::load_dir(dir.path()).unwrap();
        assert_eq!(migrations.len(), 1);
    }

    #[test]
    fn test_load_dir_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(Migration::load_dir(&missing).is_err());
    }

    #[test]
    fn test_migration_status_is_applied() {
        let pending = MigrationStatus {
            version: 1,
            name: "a".to_string(),
            applied_at: None,
        };
        assert!(!pending.is_applied());

        let applied = MigrationStatus {
            version: 1,
            name: "a".to_string(),
            applied_at: Some(Utc::now()),
        };
        assert!(applied.is_applied());
    }
}
