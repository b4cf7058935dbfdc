//! Database abstraction layer.
//!
//! This module provides the routing core:
//! - Connection pools and the process-wide registry
//! - Task-local connection switching
//! - Per-database schema migrations

pub mod migrate;
pub mod pool;
pub mod scope;

pub use migrate::{MIGRATIONS_TABLE, MigrationRunner};
pub use pool::{ConnectionRegistry, DbPool};
pub use scope::{ConnectionHandle, active_identifier};
