//! Migration Definitions - Core types and structures for migrations
//!
//! Defines the `Migration` trait every schema change implements, the SQL-backed
//! `SqlMigration`, and the records and results exchanged with the runner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::AnyConnection;
use std::time::Instant;

use super::source::split_sql_statements;
use crate::error::{MigrationError, MigrationErrorKind, MigrationResult};

/// A named, ordered unit of schema change
///
/// The name is both the identity recorded in the ledger and the ordering key,
/// so it must be unique and should sort chronologically (e.g. a
/// `YYYYMMDD_HHMMSS_` prefix).
#[async_trait]
pub trait Migration: Send + Sync {
    /// Unique, stable name of the migration
    fn name(&self) -> &str;

    /// Apply the schema change
    async fn up(&self, conn: &mut AnyConnection) -> MigrationResult<()>;

    /// Reverse the schema change
    async fn down(&self, _conn: &mut AnyConnection) -> MigrationResult<()> {
        Err(MigrationError::MissingDownFunction(self.name().to_string()))
    }

    /// Whether `down` can be run at all
    fn is_reversible(&self) -> bool {
        true
    }
}

/// Migration backed by UP and DOWN SQL text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlMigration {
    /// Unique identifier, typically `YYYYMMDD_HHMMSS_description`
    pub name: String,
    /// SQL statements to apply the migration
    pub up_sql: String,
    /// SQL statements to rollback the migration, `None` if irreversible
    pub down_sql: Option<String>,
}

impl SqlMigration {
    pub fn new(name: impl Into<String>, up_sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            up_sql: up_sql.into(),
            down_sql: None,
        }
    }

    pub fn with_down(mut self, down_sql: impl Into<String>) -> Self {
        let down_sql = down_sql.into();
        self.down_sql = if down_sql.trim().is_empty() {
            None
        } else {
            Some(down_sql)
        };
        self
    }

    async fn execute_sql(&self, conn: &mut AnyConnection, sql: &str) -> MigrationResult<()> {
        for statement in split_sql_statements(sql) {
            sqlx::query(&statement)
                .execute(&mut *conn)
                .await
                .map_err(|e| MigrationError::execution(&self.name, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Migration for SqlMigration {
    fn name(&self) -> &str {
        &self.name
    }

    async fn up(&self, conn: &mut AnyConnection) -> MigrationResult<()> {
        self.execute_sql(conn, &self.up_sql).await
    }

    async fn down(&self, conn: &mut AnyConnection) -> MigrationResult<()> {
        match &self.down_sql {
            Some(sql) => self.execute_sql(conn, sql).await,
            None => Err(MigrationError::MissingDownFunction(self.name.clone())),
        }
    }

    fn is_reversible(&self) -> bool {
        self.down_sql.is_some()
    }
}

/// Ledger row for an applied migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Migration name
    pub name: String,
    /// Batch number (one per `migrate_to_latest` run)
    pub batch: i64,
    /// When the migration was applied
    pub applied_at: DateTime<Utc>,
}

/// The single row of the lock table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder_token: String,
    pub acquired_at: DateTime<Utc>,
}

/// Derived view of the ledger against the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    /// Most recently applied migration
    pub current: Option<String>,
    /// Registry names not yet applied, in registry order
    pub pending: Vec<String>,
    /// Applied names, in applied order
    pub completed: Vec<String>,
}

/// Result of a runner operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Whether the operation completed without error
    pub success: bool,
    /// Names applied or reverted by this call, in execution order
    pub executed: Vec<String>,
    /// The error that stopped the operation
    pub error: Option<MigrationError>,
    /// Total execution time in milliseconds
    pub duration_ms: u128,
}

impl MigrationOutcome {
    pub(crate) fn succeeded(executed: Vec<String>, started: Instant) -> Self {
        Self {
            success: true,
            executed,
            error: None,
            duration_ms: started.elapsed().as_millis(),
        }
    }

    pub(crate) fn failed(executed: Vec<String>, error: MigrationError, started: Instant) -> Self {
        Self {
            success: false,
            executed,
            error: Some(error),
            duration_ms: started.elapsed().as_millis(),
        }
    }

    /// Kind of the carried error, if any
    pub fn error_kind(&self) -> Option<MigrationErrorKind> {
        self.error.as_ref().map(MigrationError::kind)
    }
}

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDirection {
    /// Apply the migration (run UP statements)
    Up,
    /// Rollback the migration (run DOWN statements)
    Down,
}

impl std::fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationDirection::Up => write!(f, "up"),
            MigrationDirection::Down => write!(f, "down"),
        }
    }
}

/// Lifecycle of a single runner operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    LockAcquired,
    Executing,
    Committed,
    Failed,
}
