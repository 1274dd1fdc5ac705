//! State Store - durable ledger of applied migrations and the run lock
//!
//! Both tables live in the target database so every process migrating the
//! same database sees the same state. Timestamps are stored as fixed-width
//! RFC 3339 text, which keeps them portable across backends and makes
//! lexicographic order match chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{AnyConnection, AnyPool};
use sqlx::Row;
use std::time::Duration;

use super::definitions::{LockRecord, MigrationRecord};
use crate::config::MigrationConfig;
use crate::error::{MigrationError, MigrationResult};

const LOCK_ROW_ID: i64 = 1;

/// Ledger and lock tables over a shared connection pool
#[derive(Debug, Clone)]
pub struct StateStore {
    pool: AnyPool,
    migrations_table: String,
    lock_table: String,
    lock_max_age: Duration,
}

impl StateStore {
    pub fn new(pool: AnyPool, config: &MigrationConfig) -> Self {
        Self {
            pool,
            migrations_table: config.migrations_table.clone(),
            lock_table: config.lock_table.clone(),
            lock_max_age: config.lock_max_age(),
        }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn migrations_table(&self) -> &str {
        &self.migrations_table
    }

    pub fn lock_table(&self) -> &str {
        &self.lock_table
    }

    /// Create the ledger and lock tables if they do not exist
    pub async fn install(&self) -> MigrationResult<()> {
        sqlx::query(&self.create_migrations_table_sql())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                MigrationError::Database(format!("Failed to create migrations table: {}", e))
            })?;
        sqlx::query(&self.create_lock_table_sql())
            .execute(&self.pool)
            .await
            .map_err(|e| MigrationError::Database(format!("Failed to create lock table: {}", e)))?;
        Ok(())
    }

    /// Whether both tables are present and readable
    pub async fn is_healthy(&self) -> bool {
        self.check_health().await.is_ok()
    }

    /// Like [`is_healthy`](Self::is_healthy), but says what is wrong
    pub async fn check_health(&self) -> MigrationResult<()> {
        let ledger = format!(
            "SELECT name, batch, applied_at FROM {} LIMIT 1",
            self.migrations_table
        );
        sqlx::query(&ledger)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| unreadable(&self.migrations_table, e))?;

        let lock = format!(
            "SELECT lock_id, holder_token, acquired_at FROM {} LIMIT 1",
            self.lock_table
        );
        sqlx::query(&lock)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| unreadable(&self.lock_table, e))?;

        Ok(())
    }

    /// Take the run lock for `token`
    ///
    /// Never waits: a live lock held by someone else fails immediately with
    /// `LockAcquisition`. A lock older than the configured max age is assumed
    /// abandoned and removed first.
    pub async fn acquire_lock(&self, token: &str) -> MigrationResult<()> {
        let cutoff = chrono::Duration::from_std(self.lock_max_age)
            .ok()
            .and_then(|max_age| Utc::now().checked_sub_signed(max_age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let stale = sqlx::query(&format!(
            "DELETE FROM {} WHERE lock_id = $1 AND acquired_at < $2",
            self.lock_table
        ))
        .bind(LOCK_ROW_ID)
        .bind(format_timestamp(cutoff))
        .execute(&self.pool)
        .await?;
        if stale.rows_affected() > 0 {
            tracing::warn!(
                target: "elif::migrate",
                max_age_ms = self.lock_max_age.as_millis() as u64,
                "Removed stale migration lock"
            );
        }

        let inserted = sqlx::query(&format!(
            "INSERT INTO {} (lock_id, holder_token, acquired_at) VALUES ($1, $2, $3) \
             ON CONFLICT (lock_id) DO NOTHING",
            self.lock_table
        ))
        .bind(LOCK_ROW_ID)
        .bind(token.to_string())
        .bind(now_timestamp())
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            let holder = self
                .lock_holder()
                .await?
                .map(|lock| format!("held by {} since {}", lock.holder_token, lock.acquired_at))
                .unwrap_or_else(|| "lock contended".to_string());
            return Err(MigrationError::LockAcquisition(holder));
        }

        tracing::debug!(target: "elif::migrate", token, "Acquired migration lock");
        Ok(())
    }

    /// Release the lock if `token` still holds it; returns whether it did
    pub async fn release_lock(&self, token: &str) -> MigrationResult<bool> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE lock_id = $1 AND holder_token = $2",
            self.lock_table
        ))
        .bind(LOCK_ROW_ID)
        .bind(token.to_string())
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected() > 0;
        if released {
            tracing::debug!(target: "elif::migrate", token, "Released migration lock");
        } else {
            tracing::warn!(target: "elif::migrate", token, "Migration lock was no longer held by this run");
        }
        Ok(released)
    }

    /// Current lock row, if any
    pub async fn lock_holder(&self) -> MigrationResult<Option<LockRecord>> {
        let row = sqlx::query(&format!(
            "SELECT holder_token, acquired_at FROM {} WHERE lock_id = $1",
            self.lock_table
        ))
        .bind(LOCK_ROW_ID)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let holder_token: String = row.try_get("holder_token").map_err(corrupted)?;
                let acquired_at: String = row.try_get("acquired_at").map_err(corrupted)?;
                Ok(Some(LockRecord {
                    holder_token,
                    acquired_at: parse_timestamp(&acquired_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Record a migration as applied on the migration's own transaction
    pub async fn record_applied(
        &self,
        conn: &mut AnyConnection,
        name: &str,
        batch: i64,
    ) -> MigrationResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (name, batch, applied_at) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO NOTHING",
            self.migrations_table
        ))
        .bind(name.to_string())
        .bind(batch)
        .bind(now_timestamp())
        .execute(&mut *conn)
        .await
        .map_err(|e| MigrationError::Database(format!("Failed to record migration: {}", e)))?;
        Ok(())
    }

    /// Remove a migration record on the revert's own transaction
    pub async fn record_reverted(&self, conn: &mut AnyConnection, name: &str) -> MigrationResult<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE name = $1",
            self.migrations_table
        ))
        .bind(name.to_string())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            MigrationError::Database(format!("Failed to remove migration record: {}", e))
        })?;
        Ok(())
    }

    /// Applied migrations in applied order
    pub async fn list_applied(&self) -> MigrationResult<Vec<MigrationRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT name, batch, applied_at FROM {} ORDER BY batch ASC, applied_at ASC, name ASC",
            self.migrations_table
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(corrupted)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name").map_err(corrupted)?;
            let batch: i64 = row.try_get("batch").map_err(corrupted)?;
            let applied_at: String = row.try_get("applied_at").map_err(corrupted)?;
            records.push(MigrationRecord {
                name,
                batch,
                applied_at: parse_timestamp(&applied_at)?,
            });
        }
        Ok(records)
    }

    /// Batch number for the next `migrate_to_latest` run
    pub async fn next_batch(&self) -> MigrationResult<i64> {
        let row = sqlx::query(&format!(
            "SELECT COALESCE(MAX(batch), 0) AS latest FROM {}",
            self.migrations_table
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(corrupted)?;

        let latest: i64 = row.try_get("latest").map_err(corrupted)?;
        Ok(latest + 1)
    }

    fn create_migrations_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                name VARCHAR(255) PRIMARY KEY,\n    \
                batch BIGINT NOT NULL,\n    \
                applied_at VARCHAR(64) NOT NULL\n\
            )",
            self.migrations_table
        )
    }

    fn create_lock_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                lock_id BIGINT PRIMARY KEY,\n    \
                holder_token VARCHAR(64) NOT NULL,\n    \
                acquired_at VARCHAR(64) NOT NULL\n\
            )",
            self.lock_table
        )
    }
}

/// Schema and decode failures mean damaged state tables; anything else is
/// a connection problem
fn corrupted(err: sqlx::Error) -> MigrationError {
    match err {
        sqlx::Error::Database(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => MigrationError::StateStoreCorrupted(err.to_string()),
        other => MigrationError::Database(other.to_string()),
    }
}

fn unreadable(table: &str, err: sqlx::Error) -> MigrationError {
    match corrupted(err) {
        MigrationError::StateStoreCorrupted(message) => MigrationError::StateStoreCorrupted(
            format!("table {} is unreadable: {}", table, message),
        ),
        other => other,
    }
}

fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> MigrationResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| {
            MigrationError::StateStoreCorrupted(format!("invalid timestamp '{}': {}", value, e))
        })
}
