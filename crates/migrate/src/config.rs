//! Migration configuration
//!
//! Loaded from YAML, optionally overridden from the environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MigrationError, MigrationResult};

/// Configuration for the migration system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Connection URL (`postgres://...` or `sqlite://...`)
    pub database_url: Option<String>,
    /// Directory where migration files are stored
    pub migrations_dir: PathBuf,
    /// Table name for tracking migrations
    pub migrations_table: String,
    /// Table name for the single-row run lock
    pub lock_table: String,
    /// Age in milliseconds after which a held lock is considered abandoned
    pub lock_max_age_ms: u64,
    /// Upper bound in milliseconds for a single up or down step
    pub statement_timeout_ms: Option<u64>,
    /// Fail with `EmptyRegistry` when no migrations are defined
    pub require_non_empty: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            migrations_dir: PathBuf::from("migrations"),
            migrations_table: "elif_migrations".to_string(),
            lock_table: "elif_migrations_lock".to_string(),
            lock_max_age_ms: 600_000,
            statement_timeout_ms: None,
            require_non_empty: false,
        }
    }
}

impl MigrationConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> MigrationResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MigrationConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DATABASE_URL` and `ELIF_MIGRATIONS_TABLE` from the environment
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Ok(table) = std::env::var("ELIF_MIGRATIONS_TABLE") {
            self.lock_table = format!("{}_lock", table);
            self.migrations_table = table;
        }
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_migrations_table(mut self, table: impl Into<String>) -> Self {
        self.migrations_table = table.into();
        self
    }

    pub fn with_lock_max_age(mut self, max_age: Duration) -> Self {
        self.lock_max_age_ms = millis(max_age);
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout_ms = Some(millis(timeout));
        self
    }

    pub fn lock_max_age(&self) -> Duration {
        Duration::from_millis(self.lock_max_age_ms)
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms.map(Duration::from_millis)
    }

    /// Table names are interpolated into SQL, so only plain identifiers pass
    pub fn validate(&self) -> MigrationResult<()> {
        for table in [&self.migrations_table, &self.lock_table] {
            if !is_plain_identifier(table) {
                return Err(MigrationError::Configuration(format!(
                    "invalid table name '{}'",
                    table
                )));
            }
        }
        // A zero max age makes every live lock look stale
        if self.lock_max_age_ms == 0 {
            return Err(MigrationError::Configuration(
                "lock_max_age_ms must be greater than zero".to_string(),
            ));
        }
        if self.statement_timeout_ms == Some(0) {
            return Err(MigrationError::Configuration(
                "statement_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.migrations_table == self.lock_table {
            return Err(MigrationError::Configuration(
                "migrations_table and lock_table must differ".to_string(),
            ));
        }
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
