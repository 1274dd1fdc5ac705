//! Migration Runner - Executes migrations against the database
//!
//! Every mutating operation follows the same path: health check, take the run
//! lock, re-read the ledger under the lock, execute steps one transaction at a
//! time, release the lock. Failures are reported in the returned
//! [`MigrationOutcome`], never raised.

use futures::FutureExt;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyConnection, AnyPool};
use std::collections::HashSet;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::definitions::{
    Migration, MigrationDirection, MigrationOutcome, MigrationRecord, MigrationStatus, RunnerState,
};
use super::registry::MigrationRegistry;
use super::state_store::StateStore;
use super::status::StatusReporter;
use crate::config::MigrationConfig;
use crate::error::{MigrationError, MigrationResult};

/// Steps executed so far by one operation, and what stopped it
#[derive(Debug, Default)]
pub(crate) struct Progress {
    pub(crate) executed: Vec<String>,
    pub(crate) error: Option<MigrationError>,
}

impl Progress {
    pub(crate) fn stop(mut self, error: MigrationError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Migration runner that applies and reverts migrations against a database
pub struct MigrationRunner {
    registry: Arc<MigrationRegistry>,
    store: StateStore,
    reporter: StatusReporter,
    statement_timeout: Option<Duration>,
}

impl MigrationRunner {
    /// Create a runner over an existing pool, installing the state tables
    pub async fn new(
        registry: MigrationRegistry,
        pool: AnyPool,
        config: MigrationConfig,
    ) -> MigrationResult<Self> {
        config.validate()?;
        registry.load()?;

        let registry = Arc::new(registry);
        let store = StateStore::new(pool, &config);
        store.install().await?;

        Ok(Self {
            reporter: StatusReporter::new(Arc::clone(&registry), store.clone()),
            registry,
            store,
            statement_timeout: config.statement_timeout(),
        })
    }

    /// Connect to `config.database_url` and create a runner
    pub async fn connect(
        registry: MigrationRegistry,
        config: MigrationConfig,
    ) -> MigrationResult<Self> {
        let url = config
            .database_url
            .clone()
            .ok_or_else(|| MigrationError::Configuration("database_url is not set".to_string()))?;
        let pool = connect_pool(&url).await?;
        Self::new(registry, pool, config).await
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Apply every pending migration as one new batch
    pub async fn migrate_to_latest(&self) -> MigrationOutcome {
        let started = Instant::now();

        if let Err(e) = self.store.check_health().await {
            return MigrationOutcome::failed(Vec::new(), e, started);
        }

        match self.pending_migrations().await {
            Ok(pending) if pending.is_empty() => {
                tracing::info!(target: "elif::migrate", "Nothing to migrate");
                return MigrationOutcome::succeeded(Vec::new(), started);
            }
            Ok(_) => {}
            Err(e) => return MigrationOutcome::failed(Vec::new(), e, started),
        }

        self.run_locked("migrate", started, || self.apply_pending())
            .await
    }

    /// Current, pending and completed migrations
    pub async fn status(&self) -> MigrationResult<MigrationStatus> {
        self.reporter.status().await
    }

    /// Name of the most recently applied migration
    pub async fn current_version(&self) -> MigrationResult<Option<String>> {
        self.reporter.current_version().await
    }

    /// Close the underlying pool; a held lock is not touched
    pub async fn close(self) {
        self.store.pool().close().await;
    }

    /// Run `body` while holding the run lock
    pub(crate) async fn run_locked<'a, F, Fut>(
        &'a self,
        operation: &'static str,
        started: Instant,
        body: F,
    ) -> MigrationOutcome
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Progress> + Send + 'a,
    {
        let mut state = RunnerState::Idle;
        let token = Uuid::new_v4().to_string();

        if let Err(e) = self.store.acquire_lock(&token).await {
            tracing::warn!(target: "elif::migrate", operation, error = %e, "Migration run refused");
            return MigrationOutcome::failed(Vec::new(), e, started);
        }
        transition(&mut state, RunnerState::LockAcquired, operation);
        transition(&mut state, RunnerState::Executing, operation);

        let progress = match AssertUnwindSafe(body()).catch_unwind().await {
            Ok(progress) => progress,
            Err(panic) => Progress::default().stop(MigrationError::execution(
                operation,
                format!("panicked: {}", panic_message(panic.as_ref())),
            )),
        };

        let terminal = if progress.error.is_none() {
            RunnerState::Committed
        } else {
            RunnerState::Failed
        };
        transition(&mut state, terminal, operation);

        let released = self.store.release_lock(&token).await;
        transition(&mut state, RunnerState::Idle, operation);

        match (progress.error, released) {
            (Some(error), released) => {
                if let Err(e) = released {
                    tracing::error!(target: "elif::migrate", operation, error = %e, "Failed to release migration lock");
                }
                tracing::warn!(
                    target: "elif::migrate",
                    operation,
                    executed = progress.executed.len(),
                    error = %error,
                    "Migration run failed"
                );
                MigrationOutcome::failed(progress.executed, error, started)
            }
            (None, Err(e)) => MigrationOutcome::failed(progress.executed, e, started),
            (None, Ok(_)) => MigrationOutcome::succeeded(progress.executed, started),
        }
    }

    /// Pending definitions in registry order
    async fn pending_migrations(&self) -> MigrationResult<Vec<Arc<dyn Migration>>> {
        let migrations = self.registry.load()?;
        let applied = self.store.list_applied().await?;
        diff_pending(migrations, &applied)
    }

    async fn apply_pending(&self) -> Progress {
        let mut progress = Progress::default();

        // Another run may have finished between the first diff and the lock
        let pending = match self.pending_migrations().await {
            Ok(pending) => pending,
            Err(e) => return progress.stop(e),
        };
        if pending.is_empty() {
            return progress;
        }

        let batch = match self.store.next_batch().await {
            Ok(batch) => batch,
            Err(e) => return progress.stop(e),
        };

        for migration in pending {
            match self.apply_one(migration.as_ref(), batch).await {
                Ok(()) => progress.executed.push(migration.name().to_string()),
                Err(e) => return progress.stop(e),
            }
        }
        progress
    }

    async fn apply_one(&self, migration: &dyn Migration, batch: i64) -> MigrationResult<()> {
        let name = migration.name();
        let mut transaction = self.store.pool().begin().await.map_err(|e| {
            MigrationError::Database(format!("Failed to start transaction: {}", e))
        })?;

        self.run_step(migration, MigrationDirection::Up, &mut *transaction)
            .await?;
        self.store
            .record_applied(&mut *transaction, name, batch)
            .await?;

        transaction
            .commit()
            .await
            .map_err(|e| MigrationError::execution(name, format!("commit failed: {}", e)))?;

        tracing::info!(target: "elif::migrate", migration = name, batch, "Applied migration");
        Ok(())
    }

    pub(crate) async fn revert_one(&self, migration: &dyn Migration) -> MigrationResult<()> {
        let name = migration.name();
        if !migration.is_reversible() {
            return Err(MigrationError::MissingDownFunction(name.to_string()));
        }

        let mut transaction = self.store.pool().begin().await.map_err(|e| {
            MigrationError::Database(format!("Failed to start rollback transaction: {}", e))
        })?;

        self.run_step(migration, MigrationDirection::Down, &mut *transaction)
            .await?;
        self.store.record_reverted(&mut *transaction, name).await?;

        transaction
            .commit()
            .await
            .map_err(|e| MigrationError::execution(name, format!("commit failed: {}", e)))?;

        tracing::info!(target: "elif::migrate", migration = name, "Rolled back migration");
        Ok(())
    }

    /// Run one direction of a migration body, bounded by the step timeout
    async fn run_step(
        &self,
        migration: &dyn Migration,
        direction: MigrationDirection,
        conn: &mut AnyConnection,
    ) -> MigrationResult<()> {
        let name = migration.name();
        let body = async {
            match direction {
                MigrationDirection::Up => migration.up(conn).await,
                MigrationDirection::Down => migration.down(conn).await,
            }
        };
        let step = async {
            match AssertUnwindSafe(body).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(MigrationError::execution(
                    name,
                    format!("{} panicked: {}", direction, panic_message(panic.as_ref())),
                )),
            }
        };

        let result = match self.statement_timeout {
            Some(limit) => match tokio::time::timeout(limit, step).await {
                Ok(result) => result,
                Err(_) => Err(MigrationError::execution(
                    name,
                    format!("{} timed out after {:?}", direction, limit),
                )),
            },
            None => step.await,
        };

        result.map_err(|e| match e {
            MigrationError::Execution { .. } | MigrationError::MissingDownFunction(_) => e,
            other => MigrationError::execution(name, other),
        })
    }
}

/// Connect an `Any` pool, registering the compiled-in drivers first
pub async fn connect_pool(url: &str) -> MigrationResult<AnyPool> {
    sqlx::any::install_default_drivers();
    AnyPoolOptions::new()
        .connect(url)
        .await
        .map_err(|e| MigrationError::Database(format!("Failed to connect to database: {}", e)))
}

/// Definitions not yet applied, checking that the ledger is a registry prefix
pub(crate) fn diff_pending(
    migrations: Vec<Arc<dyn Migration>>,
    applied: &[MigrationRecord],
) -> MigrationResult<Vec<Arc<dyn Migration>>> {
    let known: HashSet<&str> = migrations.iter().map(|m| m.name()).collect();
    if let Some(unknown) = applied.iter().find(|r| !known.contains(r.name.as_str())) {
        return Err(MigrationError::DefinitionNotFound(unknown.name.clone()));
    }

    let applied_names: HashSet<&str> = applied.iter().map(|r| r.name.as_str()).collect();
    if let Some(gap) = migrations
        .iter()
        .take(applied.len())
        .find(|m| !applied_names.contains(m.name()))
    {
        return Err(MigrationError::OrderViolation(format!(
            "{} is pending but later migrations are already applied",
            gap.name()
        )));
    }

    Ok(migrations.into_iter().skip(applied.len()).collect())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

fn transition(state: &mut RunnerState, next: RunnerState, operation: &str) {
    tracing::debug!(target: "elif::migrate", operation, from = ?state, to = ?next, "Runner state change");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::SqlMigration;
    use chrono::Utc;

    fn definitions(names: &[&str]) -> Vec<Arc<dyn Migration>> {
        names
            .iter()
            .map(|n| Arc::new(SqlMigration::new(*n, "SELECT 1")) as Arc<dyn Migration>)
            .collect()
    }

    fn applied(names: &[&str]) -> Vec<MigrationRecord> {
        names
            .iter()
            .map(|n| MigrationRecord {
                name: n.to_string(),
                batch: 1,
                applied_at: Utc::now(),
            })
            .collect()
    }

    fn pending_names(pending: Vec<Arc<dyn Migration>>) -> Vec<String> {
        pending.iter().map(|m| m.name().to_string()).collect()
    }

    #[test]
    fn test_diff_pending_preserves_registry_order() {
        let pending = diff_pending(definitions(&["a", "b", "c"]), &applied(&["a"])).unwrap();
        assert_eq!(pending_names(pending), vec!["b", "c"]);

        let pending = diff_pending(definitions(&["a", "b"]), &applied(&["a", "b"])).unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn test_diff_pending_detects_gap() {
        let err = diff_pending(definitions(&["a", "b", "c"]), &applied(&["a", "c"]))
            .map(pending_names)
            .unwrap_err();
        assert!(matches!(err, MigrationError::OrderViolation(msg) if msg.starts_with("b ")));
    }

    #[test]
    fn test_diff_pending_detects_vanished_definition() {
        let err = diff_pending(definitions(&["a"]), &applied(&["a", "z"]))
            .map(pending_names)
            .unwrap_err();
        assert_eq!(err, MigrationError::DefinitionNotFound("z".to_string()));
    }

    #[test]
    fn test_transition_updates_state() {
        let mut state = RunnerState::Idle;
        transition(&mut state, RunnerState::LockAcquired, "migrate");
        assert_eq!(state, RunnerState::LockAcquired);
    }

    #[test]
    fn test_panic_message() {
        let from_str: Box<dyn Any + Send> = Box::new("boom");
        let from_string: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(from_str.as_ref()), "boom");
        assert_eq!(panic_message(from_string.as_ref()), "bang");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
