//! Migration Rollback - Handles rolling back applied migrations
//!
//! Reverts always run newest first. Each reverted migration commits its own
//! transaction, so a rollback that stops partway (irreversible migration,
//! failing DOWN body) keeps the reverts it already made and reports them in
//! `executed`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use super::definitions::{Migration, MigrationOutcome, MigrationRecord};
use super::runner::{MigrationRunner, Progress};
use crate::error::{MigrationError, MigrationResult};

/// Extension trait for MigrationRunner to add rollback functionality
#[async_trait]
pub trait MigrationRollback {
    /// Revert the last `steps` applied migrations
    async fn rollback(&self, steps: usize) -> MigrationOutcome;

    /// Revert every migration applied after `name`
    async fn rollback_to_version(&self, name: &str) -> MigrationOutcome;

    /// Revert all applied migrations
    async fn rollback_all(&self) -> MigrationOutcome;

    /// Revert every migration in the most recent batch
    async fn rollback_last_batch(&self) -> MigrationOutcome;
}

/// Which applied records a rollback targets
#[derive(Debug, Clone)]
enum RollbackTarget {
    Steps(usize),
    After(String),
    LastBatch,
}

impl RollbackTarget {
    /// Records to revert, newest first; `applied` is in applied order
    fn select(&self, applied: &[MigrationRecord]) -> MigrationResult<Vec<MigrationRecord>> {
        let start = match self {
            RollbackTarget::Steps(steps) => applied.len().saturating_sub(*steps),
            RollbackTarget::After(name) => {
                let index = applied
                    .iter()
                    .position(|r| &r.name == name)
                    .ok_or_else(|| MigrationError::UnknownVersion(name.clone()))?;
                index + 1
            }
            RollbackTarget::LastBatch => match applied.last() {
                Some(last) => applied
                    .iter()
                    .position(|r| r.batch == last.batch)
                    .unwrap_or(applied.len()),
                None => applied.len(),
            },
        };
        Ok(applied[start..].iter().rev().cloned().collect())
    }
}

#[async_trait]
impl MigrationRollback for MigrationRunner {
    async fn rollback(&self, steps: usize) -> MigrationOutcome {
        self.rollback_target(RollbackTarget::Steps(steps)).await
    }

    async fn rollback_to_version(&self, name: &str) -> MigrationOutcome {
        self.rollback_target(RollbackTarget::After(name.to_string()))
            .await
    }

    async fn rollback_all(&self) -> MigrationOutcome {
        self.rollback(usize::MAX).await
    }

    async fn rollback_last_batch(&self) -> MigrationOutcome {
        self.rollback_target(RollbackTarget::LastBatch).await
    }
}

// Extension methods for MigrationRunner
impl MigrationRunner {
    async fn rollback_target(&self, target: RollbackTarget) -> MigrationOutcome {
        let started = Instant::now();

        if let Err(e) = self.store().check_health().await {
            return MigrationOutcome::failed(Vec::new(), e, started);
        }

        // Validate outside the lock so no-ops and bad targets never contend
        match self.store().list_applied().await {
            Ok(applied) => match target.select(&applied) {
                Ok(records) if records.is_empty() => {
                    tracing::info!(target: "elif::migrate", "Nothing to roll back");
                    return MigrationOutcome::succeeded(Vec::new(), started);
                }
                Ok(_) => {}
                Err(e) => return MigrationOutcome::failed(Vec::new(), e, started),
            },
            Err(e) => return MigrationOutcome::failed(Vec::new(), e, started),
        }

        self.run_locked("rollback", started, || self.revert_selected(target))
            .await
    }

    async fn revert_selected(&self, target: RollbackTarget) -> Progress {
        let mut progress = Progress::default();

        let records = match self.store().list_applied().await {
            Ok(applied) => match target.select(&applied) {
                Ok(records) => records,
                Err(e) => return progress.stop(e),
            },
            Err(e) => return progress.stop(e),
        };

        let definitions: HashMap<String, Arc<dyn Migration>> = match self.registry().load() {
            Ok(migrations) => migrations
                .into_iter()
                .map(|m| (m.name().to_string(), m))
                .collect(),
            Err(e) => return progress.stop(e),
        };

        for record in records {
            let Some(migration) = definitions.get(&record.name) else {
                return progress.stop(MigrationError::DefinitionNotFound(record.name));
            };
            match self.revert_one(migration.as_ref()).await {
                Ok(()) => progress.executed.push(record.name),
                Err(e) => return progress.stop(e),
            }
        }
        progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ledger(entries: &[(&str, i64)]) -> Vec<MigrationRecord> {
        entries
            .iter()
            .map(|(name, batch)| MigrationRecord {
                name: name.to_string(),
                batch: *batch,
                applied_at: Utc::now(),
            })
            .collect()
    }

    fn names(records: Vec<MigrationRecord>) -> Vec<String> {
        records.into_iter().map(|r| r.name).collect()
    }

    #[test]
    fn test_select_steps_clamps() {
        let applied = ledger(&[("a", 1), ("b", 1), ("c", 2)]);
        assert_eq!(
            names(RollbackTarget::Steps(2).select(&applied).unwrap()),
            vec!["c", "b"]
        );
        assert_eq!(
            names(RollbackTarget::Steps(10).select(&applied).unwrap()),
            vec!["c", "b", "a"]
        );
        assert!(RollbackTarget::Steps(0).select(&applied).unwrap().is_empty());
        assert!(RollbackTarget::Steps(1).select(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_select_after_version() {
        let applied = ledger(&[("a", 1), ("b", 1), ("c", 2)]);
        assert_eq!(
            names(RollbackTarget::After("a".into()).select(&applied).unwrap()),
            vec!["c", "b"]
        );
        assert!(RollbackTarget::After("c".into())
            .select(&applied)
            .unwrap()
            .is_empty());
        assert_eq!(
            RollbackTarget::After("zzz".into()).select(&applied).unwrap_err(),
            MigrationError::UnknownVersion("zzz".into())
        );
    }

    #[test]
    fn test_select_last_batch() {
        let applied = ledger(&[("a", 1), ("b", 2), ("c", 2)]);
        assert_eq!(
            names(RollbackTarget::LastBatch.select(&applied).unwrap()),
            vec!["c", "b"]
        );
        assert!(RollbackTarget::LastBatch.select(&[]).unwrap().is_empty());
    }
}
