//! Status Reporter - read-only projections of the ledger
//!
//! Recomputed from the database on every call; another process may have
//! migrated since the last query.

use std::collections::HashSet;
use std::sync::Arc;

use super::definitions::{MigrationRecord, MigrationStatus};
use super::registry::MigrationRegistry;
use super::state_store::StateStore;
use crate::error::MigrationResult;

pub struct StatusReporter {
    registry: Arc<MigrationRegistry>,
    store: StateStore,
}

impl StatusReporter {
    pub fn new(registry: Arc<MigrationRegistry>, store: StateStore) -> Self {
        Self { registry, store }
    }

    /// Current, pending and completed migrations
    pub async fn status(&self) -> MigrationResult<MigrationStatus> {
        self.store.check_health().await?;
        let applied = self.store.list_applied().await?;
        let names = self.registry.names()?;
        Ok(project(&names, &applied))
    }

    /// Name of the most recently applied migration
    pub async fn current_version(&self) -> MigrationResult<Option<String>> {
        Ok(self.status().await?.current)
    }
}

/// `applied` must already be in applied order
pub(crate) fn project(registry_names: &[String], applied: &[MigrationRecord]) -> MigrationStatus {
    let applied_names: HashSet<&str> = applied.iter().map(|r| r.name.as_str()).collect();

    MigrationStatus {
        current: applied.last().map(|r| r.name.clone()),
        pending: registry_names
            .iter()
            .filter(|name| !applied_names.contains(name.as_str()))
            .cloned()
            .collect(),
        completed: applied.iter().map(|r| r.name.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(name: &str, batch: i64) -> MigrationRecord {
        MigrationRecord {
            name: name.to_string(),
            batch,
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn test_project_partial_ledger() {
        let names: Vec<String> = ["a_orgs", "b_users", "c_user_orgs"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let applied = vec![record("a_orgs", 1), record("b_users", 2)];

        let status = project(&names, &applied);
        assert_eq!(status.current.as_deref(), Some("b_users"));
        assert_eq!(status.completed, vec!["a_orgs", "b_users"]);
        assert_eq!(status.pending, vec!["c_user_orgs"]);
    }

    #[test]
    fn test_project_empty_ledger() {
        let names = vec!["a_orgs".to_string()];
        let status = project(&names, &[]);
        assert_eq!(status.current, None);
        assert!(status.completed.is_empty());
        assert_eq!(status.pending, vec!["a_orgs"]);
    }
}
