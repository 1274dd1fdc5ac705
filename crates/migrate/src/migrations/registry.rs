//! Migration Registry - the authoritative ordered set of definitions
//!
//! Sources are re-read on every `load`, so definitions added on disk between
//! runs are picked up without restarting.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use super::definitions::Migration;
use super::source::{DirectorySource, MigrationSource, StaticSource};
use crate::config::MigrationConfig;
use crate::error::{MigrationError, MigrationResult};

/// Ordered collection of migration definitions
pub struct MigrationRegistry {
    sources: Vec<Box<dyn MigrationSource>>,
    require_non_empty: bool,
}

impl MigrationRegistry {
    /// Create a registry over the given sources
    ///
    /// Loads once eagerly so duplicate names fail here rather than on the
    /// first run.
    pub fn new(sources: Vec<Box<dyn MigrationSource>>) -> MigrationResult<Self> {
        Self::with_policy(sources, false)
    }

    fn with_policy(
        sources: Vec<Box<dyn MigrationSource>>,
        require_non_empty: bool,
    ) -> MigrationResult<Self> {
        let registry = Self {
            sources,
            require_non_empty,
        };
        registry.load()?;
        Ok(registry)
    }

    pub fn builder() -> MigrationRegistryBuilder {
        MigrationRegistryBuilder::default()
    }

    /// Assemble every definition, sorted by name
    pub fn load(&self) -> MigrationResult<Vec<Arc<dyn Migration>>> {
        let mut migrations = Vec::new();
        for source in &self.sources {
            migrations.extend(source.migrations()?);
        }

        migrations.sort_by(|a, b| a.name().cmp(b.name()));

        let mut seen = HashSet::new();
        for migration in &migrations {
            if !seen.insert(migration.name()) {
                return Err(MigrationError::DuplicateName(migration.name().to_string()));
            }
        }

        if self.require_non_empty && migrations.is_empty() {
            return Err(MigrationError::EmptyRegistry);
        }

        Ok(migrations)
    }

    /// Names of every definition, in order
    pub fn names(&self) -> MigrationResult<Vec<String>> {
        Ok(self.load()?.iter().map(|m| m.name().to_string()).collect())
    }
}

/// Builder for [`MigrationRegistry`]
#[derive(Default)]
pub struct MigrationRegistryBuilder {
    registered: StaticSource,
    sources: Vec<Box<dyn MigrationSource>>,
    require_non_empty: bool,
}

impl MigrationRegistryBuilder {
    /// Start from `migrations_dir` and `require_non_empty` in the config
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::default()
            .directory(config.migrations_dir.clone())
            .require_non_empty(config.require_non_empty)
    }

    /// Register a single definition
    pub fn migration(mut self, migration: impl Migration + 'static) -> Self {
        self.registered.push(Arc::new(migration));
        self
    }

    /// Scan a directory of `.sql` migration files
    pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sources.push(Box::new(DirectorySource::new(dir)));
        self
    }

    pub fn source(mut self, source: impl MigrationSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn require_non_empty(mut self, required: bool) -> Self {
        self.require_non_empty = required;
        self
    }

    pub fn build(self) -> MigrationResult<MigrationRegistry> {
        let mut sources: Vec<Box<dyn MigrationSource>> = vec![Box::new(self.registered)];
        sources.extend(self.sources);
        MigrationRegistry::with_policy(sources, self.require_non_empty)
    }
}
