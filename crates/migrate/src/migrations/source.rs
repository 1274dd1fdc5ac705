//! Migration Sources - where definitions come from
//!
//! A source yields migration definitions on demand. `StaticSource` wraps a
//! registration list compiled into the program; `DirectorySource` scans a
//! directory of `.sql` files with UP and DOWN sections.

use chrono::Utc;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::definitions::{Migration, MigrationDirection, SqlMigration};
use crate::error::{MigrationError, MigrationResult};

/// Yields the migration definitions known to one origin
pub trait MigrationSource: Send + Sync {
    /// Produce the definitions, re-reading the origin on every call
    fn migrations(&self) -> MigrationResult<Vec<Arc<dyn Migration>>>;
}

/// Fixed registration list
#[derive(Clone, Default)]
pub struct StaticSource {
    migrations: Vec<Arc<dyn Migration>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, migration: impl Migration + 'static) -> Self {
        self.migrations.push(Arc::new(migration));
        self
    }

    pub fn push(&mut self, migration: Arc<dyn Migration>) {
        self.migrations.push(migration);
    }
}

impl MigrationSource for StaticSource {
    fn migrations(&self) -> MigrationResult<Vec<Arc<dyn Migration>>> {
        Ok(self.migrations.clone())
    }
}

/// Directory of `<timestamp>_<name>.sql` files
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create a new migration file and return its file name
    pub fn create_migration(&self, name: &str) -> MigrationResult<String> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            MigrationError::Io(format!("Failed to create migrations directory: {}", e))
        })?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let migration_name = format!("{}_{}", timestamp, name.replace(' ', "_").to_lowercase());
        let filename = format!("{}.sql", migration_name);
        let filepath = self.dir.join(&filename);

        if filepath.exists() {
            return Err(MigrationError::DuplicateName(migration_name));
        }

        fs::write(&filepath, migration_template(name, &migration_name))
            .map_err(|e| MigrationError::Io(format!("Failed to write migration file: {}", e)))?;

        tracing::info!(target: "elif::migrate", file = %filename, "Created migration");
        Ok(filename)
    }

    /// Load all migration files, sorted by name
    pub fn load_sql_migrations(&self) -> MigrationResult<Vec<SqlMigration>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|e| {
            MigrationError::Io(format!("Failed to read migrations directory: {}", e))
        })?;

        let mut migrations = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| MigrationError::Io(format!("Failed to read directory entry: {}", e)))?
                .path();
            if path.extension().map_or(false, |ext| ext == "sql") {
                migrations.push(parse_migration_file(&path)?);
            }
        }

        migrations.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(migrations)
    }
}

impl MigrationSource for DirectorySource {
    fn migrations(&self) -> MigrationResult<Vec<Arc<dyn Migration>>> {
        Ok(self
            .load_sql_migrations()?
            .into_iter()
            .map(|m| Arc::new(m) as Arc<dyn Migration>)
            .collect())
    }
}

fn parse_migration_file(path: &Path) -> MigrationResult<SqlMigration> {
    let content = fs::read_to_string(path)
        .map_err(|e| MigrationError::Io(format!("Failed to read migration file: {}", e)))?;

    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| MigrationError::Io("Invalid migration filename".to_string()))?;

    if !name.contains('_') {
        return Err(MigrationError::Io(format!(
            "Migration filename must follow format timestamp_name: {}",
            name
        )));
    }

    let (up_sql, down_sql) = parse_migration_content(&content);
    Ok(SqlMigration::new(name, up_sql).with_down(down_sql))
}

/// Split file content into its UP and DOWN sections
pub fn parse_migration_content(content: &str) -> (String, String) {
    let mut up_sql = Vec::new();
    let mut down_sql = Vec::new();
    let mut current = None;

    for line in content.lines() {
        if let Some(direction) = section_marker(line) {
            current = Some(direction);
            continue;
        }

        if line.trim().is_empty() || line.trim().starts_with("--") {
            continue;
        }

        match current {
            Some(MigrationDirection::Up) => up_sql.push(line),
            Some(MigrationDirection::Down) => down_sql.push(line),
            None => {}
        }
    }

    (
        up_sql.join("\n").trim().to_string(),
        down_sql.join("\n").trim().to_string(),
    )
}

/// `-- Up`, `-- Up migration`, `-- down migration` and the like
fn section_marker(line: &str) -> Option<MigrationDirection> {
    let comment = line.trim().strip_prefix("--")?.trim().to_lowercase();
    let word = comment.split_whitespace().next()?;
    let rest = comment[word.len()..].trim();
    if !(rest.is_empty() || rest.starts_with("migration")) {
        return None;
    }
    match word {
        "up" => Some(MigrationDirection::Up),
        "down" => Some(MigrationDirection::Down),
        _ => None,
    }
}

/// Split SQL text into individual statements
///
/// Falls back to splitting on `;` when the text does not parse.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    if sql.trim().is_empty() {
        return Vec::new();
    }

    match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) => statements.iter().map(|stmt| stmt.to_string()).collect(),
        Err(e) => {
            tracing::debug!(target: "elif::migrate", error = %e, "SQL parsing failed, splitting on semicolons");
            sql.split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        }
    }
}

fn migration_template(name: &str, migration_name: &str) -> String {
    format!(
        "-- Migration: {}\n\
         -- Name: {}\n\
         -- Created: {}\n\n\
         -- Up migration\n\n\n\
         -- Down migration\n\
         -- Leave empty to mark the migration irreversible\n\n",
        name,
        migration_name,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    )
}
