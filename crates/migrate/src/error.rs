//! Error types for the migration engine
//!
//! Every failure the runner can report is a variant of [`MigrationError`].
//! Runner operations carry these inside a
//! [`MigrationOutcome`](crate::migrations::MigrationOutcome) instead of
//! returning them, so callers inspect the kind rather than catching faults.

use thiserror::Error;

/// Result type alias for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Error types for migration operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    /// Another run holds the lock, or a stale-lock takeover lost the race
    #[error("Could not acquire migration lock: {0}")]
    LockAcquisition(String),

    /// Two definitions share a name
    #[error("Duplicate migration name: {0}")]
    DuplicateName(String),

    /// The registry yielded no definitions while at least one was required
    #[error("Migration registry is empty")]
    EmptyRegistry,

    /// Rollback target is not in the applied set
    #[error("Migration {0} is not applied")]
    UnknownVersion(String),

    /// Attempted to revert an irreversible migration
    #[error("Migration {0} has no down migration and cannot be reverted")]
    MissingDownFunction(String),

    /// The body of an up or down migration failed
    #[error("Failed to execute migration {name}: {message}")]
    Execution { name: String, message: String },

    /// Ledger or lock tables are missing or unreadable
    #[error("Migration state store is corrupted: {0}")]
    StateStoreCorrupted(String),

    /// Applied migrations are not a prefix of the registry order
    #[error("Applied migrations diverge from registry order: {0}")]
    OrderViolation(String),

    /// An applied migration has no definition in the registry
    #[error("Migration definition not found for applied migration: {0}")]
    DefinitionNotFound(String),

    /// Database connection or query error outside of a migration body
    #[error("Database error: {0}")]
    Database(String),

    /// Filesystem error while reading or writing migration files
    #[error("IO error: {0}")]
    Io(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Fieldless discriminant of [`MigrationError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationErrorKind {
    LockAcquisition,
    DuplicateName,
    EmptyRegistry,
    UnknownVersion,
    MissingDownFunction,
    Execution,
    StateStoreCorrupted,
    OrderViolation,
    DefinitionNotFound,
    Database,
    Io,
    Configuration,
}

impl MigrationError {
    /// Build an execution error for the named migration
    pub fn execution(name: &str, message: impl std::fmt::Display) -> Self {
        MigrationError::Execution {
            name: name.to_string(),
            message: message.to_string(),
        }
    }

    /// Get the kind of this error
    pub fn kind(&self) -> MigrationErrorKind {
        match self {
            MigrationError::LockAcquisition(_) => MigrationErrorKind::LockAcquisition,
            MigrationError::DuplicateName(_) => MigrationErrorKind::DuplicateName,
            MigrationError::EmptyRegistry => MigrationErrorKind::EmptyRegistry,
            MigrationError::UnknownVersion(_) => MigrationErrorKind::UnknownVersion,
            MigrationError::MissingDownFunction(_) => MigrationErrorKind::MissingDownFunction,
            MigrationError::Execution { .. } => MigrationErrorKind::Execution,
            MigrationError::StateStoreCorrupted(_) => MigrationErrorKind::StateStoreCorrupted,
            MigrationError::OrderViolation(_) => MigrationErrorKind::OrderViolation,
            MigrationError::DefinitionNotFound(_) => MigrationErrorKind::DefinitionNotFound,
            MigrationError::Database(_) => MigrationErrorKind::Database,
            MigrationError::Io(_) => MigrationErrorKind::Io,
            MigrationError::Configuration(_) => MigrationErrorKind::Configuration,
        }
    }
}

// Convert from sqlx errors
impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        MigrationError::Database(err.to_string())
    }
}

impl From<std::io::Error> for MigrationError {
    fn from(err: std::io::Error) -> Self {
        MigrationError::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for MigrationError {
    fn from(err: serde_yaml::Error) -> Self {
        MigrationError::Configuration(err.to_string())
    }
}
