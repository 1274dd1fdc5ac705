//! # elif-migrate: Reversible schema migrations for elif.rs
//!
//! Applies an ordered set of migrations to reach the latest schema and
//! reverses them one step, several steps, back to a named version, or all the
//! way. What has been applied lives in a ledger table inside the target
//! database, and a single-row lock table keeps concurrent runs from different
//! processes from interleaving.
//!
//! ```rust,ignore
//! use elif_migrate::{MigrationConfig, MigrationRegistry, MigrationRollback, MigrationRunner};
//!
//! let registry = MigrationRegistry::builder().directory("migrations").build()?;
//! let config = MigrationConfig::default().with_env_overrides();
//! let runner = MigrationRunner::connect(registry, config).await?;
//!
//! let outcome = runner.migrate_to_latest().await;
//! assert!(outcome.success, "{:?}", outcome.error);
//!
//! runner.rollback(1).await;
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod migrations;

pub use config::MigrationConfig;
pub use error::{MigrationError, MigrationErrorKind, MigrationResult};
pub use logging::{init_logging, LoggingConfig};
pub use migrations::*;

// Re-exported so migrations can name the connection type without a direct sqlx dependency
pub use async_trait::async_trait;
pub use sqlx::AnyConnection;
