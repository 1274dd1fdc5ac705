//! Migration System
//!
//! Definitions and their sources, the registry that orders them, the state
//! store that records what has been applied, and the runner that moves the
//! database between versions.

pub mod definitions;
pub mod registry;
pub mod rollback;
pub mod runner;
pub mod source;
pub mod state_store;
pub mod status;

pub use definitions::*;
pub use registry::{MigrationRegistry, MigrationRegistryBuilder};
pub use rollback::MigrationRollback;
pub use runner::{connect_pool, MigrationRunner};
pub use source::{DirectorySource, MigrationSource, StaticSource};
pub use state_store::StateStore;
pub use status::StatusReporter;
