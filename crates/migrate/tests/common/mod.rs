//! Shared fixtures for the integration tests
#![allow(dead_code)]

use elif_migrate::{
    connect_pool, MigrationConfig, MigrationRegistry, MigrationRegistryBuilder, MigrationRunner,
    SqlMigration,
};
use sqlx::AnyPool;
use sqlx::Row;
use tempfile::TempDir;

pub const CREATE_ORGS: &str = "20240101_120000_create_orgs";
pub const CREATE_USERS: &str = "20240101_120100_create_users";
pub const CREATE_USER_ORGS: &str = "20240101_120200_create_user_orgs";

/// A SQLite database file that lives as long as the fixture
pub struct TestDatabase {
    _dir: TempDir,
    pub url: String,
}

impl TestDatabase {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("app.db").display());
        Self { _dir: dir, url }
    }

    pub async fn pool(&self) -> AnyPool {
        connect_pool(&self.url).await.unwrap()
    }

    pub async fn runner(&self, registry: MigrationRegistry) -> MigrationRunner {
        self.runner_with_config(registry, MigrationConfig::default())
            .await
    }

    pub async fn runner_with_config(
        &self,
        registry: MigrationRegistry,
        config: MigrationConfig,
    ) -> MigrationRunner {
        MigrationRunner::new(registry, self.pool().await, config)
            .await
            .unwrap()
    }
}

pub fn orgs() -> SqlMigration {
    SqlMigration::new(
        CREATE_ORGS,
        "CREATE TABLE orgs (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
    )
    .with_down("DROP TABLE orgs")
}

pub fn users() -> SqlMigration {
    SqlMigration::new(
        CREATE_USERS,
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE)",
    )
    .with_down("DROP TABLE users")
}

pub fn user_orgs() -> SqlMigration {
    SqlMigration::new(
        CREATE_USER_ORGS,
        "CREATE TABLE user_orgs (\
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE, \
            org_id INTEGER NOT NULL REFERENCES orgs(id) ON DELETE CASCADE, \
            PRIMARY KEY (user_id, org_id))",
    )
    .with_down("DROP TABLE user_orgs")
}

/// Builder preloaded with orgs, users and user_orgs
pub fn org_schema() -> MigrationRegistryBuilder {
    MigrationRegistry::builder()
        .migration(orgs())
        .migration(users())
        .migration(user_orgs())
}

pub fn org_registry() -> MigrationRegistry {
    org_schema().build().unwrap()
}

/// User tables, excluding SQLite internals and the migration state tables
pub async fn tables(pool: &AnyPool) -> Vec<String> {
    sqlx::query(
        "SELECT name FROM sqlite_master WHERE type = 'table' \
         AND name NOT LIKE 'sqlite_%' AND name NOT LIKE 'elif_migrations%' ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .unwrap()
    .iter()
    .map(|row| row.get::<String, _>("name"))
    .collect()
}

pub async fn row_count(pool: &AnyPool, table: &str) -> i64 {
    sqlx::query(&format!("SELECT COUNT(*) AS total FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
        .get::<i64, _>("total")
}

pub async fn seed_orgs_and_users(pool: &AnyPool) {
    for sql in [
        "INSERT INTO orgs (id, name) VALUES (1, 'acme'), (2, 'globex')",
        "INSERT INTO users (id, email) VALUES (1, 'a@acme.test'), (2, 'b@acme.test'), (3, 'c@globex.test')",
        "INSERT INTO user_orgs (user_id, org_id) VALUES (1, 1), (2, 1), (3, 2)",
    ] {
        sqlx::query(sql).execute(pool).await.unwrap();
    }
}
