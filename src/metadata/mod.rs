//! Metadata persistence layer.
//!
//! The [`store::MetaDataRepo`] trait defines the interface the object
//! service consumes.  SQLite is the default implementation; PostgreSQL and
//! an in-memory map are also available.

pub mod memory;
pub mod postgres;
pub mod sqlite;
pub mod store;

use std::sync::Arc;

use crate::config::{DatabaseConfig, DatabaseType};
use crate::errors::{Result, ResultExt};

pub use store::{ListQuery, ListResult, MetaData, MetaDataRepo, ObjectEntry};

/// Open the configured repository, then ping, migrate and validate it.
pub async fn connect(cfg: &DatabaseConfig) -> Result<Arc<dyn MetaDataRepo>> {
    let table = &cfg.tables.meta_data;
    match cfg.db_type {
        DatabaseType::Sqlite => {
            let repo = sqlite::SqliteMetaDataRepo::open(&cfg.dsn, table).wrap_err("open sqlite")?;
            repo.ping().wrap_err("ping sqlite")?;
            repo.migrate().wrap_err("migrate sqlite")?;
            repo.validate_schema().wrap_err("validate sqlite schema")?;
            tracing::info!(dsn = %cfg.dsn, table = %table, "sqlite metadata repository ready");
            Ok(Arc::new(repo))
        }
        DatabaseType::Postgres => {
            let repo = postgres::PostgresMetaDataRepo::connect(&cfg.dsn, table, cfg.max_connections)
                .await
                .wrap_err("open postgres")?;
            repo.ping().await.wrap_err("ping postgres")?;
            repo.migrate().await.wrap_err("migrate postgres")?;
            repo.validate_schema()
                .await
                .wrap_err("validate postgres schema")?;
            tracing::info!(table = %table, "postgres metadata repository ready");
            Ok(Arc::new(repo))
        }
        DatabaseType::Memory => {
            tracing::warn!("using in-memory metadata repository; metadata is lost on exit");
            Ok(Arc::new(memory::MemoryMetaDataRepo::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DatabaseConfig {
            dsn: dir.path().join("meta.db").to_string_lossy().into_owned(),
            ..DatabaseConfig::default()
        };
        let repo = connect(&cfg).await.unwrap();
        let (m, inserted) = repo
            .upsert(ObjectEntry {
                path: "a.txt".into(),
                size: 1,
                etag: "e".into(),
                content_type: "text/plain".into(),
            })
            .await
            .unwrap();
        assert!(inserted);
        assert_eq!(repo.get("a.txt").await.unwrap().id, m.id);

        // Reopening runs the migration again without error.
        let again = connect(&cfg).await.unwrap();
        assert_eq!(again.get("a.txt").await.unwrap().id, m.id);
    }

    #[tokio::test]
    async fn test_connect_memory() {
        let cfg = DatabaseConfig {
            db_type: DatabaseType::Memory,
            ..DatabaseConfig::default()
        };
        let repo = connect(&cfg).await.unwrap();
        assert!(repo.get("x").await.unwrap_err().is_not_found());
    }
}
