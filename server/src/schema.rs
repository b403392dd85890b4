//! Database code packages installed under a shadow schema and promoted to live

use std::path::{Component, Path};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::fs;
use tracing::{debug, info};

use crate::errors::HostError;
use crate::utils::quote_ident;

/// Name of the file listing the SQL files of a code package
pub const MANIFEST_FILE: &str = "manifest.conf";

/// Where application SQL is installed
#[async_trait]
pub trait SchemaStore: Send + Sync {
    /// Recreate `schema` and run the code package in `sql_dir` inside it
    async fn install_code_package(&self, schema: &str, sql_dir: &Path) -> Result<(), HostError>;

    /// Replace `live` with `shadow`
    async fn promote(&self, shadow: &str, live: &str) -> Result<(), HostError>;
}

/// SQL files of a code package in execution order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodePackage {
    pub files: Vec<(String, String)>,
}

impl CodePackage {
    /// Read `manifest.conf` and every file it lists from `sql_dir`
    pub async fn load(sql_dir: &Path) -> Result<Self, HostError> {
        let manifest_path = sql_dir.join(MANIFEST_FILE);
        let manifest = fs::read_to_string(&manifest_path).await.map_err(|e| {
            HostError::InstallFailure(format!("cannot read {}: {}", manifest_path.display(), e))
        })?;

        let mut files = Vec::new();
        for name in parse_manifest(&manifest)? {
            let sql = fs::read_to_string(sql_dir.join(&name)).await.map_err(|e| {
                HostError::InstallFailure(format!("cannot read {}: {}", name, e))
            })?;
            files.push((name, sql));
        }

        Ok(Self { files })
    }
}

/// File names listed in a manifest. Blank lines and `#` comments are ignored.
pub fn parse_manifest(manifest: &str) -> Result<Vec<String>, HostError> {
    let mut names = Vec::new();
    for line in manifest.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let stays_inside = Path::new(line)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !stays_inside {
            return Err(HostError::InstallFailure(format!(
                "manifest entry {} is outside the sql directory",
                line
            )));
        }
        names.push(line.to_string());
    }
    Ok(names)
}

/// Shadow schema name for a live schema
pub fn shadow_schema(live: &str) -> String {
    format!("{}_next", live)
}

/// Postgres-backed schema store
#[derive(Debug, Clone)]
pub struct PgSchemaStore {
    pool: PgPool,
}

impl PgSchemaStore {
    pub async fn connect(url: &str) -> Result<Self, HostError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaStore for PgSchemaStore {
    async fn install_code_package(&self, schema: &str, sql_dir: &Path) -> Result<(), HostError> {
        let package = CodePackage::load(sql_dir).await?;
        let quoted = quote_ident(schema);

        let mut tx = self.pool.begin().await?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&format!("drop schema if exists {} cascade", quoted)))
            .await?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&format!("create schema {}", quoted)))
            .await?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&format!("set local search_path to {}", quoted)))
            .await?;

        for (name, sql) in &package.files {
            debug!("Running {} in schema {}", name, schema);
            sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(sql))
                .await
                .map_err(|e| HostError::InstallFailure(format!("{}: {}", name, e)))?;
        }

        tx.commit().await?;
        info!("Installed {} SQL files into schema {}", package.files.len(), schema);
        Ok(())
    }

    async fn promote(&self, shadow: &str, live: &str) -> Result<(), HostError> {
        let mut tx = self.pool.begin().await?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&format!("drop schema if exists {} cascade", quote_ident(live))))
            .await?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&format!(
            "alter schema {} rename to {}",
            quote_ident(shadow),
            quote_ident(live)
        )))
        .await?;
        tx.commit().await?;

        info!("Schema {} promoted to {}", shadow, live);
        Ok(())
    }
}
