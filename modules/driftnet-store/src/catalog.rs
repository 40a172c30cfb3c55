// The shared cross-tenant catalog: which shards exist, plus an optional
// global search-engine registry consulted before the per-shard one.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use uuid::Uuid;

use driftnet_common::{Result, SearchEngine};

use crate::shard::engine_from_row;

pub const CATALOG_FILE: &str = "catalog.db";

#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

const CATALOG_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS shards (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'active'
);

CREATE TABLE IF NOT EXISTS global_search_engines (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    strategy TEXT NOT NULL,
    url_template TEXT NOT NULL,
    api_config TEXT NOT NULL DEFAULT '{}',
    selectors TEXT,
    rate_limit_ms INTEGER NOT NULL DEFAULT 1000,
    max_pages INTEGER NOT NULL DEFAULT 1,
    enabled INTEGER NOT NULL DEFAULT 1
);
"#;

impl Catalog {
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(data_dir.join(CATALOG_FILE))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::prepare(pool).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::prepare(pool).await
    }

    async fn prepare(pool: SqlitePool) -> Result<Self> {
        for statement in CATALOG_TABLES.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// Register a shard as active. Re-registering never demotes a shard
    /// that was archived or deleted.
    pub async fn register_shard(&self, dossier_id: &str) -> Result<()> {
        sqlx::query("INSERT INTO shards (id, status) VALUES (?1, 'active') ON CONFLICT (id) DO NOTHING")
            .bind(dossier_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_shard_status(&self, dossier_id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE shards SET status = ?2 WHERE id = ?1")
            .bind(dossier_id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The shards the scheduler and sweeper visit.
    pub async fn list_active_shards(&self) -> Result<Vec<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM shards WHERE status = 'active' ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    // --- Global search engines ---

    pub async fn insert_engine(&self, engine: &SearchEngine) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO global_search_engines
                (id, name, strategy, url_template, api_config, selectors,
                 rate_limit_ms, max_pages, enabled)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(engine.id.to_string())
        .bind(&engine.name)
        .bind(engine.strategy.to_string())
        .bind(&engine.url_template)
        .bind(engine.api_config.to_string())
        .bind(&engine.selectors)
        .bind(engine.rate_limit_ms)
        .bind(engine.max_pages as i64)
        .bind(engine.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_engine(&self, id: Uuid) -> Result<Option<SearchEngine>> {
        let row = sqlx::query("SELECT * FROM global_search_engines WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(engine_from_row).transpose()
    }

    pub async fn list_engines(&self) -> Result<Vec<SearchEngine>> {
        let rows = sqlx::query("SELECT * FROM global_search_engines ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(engine_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftnet_common::EngineStrategy;

    #[tokio::test]
    async fn shard_registry_filters_by_status() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        catalog.register_shard("alpha").await.unwrap();
        catalog.register_shard("beta").await.unwrap();
        catalog.register_shard("gamma").await.unwrap();
        catalog.set_shard_status("beta", "archived").await.unwrap();

        let active = catalog.list_active_shards().await.unwrap();
        assert_eq!(active, vec!["alpha".to_string(), "gamma".to_string()]);

        // Re-registering an archived shard does not resurrect it.
        catalog.register_shard("beta").await.unwrap();
        let active = catalog.list_active_shards().await.unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn global_engine_round_trip() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        let engine = SearchEngine {
            id: Uuid::now_v7(),
            name: "global-news".into(),
            strategy: EngineStrategy::Api,
            url_template: "https://search.example.com?q={query}".into(),
            api_config: serde_json::json!({"result_path": "hits"}),
            selectors: None,
            rate_limit_ms: 1000,
            max_pages: 1,
            enabled: true,
        };
        catalog.insert_engine(&engine).await.unwrap();
        let loaded = catalog.get_engine(engine.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "global-news");
        assert_eq!(catalog.list_engines().await.unwrap().len(), 1);
    }
}
