// Shard schema and the open-time URL-normalization migration.
//
// Open sequence, all inside one transaction: base tables → normalization
// migration → uniqueness index on sources(url) → FTS table + sync triggers.
// The migration must precede the index: legacy rows whose URLs normalize to
// the same key would otherwise make index creation fail.

use std::collections::HashMap;

use sqlx::{Row, SqlitePool};
use tracing::info;

use driftnet_common::{normalize_url, Result};

const BASE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    url TEXT NOT NULL,
    source_type TEXT NOT NULL,
    fetch_interval_ms INTEGER NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    config TEXT NOT NULL DEFAULT '{}',
    last_success_at INTEGER,
    last_attempt_at INTEGER,
    fail_count INTEGER NOT NULL DEFAULT 0,
    last_status TEXT NOT NULL DEFAULT 'ok',
    original_fetch_interval_ms INTEGER,
    etag TEXT,
    last_modified TEXT,
    content_hash TEXT,
    user_agent TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS extractions (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    title TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL,
    url TEXT NOT NULL DEFAULT '',
    content_hash TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    UNIQUE (source_id, content_hash)
);

CREATE TABLE IF NOT EXISTS fetch_log (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    status TEXT NOT NULL,
    http_status INTEGER NOT NULL DEFAULT 0,
    bytes_read INTEGER NOT NULL DEFAULT 0,
    new_extractions INTEGER NOT NULL DEFAULT 0,
    error TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fetch_log_source ON fetch_log(source_id, created_at);

CREATE TABLE IF NOT EXISTS questions (
    id TEXT PRIMARY KEY,
    text TEXT NOT NULL,
    keywords TEXT NOT NULL DEFAULT '[]',
    engine_ids TEXT NOT NULL DEFAULT '[]',
    interval_ms INTEGER NOT NULL,
    max_results INTEGER NOT NULL DEFAULT 10,
    follow_links INTEGER NOT NULL DEFAULT 0,
    enabled INTEGER NOT NULL DEFAULT 1,
    total_results INTEGER NOT NULL DEFAULT 0,
    last_run_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS search_engines (
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

const URL_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS idx_sources_url ON sources(url)";

const FTS_TABLE: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS extractions_fts
USING fts5(title, content, content='extractions', content_rowid='rowid')
"#;

const FTS_TRIGGERS: [&str; 3] = [
    r#"
    CREATE TRIGGER IF NOT EXISTS extractions_fts_ai AFTER INSERT ON extractions BEGIN
        INSERT INTO extractions_fts(rowid, title, content)
        VALUES (new.rowid, new.title, new.content);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS extractions_fts_ad AFTER DELETE ON extractions BEGIN
        INSERT INTO extractions_fts(extractions_fts, rowid, title, content)
        VALUES ('delete', old.rowid, old.title, old.content);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS extractions_fts_au AFTER UPDATE ON extractions BEGIN
        INSERT INTO extractions_fts(extractions_fts, rowid, title, content)
        VALUES ('delete', old.rowid, old.title, old.content);
        INSERT INTO extractions_fts(rowid, title, content)
        VALUES (new.rowid, new.title, new.content);
    END
    "#,
];

/// Bring a freshly opened shard up to the current schema.
pub(crate) async fn prepare(pool: &SqlitePool, dossier_id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;

    for statement in BASE_TABLES.split(';').filter(|s| !s.trim().is_empty()) {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    let rewritten = normalize_and_dedupe(&mut tx).await?;
    if rewritten > 0 {
        info!(dossier_id, rewritten, "URL normalization migration rewrote sources");
    }

    sqlx::query(URL_INDEX).execute(&mut *tx).await?;
    sqlx::query(FTS_TABLE).execute(&mut *tx).await?;
    for trigger in FTS_TRIGGERS {
        sqlx::query(trigger).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(())
}

/// One-shot normalization migration. Groups sources by normalized URL,
/// keeps the oldest row per group, cascades the rest away, and rewrites the
/// survivor's URL to the canonical form. Idempotent: a second run finds
/// every URL already normalized and unique.
async fn normalize_and_dedupe(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
) -> Result<usize> {
    let rows = sqlx::query("SELECT id, url, created_at FROM sources ORDER BY created_at ASC, id ASC")
        .fetch_all(&mut **tx)
        .await?;

    // Oldest-first iteration: the first row seen for a key is the survivor.
    let mut survivors: HashMap<String, (String, String)> = HashMap::new();
    let mut doomed: Vec<String> = Vec::new();

    for row in &rows {
        let id: String = row.try_get("id")?;
        let url: String = row.try_get("url")?;
        // A URL that no longer parses keeps its raw form as its identity.
        let canonical = normalize_url(&url).unwrap_or_else(|_| url.clone());

        match survivors.entry(canonical) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert((id, url));
            }
            std::collections::hash_map::Entry::Occupied(_) => doomed.push(id),
        }
    }

    for id in &doomed {
        sqlx::query("DELETE FROM extractions WHERE source_id = ?1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM fetch_log WHERE source_id = ?1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM sources WHERE id = ?1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
    }

    let mut rewritten = doomed.len();
    for (canonical, (id, original)) in survivors {
        if canonical != original {
            sqlx::query("UPDATE sources SET url = ?1 WHERE id = ?2")
                .bind(&canonical)
                .bind(&id)
                .execute(&mut **tx)
                .await?;
            rewritten += 1;
        }
    }

    Ok(rewritten)
}
