// Per-dossier persistence. One SQLite file per tenant, one writer at a time.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use driftnet_common::{
    DriftnetError, EngineStrategy, Extraction, FetchLogEntry, FetchLogStatus, NewSource, Result,
    SearchEngine, SearchHit, ShardStats, Source, SourceStatus, SourceType, TrackedQuestion,
};

use crate::schema;

/// Handle to one tenant shard. Cheap to clone; writes serialize on the
/// single pooled connection.
#[derive(Clone)]
pub struct ShardStore {
    pool: SqlitePool,
    dossier_id: String,
}

/// Parameters for inserting a new extraction. The store generates the id.
#[derive(Debug, Clone)]
pub struct NewExtraction {
    pub source_id: Uuid,
    pub title: String,
    pub content: String,
    pub url: String,
    pub content_hash: String,
    pub metadata: serde_json::Value,
}

impl ShardStore {
    /// Open (creating if needed) the shard file and bring it to the current
    /// schema. The normalization migration runs on every open.
    pub async fn open(path: &Path, dossier_id: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        schema::prepare(&pool, dossier_id).await?;
        Ok(Self {
            pool,
            dossier_id: dossier_id.to_string(),
        })
    }

    /// In-memory shard for tests and ephemeral runs.
    pub async fn open_in_memory(dossier_id: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        schema::prepare(&pool, dossier_id).await?;
        Ok(Self {
            pool,
            dossier_id: dossier_id.to_string(),
        })
    }

    pub fn dossier_id(&self) -> &str {
        &self.dossier_id
    }

    // --- Sources ---

    /// Insert a validated, normalized source. A URL collision returns
    /// `DriftnetError::DuplicateSource`.
    pub async fn insert_source(&self, new: NewSource) -> Result<Source> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO sources
                (id, name, url, source_type, fetch_interval_ms, enabled, config,
                 created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(new.id.to_string())
        .bind(&new.name)
        .bind(&new.url)
        .bind(new.source_type.as_str())
        .bind(new.fetch_interval_ms)
        .bind(new.enabled)
        .bind(new.config.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self.get_source(new.id).await,
            Err(e) if is_unique_violation(&e, "sources.url") => {
                Err(DriftnetError::DuplicateSource(new.url))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_source(&self, id: Uuid) -> Result<Source> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DriftnetError::NotFound(format!("source {id}")))?;
        source_from_row(&row)
    }

    pub async fn get_source_by_url(&self, url: &str) -> Result<Option<Source>> {
        let row = sqlx::query("SELECT * FROM sources WHERE url = ?1")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query("SELECT * FROM sources ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(source_from_row).collect()
    }

    /// Enabled, non-broken sources whose interval has elapsed since the last
    /// attempt (or success, whichever is later), oldest due first.
    pub async fn list_due_sources(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Source>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM sources
            WHERE enabled = 1
              AND last_status != 'broken'
              AND MAX(COALESCE(last_success_at, 0), COALESCE(last_attempt_at, 0))
                  + fetch_interval_ms <= ?1
            ORDER BY MAX(COALESCE(last_success_at, 0), COALESCE(last_attempt_at, 0)) ASC
            LIMIT ?2
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    /// Sources the sweeper should probe: broken or erroring.
    pub async fn list_unhealthy_sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query(
            "SELECT * FROM sources WHERE last_status IN ('broken', 'error') ORDER BY updated_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    /// Full-row update. The façade re-validates before calling.
    pub async fn update_source(&self, source: &Source) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sources SET
                name = ?2, url = ?3, source_type = ?4, fetch_interval_ms = ?5,
                enabled = ?6, config = ?7, updated_at = ?8
            WHERE id = ?1
            "#,
        )
        .bind(source.id.to_string())
        .bind(&source.name)
        .bind(&source.url)
        .bind(source.source_type.as_str())
        .bind(source.fetch_interval_ms)
        .bind(source.enabled)
        .bind(source.config.to_string())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) if r.rows_affected() == 0 => {
                Err(DriftnetError::NotFound(format!("source {}", source.id)))
            }
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e, "sources.url") => {
                Err(DriftnetError::DuplicateSource(source.url.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a source and everything hanging off it, one transaction.
    pub async fn delete_source(&self, id: Uuid) -> Result<()> {
        let id = id.to_string();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM extractions WHERE source_id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM fetch_log WHERE source_id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM sources WHERE id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Err(DriftnetError::NotFound(format!("source {id}")));
        }
        Ok(())
    }

    pub async fn count_sources(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    // --- Fetch bookkeeping (pipeline / repair mutations) ---

    /// Stamp a fetch attempt, successful or not.
    pub async fn record_attempt(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sources SET last_attempt_at = ?2, updated_at = ?2 WHERE id = ?1")
            .bind(id.to_string())
            .bind(at.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a successful fetch: conditional-request metadata, content hash,
    /// status back to ok, failure streak cleared.
    pub async fn record_success(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        etag: Option<&str>,
        last_modified: Option<&str>,
        content_hash: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sources SET
                last_success_at = ?2,
                last_attempt_at = ?2,
                last_status = 'ok',
                fail_count = 0,
                etag = COALESCE(?3, etag),
                last_modified = COALESCE(?4, last_modified),
                content_hash = COALESCE(?5, content_hash),
                updated_at = ?2
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .bind(at.timestamp_millis())
        .bind(etag)
        .bind(last_modified)
        .bind(content_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed fetch. Returns the new consecutive-failure count.
    pub async fn record_failure(&self, id: Uuid, at: DateTime<Utc>) -> Result<u32> {
        sqlx::query(
            r#"
            UPDATE sources SET
                fail_count = fail_count + 1,
                last_status = 'error',
                last_attempt_at = ?2,
                updated_at = ?2
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let count: i64 = sqlx::query_scalar("SELECT fail_count FROM sources WHERE id = ?1")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u32)
    }

    /// Double the fetch interval (bounded), remembering the pre-backoff
    /// interval the first time.
    pub async fn apply_backoff(&self, id: Uuid, cap_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sources SET
                original_fetch_interval_ms = COALESCE(original_fetch_interval_ms, fetch_interval_ms),
                fetch_interval_ms = MIN(fetch_interval_ms * 2, ?2),
                updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .bind(cap_ms)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_broken(&self, id: Uuid) -> Result<()> {
        self.set_status(id, SourceStatus::Broken).await
    }

    async fn set_status(&self, id: Uuid, status: SourceStatus) -> Result<()> {
        sqlx::query("UPDATE sources SET last_status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id.to_string())
            .bind(status.to_string())
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_user_agent(&self, id: Uuid, user_agent: &str) -> Result<()> {
        sqlx::query("UPDATE sources SET user_agent = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id.to_string())
            .bind(user_agent)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Migrate a source to a redirect target. Collisions with an existing
    /// source surface as `DuplicateSource` for the caller to log.
    pub async fn set_url(&self, id: Uuid, url: &str) -> Result<()> {
        let result = sqlx::query("UPDATE sources SET url = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id.to_string())
            .bind(url)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e, "sources.url") => {
                Err(DriftnetError::DuplicateSource(url.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_config(&self, id: Uuid, config: &serde_json::Value) -> Result<()> {
        sqlx::query("UPDATE sources SET config = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id.to_string())
            .bind(config.to_string())
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clear the failure streak and status. Explicit operator reset.
    pub async fn reset_source(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sources SET fail_count = 0, last_status = 'ok', updated_at = ?2
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DriftnetError::NotFound(format!("source {id}")));
        }
        Ok(())
    }

    /// Sweeper restore: healthy again, original cadence back in force.
    pub async fn restore_source(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sources SET
                last_status = 'ok',
                fail_count = 0,
                fetch_interval_ms = COALESCE(original_fetch_interval_ms, fetch_interval_ms),
                original_fetch_interval_ms = NULL,
                updated_at = ?2
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Extractions ---

    /// Idempotent upsert keyed on `(source_id, content_hash)`. Returns the
    /// extraction id and whether this call inserted it.
    pub async fn insert_extraction(&self, new: NewExtraction) -> Result<(Uuid, bool)> {
        let id = Uuid::now_v7();
        let result = sqlx::query(
            r#"
            INSERT INTO extractions
                (id, source_id, title, content, url, content_hash, metadata, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (source_id, content_hash) DO NOTHING
            "#,
        )
        .bind(id.to_string())
        .bind(new.source_id.to_string())
        .bind(&new.title)
        .bind(&new.content)
        .bind(&new.url)
        .bind(&new.content_hash)
        .bind(new.metadata.to_string())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok((id, true));
        }

        let existing: String = sqlx::query_scalar(
            "SELECT id FROM extractions WHERE source_id = ?1 AND content_hash = ?2",
        )
        .bind(new.source_id.to_string())
        .bind(&new.content_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok((parse_uuid(&existing)?, false))
    }

    pub async fn get_extraction(&self, id: Uuid) -> Result<Extraction> {
        let row = sqlx::query("SELECT * FROM extractions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DriftnetError::NotFound(format!("extraction {id}")))?;
        extraction_from_row(&row)
    }

    pub async fn recent_extractions(&self, limit: u32) -> Result<Vec<Extraction>> {
        let rows = sqlx::query("SELECT * FROM extractions ORDER BY created_at DESC, id DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(extraction_from_row).collect()
    }

    pub async fn count_extractions(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM extractions")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    /// Full-text search over extraction titles and bodies, native relevance
    /// order. The query string is FTS5 syntax, passed through untouched.
    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchHit>> {
        let rows = sqlx::query(
            r#"
            SELECT e.id AS id, e.source_id AS source_id, e.title AS title, e.url AS url,
                   s.url AS source_url,
                   snippet(extractions_fts, 1, '', '', '…', 24) AS snippet
            FROM extractions_fts
            JOIN extractions e ON e.rowid = extractions_fts.rowid
            JOIN sources s ON s.id = e.source_id
            WHERE extractions_fts MATCH ?1
            ORDER BY rank
            LIMIT ?2
            "#,
        )
        .bind(query)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SearchHit {
                    extraction_id: parse_uuid(&row.try_get::<String, _>("id")?)?,
                    source_id: parse_uuid(&row.try_get::<String, _>("source_id")?)?,
                    source_url: row.try_get("source_url")?,
                    title: row.try_get("title")?,
                    url: row.try_get("url")?,
                    snippet: row.try_get("snippet")?,
                })
            })
            .collect()
    }

    // --- Fetch log ---

    pub async fn insert_fetch_log(
        &self,
        source_id: Uuid,
        status: FetchLogStatus,
        http_status: u16,
        bytes_read: u64,
        new_extractions: u32,
        error: &str,
    ) -> Result<Uuid> {
        let id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO fetch_log
                (id, source_id, status, http_status, bytes_read, new_extractions, error, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(id.to_string())
        .bind(source_id.to_string())
        .bind(status.to_string())
        .bind(http_status as i64)
        .bind(bytes_read as i64)
        .bind(new_extractions as i64)
        .bind(error)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn fetch_history(&self, source_id: Uuid, limit: u32) -> Result<Vec<FetchLogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM fetch_log WHERE source_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
        )
        .bind(source_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(fetch_log_from_row).collect()
    }

    pub async fn count_fetch_log(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fetch_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    // --- Stats ---

    pub async fn stats(&self) -> Result<ShardStats> {
        let mut stats = ShardStats {
            sources: self.count_sources().await?,
            extractions: self.count_extractions().await?,
            fetch_log_entries: self.count_fetch_log().await?,
            ..Default::default()
        };

        let rows = sqlx::query("SELECT last_status, COUNT(*) AS n FROM sources GROUP BY last_status")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let status: String = row.try_get("last_status")?;
            let n: i64 = row.try_get("n")?;
            match status.as_str() {
                "ok" => stats.sources_ok = n as u64,
                "error" => stats.sources_error = n as u64,
                "broken" => stats.sources_broken = n as u64,
                _ => {}
            }
        }

        let last: Option<i64> = sqlx::query_scalar("SELECT MAX(created_at) FROM fetch_log")
            .fetch_one(&self.pool)
            .await?;
        stats.last_activity_at = last.and_then(DateTime::from_timestamp_millis);

        Ok(stats)
    }

    // --- Tracked questions ---

    pub async fn insert_question(&self, question: &TrackedQuestion) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO questions
                (id, text, keywords, engine_ids, interval_ms, max_results, follow_links,
                 enabled, total_results, last_run_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(question.id.to_string())
        .bind(&question.text)
        .bind(serde_json::to_string(&question.keywords).unwrap_or_else(|_| "[]".into()))
        .bind(serde_json::to_string(&question.engine_ids).unwrap_or_else(|_| "[]".into()))
        .bind(question.interval_ms)
        .bind(question.max_results as i64)
        .bind(question.follow_links)
        .bind(question.enabled)
        .bind(question.total_results as i64)
        .bind(question.last_run_at.map(|t| t.timestamp_millis()))
        .bind(question.created_at.timestamp_millis())
        .bind(question.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_question(&self, id: Uuid) -> Result<TrackedQuestion> {
        let row = sqlx::query("SELECT * FROM questions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DriftnetError::NotFound(format!("question {id}")))?;
        question_from_row(&row)
    }

    pub async fn list_questions(&self) -> Result<Vec<TrackedQuestion>> {
        let rows = sqlx::query("SELECT * FROM questions ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(question_from_row).collect()
    }

    pub async fn update_question(&self, question: &TrackedQuestion) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE questions SET
                text = ?2, keywords = ?3, engine_ids = ?4, interval_ms = ?5,
                max_results = ?6, follow_links = ?7, enabled = ?8, updated_at = ?9
            WHERE id = ?1
            "#,
        )
        .bind(question.id.to_string())
        .bind(&question.text)
        .bind(serde_json::to_string(&question.keywords).unwrap_or_else(|_| "[]".into()))
        .bind(serde_json::to_string(&question.engine_ids).unwrap_or_else(|_| "[]".into()))
        .bind(question.interval_ms)
        .bind(question.max_results as i64)
        .bind(question.follow_links)
        .bind(question.enabled)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DriftnetError::NotFound(format!("question {}", question.id)));
        }
        Ok(())
    }

    pub async fn delete_question(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM questions WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DriftnetError::NotFound(format!("question {id}")));
        }
        Ok(())
    }

    /// Bump run counters after a question run.
    pub async fn record_question_run(
        &self,
        id: Uuid,
        new_results: u32,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE questions SET
                total_results = total_results + ?2,
                last_run_at = ?3,
                updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .bind(new_results as i64)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Search engines (per-shard registry) ---

    pub async fn insert_engine(&self, engine: &SearchEngine) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO search_engines
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
        let row = sqlx::query("SELECT * FROM search_engines WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(engine_from_row).transpose()
    }

    pub async fn list_engines(&self) -> Result<Vec<SearchEngine>> {
        let rows = sqlx::query("SELECT * FROM search_engines ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(engine_from_row).collect()
    }

    pub async fn delete_engine(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM search_engines WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DriftnetError::NotFound(format!("engine {id}")));
        }
        Ok(())
    }
}

// --- Row mapping ---

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| DriftnetError::Parse(format!("bad uuid '{s}': {e}")))
}

fn parse_json(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or_else(|_| serde_json::json!({}))
}

fn opt_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

fn req_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn source_from_row(row: &SqliteRow) -> Result<Source> {
    let last_status: String = row.try_get("last_status")?;
    Ok(Source {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        source_type: SourceType::parse(&row.try_get::<String, _>("source_type")?),
        fetch_interval_ms: row.try_get("fetch_interval_ms")?,
        enabled: row.try_get("enabled")?,
        config: parse_json(&row.try_get::<String, _>("config")?),
        last_success_at: opt_ms(row.try_get("last_success_at")?),
        last_attempt_at: opt_ms(row.try_get("last_attempt_at")?),
        fail_count: row.try_get::<i64, _>("fail_count")? as u32,
        last_status: last_status.parse().map_err(DriftnetError::Parse)?,
        original_fetch_interval_ms: row.try_get("original_fetch_interval_ms")?,
        etag: row.try_get("etag")?,
        last_modified: row.try_get("last_modified")?,
        content_hash: row.try_get("content_hash")?,
        user_agent: row.try_get("user_agent")?,
        created_at: req_ms(row.try_get("created_at")?),
        updated_at: req_ms(row.try_get("updated_at")?),
    })
}

fn extraction_from_row(row: &SqliteRow) -> Result<Extraction> {
    Ok(Extraction {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        source_id: parse_uuid(&row.try_get::<String, _>("source_id")?)?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        url: row.try_get("url")?,
        content_hash: row.try_get("content_hash")?,
        metadata: parse_json(&row.try_get::<String, _>("metadata")?),
        created_at: req_ms(row.try_get("created_at")?),
    })
}

fn fetch_log_from_row(row: &SqliteRow) -> Result<FetchLogEntry> {
    let status: String = row.try_get("status")?;
    Ok(FetchLogEntry {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        source_id: parse_uuid(&row.try_get::<String, _>("source_id")?)?,
        status: status.parse().map_err(DriftnetError::Parse)?,
        http_status: row.try_get::<i64, _>("http_status")? as u16,
        bytes_read: row.try_get::<i64, _>("bytes_read")? as u64,
        new_extractions: row.try_get::<i64, _>("new_extractions")? as u32,
        error: row.try_get("error")?,
        created_at: req_ms(row.try_get("created_at")?),
    })
}

fn question_from_row(row: &SqliteRow) -> Result<TrackedQuestion> {
    let keywords: String = row.try_get("keywords")?;
    let engine_ids: String = row.try_get("engine_ids")?;
    Ok(TrackedQuestion {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        text: row.try_get("text")?,
        keywords: serde_json::from_str(&keywords).unwrap_or_default(),
        engine_ids: serde_json::from_str(&engine_ids).unwrap_or_default(),
        interval_ms: row.try_get("interval_ms")?,
        max_results: row.try_get::<i64, _>("max_results")? as u32,
        follow_links: row.try_get("follow_links")?,
        enabled: row.try_get("enabled")?,
        total_results: row.try_get::<i64, _>("total_results")? as u64,
        last_run_at: opt_ms(row.try_get("last_run_at")?),
        created_at: req_ms(row.try_get("created_at")?),
        updated_at: req_ms(row.try_get("updated_at")?),
    })
}

pub(crate) fn engine_from_row(row: &SqliteRow) -> Result<SearchEngine> {
    let strategy: String = row.try_get("strategy")?;
    Ok(SearchEngine {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        name: row.try_get("name")?,
        strategy: strategy
            .parse::<EngineStrategy>()
            .map_err(DriftnetError::Parse)?,
        url_template: row.try_get("url_template")?,
        api_config: parse_json(&row.try_get::<String, _>("api_config")?),
        selectors: row.try_get("selectors")?,
        rate_limit_ms: row.try_get("rate_limit_ms")?,
        max_pages: row.try_get::<i64, _>("max_pages")? as u32,
        enabled: row.try_get("enabled")?,
    })
}

fn is_unique_violation(err: &sqlx::Error, column: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let msg = db.message();
            msg.contains("UNIQUE constraint failed") && msg.contains(column)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftnet_common::content_hash;

    fn new_source(url: &str) -> NewSource {
        NewSource {
            id: Uuid::now_v7(),
            name: "test source".into(),
            url: url.into(),
            source_type: SourceType::Web,
            fetch_interval_ms: 3_600_000,
            enabled: true,
            config: serde_json::json!({}),
        }
    }

    fn new_extraction(source_id: Uuid, text: &str) -> NewExtraction {
        NewExtraction {
            source_id,
            title: "title".into(),
            content: text.into(),
            url: "https://example.com/item".into(),
            content_hash: content_hash(text),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn insert_and_get_source() {
        let store = ShardStore::open_in_memory("t1").await.unwrap();
        let created = store
            .insert_source(new_source("https://example.com/feed"))
            .await
            .unwrap();
        let loaded = store.get_source(created.id).await.unwrap();
        assert_eq!(loaded.url, "https://example.com/feed");
        assert_eq!(loaded.last_status, SourceStatus::Ok);
        assert_eq!(loaded.fail_count, 0);
        assert!(loaded.last_success_at.is_none());
    }

    #[tokio::test]
    async fn duplicate_url_rejected() {
        let store = ShardStore::open_in_memory("t1").await.unwrap();
        store
            .insert_source(new_source("https://example.com/feed"))
            .await
            .unwrap();
        let err = store
            .insert_source(new_source("https://example.com/feed"))
            .await
            .unwrap_err();
        assert!(matches!(err, DriftnetError::DuplicateSource(_)));

        // A different URL is fine.
        store
            .insert_source(new_source("https://example.com/other"))
            .await
            .unwrap();
        assert_eq!(store.count_sources().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn extraction_dedup_by_hash() {
        let store = ShardStore::open_in_memory("t1").await.unwrap();
        let source = store
            .insert_source(new_source("https://example.com/feed"))
            .await
            .unwrap();

        let (first_id, inserted) = store
            .insert_extraction(new_extraction(source.id, "same body"))
            .await
            .unwrap();
        assert!(inserted);

        let (second_id, inserted) = store
            .insert_extraction(new_extraction(source.id, "same body"))
            .await
            .unwrap();
        assert!(!inserted);
        assert_eq!(first_id, second_id);
        assert_eq!(store.count_extractions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn same_hash_different_sources_both_insert() {
        let store = ShardStore::open_in_memory("t1").await.unwrap();
        let a = store
            .insert_source(new_source("https://example.com/a"))
            .await
            .unwrap();
        let b = store
            .insert_source(new_source("https://example.com/b"))
            .await
            .unwrap();

        let (_, first) = store
            .insert_extraction(new_extraction(a.id, "body"))
            .await
            .unwrap();
        let (_, second) = store
            .insert_extraction(new_extraction(b.id, "body"))
            .await
            .unwrap();
        assert!(first && second);
        assert_eq!(store.count_extractions().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn delete_source_cascades() {
        let store = ShardStore::open_in_memory("t1").await.unwrap();
        let source = store
            .insert_source(new_source("https://example.com/feed"))
            .await
            .unwrap();
        store
            .insert_extraction(new_extraction(source.id, "body"))
            .await
            .unwrap();
        store
            .insert_fetch_log(source.id, FetchLogStatus::Ok, 200, 120, 1, "")
            .await
            .unwrap();

        store.delete_source(source.id).await.unwrap();
        assert_eq!(store.count_sources().await.unwrap(), 0);
        assert_eq!(store.count_extractions().await.unwrap(), 0);
        assert_eq!(store.count_fetch_log().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn full_text_search_orders_by_relevance() {
        let store = ShardStore::open_in_memory("t1").await.unwrap();
        let source = store
            .insert_source(new_source("https://example.com/feed"))
            .await
            .unwrap();

        store
            .insert_extraction(new_extraction(
                source.id,
                "quantum computing breakthrough: quantum error correction at scale",
            ))
            .await
            .unwrap();
        store
            .insert_extraction(new_extraction(source.id, "city council passes zoning reform"))
            .await
            .unwrap();

        let hits = store.search("quantum computing", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_id, source.id);
        assert_eq!(hits[0].source_url, "https://example.com/feed");
        assert!(hits[0].snippet.contains("quantum"));

        assert!(store.search("zoning", 10).await.unwrap().len() == 1);
        assert!(store.search("nonexistent", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_index_follows_deletes() {
        let store = ShardStore::open_in_memory("t1").await.unwrap();
        let source = store
            .insert_source(new_source("https://example.com/feed"))
            .await
            .unwrap();
        store
            .insert_extraction(new_extraction(source.id, "ephemeral quantum note"))
            .await
            .unwrap();
        assert_eq!(store.search("ephemeral", 10).await.unwrap().len(), 1);

        store.delete_source(source.id).await.unwrap();
        assert!(store.search("ephemeral", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn due_listing_orders_oldest_first() {
        let store = ShardStore::open_in_memory("t1").await.unwrap();
        let now = Utc::now();

        let stale = store
            .insert_source(new_source("https://example.com/stale"))
            .await
            .unwrap();
        let staler = store
            .insert_source(new_source("https://example.com/staler"))
            .await
            .unwrap();
        let fresh = store
            .insert_source(new_source("https://example.com/fresh"))
            .await
            .unwrap();

        store
            .record_success(stale.id, now - chrono::Duration::hours(2), None, None, None)
            .await
            .unwrap();
        store
            .record_success(staler.id, now - chrono::Duration::hours(5), None, None, None)
            .await
            .unwrap();
        store
            .record_success(fresh.id, now, None, None, None)
            .await
            .unwrap();

        let due = store.list_due_sources(now, 10).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![staler.id, stale.id]);

        // The batch limit bounds the scan.
        let due = store.list_due_sources(now, 1).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, staler.id);
    }

    #[tokio::test]
    async fn due_listing_skips_disabled_and_broken() {
        let store = ShardStore::open_in_memory("t1").await.unwrap();
        let now = Utc::now();

        let mut disabled_source = new_source("https://example.com/disabled");
        disabled_source.enabled = false;
        store.insert_source(disabled_source).await.unwrap();

        let broken = store
            .insert_source(new_source("https://example.com/broken"))
            .await
            .unwrap();
        store.mark_broken(broken.id).await.unwrap();

        let live = store
            .insert_source(new_source("https://example.com/live"))
            .await
            .unwrap();

        let due = store.list_due_sources(now, 10).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![live.id]);
    }

    #[tokio::test]
    async fn due_listing_waits_out_failed_attempts() {
        let store = ShardStore::open_in_memory("t1").await.unwrap();
        let now = Utc::now();

        let source = store
            .insert_source(new_source("https://example.com/flaky"))
            .await
            .unwrap();
        // Never succeeded, but attempted just now: not due again yet.
        store.record_failure(source.id, now).await.unwrap();
        assert!(store.list_due_sources(now, 10).await.unwrap().is_empty());

        // Once the interval has passed since the attempt, it is due again.
        let later = now + chrono::Duration::milliseconds(3_600_001);
        assert_eq!(store.list_due_sources(later, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backoff_doubles_and_restore_returns_original() {
        let store = ShardStore::open_in_memory("t1").await.unwrap();
        let source = store
            .insert_source(new_source("https://example.com/feed"))
            .await
            .unwrap();

        store.apply_backoff(source.id, 86_400_000).await.unwrap();
        let s = store.get_source(source.id).await.unwrap();
        assert_eq!(s.fetch_interval_ms, 7_200_000);
        assert_eq!(s.original_fetch_interval_ms, Some(3_600_000));

        // Second backoff doubles again but keeps the original.
        store.apply_backoff(source.id, 86_400_000).await.unwrap();
        let s = store.get_source(source.id).await.unwrap();
        assert_eq!(s.fetch_interval_ms, 14_400_000);
        assert_eq!(s.original_fetch_interval_ms, Some(3_600_000));

        store.restore_source(source.id).await.unwrap();
        let s = store.get_source(source.id).await.unwrap();
        assert_eq!(s.fetch_interval_ms, 3_600_000);
        assert_eq!(s.original_fetch_interval_ms, None);
        assert_eq!(s.last_status, SourceStatus::Ok);
    }

    #[tokio::test]
    async fn backoff_respects_cap() {
        let store = ShardStore::open_in_memory("t1").await.unwrap();
        let mut source = new_source("https://example.com/feed");
        source.fetch_interval_ms = 50_000_000;
        let source = store.insert_source(source).await.unwrap();

        store.apply_backoff(source.id, 86_400_000).await.unwrap();
        let s = store.get_source(source.id).await.unwrap();
        assert_eq!(s.fetch_interval_ms, 86_400_000);
    }

    #[tokio::test]
    async fn failure_streak_counts_and_success_clears() {
        let store = ShardStore::open_in_memory("t1").await.unwrap();
        let source = store
            .insert_source(new_source("https://example.com/feed"))
            .await
            .unwrap();

        assert_eq!(store.record_failure(source.id, Utc::now()).await.unwrap(), 1);
        assert_eq!(store.record_failure(source.id, Utc::now()).await.unwrap(), 2);
        let s = store.get_source(source.id).await.unwrap();
        assert_eq!(s.last_status, SourceStatus::Error);

        store
            .record_success(source.id, Utc::now(), Some("\"etag\""), None, Some("abc"))
            .await
            .unwrap();
        let s = store.get_source(source.id).await.unwrap();
        assert_eq!(s.fail_count, 0);
        assert_eq!(s.last_status, SourceStatus::Ok);
        assert_eq!(s.etag.as_deref(), Some("\"etag\""));
        assert_eq!(s.content_hash.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn question_round_trip_and_run_counters() {
        let store = ShardStore::open_in_memory("t1").await.unwrap();
        let now = Utc::now();
        let question = TrackedQuestion {
            id: Uuid::now_v7(),
            text: "road closures downtown".into(),
            keywords: vec!["minneapolis".into()],
            engine_ids: vec![Uuid::now_v7()],
            interval_ms: 3_600_000,
            max_results: 5,
            follow_links: true,
            enabled: true,
            total_results: 0,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_question(&question).await.unwrap();

        let loaded = store.get_question(question.id).await.unwrap();
        assert_eq!(loaded.keywords, question.keywords);
        assert_eq!(loaded.engine_ids, question.engine_ids);
        assert!(loaded.follow_links);

        store
            .record_question_run(question.id, 3, Utc::now())
            .await
            .unwrap();
        let loaded = store.get_question(question.id).await.unwrap();
        assert_eq!(loaded.total_results, 3);
        assert!(loaded.last_run_at.is_some());
    }

    #[tokio::test]
    async fn engine_round_trip() {
        let store = ShardStore::open_in_memory("t1").await.unwrap();
        let engine = SearchEngine {
            id: Uuid::now_v7(),
            name: "newsapi".into(),
            strategy: EngineStrategy::Api,
            url_template: "https://api.example.com/search?q={query}".into(),
            api_config: serde_json::json!({"result_path": "articles"}),
            selectors: None,
            rate_limit_ms: 1500,
            max_pages: 2,
            enabled: true,
        };
        store.insert_engine(&engine).await.unwrap();

        let loaded = store.get_engine(engine.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "newsapi");
        assert_eq!(loaded.strategy, EngineStrategy::Api);
        assert_eq!(loaded.rate_limit_ms, 1500);

        store.delete_engine(engine.id).await.unwrap();
        assert!(store.get_engine(engine.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_aggregate() {
        let store = ShardStore::open_in_memory("t1").await.unwrap();
        let a = store
            .insert_source(new_source("https://example.com/a"))
            .await
            .unwrap();
        let b = store
            .insert_source(new_source("https://example.com/b"))
            .await
            .unwrap();
        store.mark_broken(b.id).await.unwrap();
        store
            .insert_extraction(new_extraction(a.id, "body"))
            .await
            .unwrap();
        store
            .insert_fetch_log(a.id, FetchLogStatus::Ok, 200, 64, 1, "")
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.sources, 2);
        assert_eq!(stats.sources_ok, 1);
        assert_eq!(stats.sources_broken, 1);
        assert_eq!(stats.extractions, 1);
        assert_eq!(stats.fetch_log_entries, 1);
        assert!(stats.last_activity_at.is_some());
    }

    #[tokio::test]
    async fn migration_dedupes_and_normalizes_legacy_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.db");

        // First open creates the schema; drop the uniqueness index and plant
        // legacy rows the way a pre-normalization deployment would have them.
        {
            let store = ShardStore::open(&path, "t1").await.unwrap();
            sqlx::query("DROP INDEX idx_sources_url")
                .execute(&store.pool)
                .await
                .unwrap();

            for (i, url) in [
                "https://Example.com/feed/",
                "https://example.com/feed",
                "https://example.com/other",
            ]
            .iter()
            .enumerate()
            {
                sqlx::query(
                    r#"
                    INSERT INTO sources
                        (id, name, url, source_type, fetch_interval_ms, created_at, updated_at)
                    VALUES (?1, ?2, ?3, 'web', 3600000, ?4, ?4)
                    "#,
                )
                .bind(Uuid::now_v7().to_string())
                .bind(format!("legacy {i}"))
                .bind(url)
                .bind(1_700_000_000_000_i64 + i as i64)
                .execute(&store.pool)
                .await
                .unwrap();
            }
        }

        // Reopening runs the migration and recreates the index.
        let store = ShardStore::open(&path, "t1").await.unwrap();
        let sources = store.list_sources().await.unwrap();
        assert_eq!(sources.len(), 2);

        let survivor = sources
            .iter()
            .find(|s| s.url == "https://example.com/feed")
            .expect("normalized survivor present");
        // The oldest of the colliding pair wins.
        assert_eq!(survivor.name, "legacy 0");
        assert!(sources.iter().any(|s| s.url == "https://example.com/other"));

        // Idempotent: a third open changes nothing.
        drop(store);
        let store = ShardStore::open(&path, "t1").await.unwrap();
        assert_eq!(store.list_sources().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cross_tenant_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let a = ShardStore::open(&dir.path().join("a.db"), "a").await.unwrap();
        let b = ShardStore::open(&dir.path().join("b.db"), "b").await.unwrap();

        let source = a
            .insert_source(new_source("https://example.com/feed"))
            .await
            .unwrap();
        a.insert_extraction(new_extraction(source.id, "tenant a only"))
            .await
            .unwrap();

        assert_eq!(a.count_sources().await.unwrap(), 1);
        assert_eq!(b.count_sources().await.unwrap(), 0);
        assert!(b.search("tenant", 10).await.unwrap().is_empty());

        // And the same URL is insertable in the other shard.
        b.insert_source(new_source("https://example.com/feed"))
            .await
            .unwrap();
    }
}
