// The service façade: validation and quota enforcement in front of every
// mutating verb, wiring for the scheduler/sweeper loops, and the audit
// trail for everything that changes a shard.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use url::Url;
use uuid::Uuid;

use driftnet_common::{
    check_document_path, normalize_url, Config, DriftnetError, Extraction, FetchLogEntry,
    NewSource, PublicHttpGuard, Result, SearchEngine, SearchHit, ShardStats, Source, SourceHealth,
    SourceType, TrackedQuestion, UrlGuard, DEFAULT_FETCH_INTERVAL_MS,
    MAX_CONFIG_BYTES, MAX_FETCH_INTERVAL_MS, MAX_NAME_LEN, MAX_URL_LEN, MIN_FETCH_INTERVAL_MS,
};
use driftnet_engine::bridge::{self, ServiceRouter};
use driftnet_engine::extract::{DocumentParser, HtmlExtractor, PlainTextParser};
use driftnet_engine::questions::QuestionRunner;
use driftnet_engine::scheduler::JobSink;
use driftnet_engine::sidecar::SidecarWriter;
use driftnet_engine::{Fetcher, JobContext, Pipeline, RepairPolicy, Scheduler, Sweeper};
use driftnet_store::{Catalog, ShardResolver};

use crate::audit::{AuditQueue, AuditWriter};

/// Optional collaborators injected at construction.
#[derive(Default)]
pub struct ServiceOptions {
    /// RPC router for bridge discovery. None means built-in types only.
    pub router: Option<Arc<dyn ServiceRouter>>,
    /// SSRF gate override. Defaults to the public-host guard.
    pub guard: Option<Arc<dyn UrlGuard>>,
    /// Audit sink. None disables the trail.
    pub audit: Option<Arc<dyn AuditWriter>>,
    /// Document parser override. Defaults to the plain-text parser.
    pub documents: Option<Arc<dyn DocumentParser>>,
}

/// Input for `add_source`. Zero values mean "apply the default".
#[derive(Debug, Clone, Default)]
pub struct SourceParams {
    pub id: Option<Uuid>,
    pub name: String,
    pub url: String,
    pub source_type: Option<String>,
    pub fetch_interval_ms: i64,
    pub enabled: Option<bool>,
    pub config: Option<serde_json::Value>,
}

/// Partial update; None keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct SourceUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub source_type: Option<String>,
    pub fetch_interval_ms: Option<i64>,
    pub enabled: Option<bool>,
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct QuestionParams {
    pub id: Option<Uuid>,
    pub text: String,
    pub keywords: Vec<String>,
    pub engine_ids: Vec<Uuid>,
    pub interval_ms: i64,
    pub max_results: Option<u32>,
    pub follow_links: bool,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct QuestionUpdate {
    pub text: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub engine_ids: Option<Vec<Uuid>>,
    pub interval_ms: Option<i64>,
    pub max_results: Option<u32>,
    pub follow_links: Option<bool>,
    pub enabled: Option<bool>,
}

pub struct Driftnet {
    config: Config,
    resolver: Arc<ShardResolver>,
    pipeline: Arc<Pipeline>,
    sweeper: Arc<Sweeper>,
    known_types: HashSet<String>,
    guard: Arc<dyn UrlGuard>,
    audit: Option<AuditQueue>,
    audit_task: Option<JoinHandle<()>>,
}

impl Driftnet {
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_options(config, ServiceOptions::default()).await
    }

    pub async fn with_options(config: Config, options: ServiceOptions) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let catalog = Catalog::open(&config.data_dir).await?;
        let resolver = Arc::new(ShardResolver::new(config.data_dir.clone(), catalog.clone()));

        let guard: Arc<dyn UrlGuard> = options.guard.unwrap_or_else(|| Arc::new(PublicHttpGuard));
        let fetcher = Arc::new(Fetcher::new(&config, guard.clone())?);
        let sidecar = config
            .pending_dir
            .as_ref()
            .map(|dir| Arc::new(SidecarWriter::new(dir)));
        let documents: Arc<dyn DocumentParser> = options
            .documents
            .unwrap_or_else(|| Arc::new(PlainTextParser));

        let ctx = JobContext {
            fetcher,
            html: Arc::new(HtmlExtractor),
            documents,
            sidecar,
            questions: Arc::new(QuestionRunner::new(catalog.clone())),
            guard: guard.clone(),
        };
        let policy = RepairPolicy {
            fail_threshold: config.fail_threshold,
            parse_error_breaks: config.parse_error_breaks,
            ..RepairPolicy::default()
        };

        let mut pipeline = Pipeline::new(ctx, policy);
        if let Some(router) = options.router {
            for (source_type, handler) in bridge::discover(router).await? {
                pipeline.register(&source_type, handler);
            }
        }
        let pipeline = Arc::new(pipeline);
        let known_types: HashSet<String> = pipeline.known_types().into_iter().collect();

        let sweeper = Arc::new(Sweeper::new(resolver.clone())?);

        let (audit, audit_task) = match options.audit {
            Some(writer) => {
                let (queue, task) = AuditQueue::new(writer, 256);
                (Some(queue), Some(task))
            }
            None => (None, None),
        };

        let mut type_tags: Vec<&String> = known_types.iter().collect();
        type_tags.sort();
        info!(
            data_dir = %config.data_dir.display(),
            source_types = ?type_tags,
            "driftnet service ready"
        );

        Ok(Self {
            config,
            resolver,
            pipeline,
            sweeper,
            known_types,
            guard,
            audit,
            audit_task,
        })
    }

    /// Spawn the scheduler and sweeper loops. Both observe `shutdown` and
    /// stop at their next tick check after it flips to true.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let scheduler = Scheduler::new(
            self.resolver.clone(),
            self.pipeline.clone() as Arc<dyn JobSink>,
            Duration::from_millis(self.config.scheduler_tick_ms),
            self.config.scheduler_batch_limit,
        );
        let scheduler_shutdown = shutdown.clone();
        let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

        let sweeper = self.sweeper.clone();
        let sweep_interval = Duration::from_millis(self.config.sweep_interval_ms);
        let sweeper_task = tokio::spawn(async move { sweeper.run(sweep_interval, shutdown).await });

        vec![scheduler_task, sweeper_task]
    }

    /// Source types accepted by `add_source`, including bridge-discovered.
    pub fn known_types(&self) -> &HashSet<String> {
        &self.known_types
    }

    pub fn resolver(&self) -> &Arc<ShardResolver> {
        &self.resolver
    }

    fn audit(&self, action: &str, dossier_id: &str, parameters: serde_json::Value) {
        if let Some(queue) = &self.audit {
            queue.record(action, dossier_id, parameters);
        }
    }

    // --- Sources ---

    pub async fn add_source(&self, dossier_id: &str, params: SourceParams) -> Result<Source> {
        let store = self.resolver.resolve(dossier_id).await?;

        let source_type = self.validated_type(params.source_type.as_deref())?;
        let name = validated_name(&params.name)?;
        let fetch_interval_ms = validated_interval(params.fetch_interval_ms)?;
        let config = validated_config(params.config)?;
        let url = self.validated_url(&params.url, &source_type)?;

        let count = store.count_sources().await?;
        if count >= self.config.source_quota as u64 {
            return Err(DriftnetError::QuotaExceeded(self.config.source_quota));
        }

        if store.get_source_by_url(&url).await?.is_some() {
            return Err(DriftnetError::DuplicateSource(url));
        }

        let source = store
            .insert_source(NewSource {
                id: params.id.unwrap_or_else(Uuid::now_v7),
                name,
                url,
                source_type,
                fetch_interval_ms,
                enabled: params.enabled.unwrap_or(true),
                config,
            })
            .await?;

        self.audit(
            "add_source",
            dossier_id,
            serde_json::json!({"source_id": source.id, "url": source.url, "source_type": source.source_type}),
        );
        Ok(source)
    }

    pub async fn update_source(
        &self,
        dossier_id: &str,
        id: Uuid,
        update: SourceUpdate,
    ) -> Result<Source> {
        let store = self.resolver.resolve(dossier_id).await?;
        let mut source = store.get_source(id).await?;

        if let Some(name) = update.name {
            source.name = validated_name(&name)?;
        }
        if let Some(type_tag) = update.source_type.as_deref() {
            source.source_type = self.validated_type(Some(type_tag))?;
        }
        if let Some(interval) = update.fetch_interval_ms {
            source.fetch_interval_ms = validated_interval(interval)?;
        }
        if let Some(enabled) = update.enabled {
            source.enabled = enabled;
        }
        if let Some(config) = update.config {
            source.config = validated_config(Some(config))?;
        }
        if let Some(raw_url) = update.url {
            let url = self.validated_url(&raw_url, &source.source_type)?;
            if url != source.url && store.get_source_by_url(&url).await?.is_some() {
                return Err(DriftnetError::DuplicateSource(url));
            }
            source.url = url;
        }

        store.update_source(&source).await?;
        let source = store.get_source(id).await?;

        self.audit(
            "update_source",
            dossier_id,
            serde_json::json!({"source_id": id, "url": source.url}),
        );
        Ok(source)
    }

    pub async fn delete_source(&self, dossier_id: &str, id: Uuid) -> Result<()> {
        let store = self.resolver.resolve(dossier_id).await?;
        store.delete_source(id).await?;
        self.audit(
            "delete_source",
            dossier_id,
            serde_json::json!({"source_id": id}),
        );
        Ok(())
    }

    pub async fn get_source(&self, dossier_id: &str, id: Uuid) -> Result<Source> {
        self.resolver.resolve(dossier_id).await?.get_source(id).await
    }

    pub async fn list_sources(&self, dossier_id: &str) -> Result<Vec<Source>> {
        self.resolver.resolve(dossier_id).await?.list_sources().await
    }

    /// Run one source through the pipeline immediately.
    pub async fn fetch_now(&self, dossier_id: &str, id: Uuid) -> Result<u32> {
        let store = self.resolver.resolve(dossier_id).await?;
        let source = store.get_source(id).await?;
        self.audit(
            "fetch_now",
            dossier_id,
            serde_json::json!({"source_id": id, "url": source.url}),
        );
        self.pipeline.run(&store, &source).await
    }

    /// Clear the failure streak and status on a source.
    pub async fn reset_source(&self, dossier_id: &str, id: Uuid) -> Result<()> {
        let store = self.resolver.resolve(dossier_id).await?;
        store.reset_source(id).await?;
        self.audit(
            "reset_source",
            dossier_id,
            serde_json::json!({"source_id": id}),
        );
        Ok(())
    }

    // --- Reads ---

    pub async fn search(&self, dossier_id: &str, query: &str, limit: u32) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Err(DriftnetError::InvalidInput("empty search query".into()));
        }
        self.resolver
            .resolve(dossier_id)
            .await?
            .search(query, limit.clamp(1, 500))
            .await
    }

    pub async fn stats(&self, dossier_id: &str) -> Result<ShardStats> {
        self.resolver.resolve(dossier_id).await?.stats().await
    }

    pub async fn recent_extractions(&self, dossier_id: &str, limit: u32) -> Result<Vec<Extraction>> {
        self.resolver
            .resolve(dossier_id)
            .await?
            .recent_extractions(limit.clamp(1, 500))
            .await
    }

    pub async fn fetch_history(
        &self,
        dossier_id: &str,
        source_id: Uuid,
        limit: u32,
    ) -> Result<Vec<FetchLogEntry>> {
        self.resolver
            .resolve(dossier_id)
            .await?
            .fetch_history(source_id, limit.clamp(1, 500))
            .await
    }

    /// Broken and erroring sources across every active shard.
    pub async fn list_source_health(&self) -> Result<Vec<SourceHealth>> {
        let mut health = Vec::new();
        for dossier_id in self.resolver.catalog().list_active_shards().await? {
            let store = self.resolver.resolve(&dossier_id).await?;
            for source in store.list_unhealthy_sources().await? {
                health.push(SourceHealth {
                    dossier_id: dossier_id.clone(),
                    source_id: source.id,
                    name: source.name,
                    url: source.url,
                    last_status: source.last_status,
                    fail_count: source.fail_count,
                    last_attempt_at: source.last_attempt_at,
                });
            }
        }
        Ok(health)
    }

    // --- Repair surface ---

    /// One sweep pass right now.
    pub async fn sweep_now(&self) -> Result<driftnet_engine::sweeper::SweepSummary> {
        self.sweeper.sweep_once().await
    }

    /// Probe a URL the way the sweeper would.
    pub async fn probe_url(&self, url: &str) -> Result<u16> {
        let parsed = Url::parse(url)
            .map_err(|e| DriftnetError::InvalidInput(format!("invalid URL: {e}")))?;
        self.guard.check(&parsed)?;
        self.sweeper.probe(url).await
    }

    // --- Tracked questions ---

    pub async fn add_question(
        &self,
        dossier_id: &str,
        params: QuestionParams,
    ) -> Result<TrackedQuestion> {
        let store = self.resolver.resolve(dossier_id).await?;

        let text = params.text.trim().to_string();
        if text.is_empty() || text.chars().count() > MAX_NAME_LEN {
            return Err(DriftnetError::InvalidInput(format!(
                "question text must be 1-{MAX_NAME_LEN} characters"
            )));
        }
        let interval_ms = validated_interval(params.interval_ms)?;

        let now = Utc::now();
        let question = TrackedQuestion {
            id: params.id.unwrap_or_else(Uuid::now_v7),
            text,
            keywords: params.keywords,
            engine_ids: params.engine_ids,
            interval_ms,
            max_results: params.max_results.unwrap_or(10).clamp(1, 100),
            follow_links: params.follow_links,
            enabled: params.enabled.unwrap_or(true),
            total_results: 0,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        };

        store.insert_question(&question).await?;

        // The backing source is the scheduler's hook into this question.
        store
            .insert_source(NewSource {
                id: question.id,
                name: question.text.clone(),
                url: question.source_url(),
                source_type: SourceType::Question,
                fetch_interval_ms: question.interval_ms,
                enabled: question.enabled,
                config: serde_json::json!({"question_id": question.id}),
            })
            .await?;

        self.audit(
            "add_question",
            dossier_id,
            serde_json::json!({"question_id": question.id, "text": question.text}),
        );
        Ok(question)
    }

    pub async fn update_question(
        &self,
        dossier_id: &str,
        id: Uuid,
        update: QuestionUpdate,
    ) -> Result<TrackedQuestion> {
        let store = self.resolver.resolve(dossier_id).await?;
        let mut question = store.get_question(id).await?;

        if let Some(text) = update.text {
            let text = text.trim().to_string();
            if text.is_empty() || text.chars().count() > MAX_NAME_LEN {
                return Err(DriftnetError::InvalidInput(format!(
                    "question text must be 1-{MAX_NAME_LEN} characters"
                )));
            }
            question.text = text;
        }
        if let Some(keywords) = update.keywords {
            question.keywords = keywords;
        }
        if let Some(engine_ids) = update.engine_ids {
            question.engine_ids = engine_ids;
        }
        if let Some(interval) = update.interval_ms {
            question.interval_ms = validated_interval(interval)?;
        }
        if let Some(max_results) = update.max_results {
            question.max_results = max_results.clamp(1, 100);
        }
        if let Some(follow_links) = update.follow_links {
            question.follow_links = follow_links;
        }
        if let Some(enabled) = update.enabled {
            question.enabled = enabled;
        }

        store.update_question(&question).await?;

        // Keep the backing source's schedule in step.
        if let Ok(mut source) = store.get_source(id).await {
            source.name = question.text.clone();
            source.fetch_interval_ms = question.interval_ms;
            source.enabled = question.enabled;
            store.update_source(&source).await?;
        }

        store.get_question(id).await
    }

    pub async fn delete_question(&self, dossier_id: &str, id: Uuid) -> Result<()> {
        let store = self.resolver.resolve(dossier_id).await?;
        store.delete_question(id).await?;
        // The backing source cascades this question's extractions away.
        match store.delete_source(id).await {
            Ok(()) | Err(DriftnetError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.audit(
            "delete_question",
            dossier_id,
            serde_json::json!({"question_id": id}),
        );
        Ok(())
    }

    pub async fn get_question(&self, dossier_id: &str, id: Uuid) -> Result<TrackedQuestion> {
        self.resolver.resolve(dossier_id).await?.get_question(id).await
    }

    pub async fn list_questions(&self, dossier_id: &str) -> Result<Vec<TrackedQuestion>> {
        self.resolver.resolve(dossier_id).await?.list_questions().await
    }

    /// Run a question immediately through its backing source.
    pub async fn run_question_now(&self, dossier_id: &str, id: Uuid) -> Result<u32> {
        let store = self.resolver.resolve(dossier_id).await?;
        store.get_question(id).await?;
        let source = store.get_source(id).await?;
        self.pipeline.run(&store, &source).await
    }

    // --- Search engines ---

    pub async fn add_engine(&self, dossier_id: &str, engine: SearchEngine) -> Result<()> {
        validated_engine(&engine)?;
        self.resolver
            .resolve(dossier_id)
            .await?
            .insert_engine(&engine)
            .await
    }

    pub async fn list_engines(&self, dossier_id: &str) -> Result<Vec<SearchEngine>> {
        self.resolver.resolve(dossier_id).await?.list_engines().await
    }

    pub async fn delete_engine(&self, dossier_id: &str, id: Uuid) -> Result<()> {
        self.resolver.resolve(dossier_id).await?.delete_engine(id).await
    }

    pub async fn add_global_engine(&self, engine: SearchEngine) -> Result<()> {
        validated_engine(&engine)?;
        self.resolver.catalog().insert_engine(&engine).await
    }

    pub async fn list_global_engines(&self) -> Result<Vec<SearchEngine>> {
        self.resolver.catalog().list_engines().await
    }

    // --- Validation helpers bound to instance state ---

    fn validated_type(&self, tag: Option<&str>) -> Result<SourceType> {
        let tag = tag.unwrap_or("web");
        if !self.known_types.contains(tag) {
            return Err(DriftnetError::InvalidInput(format!(
                "unknown source type '{tag}'"
            )));
        }
        Ok(SourceType::parse(tag))
    }

    /// Length check, normalization, and the SSRF/path gate appropriate for
    /// the type. Question sources carry synthetic URLs and skip the gate.
    fn validated_url(&self, raw: &str, source_type: &SourceType) -> Result<String> {
        if raw.trim().is_empty() {
            return Err(DriftnetError::InvalidInput("URL is required".into()));
        }
        if raw.chars().count() > MAX_URL_LEN {
            return Err(DriftnetError::InvalidInput(format!(
                "URL longer than {MAX_URL_LEN} characters"
            )));
        }
        let url = normalize_url(raw)?;

        match source_type {
            SourceType::Question => {}
            SourceType::Document => check_document_path(&url)?,
            _ => {
                let parsed = Url::parse(&url)
                    .map_err(|e| DriftnetError::InvalidInput(format!("invalid URL: {e}")))?;
                self.guard.check(&parsed)?;
            }
        }
        Ok(url)
    }
}

impl Drop for Driftnet {
    fn drop(&mut self) {
        if let Some(task) = self.audit_task.take() {
            task.abort();
        }
    }
}

fn validated_name(name: &str) -> Result<String> {
    let name = name.trim().to_string();
    let len = name.chars().count();
    if len == 0 || len > MAX_NAME_LEN {
        return Err(DriftnetError::InvalidInput(format!(
            "name must be 1-{MAX_NAME_LEN} characters"
        )));
    }
    Ok(name)
}

/// Zero means unset and takes the default; anything else must be in bounds.
fn validated_interval(interval_ms: i64) -> Result<i64> {
    if interval_ms == 0 {
        return Ok(DEFAULT_FETCH_INTERVAL_MS);
    }
    if !(MIN_FETCH_INTERVAL_MS..=MAX_FETCH_INTERVAL_MS).contains(&interval_ms) {
        return Err(DriftnetError::InvalidInput(format!(
            "fetch interval must be between {MIN_FETCH_INTERVAL_MS} and {MAX_FETCH_INTERVAL_MS} ms"
        )));
    }
    Ok(interval_ms)
}

fn validated_config(config: Option<serde_json::Value>) -> Result<serde_json::Value> {
    let config = config.unwrap_or_else(|| serde_json::json!({}));
    let serialized = config.to_string();
    if serialized.len() > MAX_CONFIG_BYTES {
        return Err(DriftnetError::InvalidInput(format!(
            "config larger than {MAX_CONFIG_BYTES} bytes"
        )));
    }
    Ok(config)
}

fn validated_engine(engine: &SearchEngine) -> Result<()> {
    if engine.name.trim().is_empty() {
        return Err(DriftnetError::InvalidInput("engine name is required".into()));
    }
    if !engine.url_template.contains("{query}") {
        return Err(DriftnetError::InvalidInput(
            "engine url_template must contain a {query} placeholder".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_bounds() {
        assert_eq!(validated_interval(0).unwrap(), DEFAULT_FETCH_INTERVAL_MS);
        assert_eq!(validated_interval(60_000).unwrap(), 60_000);
        assert_eq!(validated_interval(604_800_000).unwrap(), 604_800_000);
        assert!(validated_interval(59_999).is_err());
        assert!(validated_interval(604_800_001).is_err());
        assert!(validated_interval(-1).is_err());
    }

    #[test]
    fn name_bounds() {
        assert!(validated_name("").is_err());
        assert!(validated_name("   ").is_err());
        assert!(validated_name(&"x".repeat(512)).is_ok());
        assert!(validated_name(&"x".repeat(513)).is_err());
    }

    #[test]
    fn config_size_bound() {
        assert!(validated_config(None).is_ok());
        let small = serde_json::json!({"k": "v"});
        assert!(validated_config(Some(small)).is_ok());
        let big = serde_json::json!({"k": "v".repeat(9000)});
        assert!(validated_config(Some(big)).is_err());
    }

    #[test]
    fn engine_template_must_have_query() {
        let mut engine = SearchEngine {
            id: Uuid::now_v7(),
            name: "e".into(),
            strategy: driftnet_common::EngineStrategy::Api,
            url_template: "https://example.com/search?q={query}".into(),
            api_config: serde_json::json!({}),
            selectors: None,
            rate_limit_ms: 1000,
            max_pages: 1,
            enabled: true,
        };
        assert!(validated_engine(&engine).is_ok());
        engine.url_template = "https://example.com/search".into();
        assert!(validated_engine(&engine).is_err());
    }
}
