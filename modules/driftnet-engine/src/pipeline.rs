// The dispatch pipeline: a type-keyed handler registry and the uniform
// processing skeleton wrapped around every handler: dedup gate, insert,
// sidecar emission, fetch-log record, and repair on failure.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use driftnet_common::{
    normalize_url, Candidate, DriftnetError, FetchLogStatus, Result, Source, UrlGuard,
};
use driftnet_store::{NewExtraction, ShardStore};

use crate::extract::{DocumentParser, HtmlExtractor};
use crate::fetcher::Fetcher;
use crate::handlers;
use crate::questions::QuestionRunner;
use crate::repair::{self, RepairPolicy};
use crate::sidecar::SidecarWriter;

/// Shared dependencies handed to every handler invocation.
pub struct JobContext {
    pub fetcher: Arc<Fetcher>,
    pub html: Arc<HtmlExtractor>,
    pub documents: Arc<dyn DocumentParser>,
    pub sidecar: Option<Arc<SidecarWriter>>,
    pub questions: Arc<QuestionRunner>,
    pub guard: Arc<dyn UrlGuard>,
}

/// What a handler reports back on success. Errors propagate instead.
#[derive(Debug)]
pub struct HandlerReport {
    pub status: FetchLogStatus,
    pub http_status: u16,
    pub bytes_read: u64,
    pub new_extractions: u32,
    /// Conditional-request metadata to persist on the source.
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash: Option<String>,
    /// A permanent redirect the fetch followed; the pipeline migrates the
    /// stored URL.
    pub permanent_redirect: Option<String>,
}

impl HandlerReport {
    pub fn ok(http_status: u16, bytes_read: u64, new_extractions: u32) -> Self {
        Self {
            status: FetchLogStatus::Ok,
            http_status,
            bytes_read,
            new_extractions,
            etag: None,
            last_modified: None,
            content_hash: None,
            permanent_redirect: None,
        }
    }

    pub fn not_modified(http_status: u16) -> Self {
        Self {
            status: FetchLogStatus::NotModified,
            http_status,
            bytes_read: 0,
            new_extractions: 0,
            etag: None,
            last_modified: None,
            content_hash: None,
            permanent_redirect: None,
        }
    }
}

/// One source type's implementation. Produce candidates, push them through
/// `ingest`, report what happened.
#[async_trait]
pub trait SourceHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &JobContext,
        store: &ShardStore,
        source: &Source,
    ) -> Result<HandlerReport>;
}

/// The dedup gate every candidate passes through: insert keyed on
/// `(source_id, content_hash)`, skip silently when the hash is already
/// known, emit the sidecar for genuinely new extractions. Returns the
/// new-extraction count.
pub(crate) async fn ingest(
    ctx: &JobContext,
    store: &ShardStore,
    source: &Source,
    candidates: Vec<Candidate>,
    metadata: serde_json::Value,
) -> Result<u32> {
    let mut new_count = 0u32;
    for candidate in candidates {
        let (extraction_id, inserted) = store
            .insert_extraction(NewExtraction {
                source_id: source.id,
                title: candidate.title,
                content: candidate.content,
                url: candidate.url,
                content_hash: candidate.content_hash,
                metadata: metadata.clone(),
            })
            .await?;

        if !inserted {
            debug!(source_id = %source.id, extraction_id = %extraction_id, "Hash already seen, skipping");
            continue;
        }
        new_count += 1;

        if let Some(sidecar) = &ctx.sidecar {
            let extraction = store.get_extraction(extraction_id).await?;
            if let Err(e) = sidecar.write(store.dossier_id(), source, &extraction).await {
                warn!(extraction_id = %extraction_id, error = %e, "Sidecar write failed");
            }
        }
    }
    Ok(new_count)
}

/// Type-keyed dispatch. Built-ins register at construction; the bridge adds
/// discovered types before the service starts, after which the registry is
/// read-only.
pub struct Pipeline {
    handlers: HashMap<String, Arc<dyn SourceHandler>>,
    ctx: JobContext,
    policy: RepairPolicy,
}

impl Pipeline {
    pub fn new(ctx: JobContext, policy: RepairPolicy) -> Self {
        let mut registry: HashMap<String, Arc<dyn SourceHandler>> = HashMap::new();
        registry.insert("web".into(), Arc::new(handlers::web::WebHandler));
        registry.insert("rss".into(), Arc::new(handlers::feed::FeedHandler));
        registry.insert("api".into(), Arc::new(handlers::api::ApiHandler));
        registry.insert("document".into(), Arc::new(handlers::document::DocumentHandler));
        registry.insert("question".into(), Arc::new(handlers::question::QuestionHandler));
        Self {
            handlers: registry,
            ctx,
            policy,
        }
    }

    /// Add a handler for a discovered type. Construction-time only.
    pub fn register(&mut self, source_type: &str, handler: Arc<dyn SourceHandler>) {
        self.handlers.insert(source_type.to_string(), handler);
    }

    pub fn known_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn ctx(&self) -> &JobContext {
        &self.ctx
    }

    pub fn policy(&self) -> &RepairPolicy {
        &self.policy
    }

    /// Run one source through its handler. Always leaves a fetch-log entry;
    /// failures additionally go through the repair classifier and applier.
    /// Returns the count of genuinely new extractions.
    pub async fn run(&self, store: &ShardStore, source: &Source) -> Result<u32> {
        let handler = self
            .handlers
            .get(source.source_type.as_str())
            .cloned()
            .ok_or_else(|| {
                DriftnetError::InvalidInput(format!(
                    "no handler for source type '{}'",
                    source.source_type
                ))
            })?;

        match handler.handle(&self.ctx, store, source).await {
            Ok(report) => {
                let now = Utc::now();
                match report.status {
                    FetchLogStatus::Ok => {
                        store
                            .record_success(
                                source.id,
                                now,
                                report.etag.as_deref(),
                                report.last_modified.as_deref(),
                                report.content_hash.as_deref(),
                            )
                            .await?;
                    }
                    // A 304 is a healthy response too; only the conditional
                    // metadata stays as it was.
                    _ => store.record_success(source.id, now, None, None, None).await?,
                }
                store
                    .insert_fetch_log(
                        source.id,
                        report.status,
                        report.http_status,
                        report.bytes_read,
                        report.new_extractions,
                        "",
                    )
                    .await?;

                if let Some(target) = &report.permanent_redirect {
                    self.migrate_url(store, source, target).await;
                }

                info!(
                    source_id = %source.id,
                    source_type = %source.source_type,
                    status = %report.status,
                    new = report.new_extractions,
                    "Source processed"
                );
                Ok(report.new_extractions)
            }
            Err(err) => {
                let status = err.fetch_status();
                let message = err.to_string();
                let fail_count = store.record_failure(source.id, Utc::now()).await?;
                store
                    .insert_fetch_log(source.id, FetchLogStatus::Error, status, 0, 0, &message)
                    .await?;

                let (class, action) =
                    repair::classify(&source.source_type, status, &message, &self.policy);
                warn!(
                    source_id = %source.id,
                    url = %source.url,
                    http_status = status,
                    class = ?class,
                    action = ?action,
                    fail_count,
                    error = %message,
                    "Fetch failed"
                );
                repair::apply(store, source, action, &self.policy, fail_count, &self.ctx.guard)
                    .await?;
                Err(err)
            }
        }
    }

    /// A permanent redirect was followed successfully: move the stored URL
    /// to the target so future fetches skip the hop.
    async fn migrate_url(&self, store: &ShardStore, source: &Source, target: &str) {
        let canonical = match normalize_url(target) {
            Ok(c) => c,
            Err(e) => {
                warn!(source_id = %source.id, target, error = %e, "Redirect target not normalizable");
                return;
            }
        };
        if canonical == source.url {
            return;
        }
        match store.set_url(source.id, &canonical).await {
            Ok(()) => {
                info!(source_id = %source.id, from = %source.url, to = %canonical, "Source URL migrated to redirect target")
            }
            Err(e) => {
                warn!(source_id = %source.id, target = %canonical, error = %e, "Could not migrate source URL")
            }
        }
    }
}
