use async_trait::async_trait;

use driftnet_common::{content_hash, Candidate, DriftnetError, Result, Source};
use driftnet_store::ShardStore;

use crate::fetcher::{FetchOutcome, FetchParams};
use crate::pipeline::{ingest, HandlerReport, JobContext, SourceHandler};

/// RSS/Atom: one candidate per entry, keyed on the entry's own identity.
pub struct FeedHandler;

#[async_trait]
impl SourceHandler for FeedHandler {
    async fn handle(
        &self,
        ctx: &JobContext,
        store: &ShardStore,
        source: &Source,
    ) -> Result<HandlerReport> {
        let outcome = ctx
            .fetcher
            .fetch(FetchParams {
                url: &source.url,
                etag: source.etag.as_deref(),
                last_modified: source.last_modified.as_deref(),
                previous_hash: source.content_hash.as_deref(),
                user_agent: source.user_agent.as_deref(),
                headers: Vec::new(),
            })
            .await?;

        let fetched = match outcome {
            FetchOutcome::NotModified { http_status } => {
                return Ok(HandlerReport::not_modified(http_status))
            }
            FetchOutcome::Fetched(fetched) => fetched,
        };

        let feed = feed_rs::parser::parse(&fetched.body[..])
            .map_err(|e| DriftnetError::Parse(format!("feed: {e}")))?;

        let mut candidates = Vec::with_capacity(feed.entries.len());
        for entry in feed.entries {
            let title = entry.title.map(|t| t.content).unwrap_or_default();
            let url = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .unwrap_or_default();
            let content = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content))
                .unwrap_or_else(|| title.clone());

            // Feeds carry their own identity; fall back to url+title when a
            // feed omits entry ids.
            let hash = if entry.id.is_empty() {
                content_hash(&format!("{url}{title}"))
            } else {
                content_hash(&entry.id)
            };

            candidates.push(Candidate {
                title,
                content,
                url,
                content_hash: hash,
            });
        }

        let new_extractions = ingest(ctx, store, source, candidates, serde_json::json!({})).await?;

        let mut report =
            HandlerReport::ok(fetched.http_status, fetched.body.len() as u64, new_extractions);
        report.etag = fetched.etag;
        report.last_modified = fetched.last_modified;
        report.content_hash = Some(fetched.content_hash);
        report.permanent_redirect = fetched.permanent_redirect;
        Ok(report)
    }
}
