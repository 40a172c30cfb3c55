use async_trait::async_trait;

use driftnet_common::{Candidate, Result, Source};
use driftnet_store::ShardStore;

use crate::extract::ExtractMode;
use crate::fetcher::{FetchOutcome, FetchParams};
use crate::pipeline::{ingest, HandlerReport, JobContext, SourceHandler};

/// Conditional GET, readability extraction, one candidate per change.
pub struct WebHandler;

#[async_trait]
impl SourceHandler for WebHandler {
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

        let extracted = ctx
            .html
            .extract(&fetched.body, Some(&fetched.final_url), ExtractMode::Auto);

        let candidates = if extracted.text.is_empty() {
            Vec::new()
        } else {
            vec![Candidate {
                title: extracted.title,
                content: extracted.text,
                url: fetched.final_url.clone(),
                content_hash: extracted.content_hash,
            }]
        };

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
