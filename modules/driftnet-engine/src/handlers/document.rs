use std::path::Path;

use async_trait::async_trait;

use driftnet_common::{check_document_path, content_hash, Candidate, Result, Source};
use driftnet_store::ShardStore;

use crate::pipeline::{ingest, HandlerReport, JobContext, SourceHandler};

/// Local files. The parser seam owns format internals; the handler owns
/// change detection and the dedup gate.
pub struct DocumentHandler;

#[async_trait]
impl SourceHandler for DocumentHandler {
    async fn handle(
        &self,
        ctx: &JobContext,
        store: &ShardStore,
        source: &Source,
    ) -> Result<HandlerReport> {
        // Re-checked at fetch time: the path in the store may predate the
        // current validation rules.
        check_document_path(&source.url)?;

        let parsed = ctx.documents.parse(Path::new(&source.url)).await?;
        let hash = content_hash(&parsed.text);
        let bytes_read = parsed.text.len() as u64;

        if source.content_hash.as_deref() == Some(hash.as_str()) {
            return Ok(HandlerReport::not_modified(0));
        }

        let candidate = Candidate {
            title: parsed.title,
            content: parsed.text,
            url: source.url.clone(),
            content_hash: hash.clone(),
        };
        let new_extractions = ingest(
            ctx,
            store,
            source,
            vec![candidate],
            serde_json::json!({"format": parsed.format}),
        )
        .await?;

        let mut report = HandlerReport::ok(0, bytes_read, new_extractions);
        report.content_hash = Some(hash);
        Ok(report)
    }
}
