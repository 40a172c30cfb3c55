use async_trait::async_trait;
use uuid::Uuid;

use driftnet_common::{Result, Source};
use driftnet_store::ShardStore;

use crate::pipeline::{HandlerReport, JobContext, SourceHandler};

/// Backing-source handler for tracked questions. The source id doubles as
/// the question id; the config may carry it explicitly.
pub struct QuestionHandler;

#[async_trait]
impl SourceHandler for QuestionHandler {
    async fn handle(
        &self,
        ctx: &JobContext,
        store: &ShardStore,
        source: &Source,
    ) -> Result<HandlerReport> {
        let question_id = source
            .config
            .get("question_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or(source.id);

        let question = store.get_question(question_id).await?;
        if !question.enabled {
            return Ok(HandlerReport::ok(0, 0, 0));
        }

        let new_extractions = ctx.questions.run(ctx, store, source, &question).await?;
        Ok(HandlerReport::ok(0, 0, new_extractions))
    }
}
