// Tracked-question runner: resolve each configured engine (global catalog
// first, then the shard registry), substitute the query into its template,
// run it by strategy, and push every result through the shared dedup gate.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use driftnet_common::{
    content_hash, Candidate, DriftnetError, EngineStrategy, Result, SearchEngine, Source,
    TrackedQuestion,
};
use driftnet_store::{Catalog, ShardStore};

use crate::extract::ExtractMode;
use crate::fetcher::{FetchOutcome, FetchParams};
use crate::handlers::api;
use crate::pipeline::{ingest, JobContext};

/// One engine result before the dedup gate.
#[derive(Debug, Clone)]
struct EngineResult {
    title: String,
    snippet: String,
    url: String,
}

pub struct QuestionRunner {
    catalog: Catalog,
}

impl QuestionRunner {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    /// Run a question against its engines. Returns the count of new
    /// extractions and updates the question's run counters.
    pub async fn run(
        &self,
        ctx: &JobContext,
        store: &ShardStore,
        source: &Source,
        question: &TrackedQuestion,
    ) -> Result<u32> {
        let query = question.query_expression();
        let mut new_total = 0u32;

        for engine_id in &question.engine_ids {
            let engine = match self.resolve_engine(store, *engine_id).await? {
                Some(engine) if engine.enabled => engine,
                Some(_) => continue,
                None => {
                    warn!(question_id = %question.id, engine_id = %engine_id, "Unknown search engine, skipping");
                    continue;
                }
            };

            let results = match self
                .run_engine(ctx, &engine, &query, question.max_results)
                .await
            {
                Ok(results) => results,
                Err(e) => {
                    warn!(question_id = %question.id, engine = %engine.name, error = %e, "Engine run failed");
                    continue;
                }
            };

            let mut candidates = Vec::with_capacity(results.len());
            for result in results {
                let mut content = result.snippet;
                if question.follow_links && !result.url.is_empty() {
                    match self.follow(ctx, &result.url).await {
                        Ok(text) if !text.is_empty() => content = text,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(url = %result.url, error = %e, "Result follow failed, keeping snippet")
                        }
                    }
                }
                candidates.push(Candidate {
                    title: result.title,
                    content,
                    content_hash: content_hash(&result.url),
                    url: result.url,
                });
            }

            new_total += ingest(
                ctx,
                store,
                source,
                candidates,
                serde_json::json!({"question_id": question.id}),
            )
            .await?;
        }

        store
            .record_question_run(question.id, new_total, Utc::now())
            .await?;
        info!(question_id = %question.id, new = new_total, "Question run complete");
        Ok(new_total)
    }

    /// The global registry wins over the per-shard one.
    async fn resolve_engine(
        &self,
        store: &ShardStore,
        engine_id: uuid::Uuid,
    ) -> Result<Option<SearchEngine>> {
        if let Some(engine) = self.catalog.get_engine(engine_id).await? {
            return Ok(Some(engine));
        }
        store.get_engine(engine_id).await
    }

    async fn run_engine(
        &self,
        ctx: &JobContext,
        engine: &SearchEngine,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<EngineResult>> {
        match engine.strategy {
            EngineStrategy::Api => self.run_api_engine(ctx, engine, query, max_results).await,
            EngineStrategy::Generic => Err(DriftnetError::InvalidInput(
                "generic engine strategy requires a browser-driver backend".into(),
            )),
        }
    }

    async fn run_api_engine(
        &self,
        ctx: &JobContext,
        engine: &SearchEngine,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<EngineResult>> {
        let encoded_query: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        let headers = api::header_pairs(&engine.api_config);
        let paged = engine.url_template.contains("{page}");
        let pages = if paged { engine.max_pages.max(1) } else { 1 };

        let mut results: Vec<EngineResult> = Vec::new();
        for page in 1..=pages {
            if page > 1 {
                tokio::time::sleep(Duration::from_millis(engine.rate_limit_ms.max(0) as u64)).await;
            }

            let url = api::interpolate_env(&engine.url_template)
                .replace("{query}", &encoded_query)
                .replace("{page}", &page.to_string());

            let outcome = ctx
                .fetcher
                .fetch(FetchParams {
                    url: &url,
                    headers: headers.clone(),
                    ..Default::default()
                })
                .await?;
            let fetched = match outcome {
                FetchOutcome::Fetched(fetched) => fetched,
                FetchOutcome::NotModified { .. } => break,
            };

            let body: Value = serde_json::from_slice(&fetched.body)
                .map_err(|e| DriftnetError::Parse(format!("engine response: {e}")))?;
            let mapped = api::mapped_results(&body, &engine.api_config)?;
            if mapped.is_empty() {
                break;
            }

            for (title, text, url) in mapped {
                results.push(EngineResult {
                    title,
                    snippet: text,
                    url,
                });
                if results.len() >= max_results as usize {
                    return Ok(results);
                }
            }
        }
        Ok(results)
    }

    /// Follow a result link for full extraction.
    async fn follow(&self, ctx: &JobContext, url: &str) -> Result<String> {
        let outcome = ctx.fetcher.fetch(FetchParams::bare(url)).await?;
        match outcome {
            FetchOutcome::Fetched(fetched) => {
                let extracted =
                    ctx.html
                        .extract(&fetched.body, Some(&fetched.final_url), ExtractMode::Auto);
                Ok(extracted.text)
            }
            FetchOutcome::NotModified { .. } => Ok(String::new()),
        }
    }
}
