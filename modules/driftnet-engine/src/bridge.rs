// The connectivity bridge: external services registered on an RPC router
// under the `<type>_fetch` naming convention become source handlers. This
// is the only way new source types enter the system after compile time.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use driftnet_common::{content_hash, Candidate, Result, Source};
use driftnet_store::ShardStore;

use crate::pipeline::{ingest, HandlerReport, JobContext, SourceHandler};

/// The router surface the engine consumes. Transport, authentication, and
/// timeouts are the implementation's concern.
#[async_trait]
pub trait ServiceRouter: Send + Sync {
    async fn list_services(&self) -> Result<Vec<String>>;
    async fn call(&self, service: &str, payload: serde_json::Value) -> Result<serde_json::Value>;
}

const FETCH_SUFFIX: &str = "_fetch";

/// Enumerate the router and synthesize a handler per `<type>_fetch`
/// service. Returns `(source_type, handler)` pairs for registration.
pub async fn discover(
    router: Arc<dyn ServiceRouter>,
) -> Result<Vec<(String, Arc<dyn SourceHandler>)>> {
    let mut discovered: Vec<(String, Arc<dyn SourceHandler>)> = Vec::new();
    for service in router.list_services().await? {
        let Some(source_type) = service.strip_suffix(FETCH_SUFFIX) else {
            continue;
        };
        if source_type.is_empty() {
            continue;
        }
        info!(service, source_type, "Discovered bridge source type");
        discovered.push((
            source_type.to_string(),
            Arc::new(BridgeHandler {
                service,
                router: router.clone(),
            }) as Arc<dyn SourceHandler>,
        ));
    }
    Ok(discovered)
}

/// Synthetic handler delegating fetch + parse to the external service.
pub struct BridgeHandler {
    service: String,
    router: Arc<dyn ServiceRouter>,
}

#[derive(Deserialize)]
struct BridgeResponse {
    #[serde(default)]
    extractions: Vec<BridgeExtraction>,
}

#[derive(Deserialize)]
struct BridgeExtraction {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content_hash: String,
}

#[async_trait]
impl SourceHandler for BridgeHandler {
    async fn handle(
        &self,
        ctx: &JobContext,
        store: &ShardStore,
        source: &Source,
    ) -> Result<HandlerReport> {
        let payload = serde_json::json!({
            "source_id": source.id,
            "url": source.url,
            "config": source.config,
            "source_type": source.source_type,
        });
        let response = self.router.call(&self.service, payload).await?;

        let parsed: BridgeResponse = serde_json::from_value(response).map_err(|e| {
            driftnet_common::DriftnetError::Parse(format!("bridge response from {}: {e}", self.service))
        })?;

        let candidates: Vec<Candidate> = parsed
            .extractions
            .into_iter()
            .map(|x| {
                let hash = if x.content_hash.is_empty() {
                    content_hash(if x.url.is_empty() { &x.content } else { &x.url })
                } else {
                    x.content_hash
                };
                Candidate {
                    title: x.title,
                    content: x.content,
                    url: x.url,
                    content_hash: hash,
                }
            })
            .collect();

        let new_extractions = ingest(ctx, store, source, candidates, serde_json::json!({})).await?;
        Ok(HandlerReport::ok(0, 0, new_extractions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticRouter;

    #[async_trait]
    impl ServiceRouter for StaticRouter {
        async fn list_services(&self) -> Result<Vec<String>> {
            Ok(vec![
                "youtube_fetch".into(),
                "podcast_fetch".into(),
                "unrelated_service".into(),
                "_fetch".into(),
            ])
        }

        async fn call(&self, _service: &str, _payload: serde_json::Value) -> Result<serde_json::Value> {
            Ok(serde_json::json!({"extractions": []}))
        }
    }

    #[tokio::test]
    async fn discovery_filters_on_suffix() {
        let discovered = discover(Arc::new(StaticRouter)).await.unwrap();
        let types: Vec<&str> = discovered.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(types, vec!["youtube", "podcast"]);
    }
}
