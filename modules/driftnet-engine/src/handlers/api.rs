// JSON API sources: walk a configured dotted path to the result array,
// map fields per configuration, interpolate `${ENV}` references in the URL
// and headers. The tracked-question runner shares these helpers for its
// api-strategy engines.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use driftnet_common::{content_hash, Candidate, DriftnetError, Result, Source};
use driftnet_store::ShardStore;

use crate::fetcher::{FetchOutcome, FetchParams};
use crate::pipeline::{ingest, HandlerReport, JobContext, SourceHandler};

static ENV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));

/// Replace `${NAME}` references with environment values. Unset variables
/// become empty strings.
pub(crate) fn interpolate_env(input: &str) -> String {
    ENV_RE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

/// Walk a dotted path (`a.b.c`) into a JSON document.
pub(crate) fn walk<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Field names to read from each result item.
pub(crate) struct FieldMap {
    pub title: String,
    pub text: String,
    pub url: String,
}

pub(crate) fn field_map(config: &Value) -> FieldMap {
    let field = |name: &str, default: &str| {
        config
            .get("fields")
            .and_then(|f| f.get(name))
            .and_then(|v| v.as_str())
            .unwrap_or(default)
            .to_string()
    };
    FieldMap {
        title: field("title", "title"),
        text: field("text", "text"),
        url: field("url", "url"),
    }
}

/// Interpolated `(name, value)` pairs from a config's `headers` object.
pub(crate) fn header_pairs(config: &Value) -> Vec<(String, String)> {
    config
        .get("headers")
        .and_then(|h| h.as_object())
        .map(|headers| {
            headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .as_str()
                        .map(|v| (name.clone(), interpolate_env(v)))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Resolve the result array and map each item to `(title, text, url)`.
pub(crate) fn mapped_results(body: &Value, config: &Value) -> Result<Vec<(String, String, String)>> {
    let result_path = config
        .get("result_path")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let results = if result_path.is_empty() {
        body
    } else {
        walk(body, result_path).ok_or_else(|| {
            DriftnetError::Parse(format!("result path '{result_path}' not found in response"))
        })?
    };
    let items = results.as_array().ok_or_else(|| {
        DriftnetError::Parse(format!("result path '{result_path}' is not an array"))
    })?;

    let fields = field_map(config);
    let text_of = |item: &Value, key: &str| -> String {
        walk(item, key)
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default()
    };

    Ok(items
        .iter()
        .map(|item| {
            (
                text_of(item, &fields.title),
                text_of(item, &fields.text),
                text_of(item, &fields.url),
            )
        })
        .collect())
}

/// Handler for `api` sources.
pub struct ApiHandler;

#[async_trait]
impl SourceHandler for ApiHandler {
    async fn handle(
        &self,
        ctx: &JobContext,
        store: &ShardStore,
        source: &Source,
    ) -> Result<HandlerReport> {
        let url = interpolate_env(&source.url);
        let headers = header_pairs(&source.config);

        let outcome = ctx
            .fetcher
            .fetch(FetchParams {
                url: &url,
                etag: source.etag.as_deref(),
                last_modified: source.last_modified.as_deref(),
                previous_hash: source.content_hash.as_deref(),
                user_agent: source.user_agent.as_deref(),
                headers,
            })
            .await?;

        let fetched = match outcome {
            FetchOutcome::NotModified { http_status } => {
                return Ok(HandlerReport::not_modified(http_status))
            }
            FetchOutcome::Fetched(fetched) => fetched,
        };

        let body: Value = serde_json::from_slice(&fetched.body)
            .map_err(|e| DriftnetError::Parse(format!("api response: {e}")))?;

        let candidates: Vec<Candidate> = mapped_results(&body, &source.config)?
            .into_iter()
            .filter(|(title, text, _)| !title.is_empty() || !text.is_empty())
            .map(|(title, text, item_url)| {
                let hash = if item_url.is_empty() {
                    content_hash(&text)
                } else {
                    content_hash(&item_url)
                };
                Candidate {
                    title,
                    content: text,
                    url: item_url,
                    content_hash: hash,
                }
            })
            .collect();

        let new_extractions = ingest(ctx, store, source, candidates, serde_json::json!({})).await?;

        let mut report =
            HandlerReport::ok(fetched.http_status, fetched.body.len() as u64, new_extractions);
        report.etag = fetched.etag;
        report.last_modified = fetched.last_modified;
        report.content_hash = Some(fetched.content_hash);
        Ok(report)
    }
}
