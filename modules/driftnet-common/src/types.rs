use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Validation bounds ---

pub const MIN_FETCH_INTERVAL_MS: i64 = 60_000;
pub const MAX_FETCH_INTERVAL_MS: i64 = 604_800_000;
pub const DEFAULT_FETCH_INTERVAL_MS: i64 = 3_600_000;
pub const MAX_NAME_LEN: usize = 512;
pub const MAX_URL_LEN: usize = 4096;
pub const MAX_CONFIG_BYTES: usize = 8192;

// --- Source types ---

/// The handler family a source is dispatched to. Types beyond the built-in
/// five are discovered on the RPC router at startup (`<type>_fetch` services).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Web,
    Rss,
    Api,
    Document,
    Question,
    /// A type contributed by an external bridge service at runtime.
    #[serde(untagged)]
    External(String),
}

impl SourceType {
    /// Parse a type tag. Never fails: unrecognized tags become `External`,
    /// and membership in the accepted set is the façade's concern.
    pub fn parse(s: &str) -> Self {
        match s {
            "web" => SourceType::Web,
            "rss" => SourceType::Rss,
            "api" => SourceType::Api,
            "document" => SourceType::Document,
            "question" => SourceType::Question,
            other => SourceType::External(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SourceType::Web => "web",
            SourceType::Rss => "rss",
            SourceType::Api => "api",
            SourceType::Document => "document",
            SourceType::Question => "question",
            SourceType::External(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// --- Source status ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Ok,
    Error,
    Broken,
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceStatus::Ok => write!(f, "ok"),
            SourceStatus::Error => write!(f, "error"),
            SourceStatus::Broken => write!(f, "broken"),
        }
    }
}

impl std::str::FromStr for SourceStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            "broken" => Ok(Self::Broken),
            other => Err(format!("unknown SourceStatus: {other}")),
        }
    }
}

// --- Source ---

/// A monitored endpoint; the unit of scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub name: String,
    /// Canonical URL: always equals `normalize_url(input)`, unique per shard.
    pub url: String,
    pub source_type: SourceType,
    pub fetch_interval_ms: i64,
    pub enabled: bool,
    /// Opaque per-type configuration, bounded JSON.
    pub config: serde_json::Value,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub fail_count: u32,
    pub last_status: SourceStatus,
    /// Interval before auto-repair backoff first doubled it, for restore.
    pub original_fetch_interval_ms: Option<i64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Content hash of the last successful fetch, for change detection.
    pub content_hash: Option<String>,
    /// Override set by user-agent rotation; None means the configured default.
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for inserting a new source. The store fills in timestamps.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub source_type: SourceType,
    pub fetch_interval_ms: i64,
    pub enabled: bool,
    pub config: serde_json::Value,
}

// --- Extraction ---

/// One distilled piece of content; the unit of search and sidecar emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    pub id: Uuid,
    pub source_id: Uuid,
    pub title: String,
    pub content: String,
    /// URL of the item itself; may differ from the source URL for feeds.
    pub url: String,
    pub content_hash: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A candidate record produced by a handler, before the dedup gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub title: String,
    pub content: String,
    pub url: String,
    pub content_hash: String,
}

// --- Fetch log ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchLogStatus {
    Ok,
    NotModified,
    Error,
}

impl std::fmt::Display for FetchLogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchLogStatus::Ok => write!(f, "ok"),
            FetchLogStatus::NotModified => write!(f, "not_modified"),
            FetchLogStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for FetchLogStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "not_modified" => Ok(Self::NotModified),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown FetchLogStatus: {other}")),
        }
    }
}

/// One fetch attempt. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchLogEntry {
    pub id: Uuid,
    pub source_id: Uuid,
    pub status: FetchLogStatus,
    /// HTTP response code, 0 when no response was received.
    pub http_status: u16,
    pub bytes_read: u64,
    pub new_extractions: u32,
    /// Empty on success.
    pub error: String,
    pub created_at: DateTime<Utc>,
}

// --- Tracked questions ---

/// A recurring search query whose results are persisted over time.
/// Adding one also creates a backing source with `source_type = question`,
/// the same id, and the synthetic URL `question://<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedQuestion {
    pub id: Uuid,
    pub text: String,
    pub keywords: Vec<String>,
    pub engine_ids: Vec<Uuid>,
    pub interval_ms: i64,
    pub max_results: u32,
    /// Follow result URLs for full extraction instead of keeping snippets.
    pub follow_links: bool,
    pub enabled: bool,
    pub total_results: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedQuestion {
    /// The synthetic URL of the backing source.
    pub fn source_url(&self) -> String {
        format!("question://{}", self.id)
    }

    /// Search expression: keywords plus the question text.
    pub fn query_expression(&self) -> String {
        let mut parts: Vec<&str> = self.keywords.iter().map(|s| s.as_str()).collect();
        parts.push(self.text.as_str());
        parts.join(" ")
    }
}

// --- Search engines ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStrategy {
    Api,
    Generic,
}

impl std::fmt::Display for EngineStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineStrategy::Api => write!(f, "api"),
            EngineStrategy::Generic => write!(f, "generic"),
        }
    }
}

impl std::str::FromStr for EngineStrategy {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "api" => Ok(Self::Api),
            "generic" => Ok(Self::Generic),
            other => Err(format!("unknown EngineStrategy: {other}")),
        }
    }
}

/// A search engine registry row (per-shard or global catalog).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchEngine {
    pub id: Uuid,
    pub name: String,
    pub strategy: EngineStrategy,
    /// Request template with a `{query}` placeholder.
    pub url_template: String,
    /// Strategy-specific configuration: result path and field mapping for
    /// `api`, CSS selectors for `generic`.
    pub api_config: serde_json::Value,
    pub selectors: Option<String>,
    /// Minimum milliseconds between calls to this engine.
    pub rate_limit_ms: i64,
    pub max_pages: u32,
    pub enabled: bool,
}

// --- Search & stats ---

/// One full-text search hit, ordered by the index's native relevance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub extraction_id: Uuid,
    pub source_id: Uuid,
    pub source_url: String,
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Aggregate counts for one shard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardStats {
    pub sources: u64,
    pub sources_ok: u64,
    pub sources_error: u64,
    pub sources_broken: u64,
    pub extractions: u64,
    pub fetch_log_entries: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// A broken or erroring source surfaced by cross-tenant health aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealth {
    pub dossier_id: String,
    pub source_id: Uuid,
    pub name: String,
    pub url: String,
    pub last_status: SourceStatus,
    pub fail_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

// --- Content hashing ---

/// FNV-1a 64-bit hash of content, rendered as fixed-width hex.
/// Stable dedup key for extractions and change detection on fetched bodies.
pub fn content_hash(content: &str) -> String {
    let mut hash: u64 = 0xcbf29ce484222325; // FNV offset basis
    for byte in content.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3); // FNV prime
    }
    format!("{hash:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(content_hash("hello"), content_hash("hello"));
        assert_ne!(content_hash("hello"), content_hash("hello "));
        assert_eq!(content_hash("").len(), 16);
    }

    #[test]
    fn source_type_round_trips() {
        for tag in ["web", "rss", "api", "document", "question"] {
            assert_eq!(SourceType::parse(tag).as_str(), tag);
        }
        let ext = SourceType::parse("youtube");
        assert_eq!(ext, SourceType::External("youtube".to_string()));
        assert_eq!(ext.as_str(), "youtube");
    }

    #[test]
    fn question_source_url_uses_id() {
        let q = TrackedQuestion {
            id: Uuid::now_v7(),
            text: "street closures".into(),
            keywords: vec!["minneapolis".into()],
            engine_ids: vec![],
            interval_ms: DEFAULT_FETCH_INTERVAL_MS,
            max_results: 10,
            follow_links: false,
            enabled: true,
            total_results: 0,
            last_run_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(q.source_url(), format!("question://{}", q.id));
        assert_eq!(q.query_expression(), "minneapolis street closures");
    }
}
