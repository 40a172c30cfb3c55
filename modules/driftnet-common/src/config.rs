use std::env;
use std::path::PathBuf;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the catalog DB and one shard file per dossier.
    pub data_dir: PathBuf,
    /// Sidecar pending directory. None disables sidecar emission.
    pub pending_dir: Option<PathBuf>,

    // Scheduler
    pub scheduler_tick_ms: u64,
    pub scheduler_batch_limit: u32,

    // Sweeper
    pub sweep_interval_ms: u64,

    // Fetching
    pub fetch_timeout_ms: u64,
    pub max_body_bytes: usize,
    pub user_agent: String,

    // Limits & repair policy
    pub source_quota: u32,
    pub fail_threshold: u32,
    /// When false, parse errors count toward backoff instead of marking
    /// the source broken.
    pub parse_error_breaks: bool,
}

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            data_dir: PathBuf::from(required_env("DRIFTNET_DATA_DIR")),
            pending_dir: env::var("DRIFTNET_PENDING_DIR").ok().map(PathBuf::from),
            scheduler_tick_ms: env_u64("DRIFTNET_SCHEDULER_TICK_MS", 60_000),
            scheduler_batch_limit: env_u64("DRIFTNET_SCHEDULER_BATCH_LIMIT", 25) as u32,
            sweep_interval_ms: env_u64("DRIFTNET_SWEEP_INTERVAL_MS", 3_600_000),
            fetch_timeout_ms: env_u64("DRIFTNET_FETCH_TIMEOUT_MS", 30_000),
            max_body_bytes: env_u64("DRIFTNET_MAX_BODY_BYTES", 10 * 1024 * 1024) as usize,
            user_agent: env::var("DRIFTNET_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            source_quota: env_u64("DRIFTNET_SOURCE_QUOTA", 1000) as u32,
            fail_threshold: env_u64("DRIFTNET_FAIL_THRESHOLD", 10) as u32,
            parse_error_breaks: env::var("DRIFTNET_PARSE_ERROR_BREAKS")
                .map(|v| v != "0" && v.to_lowercase() != "false")
                .unwrap_or(true),
        }
    }

    /// Config rooted at a directory, defaults everywhere else. The usual
    /// entry point for tests and embedded callers.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            pending_dir: None,
            scheduler_tick_ms: 60_000,
            scheduler_batch_limit: 25,
            sweep_interval_ms: 3_600_000,
            fetch_timeout_ms: 30_000,
            max_body_bytes: 10 * 1024 * 1024,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            source_quota: 1000,
            fail_threshold: 10,
            parse_error_breaks: true,
        }
    }
}

fn required_env(name: &str) -> String {
    env::var(name).unwrap_or_else(|_| panic!("{name} must be set"))
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
