// Auto-repair: classify a failed fetch into an action, then apply it to
// the source record in place. Classification is a pure function so the
// table is testable row by row.

use std::sync::Arc;

use tracing::{info, warn};

use driftnet_common::{normalize_url, Result, Source, SourceType, UrlGuard};
use driftnet_store::ShardStore;

/// Rotation pool for 403-hostile hosts. The applier picks the entry after
/// the source's current one.
pub const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Redirected,
    Transient,
    RateLimited,
    Gone,
    Forbidden,
    ParseFailure,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairAction {
    /// Move the source to the redirect target (revalidated before writing).
    FollowRedirect { target: String },
    /// Double the fetch interval, capped; remember the original.
    Backoff,
    /// Double the per-source rate-limit floor.
    IncreaseRateLimit,
    MarkBroken,
    RotateUserAgent,
    None,
}

#[derive(Debug, Clone)]
pub struct RepairPolicy {
    /// Failure streak after which a source is forced broken.
    pub fail_threshold: u32,
    pub backoff_cap_ms: i64,
    /// When false, parse errors back off instead of breaking the source.
    pub parse_error_breaks: bool,
}

impl Default for RepairPolicy {
    fn default() -> Self {
        Self {
            fail_threshold: 10,
            backoff_cap_ms: 86_400_000,
            parse_error_breaks: true,
        }
    }
}

/// The error taxonomy. Input is whatever the failed fetch left behind:
/// the HTTP status (0 when no response) and the error display text.
pub fn classify(
    source_type: &SourceType,
    status: u16,
    message: &str,
    policy: &RepairPolicy,
) -> (ErrorClass, RepairAction) {
    if matches!(status, 301 | 302 | 307 | 308) {
        let action = match extract_redirect_target(message) {
            Some(target) => RepairAction::FollowRedirect { target },
            None => RepairAction::None,
        };
        return (ErrorClass::Redirected, action);
    }

    if status == 429 {
        return (ErrorClass::RateLimited, RepairAction::IncreaseRateLimit);
    }

    if matches!(status, 404 | 410) {
        return (ErrorClass::Gone, RepairAction::MarkBroken);
    }

    if status == 403 {
        let action = match source_type {
            SourceType::Web | SourceType::Rss => RepairAction::RotateUserAgent,
            // An api 403 is a revoked credential, not a bot wall.
            _ => RepairAction::MarkBroken,
        };
        return (ErrorClass::Forbidden, action);
    }

    let lowered = message.to_lowercase();
    if status >= 500 || lowered.contains("timed out") || lowered.contains("timeout") || lowered.contains("dns")
    {
        return (ErrorClass::Transient, RepairAction::Backoff);
    }

    if lowered.contains("parse error") {
        let action = if policy.parse_error_breaks {
            RepairAction::MarkBroken
        } else {
            RepairAction::Backoff
        };
        return (ErrorClass::ParseFailure, action);
    }

    (ErrorClass::Unknown, RepairAction::None)
}

/// Pull the redirect target out of a fetch error message. The fetcher
/// phrases every redirect failure as `… redirect to <url> …`.
fn extract_redirect_target(message: &str) -> Option<String> {
    let idx = message.find("redirect to ")?;
    let rest = &message[idx + "redirect to ".len()..];
    let target = rest.split_whitespace().next()?;
    let target = target.trim_end_matches([':', ',', ';']);
    if target.is_empty() {
        None
    } else {
        Some(target.to_string())
    }
}

/// Apply an action to the source record. `fail_count` is the streak after
/// the failure that produced this action; past the threshold the source is
/// forced broken no matter what the classifier said.
pub async fn apply(
    store: &ShardStore,
    source: &Source,
    action: RepairAction,
    policy: &RepairPolicy,
    fail_count: u32,
    guard: &Arc<dyn UrlGuard>,
) -> Result<()> {
    match action {
        RepairAction::FollowRedirect { target } => {
            match validated_target(&target, guard) {
                Ok(canonical) => {
                    match store.set_url(source.id, &canonical).await {
                        Ok(()) => {
                            info!(source_id = %source.id, from = %source.url, to = %canonical, "Source URL migrated to redirect target")
                        }
                        Err(e) => {
                            warn!(source_id = %source.id, target = %canonical, error = %e, "Redirect target collides with an existing source")
                        }
                    }
                }
                Err(e) => {
                    warn!(source_id = %source.id, target = %target, error = %e, "Redirect target failed validation")
                }
            }
        }
        RepairAction::Backoff => {
            store.apply_backoff(source.id, policy.backoff_cap_ms).await?;
            info!(source_id = %source.id, "Fetch interval backed off");
        }
        RepairAction::IncreaseRateLimit => {
            let current = source
                .config
                .get("rate_limit_ms")
                .and_then(|v| v.as_i64())
                .unwrap_or(1000);
            let mut config = source.config.clone();
            if let Some(obj) = config.as_object_mut() {
                obj.insert("rate_limit_ms".into(), serde_json::json!(current * 2));
            }
            store.set_config(source.id, &config).await?;
            info!(source_id = %source.id, rate_limit_ms = current * 2, "Rate limit floor doubled");
        }
        RepairAction::MarkBroken => {
            store.mark_broken(source.id).await?;
            warn!(source_id = %source.id, url = %source.url, "Source marked broken");
        }
        RepairAction::RotateUserAgent => {
            let next = next_user_agent(source.user_agent.as_deref());
            store.set_user_agent(source.id, next).await?;
            info!(source_id = %source.id, "User agent rotated");
        }
        RepairAction::None => {}
    }

    if fail_count > policy.fail_threshold {
        store.mark_broken(source.id).await?;
        warn!(
            source_id = %source.id,
            fail_count,
            threshold = policy.fail_threshold,
            "Failure streak over threshold; source forced broken"
        );
    }
    Ok(())
}

fn validated_target(target: &str, guard: &Arc<dyn UrlGuard>) -> Result<String> {
    let canonical = normalize_url(target)?;
    let parsed = url::Url::parse(&canonical)
        .map_err(|e| driftnet_common::DriftnetError::InvalidInput(format!("invalid URL: {e}")))?;
    guard.check(&parsed)?;
    Ok(canonical)
}

fn next_user_agent(current: Option<&str>) -> &'static str {
    match current.and_then(|ua| USER_AGENTS.iter().position(|c| *c == ua)) {
        Some(i) => USER_AGENTS[(i + 1) % USER_AGENTS.len()],
        None => USER_AGENTS[0],
    }
}
