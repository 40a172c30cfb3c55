// The sweeper: periodically probe broken and erroring sources and restore
// the ones that answer healthily.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use url::Url;

use driftnet_common::{DriftnetError, Result};
use driftnet_store::ShardResolver;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one sweep across all active shards.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    pub probed: usize,
    pub restored: usize,
    pub still_unhealthy: usize,
    /// Sources whose URL cannot be probed over HTTP (question://, local paths).
    pub skipped: usize,
}

pub struct Sweeper {
    resolver: Arc<ShardResolver>,
    client: reqwest::Client,
}

impl Sweeper {
    pub fn new(resolver: Arc<ShardResolver>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| DriftnetError::InvalidInput(format!("http client: {e}")))?;
        Ok(Self { resolver, client })
    }

    /// Probe until shutdown flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "Sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(summary) if summary.probed > 0 => {
                            info!(
                                probed = summary.probed,
                                restored = summary.restored,
                                still_unhealthy = summary.still_unhealthy,
                                "Sweep complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown channel closed, sweeper stopping");
                        return;
                    }
                }
            }
            if *shutdown.borrow() {
                info!("Sweeper stopping");
                return;
            }
        }
    }

    /// One pass over every active shard's unhealthy sources.
    pub async fn sweep_once(&self) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();

        for dossier_id in self.resolver.catalog().list_active_shards().await? {
            let store = match self.resolver.resolve(&dossier_id).await {
                Ok(store) => store,
                Err(e) => {
                    warn!(dossier_id, error = %e, "Shard resolution failed, skipping sweep");
                    continue;
                }
            };

            for source in store.list_unhealthy_sources().await? {
                if !probeable(&source.url) {
                    summary.skipped += 1;
                    continue;
                }
                summary.probed += 1;

                match self.probe(&source.url).await {
                    Ok(status) if (200..300).contains(&status) => {
                        store.restore_source(source.id).await?;
                        summary.restored += 1;
                        info!(
                            dossier_id,
                            source_id = %source.id,
                            url = %source.url,
                            status,
                            "Source restored after healthy probe"
                        );
                    }
                    Ok(status) => {
                        summary.still_unhealthy += 1;
                        warn!(dossier_id, source_id = %source.id, status, "Probe still unhealthy");
                    }
                    Err(e) => {
                        summary.still_unhealthy += 1;
                        warn!(dossier_id, source_id = %source.id, error = %e, "Probe failed");
                    }
                }
            }
        }

        Ok(summary)
    }

    /// HEAD first; hosts that answer 405 get a range-limited GET instead.
    pub async fn probe(&self, url: &str) -> Result<u16> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| DriftnetError::Fetch {
                status: 0,
                message: format!("probe failed: {e}"),
            })?;
        let status = response.status().as_u16();
        if status != 405 {
            return Ok(status);
        }

        let response = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| DriftnetError::Fetch {
                status: 0,
                message: format!("probe failed: {e}"),
            })?;
        Ok(response.status().as_u16())
    }
}

fn probeable(url: &str) -> bool {
    matches!(
        Url::parse(url).map(|u| u.scheme().to_string()).as_deref(),
        Ok("http") | Ok("https")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_http_urls_are_probeable() {
        assert!(probeable("https://example.com/feed"));
        assert!(probeable("http://example.com"));
        assert!(!probeable("question://0195d2ae-0000-7000-8000-000000000000"));
        assert!(!probeable("reports/q3.pdf"));
    }
}
