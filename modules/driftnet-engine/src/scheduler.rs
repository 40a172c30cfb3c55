// The polling driver: on every tick, visit each active shard, pull its due
// sources, and hand one job per source to the sink. Single-threaded by
// design; per-shard write concurrency is already bounded by the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uuid::Uuid;

use driftnet_common::{Result, Source};
use driftnet_store::{ShardResolver, ShardStore};

use crate::pipeline::Pipeline;

/// One unit of scheduled work.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub dossier_id: String,
    pub source_id: Uuid,
    pub url: String,
}

/// Where jobs go. In production this is the pipeline (which wraps every
/// run with the repair handler); tests plug in recorders.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn dispatch(&self, store: &ShardStore, source: &Source, job: &FetchJob) -> Result<u32>;
}

#[async_trait]
impl JobSink for Pipeline {
    async fn dispatch(&self, store: &ShardStore, source: &Source, _job: &FetchJob) -> Result<u32> {
        self.run(store, source).await
    }
}

/// Counters for one scan, logged per tick.
#[derive(Debug, Default)]
pub struct ScanStats {
    pub shards: usize,
    pub skipped_shards: usize,
    pub dispatched: usize,
    pub failed: usize,
}

pub struct Scheduler {
    resolver: Arc<ShardResolver>,
    sink: Arc<dyn JobSink>,
    tick: Duration,
    batch_limit: u32,
}

impl Scheduler {
    pub fn new(
        resolver: Arc<ShardResolver>,
        sink: Arc<dyn JobSink>,
        tick: Duration,
        batch_limit: u32,
    ) -> Self {
        Self {
            resolver,
            sink,
            tick,
            batch_limit,
        }
    }

    /// Drive scans until shutdown flips. Cancellation mid-batch finishes
    /// the in-flight source, then returns.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_ms = self.tick.as_millis() as u64, "Scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.scan_once(Some(&shutdown)).await;
                    if stats.dispatched > 0 || stats.failed > 0 || stats.skipped_shards > 0 {
                        info!(
                            shards = stats.shards,
                            dispatched = stats.dispatched,
                            failed = stats.failed,
                            skipped_shards = stats.skipped_shards,
                            "Scheduler scan complete"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown channel closed, scheduler stopping");
                        return;
                    }
                }
            }
            if *shutdown.borrow() {
                info!("Scheduler stopping");
                return;
            }
        }
    }

    /// One full pass over every active shard. Shard failures are skipped,
    /// never fatal; per-source failures are already recorded and repaired
    /// by the sink.
    pub async fn scan_once(&self, shutdown: Option<&watch::Receiver<bool>>) -> ScanStats {
        let mut stats = ScanStats::default();

        let shard_ids = match self.resolver.catalog().list_active_shards().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Catalog query failed, skipping scan");
                return stats;
            }
        };
        stats.shards = shard_ids.len();

        for dossier_id in shard_ids {
            if shutdown.is_some_and(|s| *s.borrow()) {
                return stats;
            }

            let store = match self.resolver.resolve(&dossier_id).await {
                Ok(store) => store,
                Err(e) => {
                    warn!(dossier_id, error = %e, "Shard resolution failed, skipping");
                    stats.skipped_shards += 1;
                    continue;
                }
            };

            let due = match store.list_due_sources(Utc::now(), self.batch_limit).await {
                Ok(due) => due,
                Err(e) => {
                    warn!(dossier_id, error = %e, "Due-source query failed, skipping shard");
                    stats.skipped_shards += 1;
                    continue;
                }
            };

            for source in due {
                let job = FetchJob {
                    dossier_id: dossier_id.clone(),
                    source_id: source.id,
                    url: source.url.clone(),
                };
                match self.sink.dispatch(&store, &source, &job).await {
                    Ok(_) => stats.dispatched += 1,
                    Err(e) => {
                        // Already fetch-logged and repaired downstream.
                        warn!(dossier_id, source_id = %source.id, error = %e, "Job failed");
                        stats.failed += 1;
                    }
                }
                if shutdown.is_some_and(|s| *s.borrow()) {
                    return stats;
                }
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftnet_common::{NewSource, SourceType};
    use driftnet_store::Catalog;
    use std::sync::Mutex;

    struct RecordingSink {
        jobs: Mutex<Vec<FetchJob>>,
    }

    #[async_trait]
    impl JobSink for RecordingSink {
        async fn dispatch(
            &self,
            _store: &ShardStore,
            _source: &Source,
            job: &FetchJob,
        ) -> Result<u32> {
            self.jobs.lock().unwrap().push(job.clone());
            Ok(0)
        }
    }

    #[tokio::test]
    async fn scan_dispatches_due_sources_across_shards() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).await.unwrap();
        let resolver = Arc::new(ShardResolver::new(dir.path().to_path_buf(), catalog));

        for dossier in ["alpha", "beta"] {
            let store = resolver.resolve(dossier).await.unwrap();
            store
                .insert_source(NewSource {
                    id: Uuid::now_v7(),
                    name: format!("{dossier} source"),
                    url: format!("https://{dossier}.example.com/"),
                    source_type: SourceType::Web,
                    fetch_interval_ms: 3_600_000,
                    enabled: true,
                    config: serde_json::json!({}),
                })
                .await
                .unwrap();
        }

        let sink = Arc::new(RecordingSink {
            jobs: Mutex::new(Vec::new()),
        });
        let scheduler = Scheduler::new(
            resolver,
            sink.clone(),
            Duration::from_secs(60),
            25,
        );

        let stats = scheduler.scan_once(None).await;
        assert_eq!(stats.shards, 2);
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.failed, 0);

        let jobs = sink.jobs.lock().unwrap();
        let mut dossiers: Vec<&str> = jobs.iter().map(|j| j.dossier_id.as_str()).collect();
        dossiers.sort();
        assert_eq!(dossiers, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn cancellation_stops_between_sources() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).await.unwrap();
        let resolver = Arc::new(ShardResolver::new(dir.path().to_path_buf(), catalog));

        let store = resolver.resolve("alpha").await.unwrap();
        for i in 0..3 {
            store
                .insert_source(NewSource {
                    id: Uuid::now_v7(),
                    name: format!("source {i}"),
                    url: format!("https://example.com/{i}"),
                    source_type: SourceType::Web,
                    fetch_interval_ms: 3_600_000,
                    enabled: true,
                    config: serde_json::json!({}),
                })
                .await
                .unwrap();
        }

        let sink = Arc::new(RecordingSink {
            jobs: Mutex::new(Vec::new()),
        });
        let scheduler = Scheduler::new(resolver, sink.clone(), Duration::from_secs(60), 25);

        // Already-cancelled context: the batch stops after the first source.
        let (tx, rx) = watch::channel(true);
        drop(tx);
        let stats = scheduler.scan_once(Some(&rx)).await;
        assert!(stats.dispatched <= 1);
    }
}
