// Best-effort audit trail: a bounded queue drained by one background task.
// A full queue drops the entry rather than stalling the caller.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub action: String,
    pub dossier_id: String,
    pub parameters: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Where drained entries go. Persistence is the caller's concern; the
/// engine only requires an async sink.
#[async_trait]
pub trait AuditWriter: Send + Sync {
    async fn write(&self, entry: AuditEntry) -> anyhow::Result<()>;
}

/// Default writer: the audit trail lands in the log stream.
pub struct TracingAuditWriter;

#[async_trait]
impl AuditWriter for TracingAuditWriter {
    async fn write(&self, entry: AuditEntry) -> anyhow::Result<()> {
        info!(
            action = %entry.action,
            dossier_id = %entry.dossier_id,
            parameters = %entry.parameters,
            "audit"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct AuditQueue {
    tx: mpsc::Sender<AuditEntry>,
}

impl AuditQueue {
    /// Spawn the drain task. The task ends when every queue handle drops.
    pub fn new(writer: Arc<dyn AuditWriter>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditEntry>(capacity);
        let handle = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = writer.write(entry).await {
                    warn!(error = %e, "Audit write failed");
                }
            }
        });
        (Self { tx }, handle)
    }

    /// Enqueue without waiting. Dropped (with a warning) when full.
    pub fn record(&self, action: &str, dossier_id: &str, parameters: serde_json::Value) {
        let entry = AuditEntry {
            action: action.to_string(),
            dossier_id: dossier_id.to_string(),
            parameters,
            timestamp: Utc::now(),
        };
        if let Err(mpsc::error::TrySendError::Full(entry)) = self.tx.try_send(entry) {
            warn!(action = %entry.action, "Audit queue full, entry dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectingWriter {
        entries: Arc<Mutex<Vec<AuditEntry>>>,
    }

    #[async_trait]
    impl AuditWriter for CollectingWriter {
        async fn write(&self, entry: AuditEntry) -> anyhow::Result<()> {
            self.entries.lock().unwrap().push(entry);
            Ok(())
        }
    }

    #[tokio::test]
    async fn entries_drain_to_the_writer() {
        let entries = Arc::new(Mutex::new(Vec::new()));
        let (queue, handle) = AuditQueue::new(
            Arc::new(CollectingWriter {
                entries: entries.clone(),
            }),
            16,
        );

        queue.record("add_source", "acme", serde_json::json!({"url": "https://example.com"}));
        queue.record("delete_source", "acme", serde_json::json!({}));
        drop(queue);
        handle.await.unwrap();

        let drained = entries.lock().unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].action, "add_source");
        assert_eq!(drained[0].dossier_id, "acme");
    }
}
