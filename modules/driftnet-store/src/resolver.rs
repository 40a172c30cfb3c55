// Lazy dossier → shard resolution with a process-wide cache.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::info;

use driftnet_common::{DriftnetError, Result};

use crate::catalog::Catalog;
use crate::shard::ShardStore;

/// Opens shard stores on first use and hands out cached clones after.
/// Resolving also registers the dossier in the catalog so the scheduler
/// starts visiting it.
pub struct ShardResolver {
    data_dir: PathBuf,
    catalog: Catalog,
    cache: Mutex<HashMap<String, ShardStore>>,
}

impl ShardResolver {
    pub fn new(data_dir: PathBuf, catalog: Catalog) -> Self {
        Self {
            data_dir,
            catalog,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub async fn resolve(&self, dossier_id: &str) -> Result<ShardStore> {
        if dossier_id.is_empty()
            || !dossier_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DriftnetError::InvalidInput(format!(
                "invalid dossier id '{dossier_id}'"
            )));
        }

        let mut cache = self.cache.lock().await;
        if let Some(store) = cache.get(dossier_id) {
            return Ok(store.clone());
        }

        let path = self.data_dir.join(format!("{dossier_id}.db"));
        let store = ShardStore::open(&path, dossier_id).await?;
        self.catalog.register_shard(dossier_id).await?;
        info!(dossier_id, path = %path.display(), "Opened tenant shard");

        cache.insert(dossier_id.to_string(), store.clone());
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_opens_once_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).await.unwrap();
        let resolver = ShardResolver::new(dir.path().to_path_buf(), catalog.clone());

        let a = resolver.resolve("acme").await.unwrap();
        let b = resolver.resolve("acme").await.unwrap();
        assert_eq!(a.dossier_id(), b.dossier_id());
        assert!(dir.path().join("acme.db").exists());

        let active = catalog.list_active_shards().await.unwrap();
        assert_eq!(active, vec!["acme".to_string()]);
    }

    #[tokio::test]
    async fn hostile_dossier_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).await.unwrap();
        let resolver = ShardResolver::new(dir.path().to_path_buf(), catalog);

        assert!(resolver.resolve("../escape").await.is_err());
        assert!(resolver.resolve("").await.is_err());
        assert!(resolver.resolve("a/b").await.is_err());
    }
}
