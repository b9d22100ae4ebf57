//! Lifecycle Store - the live endpoint collection and its snapshot file
//!
//! Every mutation goes through a closure applied under the write lock, so a
//! read-modify-write on one record never interleaves with another. `save`
//! always writes the whole collection.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::endpoint::Endpoint;

pub struct LifecycleStore {
    /// `None` keeps everything in memory.
    path: Option<PathBuf>,
    endpoints: RwLock<Vec<Endpoint>>,
    /// Serialises snapshot writes so they land in mutation order.
    save_lock: Mutex<()>,
}

impl LifecycleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            endpoints: RwLock::new(Vec::new()),
            save_lock: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            endpoints: RwLock::new(Vec::new()),
            save_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Replace the live collection with the persisted snapshot.
    ///
    /// A missing file yields an empty collection. Evolution flags are
    /// cleared because nothing can be in flight in a fresh load.
    pub async fn load_all(&self) -> Result<usize> {
        let Some(path) = &self.path else {
            return Ok(self.endpoints.read().await.len());
        };

        if !fs::try_exists(path).await.unwrap_or(false) {
            info!("📚 No existing endpoints at {:?}, starting fresh", path);
            self.endpoints.write().await.clear();
            return Ok(0);
        }

        let json = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read endpoint snapshot at {:?}", path))?;
        let mut loaded: Vec<Endpoint> = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse endpoint snapshot at {:?}", path))?;

        for endpoint in &mut loaded {
            if endpoint.is_evolving {
                warn!("Clearing stale evolution flag on {}", endpoint.path);
                endpoint.is_evolving = false;
            }
        }

        let count = loaded.len();
        *self.endpoints.write().await = loaded;
        info!("📚 Loaded {} endpoints", count);
        Ok(count)
    }

    pub async fn get_all(&self) -> Vec<Endpoint> {
        self.endpoints.read().await.clone()
    }

    pub async fn get_by_path(&self, path: &str) -> Option<Endpoint> {
        self.endpoints.read().await.iter().find(|e| e.path == path).cloned()
    }

    pub async fn paths(&self) -> Vec<String> {
        self.endpoints.read().await.iter().map(|e| e.path.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.endpoints.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.endpoints.read().await.is_empty()
    }

    /// Add a record unless its path is already live; the live record wins
    /// and is returned either way.
    pub async fn insert(&self, endpoint: Endpoint) -> Endpoint {
        self.insert_checked(endpoint).await.0
    }

    /// [`insert`](Self::insert), also reporting whether the record was added.
    pub async fn insert_checked(&self, endpoint: Endpoint) -> (Endpoint, bool) {
        let mut endpoints = self.endpoints.write().await;
        if let Some(existing) = endpoints.iter().find(|e| e.path == endpoint.path) {
            return (existing.clone(), false);
        }
        endpoints.push(endpoint.clone());
        (endpoint, true)
    }

    /// Apply `f` to one record. `None` when the path is not live.
    pub async fn update<R>(&self, path: &str, f: impl FnOnce(&mut Endpoint) -> R) -> Option<R> {
        let mut endpoints = self.endpoints.write().await;
        endpoints.iter_mut().find(|e| e.path == path).map(f)
    }

    /// Apply `f` to every record, collecting the `Some` results in order.
    pub async fn update_all<R>(&self, mut f: impl FnMut(&mut Endpoint) -> Option<R>) -> Vec<R> {
        let mut endpoints = self.endpoints.write().await;
        endpoints.iter_mut().filter_map(|e| f(e)).collect()
    }

    /// Drop every record at zero health and return them.
    pub async fn remove_dead(&self) -> Vec<Endpoint> {
        let mut endpoints = self.endpoints.write().await;
        let (dead, alive): (Vec<_>, Vec<_>) = endpoints.drain(..).partition(|e| e.is_dead());
        *endpoints = alive;
        dead
    }

    /// Overwrite the snapshot file with the current collection.
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let _guard = self.save_lock.lock().await;
        let snapshot = self.endpoints.read().await.clone();
        let json = serde_json::to_string_pretty(&snapshot).context("Failed to serialize endpoints")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {:?}", path))?;

        debug!("Saved {} endpoints to {:?}", snapshot.len(), path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_snapshot_is_empty() {
        let temp_dir = tempdir().unwrap();
        let store = LifecycleStore::new(temp_dir.path().join("endpoints.json"));

        assert_eq!(store.load_all().await.unwrap(), 0);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("endpoints.json");

        let store = LifecycleStore::new(&path);
        store.insert(Endpoint::spawned("/a", "return input", "spawned")).await;
        store.insert(Endpoint::spawned("/b", "return input", "spawned")).await;
        store.save().await.unwrap();

        let reloaded = LifecycleStore::new(&path);
        assert_eq!(reloaded.load_all().await.unwrap(), 2);
        assert_eq!(reloaded.paths().await, vec!["/a".to_string(), "/b".to_string()]);
        assert_eq!(reloaded.get_by_path("/a").await, store.get_by_path("/a").await);
    }

    #[tokio::test]
    async fn test_load_clears_stale_evolution_flags() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("endpoints.json");

        let store = LifecycleStore::new(&path);
        let mut ep = Endpoint::spawned("/stuck", "return input", "spawned");
        ep.is_evolving = true;
        store.insert(ep).await;
        store.save().await.unwrap();

        let reloaded = LifecycleStore::new(&path);
        reloaded.load_all().await.unwrap();
        assert!(!reloaded.get_by_path("/stuck").await.unwrap().is_evolving);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("endpoints.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = LifecycleStore::new(&path);
        assert!(store.load_all().await.is_err());
    }

    #[tokio::test]
    async fn test_insert_keeps_live_record() {
        let store = LifecycleStore::in_memory();
        store.insert(Endpoint::spawned("/one", "first", "spawned")).await;
        let kept = store.insert(Endpoint::spawned("/one", "second", "spawned")).await;

        assert_eq!(kept.code, "first");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_dead() {
        let store = LifecycleStore::in_memory();
        let mut dead = Endpoint::spawned("/dead", "x", "spawned");
        dead.health = 0;
        store.insert(dead).await;
        store.insert(Endpoint::spawned("/alive", "x", "spawned")).await;

        let removed = store.remove_dead().await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].path, "/dead");
        assert_eq!(store.paths().await, vec!["/alive".to_string()]);
    }
}
