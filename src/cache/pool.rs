//! Shared dependency cache pool
//!
//! Maps fingerprint keys to prepared dependency directories. At most one build
//! runs per key (serialized by [`NamedLock`]), any number of slots may bind a
//! ready entry at once, and reference counts keep an entry from being evicted
//! while an execution depends on it.

use crate::cache::entry::{remove_tree, seal_readonly, CacheManifest, CacheRef, CacheState};
use crate::cache::fingerprint::DependencyFingerprint;
use crate::error::{FlowboxError, FlowboxResult};
use crate::install::DependencyInstaller;
use crate::lock::NamedLock;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tracing::{debug, info, warn};

/// In-memory bookkeeping for one cache key
#[derive(Debug)]
struct Entry {
    path: PathBuf,
    state: CacheState,
    ref_count: usize,
    last_released: Instant,
}

/// Point-in-time view of a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntryStatus {
    /// Fingerprint key
    pub key: String,
    /// Entry directory
    pub path: PathBuf,
    /// Building or ready
    pub state: CacheState,
    /// Number of slots currently bound
    pub ref_count: usize,
}

/// Pool of prepared dependency directories keyed by fingerprint
pub struct CachePool {
    root: PathBuf,
    installer: Arc<DependencyInstaller>,
    locks: NamedLock,
    entries: Mutex<HashMap<String, Entry>>,
    max_entries: usize,
}

impl CachePool {
    /// Create a pool rooted at `root`. `max_entries == 0` disables eviction.
    pub fn new(root: PathBuf, installer: Arc<DependencyInstaller>, max_entries: usize) -> Self {
        Self {
            root,
            installer,
            locks: NamedLock::new(),
            entries: Mutex::new(HashMap::new()),
            max_entries,
        }
    }

    /// Cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory an entry for `key` lives in
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Return a ready entry for `fingerprint`, building it if needed.
    ///
    /// The returned reference must be handed back through [`CachePool::release`].
    pub async fn find_or_create(
        &self,
        fingerprint: &DependencyFingerprint,
    ) -> FlowboxResult<CacheRef> {
        let key = fingerprint.key();

        if let Some(cache) = self.acquire_ready(&key) {
            debug!("Cache hit: {}", key);
            return Ok(cache);
        }

        let _guard = self.locks.acquire(&key).await;

        // Another caller may have finished the build while we waited
        if let Some(cache) = self.acquire_ready(&key) {
            debug!("Cache hit after wait: {}", key);
            return Ok(cache);
        }

        let path = self.entry_path(&key);
        if let Some(cache) = self.adopt_from_disk(&key, &path).await? {
            return Ok(cache);
        }

        self.build(&key, &path, fingerprint).await
    }

    /// Drop one reference to `key`.
    ///
    /// Releasing an unknown key or a key with no references is a bookkeeping
    /// bug and is reported as an invariant violation.
    pub fn release(&self, key: &str) -> FlowboxResult<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| FlowboxError::invariant(format!("release of unknown cache entry {}", key)))?;

        if entry.ref_count == 0 {
            return Err(FlowboxError::invariant(format!(
                "cache entry {} released with ref count already 0",
                key
            )));
        }

        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            entry.last_released = Instant::now();
        }
        debug!("Released cache {} (refs: {})", key, entry.ref_count);
        Ok(())
    }

    /// Current reference count for `key`, if the pool knows it
    pub fn ref_count(&self, key: &str) -> Option<usize> {
        self.entries.lock().get(key).map(|e| e.ref_count)
    }

    /// Snapshot of every tracked entry
    pub fn snapshot(&self) -> Vec<CacheEntryStatus> {
        let entries = self.entries.lock();
        let mut out: Vec<_> = entries
            .iter()
            .map(|(key, e)| CacheEntryStatus {
                key: key.clone(),
                path: e.path.clone(),
                state: e.state,
                ref_count: e.ref_count,
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Evict least-recently-released idle entries above `max_entries`.
    ///
    /// Only entries with no references are candidates; each one is re-checked
    /// under its key lock before its directory is removed.
    pub async fn evict_idle(&self) -> FlowboxResult<Vec<String>> {
        if self.max_entries == 0 {
            return Ok(vec![]);
        }

        let candidates: Vec<String> = {
            let entries = self.entries.lock();
            if entries.len() <= self.max_entries {
                return Ok(vec![]);
            }
            let mut idle: Vec<(&String, &Entry)> = entries
                .iter()
                .filter(|(_, e)| e.ref_count == 0 && e.state == CacheState::Ready)
                .collect();
            idle.sort_by_key(|(_, e)| e.last_released);
            idle.into_iter()
                .take(entries.len() - self.max_entries)
                .map(|(k, _)| k.clone())
                .collect()
        };

        let mut evicted = Vec::new();
        for key in candidates {
            let _guard = self.locks.acquire(&key).await;

            let path = {
                let mut entries = self.entries.lock();
                match entries.get(&key) {
                    Some(e) if e.ref_count == 0 && e.state == CacheState::Ready => {
                        entries.remove(&key).map(|e| e.path)
                    }
                    _ => None,
                }
            };

            if let Some(path) = path {
                remove_tree(&path).await?;
                info!("Evicted idle cache {}", key);
                evicted.push(key);
            }
        }

        Ok(evicted)
    }

    /// Take a reference on a ready entry, if one is tracked
    fn acquire_ready(&self, key: &str) -> Option<CacheRef> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        if !entry.state.is_bindable() {
            return None;
        }
        entry.ref_count += 1;
        Some(CacheRef {
            key: key.to_string(),
            path: entry.path.clone(),
        })
    }

    /// Reuse a ready entry left by an earlier process, or clear a stale one.
    ///
    /// Caller holds the key lock.
    async fn adopt_from_disk(&self, key: &str, path: &Path) -> FlowboxResult<Option<CacheRef>> {
        // A building entry in the map while we hold the key lock was
        // abandoned by a cancelled builder.
        let abandoned = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(e) if e.state == CacheState::Building => {
                    entries.remove(key);
                    true
                }
                _ => false,
            }
        };
        if abandoned {
            warn!("Discarding abandoned cache build: {}", key);
        }

        if !path.exists() {
            return Ok(None);
        }

        match CacheManifest::load(path).await? {
            Some(manifest) if manifest.state == CacheState::Ready && manifest.key == key => {
                // A crash between the ready manifest and the seal leaves it writable
                seal_entry(path).await?;
                info!("Adopted existing cache {} from disk", key);
                let mut entries = self.entries.lock();
                entries.insert(
                    key.to_string(),
                    Entry {
                        path: path.to_path_buf(),
                        state: CacheState::Ready,
                        ref_count: 1,
                        last_released: Instant::now(),
                    },
                );
                Ok(Some(CacheRef {
                    key: key.to_string(),
                    path: path.to_path_buf(),
                }))
            }
            _ => {
                warn!("Removing incomplete cache directory {}", path.display());
                remove_tree(path).await?;
                Ok(None)
            }
        }
    }

    /// Build a fresh entry. Caller holds the key lock.
    async fn build(
        &self,
        key: &str,
        path: &Path,
        fingerprint: &DependencyFingerprint,
    ) -> FlowboxResult<CacheRef> {
        info!("Building cache {} ({} package(s))", key, fingerprint.packages.len());

        self.entries.lock().insert(
            key.to_string(),
            Entry {
                path: path.to_path_buf(),
                state: CacheState::Building,
                ref_count: 0,
                last_released: Instant::now(),
            },
        );

        match self.install_entry(key, path, fingerprint).await {
            Ok(()) => {
                let mut entries = self.entries.lock();
                let entry = entries.get_mut(key).ok_or_else(|| {
                    FlowboxError::invariant(format!("cache entry {} vanished during build", key))
                })?;
                entry.state = CacheState::Ready;
                entry.ref_count = 1;
                info!("Cache ready: {}", key);
                Ok(CacheRef {
                    key: key.to_string(),
                    path: path.to_path_buf(),
                })
            }
            Err(e) => {
                self.entries.lock().remove(key);
                if let Err(cleanup) = remove_tree(path).await {
                    warn!("Failed to clean up cache {}: {}", key, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn install_entry(
        &self,
        key: &str,
        path: &Path,
        fingerprint: &DependencyFingerprint,
    ) -> FlowboxResult<()> {
        let packages = fingerprint.sorted_packages();

        fs::create_dir_all(path)
            .await
            .map_err(|e| FlowboxError::io(format!("creating cache dir {}", path.display()), e))?;

        let mut manifest =
            CacheManifest::building(key, packages.clone(), fingerprint.code_steps.clone());
        manifest.save(path).await?;

        self.installer.install(path, &packages).await?;

        // The manifest lives inside the sealed tree, so it is written first
        manifest.state = CacheState::Ready;
        manifest.save(path).await?;
        seal_entry(path).await
    }
}

/// Seal an entry directory so slots cannot modify it
async fn seal_entry(path: &Path) -> FlowboxResult<()> {
    let seal_path = path.to_path_buf();
    tokio::task::spawn_blocking(move || seal_readonly(&seal_path))
        .await
        .map_err(|e| FlowboxError::Internal(format!("seal task failed: {}", e)))?
        .map_err(|e| FlowboxError::io(format!("sealing cache {}", path.display()), e))
}
