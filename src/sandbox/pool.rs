//! Fixed-size pool of reusable isolation slots

use crate::cache::CacheRef;
use crate::error::{FlowboxError, FlowboxResult};
use crate::sandbox::backend::IsolationBackend;
use crate::sandbox::{INPUT_FILE, OUTPUT_FILE};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// A slot handed to exactly one caller between allocate and release
#[derive(Debug)]
pub struct IsolationSlot {
    id: usize,
    workdir: PathBuf,
    cache: Option<CacheRef>,
}

impl IsolationSlot {
    pub(crate) fn new(id: usize, workdir: PathBuf) -> Self {
        Self {
            id,
            workdir,
            cache: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_cache(&mut self, cache: CacheRef) {
        self.cache = Some(cache);
    }

    /// Slot id, `0..size`
    pub fn id(&self) -> usize {
        self.id
    }

    /// Host-side working directory of the slot
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Cache entry bound to this slot, if any
    pub fn cache(&self) -> Option<&CacheRef> {
        self.cache.as_ref()
    }

    /// Where the operation file is written
    pub fn input_path(&self) -> PathBuf {
        self.workdir.join(INPUT_FILE)
    }

    /// Where the engine writes its result
    pub fn output_path(&self) -> PathBuf {
        self.workdir.join(OUTPUT_FILE)
    }
}

/// Point-in-time view of one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStatus {
    pub id: usize,
    pub in_use: bool,
    pub cache_key: Option<String>,
}

#[derive(Debug, Default)]
struct SlotState {
    in_use: bool,
    cache_key: Option<String>,
}

/// Fixed set of slots behind one mutex.
///
/// `allocate` fails fast when every slot is taken; `allocate_within` waits for
/// a release up to a bound.
pub struct IsolationPool {
    slots: Mutex<Vec<SlotState>>,
    backend: Arc<dyn IsolationBackend>,
    released: Notify,
}

/// Marks a slot in use until disarmed; frees it again if allocation fails or
/// the allocating future is dropped mid-recreate.
struct SlotClaim<'a> {
    pool: &'a IsolationPool,
    id: usize,
    armed: bool,
}

impl Drop for SlotClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.free(self.id);
        }
    }
}

impl IsolationPool {
    /// Create a pool of `size` slots over `backend`
    pub fn new(size: usize, backend: Arc<dyn IsolationBackend>) -> FlowboxResult<Self> {
        if size == 0 {
            return Err(FlowboxError::User(
                "Isolation pool size must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            slots: Mutex::new((0..size).map(|_| SlotState::default()).collect()),
            backend,
            released: Notify::new(),
        })
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of slots currently allocated
    pub fn in_use(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.in_use).count()
    }

    /// Backend driving the slots
    pub fn backend(&self) -> &Arc<dyn IsolationBackend> {
        &self.backend
    }

    /// Claim the first free slot and reset it.
    ///
    /// Fails immediately with `PoolExhausted` when no slot is free. If the
    /// reset fails the slot is returned to the pool before the error is.
    pub async fn allocate(&self) -> FlowboxResult<IsolationSlot> {
        let id = {
            let mut slots = self.slots.lock();
            let size = slots.len();
            let id = slots
                .iter()
                .position(|s| !s.in_use)
                .ok_or(FlowboxError::PoolExhausted { size })?;
            slots[id].in_use = true;
            id
        };

        let mut claim = SlotClaim {
            pool: self,
            id,
            armed: true,
        };

        match self.backend.recreate(id).await {
            Ok(workdir) => {
                claim.armed = false;
                debug!("Allocated slot {} ({})", id, workdir.display());
                Ok(IsolationSlot::new(id, workdir))
            }
            Err(e) => {
                drop(claim);
                Err(FlowboxError::SlotRecreate {
                    slot: id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Like [`IsolationPool::allocate`], but wait up to `wait` for a release
    /// when the pool is exhausted.
    pub async fn allocate_within(&self, wait: Duration) -> FlowboxResult<IsolationSlot> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            // Register before checking so a release in between is not missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.allocate().await {
                Err(FlowboxError::PoolExhausted { size }) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(FlowboxError::PoolExhausted { size });
                    }
                }
                other => return other,
            }
        }
    }

    /// Return a slot to the pool and clear its cache binding.
    ///
    /// Releasing an unknown or already free slot is a bookkeeping bug.
    pub fn release(&self, id: usize) -> FlowboxResult<()> {
        {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(id) else {
                error!("Release of unknown slot {}", id);
                return Err(FlowboxError::UnknownSlot(id));
            };
            if !slot.in_use {
                return Err(FlowboxError::invariant(format!(
                    "slot {} released while already free",
                    id
                )));
            }
            slot.in_use = false;
            slot.cache_key = None;
        }

        self.released.notify_waiters();
        debug!("Released slot {}", id);
        Ok(())
    }

    /// Bind a ready cache entry into an allocated slot
    pub async fn bind(&self, slot: &mut IsolationSlot, cache: CacheRef) -> FlowboxResult<()> {
        if let Some(ref bound) = slot.cache {
            return Err(FlowboxError::invariant(format!(
                "slot {} already bound to cache {}",
                slot.id, bound.key
            )));
        }

        self.backend.bind_cache(slot, &cache.path).await?;

        {
            let mut slots = self.slots.lock();
            let state = slots
                .get_mut(slot.id)
                .ok_or(FlowboxError::UnknownSlot(slot.id))?;
            if !state.in_use {
                return Err(FlowboxError::invariant(format!(
                    "bind on slot {} that is not allocated",
                    slot.id
                )));
            }
            state.cache_key = Some(cache.key.clone());
        }

        info!("Bound cache {} to slot {}", cache.key, slot.id);
        slot.cache = Some(cache);
        Ok(())
    }

    /// Snapshot of every slot
    pub fn snapshot(&self) -> Vec<SlotStatus> {
        self.slots
            .lock()
            .iter()
            .enumerate()
            .map(|(id, s)| SlotStatus {
                id,
                in_use: s.in_use,
                cache_key: s.cache_key.clone(),
            })
            .collect()
    }

    fn free(&self, id: usize) {
        if let Some(slot) = self.slots.lock().get_mut(id) {
            slot.in_use = false;
            slot.cache_key = None;
        }
        self.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeBackend;
    use std::time::Instant;
    use tempfile::TempDir;

    fn pool(size: usize) -> (TempDir, Arc<FakeBackend>, Arc<IsolationPool>) {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FakeBackend::new(dir.path().to_path_buf()));
        let pool = Arc::new(IsolationPool::new(size, backend.clone()).unwrap());
        (dir, backend, pool)
    }

    fn cache(key: &str) -> CacheRef {
        CacheRef {
            key: key.to_string(),
            path: PathBuf::from("/cache").join(key),
        }
    }

    #[test]
    fn zero_size_rejected() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FakeBackend::new(dir.path().to_path_buf()));
        assert!(IsolationPool::new(0, backend).is_err());
    }

    #[tokio::test]
    async fn allocates_first_free_slot() {
        let (_dir, backend, pool) = pool(2);

        let a = pool.allocate().await.unwrap();
        let b = pool.allocate().await.unwrap();
        assert_eq!((a.id(), b.id()), (0, 1));
        assert_eq!(backend.recreate_count(), 2);

        pool.release(a.id()).unwrap();
        let c = pool.allocate().await.unwrap();
        assert_eq!(c.id(), 0);
    }

    #[tokio::test]
    async fn exhausted_pool_fails_fast() {
        let (_dir, _backend, pool) = pool(1);
        let _held = pool.allocate().await.unwrap();

        let started = Instant::now();
        let err = pool.allocate().await.unwrap_err();
        assert!(matches!(err, FlowboxError::PoolExhausted { size: 1 }));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn failed_recreate_frees_slot() {
        let (_dir, backend, pool) = pool(1);
        backend.set_fail_recreate(true);

        let err = pool.allocate().await.unwrap_err();
        assert!(matches!(err, FlowboxError::SlotRecreate { slot: 0, .. }));
        assert_eq!(pool.in_use(), 0);

        backend.set_fail_recreate(false);
        assert_eq!(pool.allocate().await.unwrap().id(), 0);
    }

    #[tokio::test]
    async fn release_errors_are_reported() {
        let (_dir, _backend, pool) = pool(1);

        assert!(matches!(pool.release(7), Err(FlowboxError::UnknownSlot(7))));
        assert!(pool.release(0).unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn bind_records_cache_and_release_clears_it() {
        let (_dir, _backend, pool) = pool(1);
        let mut slot = pool.allocate().await.unwrap();

        pool.bind(&mut slot, cache("k1")).await.unwrap();
        assert_eq!(slot.cache().unwrap().key, "k1");
        assert_eq!(pool.snapshot()[0].cache_key.as_deref(), Some("k1"));

        let err = pool.bind(&mut slot, cache("k2")).await.unwrap_err();
        assert!(err.is_fatal());

        pool.release(slot.id()).unwrap();
        assert_eq!(
            pool.snapshot()[0],
            SlotStatus {
                id: 0,
                in_use: false,
                cache_key: None
            }
        );
    }

    #[tokio::test]
    async fn allocate_within_waits_for_release() {
        let (_dir, _backend, pool) = pool(1);
        let held = pool.allocate().await.unwrap();

        let releaser = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                pool.release(held.id()).unwrap();
            })
        };

        let slot = pool.allocate_within(Duration::from_secs(2)).await.unwrap();
        assert_eq!(slot.id(), 0);
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn allocate_within_gives_up_at_deadline() {
        let (_dir, _backend, pool) = pool(1);
        let _held = pool.allocate().await.unwrap();

        let err = pool
            .allocate_within(Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowboxError::PoolExhausted { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocations_never_share_a_slot() {
        let (_dir, _backend, pool) = pool(3);

        let tasks: Vec<_> = (0..12)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.allocate().await.map(|s| s.id()) })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            if let Ok(id) = task.await.unwrap() {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(pool.in_use(), 3);
    }
}
