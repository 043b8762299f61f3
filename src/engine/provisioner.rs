//! Pairs a ready cache entry with a free isolation slot

use crate::cache::{CachePool, CacheRef, DependencyFingerprint};
use crate::error::FlowboxResult;
use crate::sandbox::{IsolationPool, IsolationSlot};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// A provisioned slot: one allocated slot bound to one cache reference.
///
/// Hand it back through [`Lease::release`]. A lease dropped without release
/// (for example when the owning future is cancelled) releases itself.
pub struct Lease {
    slot: IsolationSlot,
    cache: CacheRef,
    slots: Arc<IsolationPool>,
    caches: Arc<CachePool>,
    released: bool,
}

impl Lease {
    /// The bound slot
    pub fn slot(&self) -> &IsolationSlot {
        &self.slot
    }

    /// The cache entry the slot is bound to
    pub fn cache(&self) -> &CacheRef {
        &self.cache
    }

    /// Release the slot, then the cache reference.
    ///
    /// Both steps always run; the first error is returned.
    pub fn release(mut self) -> FlowboxResult<()> {
        self.released = true;
        self.release_both()
    }

    fn release_both(&self) -> FlowboxResult<()> {
        let slot_result = self.slots.release(self.slot.id());
        let cache_result = self.caches.release(&self.cache.key);
        debug!(
            "Released lease: slot {} / cache {}",
            self.slot.id(),
            self.cache.key
        );
        slot_result.and(cache_result)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            "Lease for slot {} dropped without release, releasing",
            self.slot.id()
        );
        if let Err(e) = self.release_both() {
            error!("Failed to release dropped lease: {}", e);
        }
    }
}

/// Orchestrates the cache pool and the isolation pool
pub struct Provisioner {
    caches: Arc<CachePool>,
    slots: Arc<IsolationPool>,
    acquire_timeout: Option<Duration>,
}

impl Provisioner {
    /// Create a provisioner. `acquire_timeout` of `None` keeps slot
    /// allocation fail-fast.
    pub fn new(
        caches: Arc<CachePool>,
        slots: Arc<IsolationPool>,
        acquire_timeout: Option<Duration>,
    ) -> Self {
        Self {
            caches,
            slots,
            acquire_timeout,
        }
    }

    /// Secure a ready cache entry for `fingerprint` and a slot bound to it.
    ///
    /// On any failure after the cache reference is taken, everything acquired
    /// so far is released before the error is returned.
    pub async fn provision(&self, fingerprint: &DependencyFingerprint) -> FlowboxResult<Lease> {
        let cache = self.caches.find_or_create(fingerprint).await?;

        let slot = match self.allocate().await {
            Ok(slot) => slot,
            Err(e) => {
                if let Err(release_err) = self.caches.release(&cache.key) {
                    error!("Cache release after failed allocate: {}", release_err);
                }
                return Err(e);
            }
        };

        // From here on the lease owns both halves
        let mut lease = Lease {
            slot,
            cache: cache.clone(),
            slots: Arc::clone(&self.slots),
            caches: Arc::clone(&self.caches),
            released: false,
        };

        if let Err(e) = self.slots.bind(&mut lease.slot, cache).await {
            if let Err(release_err) = lease.release() {
                error!("Lease release after failed bind: {}", release_err);
            }
            return Err(e);
        }

        debug!(
            "Provisioned slot {} with cache {}",
            lease.slot.id(),
            lease.cache.key
        );
        Ok(lease)
    }

    /// Release a lease; see [`Lease::release`]
    pub fn release(&self, lease: Lease) -> FlowboxResult<()> {
        lease.release()
    }

    async fn allocate(&self) -> FlowboxResult<IsolationSlot> {
        match self.acquire_timeout {
            Some(wait) => self.slots.allocate_within(wait).await,
            None => self.slots.allocate().await,
        }
    }

    pub fn caches(&self) -> &Arc<CachePool> {
        &self.caches
    }

    pub fn slots(&self) -> &Arc<IsolationPool> {
        &self.slots
    }
}
