//! Per-key async mutex registry
//!
//! Serializes filesystem work that targets the same key (for example two
//! callers building the same cache directory) while letting work on
//! different keys proceed in parallel. Registry entries are reaped when the
//! last guard for a key drops and nobody is queued behind it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// Registry slot for one key: the mutex plus how many holders and waiters
/// currently reference it
struct Entry {
    mutex: Arc<AsyncMutex<()>>,
    users: usize,
}

type Registry = Mutex<HashMap<String, Entry>>;

/// Registry of async mutexes keyed by string
#[derive(Clone, Default)]
pub struct NamedLock {
    registry: Arc<Registry>,
}

impl NamedLock {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting for the current holder if any.
    ///
    /// Cancelling the returned future while it waits leaves no registry
    /// entry behind.
    pub async fn acquire(&self, key: &str) -> NamedLockGuard {
        let (mutex, interest) = {
            let mut registry = self.registry.lock();
            let entry = registry.entry(key.to_string()).or_insert_with(|| Entry {
                mutex: Arc::new(AsyncMutex::new(())),
                users: 0,
            });
            entry.users += 1;
            (
                Arc::clone(&entry.mutex),
                Interest {
                    key: key.to_string(),
                    registry: Arc::clone(&self.registry),
                },
            )
        };

        let guard = mutex.lock_owned().await;
        debug!("Acquired named lock: {}", key);

        NamedLockGuard {
            guard: Some(guard),
            interest,
        }
    }

    /// Number of keys currently tracked (held or waited on)
    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    /// Whether no key is currently held or waited on
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One holder's or waiter's claim on a registry entry; the entry is removed
/// when the last claim drops
struct Interest {
    key: String,
    registry: Arc<Registry>,
}

impl Drop for Interest {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        if let Some(entry) = registry.get_mut(&self.key) {
            entry.users -= 1;
            if entry.users == 0 {
                registry.remove(&self.key);
            }
        }
    }
}

/// Exclusive hold on one key; released on drop
pub struct NamedLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    interest: Interest,
}

impl NamedLockGuard {
    /// The key this guard holds
    pub fn key(&self) -> &str {
        &self.interest.key
    }
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        // Unlock before the interest field drops and reaps the entry
        drop(self.guard.take());
        debug!("Released named lock: {}", self.interest.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = NamedLock::new();
        let _a = locks.acquire("a").await;

        let b = tokio::time::timeout(Duration::from_millis(200), locks.acquire("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn same_key_waits_for_holder() {
        let locks = NamedLock::new();
        let guard = locks.acquire("key").await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.acquire("key")).await;
        assert!(blocked.is_err());

        drop(guard);
        let reacquired =
            tokio::time::timeout(Duration::from_millis(200), locks.acquire("key")).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_is_mutually_exclusive() {
        let locks = NamedLock::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                tokio::spawn(async move {
                    let _guard = locks.acquire("shared").await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registry_reaps_released_keys() {
        let locks = NamedLock::new();
        {
            let guard = locks.acquire("temp").await;
            assert_eq!(guard.key(), "temp");
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn registry_keeps_key_while_waiter_queued() {
        let locks = NamedLock::new();
        let guard = locks.acquire("busy").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire("busy").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(guard);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_no_entry() {
        let locks = NamedLock::new();
        let guard = locks.acquire("contended").await;

        let waited =
            tokio::time::timeout(Duration::from_millis(20), locks.acquire("contended")).await;
        assert!(waited.is_err());
        assert_eq!(locks.len(), 1);

        drop(guard);
        assert!(locks.is_empty());
    }
}
