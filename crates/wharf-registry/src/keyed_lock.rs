//! Per-key serialization.
//!
//! [`KeyedMutexPool`] hands out locks by key so that only one task works
//! on any one image name at a time while other names proceed freely.
//! Unlike single-flight, concurrent requesters for the same key are
//! serialized rather than coalesced: the second runs its own work after
//! the first finishes and sees whatever the first left in the cache.
//!
//! Entries are reference counted and removed once the last holder
//! releases, so the map does not grow with the set of names ever seen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Entry {
    count: usize,
    lock: Arc<AsyncMutex<()>>,
}

/// A pool of mutexes addressed by key.
#[derive(Default)]
pub struct KeyedMutexPool {
    entries: Mutex<HashMap<String, Entry>>,
}

/// Holds one key's lock; releases and deregisters on drop.
pub struct KeyedLock<'a> {
    // Declaration order matters: the mutex guard must drop (releasing
    // the key's lock) before the registration is released.
    _guard: OwnedMutexGuard<()>,
    _registration: Registration<'a>,
}

struct Registration<'a> {
    pool: &'a KeyedMutexPool,
    key: String,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.pool.release(&self.key);
    }
}

impl KeyedMutexPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `key`, waiting behind any current holder.
    /// A task cancelled while waiting deregisters cleanly.
    pub async fn acquire(&self, key: &str) -> KeyedLock<'_> {
        let lock = {
            let mut entries = self.lock_entries();
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                count: 0,
                lock: Arc::new(AsyncMutex::new(())),
            });
            entry.count += 1;
            Arc::clone(&entry.lock)
        };
        // Registered before the await: if the caller is dropped while
        // waiting, `Registration` still decrements the count.
        let registration = Registration {
            pool: self,
            key: key.to_string(),
        };
        let guard = lock.lock_owned().await;
        KeyedLock {
            _guard: guard,
            _registration: registration,
        }
    }

    fn release(&self, key: &str) {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.get_mut(key) {
            entry.count -= 1;
            if entry.count == 0 {
                entries.remove(key);
            }
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of keys currently registered (for tests and diagnostics).
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Whether no key is currently registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let pool = Arc::new(KeyedMutexPool::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let _lock = pool.acquire("alpine").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn different_keys_run_concurrently() {
        let pool = Arc::new(KeyedMutexPool::new());

        // Both tasks must be inside their critical sections at once for
        // the rendezvous to complete.
        let (tx_a, rx_a) = tokio::sync::oneshot::channel();
        let (tx_b, rx_b) = tokio::sync::oneshot::channel();

        let pool_a = Arc::clone(&pool);
        let a = tokio::spawn(async move {
            let _lock = pool_a.acquire("alpine").await;
            tx_a.send(()).unwrap();
            rx_b.await.unwrap();
        });
        let pool_b = Arc::clone(&pool);
        let b = tokio::spawn(async move {
            let _lock = pool_b.acquire("nginx").await;
            tx_b.send(()).unwrap();
            rx_a.await.unwrap();
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            a.await.unwrap();
            b.await.unwrap();
        })
        .await
        .expect("distinct keys must not block each other");

        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_deregisters() {
        let pool = Arc::new(KeyedMutexPool::new());

        let held = pool.acquire("alpine").await;
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let _lock = pool.acquire("alpine").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.len(), 1);

        waiter.abort();
        let _ = waiter.await;
        drop(held);

        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn entries_are_garbage_collected() {
        let pool = KeyedMutexPool::new();
        {
            let _lock = pool.acquire("alpine").await;
            assert_eq!(pool.len(), 1);
        }
        assert!(pool.is_empty());
    }
}
