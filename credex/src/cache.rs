//! Small async caches shared by chain adapters.
//!
//! - [`TtlCache`] - A single value that expires after a fixed TTL
//!   (block heights, slot numbers, spot prices)
//! - [`KeyedLocks`] - One async mutex per key, used to serialize state
//!   transitions per payment token

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

#[derive(Debug, Clone)]
struct TtlCacheState<T> {
    value: T,
    expires_at: Instant,
}

/// An encapsulated TTL cache for a single value.
///
/// A zero TTL disables caching: [`TtlCache::get`] always misses.
#[derive(Debug)]
pub struct TtlCache<T> {
    ttl: Duration,
    state: RwLock<Option<TtlCacheState<T>>>,
}

impl<T: Clone> TtlCache<T> {
    /// Creates a new cache with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(None),
        }
    }

    /// Returns the configured TTL.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached value if still valid, `None` otherwise.
    pub async fn get(&self) -> Option<T> {
        let guard = self.state.read().await;
        let cache = guard.as_ref()?;
        if Instant::now() < cache.expires_at {
            Some(cache.value.clone())
        } else {
            None
        }
    }

    /// Stores a value with the configured TTL.
    pub async fn set(&self, value: T) {
        let mut guard = self.state.write().await;
        *guard = Some(TtlCacheState {
            value,
            expires_at: Instant::now() + self.ttl,
        });
    }

    /// Clears the cache.
    pub async fn clear(&self) {
        let mut guard = self.state.write().await;
        *guard = None;
    }
}

/// Per-key async mutexes.
///
/// Each key gets its own `Arc<Mutex<()>>`, created on first use and removed
/// when the last guard for it is dropped with nobody waiting. Different keys
/// never block each other.
#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Holds the lock for one key. Dropping it releases the lock and, if no
/// other task holds or waits on the key, removes its entry.
#[derive(Debug)]
pub struct KeyedGuard {
    key: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        // Map entry plus the one inside `guard`.
        self.locks
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 2);
        self.guard.take();
    }
}

impl KeyedLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `key`, waiting for any current holder.
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let slot = {
            let entry = self
                .locks
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            Arc::clone(entry.value())
        };
        let guard = slot.lock_owned().await;
        KeyedGuard {
            key: key.to_owned(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Returns `true` if no keys are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ttl_cache_expires() {
        let cache = TtlCache::new(Duration::from_millis(5));
        cache.set(42u64).await;
        assert_eq!(cache.get().await, Some(42));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get().await, None);
    }

    #[tokio::test]
    async fn test_ttl_cache_zero_ttl_disables_caching() {
        let cache = TtlCache::new(Duration::ZERO);
        cache.set(1u64).await;
        assert_eq!(cache.get().await, None);
    }

    #[tokio::test]
    async fn test_keyed_locks_serialize_same_key() {
        let locks = KeyedLocks::new();
        let guard = locks.lock("pay_a").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("pay_a").await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        // A different key is not blocked.
        let _b = locks.lock("pay_b").await;

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_keyed_locks_drop_idle_entries() {
        let locks = KeyedLocks::new();
        let guard = locks.lock("pay_a").await;
        assert_eq!(locks.len(), 1);

        let other = locks.clone();
        let waiter = tokio::spawn(async move { other.lock("pay_a").await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The waiter still references the slot, so it survives this drop.
        drop(guard);
        let second = waiter.await.unwrap();
        assert_eq!(locks.len(), 1);

        drop(second);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_keyed_locks_release_does_not_accumulate() {
        let locks = KeyedLocks::new();
        for i in 0..100 {
            let _g = locks.lock(&format!("pay_{i}")).await;
        }
        assert!(locks.is_empty());
    }
}
