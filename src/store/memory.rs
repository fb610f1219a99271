//! In-process lock store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{LockStore, MEMORY_BACKEND};
use crate::clock::Clock;
use crate::error::Result;

/// Expired entries are swept once every this many acquires.
const PURGE_EVERY: u64 = 256;

/// A single held lock.
#[derive(Debug, Clone)]
struct LockEntry {
    /// Serialized job arguments, kept for introspection
    value: String,
    /// When the lock stops counting as held
    expires_at: DateTime<Utc>,
}

impl LockEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// A lock store held in process memory.
///
/// Set-if-absent runs under the map's shard lock for the key, so concurrent
/// acquires of one key are serialized. Expired entries count as absent and
/// are replaced on the next acquire of the same key, and swept from the map
/// every [`PURGE_EVERY`] acquires. Only suitable when every enqueuer and
/// performer shares the process.
pub struct InMemoryLockStore {
    locks: DashMap<String, LockEntry>,
    clock: Arc<dyn Clock>,
    acquires: AtomicU64,
}

impl InMemoryLockStore {
    /// Create an empty store reading expiry from `clock`.
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            locks: DashMap::new(),
            clock: Arc::new(clock),
            acquires: AtomicU64::new(0),
        }
    }

    /// Whether `key` is currently held.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.locks
            .get(key)
            .map(|entry| entry.is_live(now))
            .unwrap_or(false)
    }

    /// The value stored under a live `key`.
    pub fn value(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        self.locks
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Number of live locks.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.locks.iter().filter(|entry| entry.is_live(now)).count()
    }

    /// Whether no lock is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored entries, live or expired.
    pub fn stored(&self) -> usize {
        self.locks.len()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.locks.len();
        self.locks.retain(|_, entry| entry.is_live(now));
        before - self.locks.len()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn acquire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        // Perform and reschedule locks are never released, only expire
        if (self.acquires.fetch_add(1, Ordering::Relaxed) + 1) % PURGE_EVERY == 0 {
            let purged = self.purge_expired();
            if purged > 0 {
                debug!(purged = purged, "Purged expired locks");
            }
        }

        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let fresh = LockEntry {
            value: value.to_string(),
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        let acquired = match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().is_live(now) {
                    false
                } else {
                    held.insert(fresh);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                true
            }
        };

        trace!(key = %key, acquired = acquired, "Acquire lock");
        Ok(acquired)
    }

    async fn release(&self, key: &str) -> Result<()> {
        let removed = self.locks.remove(key).is_some();
        trace!(key = %key, removed = removed, "Release lock");
        Ok(())
    }

    fn name(&self) -> &'static str {
        MEMORY_BACKEND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_acquire_is_set_if_absent() {
        let store = InMemoryLockStore::new(ManualClock::default());

        assert!(store.acquire("k", "[1]", Duration::from_secs(10)).await.unwrap());
        assert!(!store.acquire("k", "[2]", Duration::from_secs(10)).await.unwrap());

        // The first value is never overwritten
        assert_eq!(store.value("k").as_deref(), Some("[1]"));
    }

    #[tokio::test]
    async fn test_lock_expires_after_ttl() {
        let clock = ManualClock::default();
        let store = InMemoryLockStore::new(clock.clone());

        assert!(store.acquire("k", "", Duration::from_secs(10)).await.unwrap());

        clock.advance(Duration::from_secs(9));
        assert!(store.contains("k"));
        assert!(!store.acquire("k", "", Duration::from_secs(10)).await.unwrap());

        clock.advance(Duration::from_secs(1));
        assert!(!store.contains("k"));
        assert!(store.acquire("k", "", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_missing_key_is_noop() {
        let store = InMemoryLockStore::new(ManualClock::default());
        store.release("missing").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_release_frees_key() {
        let store = InMemoryLockStore::new(ManualClock::default());

        store.acquire("k", "", Duration::from_secs(60)).await.unwrap();
        store.release("k").await.unwrap();

        assert!(store.acquire("k", "", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let clock = ManualClock::default();
        let store = InMemoryLockStore::new(clock.clone());

        store.acquire("short", "", Duration::from_secs(1)).await.unwrap();
        store.acquire("long", "", Duration::from_secs(100)).await.unwrap();
        clock.advance(Duration::from_secs(5));

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.contains("long"));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let store = Arc::new(InMemoryLockStore::new(ManualClock::default()));

        let attempts = (0..32).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.acquire("k", "", Duration::from_secs(60)).await.unwrap() })
        });

        let results = futures::future::join_all(attempts).await;
        let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_acquire_sweeps_expired_entries() {
        let clock = ManualClock::default();
        let store = InMemoryLockStore::new(clock.clone());

        for i in 0..1000 {
            let key = format!("perform:{}", i);
            assert!(store.acquire(&key, "", Duration::from_secs(1)).await.unwrap());
        }
        assert_eq!(store.stored(), 1000);

        clock.advance(Duration::from_secs(3600));
        assert!(store.is_empty());

        for i in 0..PURGE_EVERY {
            let key = format!("fresh:{}", i);
            store.acquire(&key, "", Duration::from_secs(60)).await.unwrap();
        }

        // The sweep on acquire 1024 dropped every expired perform lock
        assert_eq!(store.stored(), PURGE_EVERY as usize);
        assert_eq!(store.len(), PURGE_EVERY as usize);
    }
}
