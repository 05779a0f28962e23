//! In-memory [`SharedStore`] backed by [`DashMap`].
//!
//! `DashMap::entry` holds the shard write lock for the key while the closure
//! runs, which makes `hit_window` linearizable per key within one process.
//! Expiry is lazy (checked on access) plus a periodic sweep started with
//! [`MemoryStore::spawn_sweeper`]. Rate-limit keys carry their window start, so
//! a finished window's key is never read again and only the sweep reclaims it.
//! Uses `tokio::time::Instant` so tests can pause and advance time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::{SharedStore, StoreError, WindowHit};

#[derive(Debug, Clone)]
enum Slot {
    Counter(u64),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Single-process shared store.
///
/// `set_available(false)` makes every call fail with
/// [`StoreError::Unavailable`], which is how outage policies are tested.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    available: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates the store going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored keys, including not-yet-purged expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes expired keys. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live(now));
        before - self.entries.len()
    }

    /// Runs [`purge_expired`](Self::purge_expired) every `every` until
    /// `shutdown` flips to `true` or the store is dropped.
    ///
    /// # Panics
    ///
    /// Panics if `every` is zero.
    pub fn spawn_sweeper(
        store: &Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::downgrade(store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = store.len(), "expired shared-store keys swept");
                }
            }
        })
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store disabled".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn hit_window(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> Result<WindowHit, StoreError> {
        self.check_available()?;
        let now = Instant::now();

        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occ) if occ.get().is_live(now) => {
                let entry = occ.get_mut();
                let remaining_ttl = entry.expires_at - now;
                let Slot::Counter(count) = &mut entry.slot else {
                    return Err(StoreError::Protocol(format!("{key} is not a counter")));
                };
                if *count >= limit {
                    return Ok(WindowHit {
                        accepted: false,
                        count: *count,
                        ttl: remaining_ttl,
                    });
                }
                *count += 1;
                Ok(WindowHit {
                    accepted: true,
                    count: *count,
                    ttl: remaining_ttl,
                })
            }
            MapEntry::Occupied(mut occ) => {
                // Expired: the window restarts with this hit.
                let accepted = limit > 0;
                occ.insert(Entry {
                    slot: Slot::Counter(u64::from(accepted)),
                    expires_at: now + ttl,
                });
                Ok(WindowHit {
                    accepted,
                    count: u64::from(accepted),
                    ttl,
                })
            }
            MapEntry::Vacant(vac) => {
                let accepted = limit > 0;
                vac.insert(Entry {
                    slot: Slot::Counter(u64::from(accepted)),
                    expires_at: now + ttl,
                });
                Ok(WindowHit {
                    accepted,
                    count: u64::from(accepted),
                    ttl,
                })
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if !entry.is_live(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| !e.is_live(now));
            return Ok(None);
        }
        match &entry.slot {
            Slot::Bytes(b) => Ok(Some(b.clone())),
            Slot::Counter(c) => Ok(Some(c.to_string().into_bytes())),
        }
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        self.check_available()?;
        self.entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Bytes(value),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.entries.remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.starts_with(prefix));
        Ok((before - self.entries.len()) as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn hit_window_accepts_up_to_limit() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        for expected in 1..=3 {
            let hit = store.hit_window("k", 3, ttl).await.unwrap();
            assert!(hit.accepted);
            assert_eq!(hit.count, expected);
        }
        let hit = store.hit_window("k", 3, ttl).await.unwrap();
        assert!(!hit.accepted);
        assert_eq!(hit.count, 3, "rejected hits never increment");
    }

    #[tokio::test]
    async fn zero_limit_rejects_first_hit() {
        let store = MemoryStore::new();
        let hit = store.hit_window("k", 0, Duration::from_secs(1)).await.unwrap();
        assert!(!hit.accepted);
        assert_eq!(hit.count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_ttl() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);
        assert!(store.hit_window("k", 1, ttl).await.unwrap().accepted);
        assert!(!store.hit_window("k", 1, ttl).await.unwrap().accepted);

        tokio::time::advance(Duration::from_secs(11)).await;
        let hit = store.hit_window("k", 1, ttl).await.unwrap();
        assert!(hit.accepted);
        assert_eq!(hit.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn get_respects_ttl() {
        let store = MemoryStore::new();
        store
            .set_ex("c", b"v".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(store.get("c").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("c").await.unwrap(), None);
        assert!(store.is_empty(), "expired key is removed on read");
    }

    #[tokio::test]
    async fn delete_prefix_only_touches_prefix() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.set_ex("cache:a:ns:1", vec![1], ttl).await.unwrap();
        store.set_ex("cache:a:ns:2", vec![2], ttl).await.unwrap();
        store.set_ex("cache:b:ns:1", vec![3], ttl).await.unwrap();

        assert_eq!(store.delete_prefix("cache:a:ns:").await.unwrap(), 2);
        assert!(store.get("cache:b:ns:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.hit_window("k", 1, Duration::from_secs(1)).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.get("k").await.is_err());
        assert!(store.ping().await.is_err());

        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_hits_never_exceed_limit() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..200 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .hit_window("shared", 17, Duration::from_secs(60))
                    .await
                    .unwrap()
                    .accepted
            }));
        }
        let mut accepted = 0;
        for h in handles {
            if h.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 17);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_sweeps() {
        let store = MemoryStore::new();
        store.set_ex("a", vec![], Duration::from_secs(1)).await.unwrap();
        store.set_ex("b", vec![], Duration::from_secs(100)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_bounds_keys_across_rate_windows() {
        let store = Arc::new(MemoryStore::new());
        let (stop, rx) = watch::channel(false);
        let sweeper = MemoryStore::spawn_sweeper(&store, Duration::from_secs(30), rx);
        let window = Duration::from_secs(60);

        for start in 0..20u64 {
            let key = format!("rl:org-1:api:60:{}", start * 60_000);
            assert!(store.hit_window(&key, 10, window).await.unwrap().accepted);
            assert!(store.len() <= 2, "window {start}: {} keys retained", store.len());
            tokio::time::sleep(window).await;
        }

        stop.send_replace(true);
        sweeper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_when_store_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let (_stop, rx) = watch::channel(false);
        let sweeper = MemoryStore::spawn_sweeper(&store, Duration::from_secs(1), rx);
        drop(store);
        tokio::time::timeout(Duration::from_secs(5), sweeper)
            .await
            .expect("sweeper exits once the store is gone")
            .unwrap();
    }
}
