/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;
use rand::Rng;
use tokio::sync::watch;

use crate::store::{CacheStore, PersistOp, StoreError};

const SHARD_COUNT: usize = 256;
const SHARD_MASK: u64 = (SHARD_COUNT - 1) as u64;

// capacity guard per shard, not a hit-rate tuner
const DEFAULT_SHARD_CAPACITY: usize = 2000;

const CLOCK_INTERVAL: Duration = Duration::from_secs(1);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const CLEANUP_SHARD_YIELD: Duration = Duration::from_millis(5);

pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

struct CacheEntry {
    value: Arc<str>,
    exp: i64,
    refresh_at: i64,
}

#[derive(Default)]
struct Shard {
    items: RwLock<HashMap<String, CacheEntry, ahash::RandomState>>,
}

/// A live lookup result.
pub struct CacheHit {
    pub value: Arc<str>,
    /// The entry sits in its trailing refresh window and should be
    /// refetched in the background.
    pub needs_refresh: bool,
    /// Time left until the entry expires.
    pub remaining: Duration,
}

struct CacheInner {
    shards: Vec<Shard>,

    ttl: i64,
    refresh_window: i64,
    shard_cap: usize,

    /// Wall-clock nanoseconds, refreshed once per second by the clock
    /// task. All expiry comparisons read this instead of the OS clock.
    now: AtomicI64,
    count: AtomicI64,
    dropped_updates: AtomicU64,
    closed: AtomicBool,

    stop_tx: watch::Sender<bool>,
    store: OnceLock<Arc<CacheStore>>,
}

impl CacheInner {
    /// FNV-1a 64 over the key bytes; the low 8 bits select the shard.
    fn shard(&self, key: &str) -> &Shard {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for b in key.as_bytes() {
            h ^= u64::from(*b);
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
        &self.shards[(h & SHARD_MASK) as usize]
    }
}

/// Sharded in-memory key → tag cache with TTL, pre-refresh tagging and
/// optional write-behind persistence.
///
/// Cheap to clone; all clones share the same shards, counters and store.
/// Construction spawns the clock and expiry-sweep tasks, so it has to
/// happen inside a tokio runtime.
#[derive(Clone)]
pub struct TagCache {
    inner: Arc<CacheInner>,
}

impl TagCache {
    pub fn new(ttl: Duration, refresh_ratio: f64) -> Self {
        Self::with_shard_capacity(ttl, refresh_ratio, DEFAULT_SHARD_CAPACITY)
    }

    pub fn with_shard_capacity(ttl: Duration, refresh_ratio: f64, shard_cap: usize) -> Self {
        let refresh_ratio = if (0.0..1.0).contains(&refresh_ratio) {
            refresh_ratio
        } else {
            0.0
        };
        let ttl = ttl.as_nanos().min(i64::MAX as u128) as i64;
        let refresh_window = (ttl as f64 * refresh_ratio) as i64;

        let (stop_tx, _) = watch::channel(false);
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        shards.resize_with(SHARD_COUNT, Shard::default);

        let inner = Arc::new(CacheInner {
            shards,
            ttl,
            refresh_window,
            shard_cap,
            now: AtomicI64::new(now_nanos()),
            count: AtomicI64::new(0),
            dropped_updates: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            stop_tx,
            store: OnceLock::new(),
        });

        spawn_clock(inner.clone());
        spawn_cleanup(inner.clone());

        TagCache { inner }
    }

    pub fn get(&self, key: &str) -> Option<CacheHit> {
        let now = self.inner.now.load(Ordering::Relaxed);
        let shard = self.inner.shard(key);
        let items = shard.items.read().unwrap();
        let e = items.get(key)?;
        if now >= e.exp {
            return None;
        }
        let needs_refresh = self.inner.refresh_window > 0 && now >= e.refresh_at;
        Some(CacheHit {
            value: e.value.clone(),
            needs_refresh,
            remaining: Duration::from_nanos((e.exp - now) as u64),
        })
    }

    /// Insert or overwrite with a fresh TTL.
    pub fn set(&self, key: &str, value: &str) {
        let now = self.inner.now.load(Ordering::Relaxed);
        let exp = now.saturating_add(self.inner.ttl);
        let refresh_at = exp - self.inner.refresh_window;
        self.insert_entry(key, value, exp, refresh_at);
        self.send_to_store(PersistOp::upsert(key, value, exp, refresh_at));
    }

    /// Insert with caller-supplied times. Used to restore persisted rows,
    /// which must keep their original expiries.
    pub fn set_with_time(&self, key: &str, value: &str, exp: i64, refresh_at: i64) {
        self.insert_entry(key, value, exp, refresh_at);
        self.send_to_store(PersistOp::upsert(key, value, exp, refresh_at));
    }

    fn insert_entry(&self, key: &str, value: &str, exp: i64, refresh_at: i64) {
        let entry = CacheEntry {
            value: Arc::from(value),
            exp,
            refresh_at,
        };
        let shard = self.inner.shard(key);
        let mut items = shard.items.write().unwrap();
        if let Some(e) = items.get_mut(key) {
            *e = entry;
            return;
        }
        if items.len() >= self.inner.shard_cap {
            // over capacity: drop one arbitrary binding to make room
            let victim = {
                let n = rand::thread_rng().gen_range(0..items.len());
                items.keys().nth(n).cloned()
            };
            if let Some(victim) = victim {
                items.remove(&victim);
                self.inner.count.fetch_sub(1, Ordering::Relaxed);
            }
        }
        items.insert(key.to_string(), entry);
        self.inner.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delete(&self, key: &str) {
        let removed = {
            let shard = self.inner.shard(key);
            let mut items = shard.items.write().unwrap();
            items.remove(key).is_some()
        };
        if removed {
            self.inner.count.fetch_sub(1, Ordering::Relaxed);
            self.send_to_store(PersistOp::delete(key));
        }
    }

    /// Live entries across all shards.
    pub fn count(&self) -> i64 {
        self.inner.count.load(Ordering::Relaxed)
    }

    /// Persistence updates refused because the channel was full or the
    /// cache was closed.
    pub fn dropped_updates(&self) -> u64 {
        self.inner.dropped_updates.load(Ordering::Relaxed)
    }

    /// Restore rows that are still live. Must run before
    /// [`start_persistence`](Self::start_persistence) so the restore does
    /// not echo every row back into the store.
    pub fn load_from_sqlite(&self, path: &Path) -> Result<usize, StoreError> {
        let now = self.inner.now.load(Ordering::Relaxed);
        let items = crate::store::load_items(path, now)?;
        let n = items.len();
        for item in items {
            self.set_with_time(&item.key, &item.value, item.exp, item.refresh_at);
        }
        Ok(n)
    }

    /// Start the write-behind store. Further `set`/`delete` calls emit
    /// ops into its bounded channel.
    pub fn start_persistence(&self, path: &Path) -> Result<(), StoreError> {
        let store = Arc::new(CacheStore::spawn(path)?);
        self.inner
            .store
            .set(store)
            .map_err(|_| StoreError::AlreadyStarted)
    }

    /// Live rows from the store, for the statistics page. Errors if
    /// persistence is not enabled.
    pub fn all_items(&self) -> Result<Vec<(String, String)>, StoreError> {
        let store = self.inner.store.get().ok_or(StoreError::NotEnabled)?;
        store.all_items(self.inner.now.load(Ordering::Relaxed))
    }

    /// Idempotent shutdown: stops the background tasks, refuses further
    /// persistence sends, drains and flushes the store channel and joins
    /// the writer thread.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.stop_tx.send(true);
        if let Some(store) = self.inner.store.get() {
            store.close();
        }
    }

    fn send_to_store(&self, op: PersistOp) {
        let Some(store) = self.inner.store.get() else {
            return;
        };
        if self.inner.closed.load(Ordering::Acquire) || !store.send(op) {
            self.inner.dropped_updates.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn spawn_clock(inner: Arc<CacheInner>) {
    let mut stop_rx = inner.stop_tx.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLOCK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    inner.now.store(now_nanos(), Ordering::Relaxed);
                }
                _ = stop_rx.changed() => return,
            }
        }
    });
}

fn spawn_cleanup(inner: Arc<CacheInner>) {
    let mut stop_rx = inner.stop_tx.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        interval.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                _ = interval.tick() => sweep_expired(&inner).await,
                _ = stop_rx.changed() => return,
            }
        }
    });
}

/// Walk the shards one by one so no sweep ever holds more than 1/256 of
/// the cache, with a short sleep in between to yield the runtime.
async fn sweep_expired(inner: &CacheInner) {
    let now = inner.now.load(Ordering::Relaxed);
    let mut removed_total = 0usize;
    for shard in &inner.shards {
        let removed = {
            let mut items = shard.items.write().unwrap();
            let before = items.len();
            items.retain(|_, e| now < e.exp);
            before - items.len()
        };
        if removed > 0 {
            inner.count.fetch_sub(removed as i64, Ordering::Relaxed);
            removed_total += removed;
        }
        tokio::time::sleep(CLEANUP_SHARD_YIELD).await;
    }
    if removed_total > 0 {
        debug!("expiry sweep removed {removed_total} entries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn same_shard_keys(cache: &TagCache, want: usize) -> Vec<String> {
        let target: *const Shard = cache.inner.shard("seed");
        let mut keys = vec!["seed".to_string()];
        let mut i = 0u32;
        while keys.len() < want {
            let key = format!("k{i}");
            if std::ptr::eq(cache.inner.shard(&key), target) {
                keys.push(key);
            }
            i += 1;
        }
        keys
    }

    #[tokio::test]
    async fn set_then_get() {
        let cache = TagCache::new(HOUR, 0.0);
        cache.set("1.2.3", "beijing_cmcc");

        let hit = cache.get("1.2.3").unwrap();
        assert_eq!(&*hit.value, "beijing_cmcc");
        assert!(!hit.needs_refresh);
        assert!(hit.remaining <= HOUR);

        assert!(cache.get("1.2.4").is_none());
        cache.close();
    }

    #[tokio::test]
    async fn overwrite_keeps_count() {
        let cache = TagCache::new(HOUR, 0.0);
        cache.set("1.2.3", "old");
        cache.set("1.2.3", "new");
        assert_eq!(cache.count(), 1);
        assert_eq!(&*cache.get("1.2.3").unwrap().value, "new");
        cache.close();
    }

    #[tokio::test]
    async fn delete_decrements_count() {
        let cache = TagCache::new(HOUR, 0.0);
        cache.set("1.2.3", "v");
        cache.set("4.5.6", "v");
        assert_eq!(cache.count(), 2);

        cache.delete("1.2.3");
        assert!(cache.get("1.2.3").is_none());
        assert_eq!(cache.count(), 1);

        // deleting a missing key changes nothing
        cache.delete("1.2.3");
        assert_eq!(cache.count(), 1);
        cache.close();
    }

    #[tokio::test]
    async fn expired_entry_misses_before_sweep() {
        let cache = TagCache::new(HOUR, 0.0);
        let now = cache.inner.now.load(Ordering::Relaxed);
        cache.set_with_time("1.2.3", "v", now - 1, now - 1);
        assert!(cache.get("1.2.3").is_none());
        cache.close();
    }

    #[tokio::test]
    async fn refresh_window_tagging() {
        let cache = TagCache::new(Duration::from_secs(100), 0.1);
        cache.set("1.2.3", "v");
        assert!(!cache.get("1.2.3").unwrap().needs_refresh);

        // inside the trailing window
        let now = cache.inner.now.load(Ordering::Relaxed);
        cache.set_with_time("4.5.6", "v", now + 5_000_000_000, now - 1);
        assert!(cache.get("4.5.6").unwrap().needs_refresh);
        cache.close();
    }

    #[tokio::test]
    async fn zero_ratio_never_refreshes() {
        let cache = TagCache::new(Duration::from_secs(100), 0.0);
        let now = cache.inner.now.load(Ordering::Relaxed);
        cache.set_with_time("1.2.3", "v", now + 5_000_000_000, now - 1);
        assert!(!cache.get("1.2.3").unwrap().needs_refresh);
        cache.close();
    }

    #[tokio::test]
    async fn out_of_range_ratio_is_coerced_to_zero() {
        for ratio in [1.0, 1.5, -0.3, f64::NAN] {
            let cache = TagCache::new(Duration::from_secs(100), ratio);
            assert_eq!(cache.inner.refresh_window, 0);
            cache.close();
        }
    }

    #[tokio::test]
    async fn full_shard_evicts_exactly_one() {
        let cache = TagCache::with_shard_capacity(HOUR, 0.0, 2);
        let keys = same_shard_keys(&cache, 3);

        cache.set(&keys[0], "v0");
        cache.set(&keys[1], "v1");
        assert_eq!(cache.count(), 2);

        cache.set(&keys[2], "v2");
        assert_eq!(cache.count(), 2);
        assert!(cache.get(&keys[2]).is_some());
        let survivors = keys[..2].iter().filter(|k| cache.get(k).is_some()).count();
        assert_eq!(survivors, 1);
        cache.close();
    }

    #[tokio::test]
    async fn overwrite_at_capacity_evicts_nothing() {
        let cache = TagCache::with_shard_capacity(HOUR, 0.0, 2);
        let keys = same_shard_keys(&cache, 2);

        cache.set(&keys[0], "v0");
        cache.set(&keys[1], "v1");
        cache.set(&keys[0], "v0-again");

        assert_eq!(cache.count(), 2);
        assert!(cache.get(&keys[0]).is_some());
        assert!(cache.get(&keys[1]).is_some());
        cache.close();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let cache = TagCache::new(HOUR, 0.0);
        cache.set("1.2.3", "v");
        cache.close();
        cache.close();
        // memory reads still work after close
        assert!(cache.get("1.2.3").is_some());
    }

    #[tokio::test]
    async fn all_items_without_store_errors() {
        let cache = TagCache::new(HOUR, 0.0);
        assert!(matches!(cache.all_items(), Err(StoreError::NotEnabled)));
        cache.close();
    }
}
