/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use iptag_cache::{InflightGuard, InflightSet, StoreError, TagCache};

use crate::config::Config;
use crate::monitor::Monitor;
use crate::provider::IpInfoProvider;

const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const QUEUE_SIZE: usize = 4096;

/// What the data plane answers for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum QueryOutcome {
    /// Live entry, no side effect.
    HitFresh(Arc<str>),
    /// Live entry inside its refresh window; a refetch may have been
    /// scheduled in the background.
    HitRefresh(Arc<str>),
    /// Cache miss, the key is now queued for a fetch.
    Accepted,
    /// Cache miss, another request already owns this key.
    Coalesced,
    /// Cache miss and the work queue is full.
    Overload,
    BadRequest(&'static str),
}

impl QueryOutcome {
    pub(crate) fn status(&self) -> u16 {
        match self {
            QueryOutcome::HitFresh(_) | QueryOutcome::HitRefresh(_) => 200,
            QueryOutcome::Accepted | QueryOutcome::Coalesced => 202,
            QueryOutcome::Overload => 429,
            QueryOutcome::BadRequest(_) => 400,
        }
    }

    pub(crate) fn body(&self) -> &str {
        match self {
            QueryOutcome::HitFresh(tag) | QueryOutcome::HitRefresh(tag) => tag,
            QueryOutcome::BadRequest(reason) => reason,
            _ => "",
        }
    }
}

/// Owns the cache, the inflight set and the bounded work queue, and runs
/// the fixed worker pool that resolves queued addresses through the
/// provider.
pub struct Manager {
    cache: TagCache,
    inflight: Arc<InflightSet>,
    provider: Arc<dyn IpInfoProvider>,
    monitor: Arc<Monitor>,
    queue_tx: Mutex<Option<flume::Sender<String>>>,
    queue_rx: flume::Receiver<String>,
    concurrency: usize,
}

impl Manager {
    pub fn new(
        provider: Arc<dyn IpInfoProvider>,
        monitor: Arc<Monitor>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        Self::with_queue_size(provider, monitor, config, QUEUE_SIZE)
    }

    fn with_queue_size(
        provider: Arc<dyn IpInfoProvider>,
        monitor: Arc<Monitor>,
        config: &Config,
        queue_size: usize,
    ) -> anyhow::Result<Self> {
        let cache = TagCache::new(config.cache_ttl, config.cache_refresh_ratio);

        if let Some(path) = &config.cache_store_path {
            match cache.load_from_sqlite(path) {
                Ok(n) => info!("loaded {n} cached entries from {}", path.display()),
                Err(e) => warn!(
                    "failed to load cache store {} (first start?): {e}",
                    path.display()
                ),
            }
            cache
                .start_persistence(path)
                .context(format!("failed to start cache store {}", path.display()))?;
        }

        let (queue_tx, queue_rx) = flume::bounded(queue_size);
        Ok(Manager {
            cache,
            inflight: Arc::new(InflightSet::new()),
            provider,
            monitor,
            queue_tx: Mutex::new(Some(queue_tx)),
            queue_rx,
            concurrency: config.worker_concurrency,
        })
    }

    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.concurrency)
            .map(|id| {
                let manager = self.clone();
                let queue_rx = self.queue_rx.clone();
                tokio::spawn(async move {
                    while let Ok(raw_ip) = queue_rx.recv_async().await {
                        manager.process(id, &raw_ip).await;
                    }
                    debug!("worker {id} exiting");
                })
            })
            .collect()
    }

    /// Drain and stop: close the queue so workers finish what is left,
    /// wait for them, then close the cache (which flushes the store).
    pub async fn stop(&self, workers: Vec<JoinHandle<()>>) {
        drop(self.queue_tx.lock().unwrap().take());
        for worker in workers {
            let _ = worker.await;
        }
        let cache = self.cache.clone();
        let _ = tokio::task::spawn_blocking(move || cache.close()).await;
    }

    pub fn cache_count(&self) -> i64 {
        self.cache.count()
    }

    pub fn dropped_updates(&self) -> u64 {
        self.cache.dropped_updates()
    }

    pub(crate) fn all_cached_items(&self) -> Result<Vec<(String, String)>, StoreError> {
        self.cache.all_items()
    }

    /// The per-request state machine of the data plane. `raw_ip` is the
    /// request path with the leading `/` stripped.
    pub(crate) fn handle_query(&self, raw_ip: &str) -> QueryOutcome {
        if raw_ip.is_empty() || raw_ip == "favicon.ico" {
            return QueryOutcome::BadRequest("");
        }
        if Ipv4Addr::from_str(raw_ip).is_err() {
            return if Ipv6Addr::from_str(raw_ip).is_ok() {
                QueryOutcome::BadRequest("only ipv4 supported")
            } else {
                QueryOutcome::BadRequest("invalid ip format")
            };
        }

        let key = cache_key(raw_ip);

        if let Some(hit) = self.cache.get(key) {
            debug!(
                "cache hit, ip={raw_ip} key={key} remaining={:?}",
                hit.remaining
            );
            if hit.needs_refresh {
                // never block the response on a refresh; a dropped one
                // just lets the entry expire naturally
                if self.inflight.try_add(key) {
                    debug!("pre-refresh scheduled, key={key}");
                    if !self.try_enqueue(raw_ip) {
                        self.inflight.delete(key);
                    }
                }
                return QueryOutcome::HitRefresh(hit.value);
            }
            return QueryOutcome::HitFresh(hit.value);
        }

        debug!("cache miss, ip={raw_ip} key={key}");

        if !self.inflight.try_add(key) {
            return QueryOutcome::Coalesced;
        }
        if self.try_enqueue(raw_ip) {
            QueryOutcome::Accepted
        } else {
            self.inflight.delete(key);
            QueryOutcome::Overload
        }
    }

    fn try_enqueue(&self, raw_ip: &str) -> bool {
        let queue_tx = self.queue_tx.lock().unwrap();
        match queue_tx.as_ref() {
            Some(tx) => tx.try_send(raw_ip.to_string()).is_ok(),
            None => false,
        }
    }

    async fn process(&self, id: usize, raw_ip: &str) {
        let key = cache_key(raw_ip).to_string();
        let _guard = InflightGuard::new(self.inflight.clone(), key.clone());

        // a racing request for the same /24 may have landed first
        if let Some(hit) = self.cache.get(&key) {
            if !hit.needs_refresh {
                return;
            }
        }

        let start = Instant::now();
        let info = match tokio::time::timeout(API_REQUEST_TIMEOUT, self.provider.fetch(raw_ip))
            .await
        {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                warn!("worker {id}: fetch {raw_ip} failed: {e:?}");
                return;
            }
            Err(_) => {
                self.monitor.record_failure(raw_ip, "fetch deadline exceeded");
                warn!("worker {id}: fetch {raw_ip} timed out");
                return;
            }
        };

        let tag = info.to_tag();
        self.cache.set(&key, &tag);
        debug!(
            "worker {id}: {raw_ip} (subnet={key}) -> {tag}, took {:?}",
            start.elapsed()
        );
    }

    #[cfg(test)]
    pub(crate) fn inflight(&self) -> &InflightSet {
        &self.inflight
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &TagCache {
        &self.cache
    }
}

/// The /24 cache key: an IPv4 literal truncated at its third dot.
fn cache_key(ip: &str) -> &str {
    match ip.rfind('.') {
        Some(i) => &ip[..i],
        None => ip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use iptag_geo::IpInfo;

    use crate::provider::FetchFuture;

    struct FakeProvider {
        info: IpInfo,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(province: &str, isp: &str, delay: Duration) -> Arc<Self> {
            Arc::new(FakeProvider {
                info: IpInfo::new(province.to_string(), isp.to_string()),
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl IpInfoProvider for FakeProvider {
        fn fetch<'a>(&'a self, _ip: &'a str) -> FetchFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::Relaxed);
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                Ok(self.info.clone())
            })
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn test_config() -> Config {
        Config {
            worker_concurrency: 2,
            cache_ttl: Duration::from_secs(3600),
            cache_refresh_ratio: 0.0,
            ..Default::default()
        }
    }

    fn new_manager(
        provider: Arc<dyn IpInfoProvider>,
        config: &Config,
        queue_size: usize,
    ) -> Arc<Manager> {
        let monitor = Arc::new(Monitor::new());
        Arc::new(Manager::with_queue_size(provider, monitor, config, queue_size).unwrap())
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cold_miss_resolves_through_worker() {
        let provider = FakeProvider::new("广东省", "中国电信", Duration::ZERO);
        let manager = new_manager(provider.clone(), &test_config(), QUEUE_SIZE);

        let outcome = manager.handle_query("203.0.113.17");
        assert_eq!(outcome, QueryOutcome::Accepted);
        assert!(manager.inflight().contains("203.0.113"));

        let workers = manager.spawn_workers();
        wait_until(|| manager.cache().get("203.0.113").is_some()).await;
        assert_eq!(
            &*manager.cache().get("203.0.113").unwrap().value,
            "guangdong_ct"
        );
        wait_until(|| manager.inflight().is_empty()).await;

        // warm path now serves straight from the cache
        match manager.handle_query("203.0.113.99") {
            QueryOutcome::HitFresh(tag) => assert_eq!(&*tag, "guangdong_ct"),
            other => panic!("unexpected outcome {other:?}"),
        }

        manager.stop(workers).await;
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_misses_coalesce_to_one_fetch() {
        let provider = FakeProvider::new("广东省", "中国电信", Duration::from_millis(300));
        let manager = new_manager(provider.clone(), &test_config(), QUEUE_SIZE);
        let workers = manager.spawn_workers();

        let mut accepted = 0;
        let mut coalesced = 0;
        for i in 1..=10 {
            match manager.handle_query(&format!("8.8.8.{i}")) {
                QueryOutcome::Accepted => accepted += 1,
                QueryOutcome::Coalesced => coalesced += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(coalesced, 9);

        wait_until(|| manager.cache().get("8.8.8").is_some()).await;
        manager.stop(workers).await;
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queue_saturation_returns_overload() {
        let provider = FakeProvider::new("广东省", "中国电信", Duration::from_secs(2));
        let mut config = test_config();
        config.worker_concurrency = 1;
        let manager = new_manager(provider.clone(), &config, 2);
        let workers = manager.spawn_workers();

        // first one enters the fetch
        assert_eq!(manager.handle_query("10.0.0.1"), QueryOutcome::Accepted);
        wait_until(|| provider.calls() == 1).await;
        // the next two sit in the queue
        assert_eq!(manager.handle_query("10.0.1.1"), QueryOutcome::Accepted);
        assert_eq!(manager.handle_query("10.0.2.1"), QueryOutcome::Accepted);
        // the fourth finds the queue full and its inflight entry is undone
        assert_eq!(manager.handle_query("10.0.3.1"), QueryOutcome::Overload);
        assert!(!manager.inflight().contains("10.0.3"));

        // a retry for the overloaded key is not treated as coalesced
        assert_eq!(manager.handle_query("10.0.3.1"), QueryOutcome::Overload);

        drop(manager.queue_tx.lock().unwrap().take());
        for w in workers {
            w.abort();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unrecognized_answer_caches_fallback() {
        let provider = FakeProvider::new("Mars", "AOL", Duration::ZERO);
        let manager = new_manager(provider.clone(), &test_config(), QUEUE_SIZE);
        let workers = manager.spawn_workers();

        assert_eq!(manager.handle_query("198.51.100.7"), QueryOutcome::Accepted);
        wait_until(|| manager.cache().get("198.51.100").is_some()).await;
        match manager.handle_query("198.51.100.8") {
            QueryOutcome::HitFresh(tag) => assert_eq!(&*tag, "fallback"),
            other => panic!("unexpected outcome {other:?}"),
        }

        manager.stop(workers).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn refresh_window_hit_schedules_refetch() {
        let provider = FakeProvider::new("北京市", "中国移动", Duration::ZERO);
        let mut config = test_config();
        config.cache_ttl = Duration::from_secs(100);
        config.cache_refresh_ratio = 0.10;
        let manager = new_manager(provider.clone(), &config, QUEUE_SIZE);

        // place an entry deep inside its refresh window
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as i64;
        manager
            .cache()
            .set_with_time("1.2.3", "beijing_cmcc", now + 5_000_000_000, now - 1);

        match manager.handle_query("1.2.3.4") {
            QueryOutcome::HitRefresh(tag) => assert_eq!(&*tag, "beijing_cmcc"),
            other => panic!("unexpected outcome {other:?}"),
        }
        // the stale value is still served while the refetch runs
        assert!(manager.inflight().contains("1.2.3"));

        let workers = manager.spawn_workers();
        wait_until(|| manager.inflight().is_empty()).await;
        assert_eq!(provider.calls(), 1);
        manager.stop(workers).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_input_is_rejected() {
        let provider = FakeProvider::new("广东省", "中国电信", Duration::ZERO);
        let manager = new_manager(provider, &test_config(), QUEUE_SIZE);

        assert_eq!(manager.handle_query(""), QueryOutcome::BadRequest(""));
        assert_eq!(
            manager.handle_query("favicon.ico"),
            QueryOutcome::BadRequest("")
        );
        assert_eq!(
            manager.handle_query("not-an-ip"),
            QueryOutcome::BadRequest("invalid ip format")
        );
        assert_eq!(
            manager.handle_query("1.2.3.4/extra"),
            QueryOutcome::BadRequest("invalid ip format")
        );
        assert_eq!(
            manager.handle_query("2001:db8::1"),
            QueryOutcome::BadRequest("only ipv4 supported")
        );
        assert!(manager.inflight().is_empty());
        manager.stop(Vec::new()).await;
    }

    #[test]
    fn cache_key_truncates_at_third_dot() {
        assert_eq!(cache_key("203.0.113.17"), "203.0.113");
        assert_eq!(cache_key("1.2.3.4"), "1.2.3");
    }

    // keep the trait object shape honest: a provider must be usable
    // through Arc<dyn IpInfoProvider>
    #[allow(dead_code)]
    fn assert_provider_object_safe(p: Arc<dyn IpInfoProvider>) -> Pin<Box<dyn Future<Output = ()>>> {
        Box::pin(async move {
            let _ = p.fetch("1.2.3.4").await;
        })
    }
}
