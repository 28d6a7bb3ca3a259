//! Resource manager: bounded in-flight admission, the page cache with
//! spill, and the checkpoint journal. Spec §4.3.

pub mod cache;
pub mod checkpoint;
pub mod spill;

use crate::config::ResourceConfig;
use crate::error::{EngineError, Result};
use crate::fetcher::CancelToken;
use crate::types::Page;
use cache::Lru;
use checkpoint::{CheckpointHandle, CheckpointWriter};
use spill::SpillStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, Semaphore};

/// Snapshot of resource manager counters, spec §4.3 "Stats".
#[derive(Debug, Clone)]
pub struct ResourceStats {
    pub cache_entries: usize,
    pub spill_files: usize,
    pub in_flight: usize,
    pub checkpoint_queued: usize,
}

struct CacheState {
    lru: Lru,
    spill: SpillStore,
    /// Per-URL singleflight claims: a URL present here has a fetch already
    /// in flight, so a second concurrent lookup waits on the `Notify`
    /// instead of racing its own fetch (spec §4.3 "at most one concurrent
    /// fetch per URL in-flight").
    in_flight: HashMap<String, Arc<Notify>>,
}

impl CacheState {
    /// Cache/spill lookup shared by `get_page` and `claim_or_wait`, kept
    /// as one place so both callers rehydrate from spill identically.
    fn lookup(&mut self, url: &str) -> Option<Page> {
        if let Some(page) = self.lru.get(url) {
            return Some(page);
        }
        let rehydrated = self.spill.take(url)?;
        self.lru.insert(url.to_string(), rehydrated.clone());
        Some(rehydrated)
    }
}

/// Result of [`ResourceManager::claim_or_wait`].
pub enum CacheLookup {
    /// The page was already cached (or rehydrated from spill); no fetch
    /// is needed.
    Hit(Page),
    /// No other fetch for this URL is in flight; the caller has claimed it
    /// and must call [`ResourceManager::release_claim`] once it either
    /// stores the fetched page or gives up.
    Claimed,
}

pub struct ResourceManager {
    cache: Mutex<CacheState>,
    in_flight: Option<Arc<Semaphore>>,
    max_in_flight: usize,
    checkpoint: CheckpointWriter,
}

impl ResourceManager {
    pub fn new(cfg: &ResourceConfig) -> Self {
        let in_flight = if cfg.max_in_flight == 0 {
            None
        } else {
            Some(Arc::new(Semaphore::new(cfg.max_in_flight)))
        };
        Self {
            cache: Mutex::new(CacheState {
                lru: Lru::new(cfg.cache_capacity.max(1)),
                spill: SpillStore::new(cfg.spill_dir.clone()),
                in_flight: HashMap::new(),
            }),
            in_flight,
            max_in_flight: cfg.max_in_flight,
            checkpoint: CheckpointWriter::spawn(
                cfg.checkpoint_path.clone(),
                cfg.checkpoint_interval,
            ),
        }
    }

    /// Acquire an in-flight slot. `max_in_flight == 0` disables admission
    /// control entirely (spec §4.3, §8 boundary behavior).
    pub async fn acquire(&self, cancel: &CancelToken) -> Result<Option<tokio::sync::OwnedSemaphorePermit>> {
        let Some(sem) = &self.in_flight else {
            return Ok(None);
        };
        tokio::select! {
            permit = Arc::clone(sem).acquire_owned() => {
                Ok(Some(permit.expect("semaphore never closed")))
            }
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
        }
    }

    /// Deep-copies `page` into the cache; if the cache is over capacity the
    /// evicted entry is spilled (or dropped if no spill dir is configured).
    pub async fn store_page(&self, url: &str, page: Page) {
        let mut state = self.cache.lock().await;
        if let Some((evicted_key, evicted_page)) = state.lru.insert(url.to_string(), page) {
            state.spill.store(&evicted_key, &evicted_page);
        }
    }

    /// Deep-copy retrieval; rehydrates from spill (and removes the spill
    /// entry) on a cache miss that hits the spill index.
    pub async fn get_page(&self, url: &str) -> Option<Page> {
        self.cache.lock().await.lookup(url)
    }

    /// Singleflight entry point for extraction: returns a cache hit if one
    /// exists, otherwise registers this caller as the sole in-flight
    /// claimant for `url` and returns `Claimed`. Concurrent callers for the
    /// same URL block here until the claim is released, then retry the
    /// lookup themselves (spec §4.3 "duplicate submissions are coalesced
    /// via cache hit").
    pub async fn claim_or_wait(&self, url: &str) -> CacheLookup {
        loop {
            let mut state = self.cache.lock().await;
            if let Some(page) = state.lookup(url) {
                return CacheLookup::Hit(page);
            }
            if let Some(notify) = state.in_flight.get(url).cloned() {
                // Register as a waiter before dropping the lock so a
                // `release_claim` racing with us can't fire its
                // `notify_waiters` in between and be missed.
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                drop(state);
                notified.await;
                continue;
            }
            state.in_flight.insert(url.to_string(), Arc::new(Notify::new()));
            return CacheLookup::Claimed;
        }
    }

    /// Release a claim taken via `claim_or_wait`, waking anyone waiting on
    /// it. Must be called exactly once per `Claimed` result, whether the
    /// fetch succeeded, failed terminally, or is being retried (a retried
    /// task re-claims the URL itself the next time it runs).
    pub async fn release_claim(&self, url: &str) {
        if let Some(notify) = self.cache.lock().await.in_flight.remove(url) {
            notify.notify_waiters();
        }
    }

    pub fn checkpoint_handle(&self) -> CheckpointHandle {
        self.checkpoint.handle()
    }

    pub async fn stats(&self) -> ResourceStats {
        let state = self.cache.lock().await;
        let in_flight = match &self.in_flight {
            Some(sem) => self.max_in_flight - sem.available_permits(),
            None => 0,
        };
        ResourceStats {
            cache_entries: state.lru.len(),
            spill_files: state.spill.len(),
            in_flight,
            checkpoint_queued: self.checkpoint_handle().queued_len(),
        }
    }

    /// Flush and stop the checkpoint writer. Safe to call more than once,
    /// and callable through a shared `Arc` since the pipeline retains its
    /// own clone of this manager.
    pub async fn close(&self) {
        self.checkpoint.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::tokio_util_cancel;

    #[tokio::test]
    async fn spill_then_rehydrate_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ResourceConfig {
            cache_capacity: 1,
            spill_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let rm = ResourceManager::new(&cfg);
        rm.store_page("u1", Page::new("u1", "one")).await;
        rm.store_page("u2", Page::new("u2", "two")).await;
        let stats = rm.stats().await;
        assert_eq!(stats.spill_files, 1);
        let fetched = rm.get_page("u1").await.unwrap();
        assert_eq!(fetched.content, "one");
        rm.close().await;
    }

    #[tokio::test]
    async fn second_claim_waits_then_sees_cache_hit() {
        let cfg = ResourceConfig::default();
        let rm = Arc::new(ResourceManager::new(&cfg));

        let first = rm.claim_or_wait("u1").await;
        assert!(matches!(first, CacheLookup::Claimed));

        let waiter = {
            let rm = Arc::clone(&rm);
            tokio::spawn(async move { rm.claim_or_wait("u1").await })
        };
        // Give the waiter a chance to register behind the still-open claim.
        tokio::task::yield_now().await;

        rm.store_page("u1", Page::new("u1", "resolved")).await;
        rm.release_claim("u1").await;

        match waiter.await.unwrap() {
            CacheLookup::Hit(page) => assert_eq!(page.content, "resolved"),
            CacheLookup::Claimed => panic!("waiter should have observed the stored page"),
        }
        rm.close().await;
    }

    #[tokio::test]
    async fn zero_in_flight_disables_admission() {
        let cfg = ResourceConfig {
            max_in_flight: 0,
            ..Default::default()
        };
        let rm = ResourceManager::new(&cfg);
        let (_h, cancel) = tokio_util_cancel::channel();
        // Every acquire should succeed immediately, unbounded.
        for _ in 0..1000 {
            assert!(rm.acquire(&cancel).await.unwrap().is_none());
        }
        rm.close().await;
    }

    #[tokio::test]
    async fn get_after_store_is_deep_copy() {
        let cfg = ResourceConfig::default();
        let rm = ResourceManager::new(&cfg);
        rm.store_page("u1", Page::new("u1", "original")).await;
        let mut page = rm.get_page("u1").await.unwrap();
        page.content = "mutated".into();
        let again = rm.get_page("u1").await.unwrap();
        assert_eq!(again.content, "original");
        rm.close().await;
    }
}
