//! Pipeline orchestrator: four staged worker pools connected by bounded
//! queues, a retry scheduler, and a single result aggregator. Spec §4.1.
//!
//! On the happy path (no cancellation) a stage's queue still closes via
//! Rust's reference-counted `mpsc` channels once every producer clone is
//! dropped. But the extraction stage's own retry path re-enters its own
//! input queue (`extraction_tx` is cloned into every extraction worker, to
//! requeue a retried task), so that channel's sender count never reaches
//! zero on its own — shutdown is therefore driven explicitly: `Engine::stop`
//! cancels the root `CancelToken` first, every worker loop selects on that
//! token and exits promptly, and `Pipeline::shutdown` awaits each spawned
//! worker's `JoinHandle` before returning (spec §4.1 "Stage closure
//! rules"/"Cancellation... exits all workers promptly").

pub mod retry;

use crate::config::Config;
use crate::error::{EngineError, StageError};
use crate::fetcher::{CancelToken, FetchOutcome, Fetcher};
use crate::limiter::{Feedback, RateLimiter};
use crate::resource::{CacheLookup, ResourceManager};
use crate::types::{
    CrawlResult, ExtractionTask, Page, STAGE_CACHE, STAGE_DISCOVERY, STAGE_EXTRACTION,
    STAGE_OUTPUT, STAGE_PROCESSING,
};
use async_trait::async_trait;
use retry::RetryScheduler;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, instrument, warn};

/// `hook(ctx, page) -> (page, error)` from spec §6. Installed by the
/// engine façade when the asset policy is enabled; any error leaves the
/// page unchanged.
#[async_trait]
pub trait AssetHook: Send + Sync {
    async fn process(&self, page: Page) -> anyhow::Result<Page>;
}

struct ProcessingItem {
    page: Page,
}

#[derive(Debug, Default)]
struct StageCounter {
    processed: AtomicU64,
    failed: AtomicU64,
    total_nanos: AtomicU64,
}

impl StageCounter {
    fn record(&self, ok: bool, elapsed: Duration) {
        if ok {
            self.processed.fetch_add(1, Relaxed);
        } else {
            self.failed.fetch_add(1, Relaxed);
        }
        self.total_nanos
            .fetch_add(elapsed.as_nanos() as u64, Relaxed);
    }

    fn snapshot(&self) -> StageMetricsSnapshot {
        let processed = self.processed.load(Relaxed);
        let failed = self.failed.load(Relaxed);
        let total = processed + failed;
        let avg_time = if total > 0 {
            Duration::from_nanos(self.total_nanos.load(Relaxed) / total)
        } else {
            Duration::ZERO
        };
        StageMetricsSnapshot {
            processed,
            failed,
            avg_time,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageMetricsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub avg_time: Duration,
}

#[derive(Debug, Default)]
struct PipelineMetrics {
    discovery: StageCounter,
    extraction: StageCounter,
    cache: StageCounter,
    processing: StageCounter,
    output: StageCounter,
}

#[derive(Debug, Clone)]
pub struct PipelineSnapshot {
    pub total_processed: u64,
    pub total_failed: u64,
    pub stage_metrics: HashMap<&'static str, StageMetricsSnapshot>,
}

pub struct Pipeline {
    cfg: Config,
    limiter: Option<Arc<RateLimiter>>,
    resources: Arc<ResourceManager>,
    fetcher: Arc<dyn Fetcher>,
    asset_hook: Option<Arc<dyn AssetHook>>,
    metrics: PipelineMetrics,
    retry_scheduler: Arc<RetryScheduler>,
    /// Handles for every spawned stage worker and the aggregator, awaited
    /// by `shutdown` so no worker is still mid-flight (e.g. touching the
    /// checkpoint writer) once the resource manager is closed.
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(
        cfg: Config,
        limiter: Option<Arc<RateLimiter>>,
        resources: Arc<ResourceManager>,
        fetcher: Arc<dyn Fetcher>,
        asset_hook: Option<Arc<dyn AssetHook>>,
    ) -> Self {
        Self {
            cfg,
            limiter,
            resources,
            fetcher,
            asset_hook,
            metrics: PipelineMetrics::default(),
            retry_scheduler: Arc::new(RetryScheduler::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        let mut stage_metrics = HashMap::new();
        stage_metrics.insert(STAGE_DISCOVERY, self.metrics.discovery.snapshot());
        stage_metrics.insert(STAGE_EXTRACTION, self.metrics.extraction.snapshot());
        stage_metrics.insert(STAGE_CACHE, self.metrics.cache.snapshot());
        stage_metrics.insert(STAGE_PROCESSING, self.metrics.processing.snapshot());
        stage_metrics.insert(STAGE_OUTPUT, self.metrics.output.snapshot());

        let (mut total_processed, mut total_failed) = (0u64, 0u64);
        for (stage, m) in stage_metrics.iter() {
            if *stage == STAGE_CACHE {
                continue;
            }
            total_processed += m.processed;
            total_failed += m.failed;
        }
        PipelineSnapshot {
            total_processed,
            total_failed,
            stage_metrics,
        }
    }

    /// Run the pipeline against `seeds`, returning the caller-visible
    /// results channel. `cancel` is the root cancellation token; every
    /// suspension point inside the pipeline observes it.
    pub async fn run(
        self: Arc<Self>,
        seeds: Vec<String>,
        cancel: CancelToken,
    ) -> mpsc::Receiver<CrawlResult> {
        let total = seeds.len();
        let buf = self.cfg.workers.queue_buffer.max(1);

        let (url_tx, url_rx) = mpsc::channel::<String>(buf);
        let (extraction_tx, extraction_rx) = mpsc::channel::<ExtractionTask>(buf);
        let (processing_tx, processing_rx) = mpsc::channel::<ProcessingItem>(buf);
        let (output_tx, output_rx) = mpsc::channel::<CrawlResult>(buf);
        let (results_internal_tx, results_internal_rx) = mpsc::channel::<CrawlResult>(buf);
        let (results_tx, results_rx) = mpsc::channel::<CrawlResult>(buf);

        let url_rx = Arc::new(Mutex::new(url_rx));
        let extraction_rx = Arc::new(Mutex::new(extraction_rx));
        let processing_rx = Arc::new(Mutex::new(processing_rx));
        let output_rx = Arc::new(Mutex::new(output_rx));

        let mut handles = Vec::new();

        // Seed feeder: runs in the background so `run` never blocks the
        // caller even if every discovery worker count is zero.
        {
            let url_tx = url_tx.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                for seed in seeds {
                    tokio::select! {
                        res = url_tx.send(seed) => if res.is_err() { break; },
                        _ = cancel.cancelled() => break,
                    }
                }
            }));
        }
        drop(url_tx);

        for _ in 0..self.cfg.workers.discovery_workers {
            handles.push(self.spawn_discovery(
                Arc::clone(&url_rx),
                extraction_tx.clone(),
                output_tx.clone(),
                cancel.clone(),
            ));
        }

        for _ in 0..self.cfg.workers.extraction_workers {
            handles.push(self.spawn_extraction(
                Arc::clone(&extraction_rx),
                extraction_tx.clone(),
                processing_tx.clone(),
                output_tx.clone(),
                cancel.clone(),
            ));
        }
        drop(extraction_tx);

        for _ in 0..self.cfg.workers.processing_workers {
            handles.push(self.spawn_processing(
                Arc::clone(&processing_rx),
                output_tx.clone(),
                cancel.clone(),
            ));
        }
        drop(processing_tx);

        for _ in 0..self.cfg.workers.output_workers {
            handles.push(self.spawn_output(
                Arc::clone(&output_rx),
                results_internal_tx.clone(),
                cancel.clone(),
            ));
        }
        drop(output_tx);
        drop(results_internal_tx);

        handles.push(self.spawn_aggregator(results_internal_rx, results_tx, total, cancel.clone()));

        self.workers.lock().await.extend(handles);

        results_rx
    }

    fn spawn_discovery(
        self: &Arc<Self>,
        url_rx: Arc<Mutex<mpsc::Receiver<String>>>,
        extraction_tx: mpsc::Sender<ExtractionTask>,
        output_tx: mpsc::Sender<CrawlResult>,
        cancel: CancelToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    v = async { url_rx.lock().await.recv().await } => v,
                    _ = cancel.cancelled() => None,
                };
                let Some(url) = next else { break };
                let started = Instant::now();
                match validate_url(&url) {
                    Ok(()) => {
                        this.metrics.discovery.record(true, started.elapsed());
                        if extraction_tx.send(ExtractionTask::first(url)).await.is_err() {
                            break;
                        }
                    }
                    Err(reason) => {
                        this.metrics.discovery.record(false, started.elapsed());
                        let err = StageError::new(
                            url.clone(),
                            STAGE_DISCOVERY,
                            EngineError::InvalidUrl(reason),
                        );
                        let result = CrawlResult::failure(url, err, false);
                        if output_tx.send(result).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_extraction(
        self: &Arc<Self>,
        extraction_rx: Arc<Mutex<mpsc::Receiver<ExtractionTask>>>,
        extraction_tx: mpsc::Sender<ExtractionTask>,
        processing_tx: mpsc::Sender<ProcessingItem>,
        output_tx: mpsc::Sender<CrawlResult>,
        cancel: CancelToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    v = async { extraction_rx.lock().await.recv().await } => v,
                    _ = cancel.cancelled() => None,
                };
                let Some(task) = next else { break };
                if this
                    .handle_extraction(task, &extraction_tx, &processing_tx, &output_tx, &cancel)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    }

    #[instrument(skip(self, extraction_tx, processing_tx, output_tx, cancel), fields(url = %task.url, attempt = task.attempt))]
    async fn handle_extraction(
        self: &Arc<Self>,
        task: ExtractionTask,
        extraction_tx: &mpsc::Sender<ExtractionTask>,
        processing_tx: &mpsc::Sender<ProcessingItem>,
        output_tx: &mpsc::Sender<CrawlResult>,
        cancel: &CancelToken,
    ) -> Result<(), ()> {
        let started = Instant::now();

        // Singleflight: a cache hit here means some other in-flight fetch
        // for this URL already completed (or never started). A `Claimed`
        // result means we now own the one fetch in flight for this URL and
        // must release it before returning, on every exit path below.
        match self.resources.claim_or_wait(&task.url).await {
            CacheLookup::Hit(page) => {
                self.metrics.cache.record(true, started.elapsed());
                let item = ProcessingItem { page };
                return processing_tx.send(item).await.map_err(|_| ());
            }
            CacheLookup::Claimed => {}
        }

        let permit = match &self.limiter {
            Some(limiter) => match limiter.acquire(&task.url, cancel).await {
                Ok(p) => Some(p),
                Err(e) => {
                    self.resources.release_claim(&task.url).await;
                    return self
                        .retry_or_terminate(task, e, extraction_tx, output_tx, cancel)
                        .await;
                }
            },
            None => None,
        };
        let host = permit.map(|p| p.host);

        let in_flight = match self.resources.acquire(cancel).await {
            Ok(p) => p,
            Err(e) => {
                self.resources.release_claim(&task.url).await;
                return self.retry_or_terminate(task, e, extraction_tx, output_tx, cancel).await;
            }
        };

        let fetch_started = Instant::now();
        let outcome = self.fetcher.fetch(&task.url, cancel.clone()).await;
        drop(in_flight);

        match outcome {
            Ok((mut page, FetchOutcome { status, latency, .. })) => {
                if let Some(host) = &host {
                    if let Some(limiter) = &self.limiter {
                        limiter
                            .feedback(
                                host,
                                Feedback {
                                    status,
                                    latency,
                                    is_error: false,
                                    retry_after: None,
                                },
                            )
                            .await;
                    }
                }
                page.url = task.url.clone();
                self.resources.store_page(&task.url, page.clone()).await;
                self.resources.release_claim(&task.url).await;
                self.metrics.extraction.record(true, started.elapsed());
                let item = ProcessingItem { page };
                processing_tx.send(item).await.map_err(|_| ())
            }
            Err(fetch_err) => {
                debug!(url = %task.url, error = %fetch_err, "fetch failed");
                if let Some(host) = &host {
                    if let Some(limiter) = &self.limiter {
                        limiter
                            .feedback(
                                host,
                                Feedback {
                                    status: fetch_err.status,
                                    latency: fetch_err.latency.max(fetch_started.elapsed()),
                                    is_error: true,
                                    retry_after: fetch_err.retry_after,
                                },
                            )
                            .await;
                    }
                }
                self.resources.release_claim(&task.url).await;
                let engine_err = EngineError::from(fetch_err);
                self.retry_or_terminate(task, engine_err, extraction_tx, output_tx, cancel)
                    .await
            }
        }
    }

    async fn retry_or_terminate(
        self: &Arc<Self>,
        task: ExtractionTask,
        err: EngineError,
        extraction_tx: &mpsc::Sender<ExtractionTask>,
        output_tx: &mpsc::Sender<CrawlResult>,
        cancel: &CancelToken,
    ) -> Result<(), ()> {
        let retryable = err.is_retryable() && task.attempt + 1 < self.cfg.retry.max_attempts;
        if retryable {
            let delay = retry::backoff_delay(&self.cfg.retry, task.attempt + 1);
            let next_task = task.retry();
            let extraction_tx = extraction_tx.clone();
            let cancel_for_timer = cancel.clone();
            self.retry_scheduler
                .schedule(delay, cancel_for_timer, async move {
                    let _ = extraction_tx.send(next_task).await;
                })
                .await;
            Ok(())
        } else {
            self.metrics.extraction.record(false, Duration::ZERO);
            let stage_err = StageError::new(task.url.clone(), STAGE_EXTRACTION, err);
            let result = CrawlResult::failure(task.url, stage_err, false);
            output_tx.send(result).await.map_err(|_| ())
        }
    }

    fn spawn_processing(
        self: &Arc<Self>,
        processing_rx: Arc<Mutex<mpsc::Receiver<ProcessingItem>>>,
        output_tx: mpsc::Sender<CrawlResult>,
        cancel: CancelToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    v = async { processing_rx.lock().await.recv().await } => v,
                    _ = cancel.cancelled() => None,
                };
                let Some(item) = next else { break };
                let started = Instant::now();
                let mut page = item.page;
                page.processed_at = Some(chrono::Utc::now());

                if let Some(hook) = &this.asset_hook {
                    let timeout = this.cfg.workers.asset_hook_timeout;
                    match tokio::time::timeout(timeout, hook.process(page.clone())).await {
                        Ok(Ok(mutated)) => page = mutated,
                        Ok(Err(e)) => warn!(error = %e, "asset hook failed; page unchanged"),
                        Err(_) => warn!("asset hook timed out; page unchanged"),
                    }
                }

                this.metrics.processing.record(true, started.elapsed());
                let url = page.url.clone();
                let result = CrawlResult::success(url, page, STAGE_PROCESSING);
                if output_tx.send(result).await.is_err() {
                    break;
                }
            }
        })
    }

    fn spawn_output(
        self: &Arc<Self>,
        output_rx: Arc<Mutex<mpsc::Receiver<CrawlResult>>>,
        results_internal_tx: mpsc::Sender<CrawlResult>,
        cancel: CancelToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    v = async { output_rx.lock().await.recv().await } => v,
                    _ = cancel.cancelled() => None,
                };
                let Some(mut result) = next else { break };
                let started = Instant::now();
                result.stage = STAGE_OUTPUT;
                this.resources
                    .checkpoint_handle()
                    .enqueue(result.url.clone());
                this.metrics.output.record(true, started.elapsed());
                if results_internal_tx.send(result).await.is_err() {
                    break;
                }
            }
        })
    }

    /// Forwards internal results to the caller until either `total` have
    /// been delivered, the internal channel closes, or the root context is
    /// cancelled. Once cancelled it stops forwarding and only drains the
    /// internal channel (counting, not delivering) so the caller-visible
    /// channel never receives a result produced after cancellation (spec
    /// §4.1 "drains internal result buffers without delivering to the
    /// caller").
    fn spawn_aggregator(
        self: &Arc<Self>,
        mut results_internal_rx: mpsc::Receiver<CrawlResult>,
        results_tx: mpsc::Sender<CrawlResult>,
        total: usize,
        cancel: CancelToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut delivered = 0usize;
            while delivered < total {
                tokio::select! {
                    next = results_internal_rx.recv() => {
                        match next {
                            Some(result) => {
                                delivered += 1;
                                if results_tx.send(result).await.is_err() {
                                    break;
                                }
                            }
                            None => return,
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            if cancel.is_cancelled() {
                while results_internal_rx.recv().await.is_some() {}
            }
            // Dropping results_tx closes the caller-visible channel exactly once.
        })
    }

    /// Cancel must already have fired (see `Engine::stop`) before this is
    /// called: it awaits every spawned worker's `JoinHandle`, so by the
    /// time it returns no worker can still be touching a resource the
    /// caller is about to tear down (e.g. the checkpoint writer).
    pub async fn shutdown(&self) {
        self.retry_scheduler.drain().await;
        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

fn validate_url(url: &str) -> Result<(), String> {
    if url.trim().is_empty() {
        return Err("empty url".to_string());
    }
    match url::Url::parse(url) {
        Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => Ok(()),
        Ok(parsed) => Err(format!("unsupported scheme: {}", parsed.scheme())),
        Err(e) => Err(format!("unparseable url: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fetcher::test_double::{ScriptedFetcher, Script};
    use crate::types::Page;

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.limiter.enabled = false;
        cfg.workers.queue_buffer = 16;
        cfg
    }

    #[tokio::test]
    async fn basic_crawl_delivers_one_result() {
        let cfg = test_config();
        let resources = Arc::new(ResourceManager::new(&cfg.resources));
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.script(
            "https://example.com/a",
            Script::Success(Page::new("https://example.com/a", "hello")),
        );
        let pipeline = Arc::new(Pipeline::new(cfg, None, resources, fetcher, None));
        let (_handle, cancel) = crate::fetcher::tokio_util_cancel::channel();
        let mut results = pipeline
            .run(vec!["https://example.com/a".to_string()], cancel)
            .await;
        let result = results.recv().await.unwrap();
        assert!(result.success);
        assert_eq!(result.stage, STAGE_OUTPUT);
        assert!(results.recv().await.is_none());

        let snap = pipeline.snapshot();
        assert_eq!(snap.total_processed, 4);
    }

    #[tokio::test]
    async fn invalid_url_is_terminal_with_no_retry() {
        let cfg = test_config();
        let resources = Arc::new(ResourceManager::new(&cfg.resources));
        let fetcher = Arc::new(ScriptedFetcher::new());
        let pipeline = Arc::new(Pipeline::new(cfg, None, resources, fetcher, None));
        let (_handle, cancel) = crate::fetcher::tokio_util_cancel::channel();
        let mut results = pipeline.run(vec!["not a url".to_string()], cancel).await;
        let result = results.recv().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.unwrap().stage, STAGE_DISCOVERY);
    }

    #[tokio::test]
    async fn retry_then_succeed() {
        let mut cfg = test_config();
        cfg.retry.base_delay = Duration::from_millis(1);
        cfg.retry.max_delay = Duration::from_millis(5);
        let resources = Arc::new(ResourceManager::new(&cfg.resources));
        let fetcher = Arc::new(ScriptedFetcher::new().with_latency(Duration::from_millis(1)));
        fetcher.script(
            "https://example.com/flaky",
            Script::FailThenSucceed {
                fail_times: 2,
                status: 503,
            },
        );
        let pipeline = Arc::new(Pipeline::new(cfg, None, resources, fetcher, None));
        let (_handle, cancel) = crate::fetcher::tokio_util_cancel::channel();
        let mut results = pipeline
            .run(vec!["https://example.com/flaky".to_string()], cancel)
            .await;
        let result = tokio::time::timeout(Duration::from_secs(2), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(result.success);
    }
}
