//! Engine façade: construct and compose the four subsystems, expose a
//! stable `Start/Stop/Snapshot` surface, filter seeds on resume, and
//! evaluate subsystem health. Spec §4.5.

use crate::assets::AssetStrategy;
use crate::config::{Config, TelemetryPolicy};
use crate::events::EventBus;
use crate::fetcher::{tokio_util_cancel, CancelHandle, CancelToken, Fetcher};
use crate::limiter::{LimiterSnapshot, RateLimiter};
use crate::pipeline::{AssetHook, Pipeline, PipelineSnapshot};
use crate::resource::{checkpoint, ResourceManager, ResourceStats};
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl Health {
    fn worst(self, other: Health) -> Health {
        use Health::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            (Unknown, Unknown) => Unknown,
            _ => Healthy,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub overall: Health,
    pub limiter: Health,
    pub resources: Health,
    pub pipeline: Health,
}

#[derive(Debug, Clone, Default)]
pub struct ResumeCounters {
    pub seeds_before: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub uptime: Duration,
    pub pipeline: PipelineSnapshot,
    pub limiter: LimiterSnapshot,
    pub resources: ResourceStats,
    pub resume: Option<ResumeCounters>,
}

struct HealthCache {
    evaluated_at: Instant,
    value: HealthSnapshot,
}

/// Constructs and owns every subsystem; the one thing embedders new up.
pub struct Engine {
    cfg: Config,
    limiter: Option<Arc<RateLimiter>>,
    resources: Arc<ResourceManager>,
    pipeline: Arc<Pipeline>,
    bus: Arc<EventBus>,
    telemetry: ArcSwap<TelemetryPolicy>,
    started_at: Mutex<Option<Instant>>,
    started_at_utc: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
    cancel_handle: Mutex<Option<CancelHandle>>,
    resume_counters: Mutex<Option<ResumeCounters>>,
    health_cache: Mutex<Option<HealthCache>>,
}

impl Engine {
    pub fn new(
        cfg: Config,
        fetcher: Arc<dyn Fetcher>,
        asset_strategy: Option<Arc<AssetStrategy>>,
    ) -> crate::error::Result<Arc<Self>> {
        cfg.validate()?;
        let bus = Arc::new(EventBus::new(cfg.telemetry.event_bus_subscriber_buffer));
        let limiter = if cfg.limiter.enabled {
            Some(RateLimiter::new(cfg.limiter.clone()))
        } else {
            None
        };
        let resources = Arc::new(ResourceManager::new(&cfg.resources));
        let asset_hook: Option<Arc<dyn AssetHook>> = asset_strategy
            .filter(|_| cfg.assets.enabled)
            .map(|s| s as Arc<dyn AssetHook>);
        let telemetry = ArcSwap::from_pointee(cfg.telemetry.clone());
        let pipeline = Arc::new(Pipeline::new(
            cfg.clone(),
            limiter.clone(),
            Arc::clone(&resources),
            fetcher,
            asset_hook,
        ));
        Ok(Arc::new(Self {
            cfg,
            limiter,
            resources,
            pipeline,
            bus,
            telemetry,
            started_at: Mutex::new(None),
            started_at_utc: Mutex::new(None),
            cancel_handle: Mutex::new(None),
            resume_counters: Mutex::new(None),
            health_cache: Mutex::new(None),
        }))
    }

    /// Filters `seeds` against the checkpoint journal when resume is
    /// enabled, then drives the pipeline. Returns the results channel.
    pub async fn start(
        self: &Arc<Self>,
        seeds: Vec<String>,
    ) -> (mpsc::Receiver<crate::types::CrawlResult>, CancelToken) {
        let (handle, cancel) = tokio_util_cancel::channel();
        *self.cancel_handle.lock().await = Some(handle);
        *self.started_at.lock().await = Some(Instant::now());
        *self.started_at_utc.lock().await = Some(chrono::Utc::now());

        let seeds_before = seeds.len();
        let filtered = if self.cfg.resume.enabled {
            let path = self
                .cfg
                .resume
                .checkpoint_path_override
                .clone()
                .or_else(|| self.cfg.resources.checkpoint_path.clone());
            let existing = path
                .as_deref()
                .map(checkpoint::load_existing)
                .unwrap_or_default();
            let filtered: Vec<String> = seeds
                .into_iter()
                .filter(|s| !existing.contains(s))
                .collect();
            let skipped = seeds_before - filtered.len();
            *self.resume_counters.lock().await = Some(ResumeCounters {
                seeds_before,
                skipped,
            });
            filtered
        } else {
            seeds
        };

        info!(count = filtered.len(), "starting crawl");
        let results = Arc::clone(&self.pipeline).run(filtered, cancel.clone()).await;
        (results, cancel)
    }

    /// Cancel the root context, drain outstanding retry timers, flush the
    /// checkpoint journal, stop the limiter sweeper. Idempotent.
    pub async fn stop(&self) {
        if let Some(handle) = self.cancel_handle.lock().await.take() {
            handle.cancel();
        }
        self.pipeline.shutdown().await;
        if let Some(limiter) = &self.limiter {
            limiter.close().await;
        }
        self.resources.close().await;
    }

    pub async fn snapshot(&self) -> Snapshot {
        let started_at = self
            .started_at_utc
            .lock()
            .await
            .unwrap_or_else(chrono::Utc::now);
        let uptime = self
            .started_at
            .lock()
            .await
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let limiter = match &self.limiter {
            Some(l) => l.snapshot().await,
            None => LimiterSnapshot {
                total_requests: 0,
                throttled: 0,
                denied: 0,
                open_circuits: 0,
                half_open_circuits: 0,
                domains: Vec::new(),
            },
        };
        Snapshot {
            started_at,
            uptime,
            pipeline: self.pipeline.snapshot(),
            limiter,
            resources: self.resources.stats().await,
            resume: self.resume_counters.lock().await.clone(),
        }
    }

    /// Evaluate the three health probes, TTL-cached per
    /// `telemetry.probe_ttl`.
    pub async fn health_snapshot(&self) -> HealthSnapshot {
        let ttl = self.telemetry.load().probe_ttl;
        {
            let cache = self.health_cache.lock().await;
            if let Some(c) = cache.as_ref() {
                if c.evaluated_at.elapsed() < ttl {
                    return c.value.clone();
                }
            }
        }

        let policy = self.telemetry.load();
        let limiter_health = match &self.limiter {
            None => Health::Healthy,
            Some(l) => {
                let snap = l.snapshot().await;
                if snap.open_circuits == 0 {
                    Health::Healthy
                } else if (snap.open_circuits as usize) < snap.domains.len().max(1) / 2 {
                    Health::Degraded
                } else {
                    Health::Unhealthy
                }
            }
        };

        let resource_stats = self.resources.stats().await;
        let resources_health = if resource_stats.checkpoint_queued
            >= policy.resource_unhealthy_checkpoint_queued
        {
            Health::Unhealthy
        } else if resource_stats.checkpoint_queued >= policy.resource_degraded_checkpoint_queued {
            Health::Degraded
        } else {
            Health::Healthy
        };

        let pipe = self.pipeline.snapshot();
        let total = pipe.total_processed + pipe.total_failed;
        let pipeline_health = if total < policy.pipeline_min_samples {
            Health::Healthy
        } else {
            let ratio = pipe.total_failed as f64 / total as f64;
            if ratio >= policy.pipeline_unhealthy_ratio {
                Health::Unhealthy
            } else if ratio >= policy.pipeline_degraded_ratio {
                Health::Degraded
            } else {
                Health::Healthy
            }
        };

        let overall = limiter_health.worst(resources_health).worst(pipeline_health);
        let snapshot = HealthSnapshot {
            overall,
            limiter: limiter_health,
            resources: resources_health,
            pipeline: pipeline_health,
        };
        *self.health_cache.lock().await = Some(HealthCache {
            evaluated_at: Instant::now(),
            value: snapshot.clone(),
        });
        snapshot
    }

    /// Hot-swap the telemetry policy without restarting the engine.
    pub fn update_telemetry_policy(&self, policy: TelemetryPolicy) {
        self.telemetry.store(Arc::new(policy));
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Thin seam over the crate's `tracing` integration point (spec §6
    /// "Tracer()"). No exporter is wired up here (SPEC_FULL.md §10.2) —
    /// this just exposes the active subscriber dispatch so an embedder can
    /// attach its own spans/fields alongside the engine's own
    /// instrumentation.
    pub fn tracer(&self) -> Tracer {
        Tracer
    }

    /// Thin seam over the crawl metrics the façade already tracks (spec §6
    /// "MetricsProvider()"), so an embedder can wire its own metrics
    /// backend without this crate doing so itself (SPEC_FULL.md §10.2).
    pub fn metrics_provider(&self) -> MetricsProvider {
        MetricsProvider {
            limiter: self.limiter.clone(),
            resources: Arc::clone(&self.resources),
            pipeline: Arc::clone(&self.pipeline),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Tracer;

impl Tracer {
    /// The `tracing::Dispatch` currently installed by the embedding
    /// process (or the no-op default if none was installed).
    pub fn dispatch(&self) -> tracing::Dispatch {
        tracing::dispatcher::get_default(|d| d.clone())
    }
}

pub struct MetricsProvider {
    limiter: Option<Arc<RateLimiter>>,
    resources: Arc<ResourceManager>,
    pipeline: Arc<Pipeline>,
}

impl MetricsProvider {
    pub fn pipeline_snapshot(&self) -> PipelineSnapshot {
        self.pipeline.snapshot()
    }

    pub async fn limiter_snapshot(&self) -> Option<LimiterSnapshot> {
        match &self.limiter {
            Some(l) => Some(l.snapshot().await),
            None => None,
        }
    }

    pub async fn resource_stats(&self) -> ResourceStats {
        self.resources.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::test_double::{Script, ScriptedFetcher};
    use crate::types::Page;

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.limiter.enabled = false;
        cfg.workers.queue_buffer = 16;
        cfg
    }

    #[tokio::test]
    async fn start_then_stop_is_idempotent() {
        let cfg = test_config();
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.script(
            "https://example.com/a",
            Script::Success(Page::new("https://example.com/a", "hi")),
        );
        let engine = Engine::new(cfg, fetcher, None).unwrap();
        let (mut results, _cancel) = engine.start(vec!["https://example.com/a".to_string()]).await;
        let result = results.recv().await.unwrap();
        assert!(result.success);
        engine.stop().await;
        engine.stop().await;
    }

    #[tokio::test]
    async fn resume_skips_checkpointed_seeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.log");
        std::fs::write(&path, "https://example.com/u1\nhttps://example.com/u2\n").unwrap();

        let mut cfg = test_config();
        cfg.resources.checkpoint_path = Some(path);
        cfg.resume.enabled = true;

        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.script(
            "https://example.com/u3",
            Script::Success(Page::new("https://example.com/u3", "hi")),
        );
        let engine = Engine::new(cfg, fetcher, None).unwrap();
        let (mut results, _cancel) = engine
            .start(vec![
                "https://example.com/u1".to_string(),
                "https://example.com/u2".to_string(),
                "https://example.com/u3".to_string(),
            ])
            .await;
        let result = results.recv().await.unwrap();
        assert_eq!(result.url, "https://example.com/u3");
        assert!(results.recv().await.is_none());

        let snap = engine.snapshot().await;
        let resume = snap.resume.unwrap();
        assert_eq!(resume.seeds_before, 3);
        assert_eq!(resume.skipped, 2);
        engine.stop().await;
    }

    #[tokio::test]
    async fn health_is_healthy_with_no_activity() {
        let cfg = test_config();
        let fetcher = Arc::new(ScriptedFetcher::new());
        let engine = Engine::new(cfg, fetcher, None).unwrap();
        let health = engine.health_snapshot().await;
        assert_eq!(health.overall, Health::Healthy);
        engine.stop().await;
    }
}
