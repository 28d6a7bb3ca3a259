//! Adaptive per-domain rate limiter. Spec §4.2.
//!
//! Domain states are sharded by FNV-1a(host) to bound lock contention,
//! an explicit shard table per spec's description of "its own
//! read/write lock" per shard. Each domain's mutable fields (token
//! bucket, EWMA, sliding window, Retry-After ratchet) sit behind one
//! `tokio::sync::Mutex` so reservation ordering under the domain lock is
//! total, per spec §5 "Ordering guarantees".

pub mod bucket;
pub mod circuit;
pub mod domain;

use crate::config::LimiterConfig;
use crate::error::{EngineError, Result};
use crate::fetcher::CancelToken;
use domain::{normalize_host, DomainState, Trend};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument, warn};

struct Shard {
    domains: RwLock<HashMap<String, Arc<Mutex<DomainState>>>>,
}

/// Opaque admission handle. Release is a no-op: reservations are consumed
/// at acquisition, not on release (spec's "Permit" glossary entry).
#[derive(Debug)]
pub struct Permit {
    pub host: String,
}

#[derive(Debug, Clone)]
pub struct DomainSummary {
    pub host: String,
    pub fill_rate: f64,
    pub circuit_state: &'static str,
    pub last_activity: Instant,
}

#[derive(Debug, Clone)]
pub struct LimiterSnapshot {
    pub total_requests: u64,
    pub throttled: u64,
    pub denied: u64,
    pub open_circuits: u64,
    pub half_open_circuits: u64,
    pub domains: Vec<DomainSummary>,
}

/// Feedback reported by the pipeline after each fetch attempt.
#[derive(Debug, Clone)]
pub struct Feedback {
    pub status: Option<u16>,
    pub latency: Duration,
    pub is_error: bool,
    pub retry_after: Option<Duration>,
}

pub struct RateLimiter {
    shards: Vec<Shard>,
    cfg: LimiterConfig,
    total_requests: AtomicU64,
    throttled: AtomicU64,
    denied: AtomicU64,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(cfg: LimiterConfig) -> Arc<Self> {
        let shard_count = cfg.shards.max(1);
        let shards = (0..shard_count)
            .map(|_| Shard {
                domains: RwLock::new(HashMap::new()),
            })
            .collect();
        let limiter = Arc::new(Self {
            shards,
            cfg,
            total_requests: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        });
        let sweeper_limiter = Arc::clone(&limiter);
        let handle = tokio::spawn(async move { sweeper_limiter.sweep_loop().await });
        // Store synchronously is not possible pre-construction; stash via blocking lock.
        if let Ok(mut guard) = limiter.sweeper.try_lock() {
            *guard = Some(handle);
        }
        limiter
    }

    fn shard_for(&self, host: &str) -> &Shard {
        let mask = (self.shards.len() - 1) as u64;
        let idx = domain::fnv1a(host.as_bytes()) & mask;
        &self.shards[idx as usize]
    }

    async fn domain_for(&self, host: &str) -> Arc<Mutex<DomainState>> {
        let shard = self.shard_for(host);
        if let Some(existing) = shard.domains.read().await.get(host) {
            return Arc::clone(existing);
        }
        let mut write = shard.domains.write().await;
        write
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DomainState::new(&self.cfg))))
            .clone()
    }

    /// Acquire an admission permit for `url`'s host. May sleep across
    /// multiple suspension points (Retry-After wait, token-bucket wait);
    /// every sleep is cancellable via `cancel`.
    #[instrument(skip(self, cancel), fields(url = %url))]
    pub async fn acquire(&self, url: &str, cancel: &CancelToken) -> Result<Permit> {
        let host = normalize_host(url)
            .ok_or_else(|| EngineError::InvalidUrl(format!("cannot derive host from {url}")))?;
        if !self.cfg.enabled {
            return Ok(Permit { host });
        }
        let domain = self.domain_for(&host).await;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let wait_for_retry_after;
            let admission;
            let token_wait;
            {
                let mut state = domain.lock().await;
                let now = Instant::now();
                wait_for_retry_after = state
                    .earliest_next_admission
                    .map(|t| t.saturating_duration_since(now))
                    .filter(|d| !d.is_zero());
                if wait_for_retry_after.is_some() {
                    admission = None;
                    token_wait = None;
                } else {
                    admission = Some(state.circuit.try_admit());
                    if admission == Some(circuit::Admission::Denied) {
                        token_wait = None;
                    } else {
                        token_wait = Some(state.bucket.reserve(1.0, now));
                    }
                }
            }
            if let Some(wait) = wait_for_retry_after {
                debug!(host = %host, wait_ms = wait.as_millis(), "retry-after wait");
                self.sleep_cancellable(wait, cancel).await?;
                continue;
            }
            if admission == Some(circuit::Admission::Denied) {
                self.denied.fetch_add(1, Relaxed);
                return Err(EngineError::CircuitOpen { host });
            }
            match token_wait {
                Some(wait) if !wait.is_zero() => {
                    self.throttled.fetch_add(1, Relaxed);
                    self.sleep_cancellable(wait, cancel).await?;
                    continue;
                }
                _ => {
                    self.total_requests.fetch_add(1, Relaxed);
                    let mut state = domain.lock().await;
                    state.total_requests += 1;
                    state.last_activity = Instant::now();
                    return Ok(Permit { host });
                }
            }
        }
    }

    async fn sleep_cancellable(&self, wait: Duration, cancel: &CancelToken) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
        }
    }

    /// Report the outcome of a fetch. Spec §4.2 "Feedback".
    pub async fn feedback(&self, host: &str, feedback: Feedback) {
        let domain = self.domain_for(host).await;
        let mut state = domain.lock().await;
        let now = Instant::now();

        let alpha = 0.2;
        let prev = state.latency_ewma.as_secs_f64();
        let observed = feedback.latency.as_secs_f64();
        state.latency_ewma = Duration::from_secs_f64((1.0 - alpha) * prev + alpha * observed);

        let degraded = feedback.latency
            >= self
                .cfg
                .latency_target
                .mul_f64(self.cfg.latency_degrade_factor);
        let is_decrease = feedback.is_error
            || matches!(feedback.status, Some(s) if s == 429 || (500..600).contains(&s))
            || degraded;
        let is_increase = !is_decrease
            && matches!(feedback.status, Some(s) if (200..400).contains(&s));

        let trend = if is_decrease {
            Trend::Decrease
        } else if is_increase {
            Trend::Increase
        } else {
            Trend::Neutral
        };

        let new_rate = match trend {
            Trend::Decrease => (state.bucket.rate() * self.cfg.aimd_decrease).max(self.cfg.min_rps),
            Trend::Increase => (state.bucket.rate() + self.cfg.aimd_increase).min(self.cfg.max_rps),
            Trend::Neutral => state.bucket.rate(),
        };
        state.bucket.set_rate(new_rate);

        state.window.record(now, feedback.is_error || is_decrease);

        if let Some(retry_after) = feedback.retry_after {
            let candidate = now + retry_after;
            state.earliest_next_admission = Some(match state.earliest_next_admission {
                Some(existing) if existing > candidate => existing,
                _ => candidate,
            });
        }

        let (total, errors) = state.window.totals();
        if is_decrease {
            state.circuit.on_failure(total, errors);
        } else {
            state.circuit.on_success();
        }
        state.last_activity = now;
        drop(state);
        warn_if_open(&domain, &host.to_string()).await;
    }

    pub async fn snapshot(&self) -> LimiterSnapshot {
        let mut open = 0u64;
        let mut half_open = 0u64;
        let mut domains = Vec::new();
        for shard in &self.shards {
            let map = shard.domains.read().await;
            for (host, state) in map.iter() {
                let state = state.lock().await;
                match state.circuit.state() {
                    circuit::State::Open => open += 1,
                    circuit::State::HalfOpen => half_open += 1,
                    circuit::State::Closed => {}
                }
                domains.push(DomainSummary {
                    host: host.clone(),
                    fill_rate: state.bucket.rate(),
                    circuit_state: state.circuit.state().as_str(),
                    last_activity: state.last_activity,
                });
            }
        }
        domains.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        domains.truncate(10);
        LimiterSnapshot {
            total_requests: self.total_requests.load(Relaxed),
            throttled: self.throttled.load(Relaxed),
            denied: self.denied.load(Relaxed),
            open_circuits: open,
            half_open_circuits: half_open,
            domains,
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let interval = (self.cfg.domain_ttl / 2).max(Duration::from_millis(100));
        loop {
            tokio::time::sleep(interval).await;
            let now = Instant::now();
            for shard in &self.shards {
                let mut map = shard.domains.write().await;
                let mut stale = Vec::new();
                for (host, state) in map.iter() {
                    if state.lock().await.idle_for(now) > self.cfg.domain_ttl {
                        stale.push(host.clone());
                    }
                }
                for host in stale {
                    map.remove(&host);
                }
            }
        }
    }

    /// Idempotently stop the background sweeper.
    pub async fn close(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
    }
}

async fn warn_if_open(domain: &Arc<Mutex<DomainState>>, host: &str) {
    if domain.lock().await.circuit.state() == circuit::State::Open {
        warn!(host = %host, "circuit breaker open");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::tokio_util_cancel;

    fn cfg() -> LimiterConfig {
        LimiterConfig {
            shards: 4,
            domain_ttl: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn acquire_then_feedback_updates_rate() {
        let limiter = RateLimiter::new(cfg());
        let (_handle, cancel) = tokio_util_cancel::channel();
        let permit = limiter.acquire("https://example.com/a", &cancel).await.unwrap();
        limiter
            .feedback(
                &permit.host,
                Feedback {
                    status: Some(200),
                    latency: Duration::from_millis(10),
                    is_error: false,
                    retry_after: None,
                },
            )
            .await;
        let snap = limiter.snapshot().await;
        assert_eq!(snap.total_requests, 1);
        limiter.close().await;
    }

    #[tokio::test]
    async fn circuit_opens_after_consecutive_failures() {
        let mut c = cfg();
        c.consecutive_fail_threshold = 1;
        c.open_state_duration = Duration::from_millis(30);
        let limiter = RateLimiter::new(c);
        let (_handle, cancel) = tokio_util_cancel::channel();
        let permit = limiter.acquire("https://flaky.example/a", &cancel).await.unwrap();
        limiter
            .feedback(
                &permit.host,
                Feedback {
                    status: Some(503),
                    latency: Duration::from_millis(5),
                    is_error: true,
                    retry_after: None,
                },
            )
            .await;
        let err = limiter.acquire("https://flaky.example/b", &cancel).await;
        assert!(matches!(err, Err(EngineError::CircuitOpen { .. })));
        limiter.close().await;
    }

    #[tokio::test]
    async fn cancellation_during_wait_returns_promptly() {
        let mut c = cfg();
        c.bucket_capacity = 1.0;
        c.initial_rps = 1.0;
        c.max_rps = 1.0;
        let limiter = RateLimiter::new(c);
        let (handle, cancel) = tokio_util_cancel::channel();
        limiter.acquire("https://slow.example/a", &cancel).await.unwrap();
        handle.cancel();
        let result = limiter.acquire("https://slow.example/a", &cancel).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        limiter.close().await;
    }
}
