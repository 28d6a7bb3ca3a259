//! Per-host state: token bucket, latency EWMA, sliding error-rate window,
//! circuit breaker, Retry-After ratchet. Spec §3 "DomainState", §4.2.

use super::bucket::TokenBucket;
use super::circuit::{CircuitBreaker, CircuitConfig};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// One bucket of the sliding window: count of samples and errors observed
/// in a `stats_bucket`-wide slice of time.
#[derive(Debug, Clone, Copy)]
struct WindowBucket {
    started_at: Instant,
    total: u64,
    errors: u64,
}

#[derive(Debug)]
pub struct SlidingWindow {
    buckets: VecDeque<WindowBucket>,
    bucket_width: Duration,
    window: Duration,
}

impl SlidingWindow {
    pub fn new(window: Duration, bucket_width: Duration) -> Self {
        Self {
            buckets: VecDeque::new(),
            bucket_width,
            window,
        }
    }

    pub fn record(&mut self, now: Instant, is_error: bool) {
        self.truncate_expired(now);
        match self.buckets.back_mut() {
            Some(b) if now.saturating_duration_since(b.started_at) < self.bucket_width => {
                b.total += 1;
                b.errors += is_error as u64;
            }
            _ => {
                self.buckets.push_back(WindowBucket {
                    started_at: now,
                    total: 1,
                    errors: is_error as u64,
                });
            }
        }
    }

    fn truncate_expired(&mut self, now: Instant) {
        while let Some(front) = self.buckets.front() {
            if now.saturating_duration_since(front.started_at) > self.window {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn totals(&self) -> (u64, u64) {
        self.buckets
            .iter()
            .fold((0, 0), |(t, e), b| (t + b.total, e + b.errors))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Increase,
    Decrease,
    Neutral,
}

pub struct DomainState {
    pub bucket: TokenBucket,
    pub latency_ewma: Duration,
    pub window: SlidingWindow,
    pub circuit: CircuitBreaker,
    pub earliest_next_admission: Option<Instant>,
    pub last_activity: Instant,
    pub total_requests: u64,
}

impl DomainState {
    pub fn new(cfg: &crate::config::LimiterConfig) -> Self {
        Self {
            bucket: TokenBucket::new(cfg.bucket_capacity, cfg.initial_rps),
            latency_ewma: Duration::ZERO,
            window: SlidingWindow::new(cfg.stats_window, cfg.stats_bucket),
            circuit: CircuitBreaker::new(CircuitConfig {
                consecutive_fail_threshold: cfg.consecutive_fail_threshold,
                min_samples_to_trip: cfg.min_samples_to_trip,
                error_rate_threshold: cfg.error_rate_threshold,
                open_state_duration: cfg.open_state_duration,
                half_open_probes: cfg.half_open_probes,
            }),
            earliest_next_admission: None,
            last_activity: Instant::now(),
            total_requests: 0,
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

/// Lowercase, strip default ports, keep bracketed IPv6 literals. Spec
/// §4.2 "Host normalization".
pub fn normalize_host(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    let scheme = parsed.scheme();
    let port = parsed.port();
    if host.is_empty() {
        return None;
    }
    let is_bracketed_v6 = host.starts_with('[') || host.parse::<std::net::Ipv6Addr>().is_ok();
    let host = if is_bracketed_v6 && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host
    };
    let normalized = match (scheme, port) {
        (_, None) => host,
        ("http", Some(80)) => host,
        ("https", Some(443)) => host,
        (_, Some(p)) => format!("{host}:{p}"),
    };
    Some(normalized)
}

/// FNV-1a, used to shard domain states (spec §4.2 "Sharding").
pub fn fnv1a(data: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_default_ports() {
        assert_eq!(
            normalize_host("https://Example.com:443/a").unwrap(),
            "example.com"
        );
        assert_eq!(
            normalize_host("http://Example.com:80/a").unwrap(),
            "example.com"
        );
        assert_eq!(
            normalize_host("http://example.com:8080/a").unwrap(),
            "example.com:8080"
        );
    }

    #[test]
    fn keeps_bracketed_ipv6() {
        let host = normalize_host("http://[::1]:8080/a").unwrap();
        assert!(host.starts_with('['));
    }

    #[test]
    fn idempotent_normalization() {
        let once = normalize_host("https://Example.COM:443/x").unwrap();
        let twice = normalize_host(&format!("https://{once}/x")).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn sliding_window_truncates_expired_buckets() {
        let mut w = SlidingWindow::new(Duration::from_millis(50), Duration::from_millis(10));
        let t0 = Instant::now();
        w.record(t0, true);
        assert_eq!(w.totals(), (1, 1));
        let t1 = t0 + Duration::from_millis(100);
        w.record(t1, false);
        let (total, _errors) = w.totals();
        // The first bucket (50ms+ old relative to t1) must have expired.
        assert_eq!(total, 1);
    }
}
