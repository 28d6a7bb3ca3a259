//! Engine configuration.
//!
//! One `Config` composed of per-component sub-configs, each with a
//! `Default` carrying the numeric defaults spec'd in the design doc, an
//! environment-variable overlay (`Config::from_env`, following
//! `riptide-pool::config::ExtractorConfig::from_env`), and a `validate`
//! that turns construction-time mistakes into `EngineError::PolicyViolation`
//! before the engine ever starts.

use crate::error::{EngineError, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub discovery_workers: usize,
    pub extraction_workers: usize,
    pub processing_workers: usize,
    pub output_workers: usize,
    pub queue_buffer: usize,
    pub asset_hook_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            discovery_workers: 4,
            extraction_workers: 8,
            processing_workers: 4,
            output_workers: 2,
            queue_buffer: 256,
            asset_hook_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub enabled: bool,
    pub initial_rps: f64,
    pub min_rps: f64,
    pub max_rps: f64,
    pub bucket_capacity: f64,
    pub aimd_increase: f64,
    pub aimd_decrease: f64,
    pub latency_target: Duration,
    pub latency_degrade_factor: f64,
    pub error_rate_threshold: f64,
    pub min_samples_to_trip: u32,
    pub consecutive_fail_threshold: u32,
    pub open_state_duration: Duration,
    pub half_open_probes: u32,
    pub stats_window: Duration,
    pub stats_bucket: Duration,
    pub domain_ttl: Duration,
    pub shards: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_rps: 2.0,
            min_rps: 0.5,
            max_rps: 20.0,
            bucket_capacity: 5.0,
            aimd_increase: 0.5,
            aimd_decrease: 0.5,
            latency_target: Duration::from_millis(800),
            latency_degrade_factor: 2.0,
            error_rate_threshold: 0.5,
            min_samples_to_trip: 10,
            consecutive_fail_threshold: 5,
            open_state_duration: Duration::from_secs(30),
            half_open_probes: 2,
            stats_window: Duration::from_secs(60),
            stats_bucket: Duration::from_secs(5),
            domain_ttl: Duration::from_secs(120),
            shards: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub cache_capacity: usize,
    pub max_in_flight: usize,
    pub spill_dir: Option<std::path::PathBuf>,
    pub checkpoint_path: Option<std::path::PathBuf>,
    pub checkpoint_interval: Duration,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            max_in_flight: 64,
            spill_dir: None,
            checkpoint_path: None,
            checkpoint_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResumeConfig {
    pub enabled: bool,
    pub checkpoint_path_override: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AssetPolicyConfig {
    pub enabled: bool,
    pub max_bytes_per_page: usize,
    pub max_per_page: usize,
    pub inline_max_bytes: usize,
    pub optimize: bool,
    pub rewrite_prefix: String,
    pub allow_types: Vec<crate::types::AssetType>,
    pub block_types: Vec<crate::types::AssetType>,
    pub max_concurrent: usize,
}

impl Default for AssetPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_bytes_per_page: 10 * 1024 * 1024,
            max_per_page: 64,
            inline_max_bytes: 4096,
            optimize: true,
            rewrite_prefix: "/assets/".to_string(),
            allow_types: Vec::new(),
            block_types: Vec::new(),
            max_concurrent: 4,
        }
    }
}

impl AssetPolicyConfig {
    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if !self.rewrite_prefix.starts_with('/') || !self.rewrite_prefix.ends_with('/') {
            return Err(EngineError::PolicyViolation(format!(
                "rewrite_prefix {:?} must begin and end with '/'",
                self.rewrite_prefix
            )));
        }
        Ok(())
    }
}

/// Dynamically swappable thresholds consulted by `Engine::health_snapshot`.
#[derive(Debug, Clone)]
pub struct TelemetryPolicy {
    pub probe_ttl: Duration,
    pub pipeline_min_samples: u64,
    pub pipeline_degraded_ratio: f64,
    pub pipeline_unhealthy_ratio: f64,
    pub resource_degraded_checkpoint_queued: usize,
    pub resource_unhealthy_checkpoint_queued: usize,
    pub trace_sample_percent: f64,
    pub event_bus_subscriber_buffer: usize,
}

impl Default for TelemetryPolicy {
    fn default() -> Self {
        Self {
            probe_ttl: Duration::from_secs(2),
            pipeline_min_samples: 10,
            pipeline_degraded_ratio: 0.50,
            pipeline_unhealthy_ratio: 0.80,
            resource_degraded_checkpoint_queued: 256,
            resource_unhealthy_checkpoint_queued: 512,
            trace_sample_percent: 100.0,
            event_bus_subscriber_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub workers: WorkerConfig,
    pub retry: RetryConfig,
    pub limiter: LimiterConfig,
    pub resources: ResourceConfig,
    pub resume: ResumeConfig,
    pub assets: AssetPolicyConfig,
    pub telemetry: TelemetryPolicy,
}

impl Config {
    /// Validate cross-field invariants, surfacing construction-time
    /// mistakes as `EngineError::PolicyViolation` rather than letting the
    /// engine start in a broken state.
    pub fn validate(&self) -> Result<()> {
        self.assets.validate()?;
        if self.limiter.min_rps > self.limiter.max_rps {
            return Err(EngineError::PolicyViolation(
                "limiter.min_rps must not exceed limiter.max_rps".into(),
            ));
        }
        if self.limiter.shards == 0 || !self.limiter.shards.is_power_of_two() {
            return Err(EngineError::PolicyViolation(
                "limiter.shards must be a power of two".into(),
            ));
        }
        Ok(())
    }

    /// Overlay `ARIADNE_*` environment variables onto the defaults, for
    /// every numeric/bool field across the sub-configs (`allow_types` and
    /// `block_types` are lists and have no env overlay, same as the
    /// teacher's `ExtractorConfig::from_env` skipping its non-scalar
    /// fields). Embedding CLIs/config-file parsers are out of scope for
    /// this crate, but this hook is the seam they call into.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("ARIADNE_DISCOVERY_WORKERS") {
            if let Ok(v) = v.parse() {
                cfg.workers.discovery_workers = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_EXTRACTION_WORKERS") {
            if let Ok(v) = v.parse() {
                cfg.workers.extraction_workers = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_PROCESSING_WORKERS") {
            if let Ok(v) = v.parse() {
                cfg.workers.processing_workers = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_OUTPUT_WORKERS") {
            if let Ok(v) = v.parse() {
                cfg.workers.output_workers = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_QUEUE_BUFFER") {
            if let Ok(v) = v.parse() {
                cfg.workers.queue_buffer = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_ASSET_HOOK_TIMEOUT_MS") {
            if let Ok(v) = v.parse::<u64>() {
                cfg.workers.asset_hook_timeout = Duration::from_millis(v);
            }
        }

        if let Ok(v) = std::env::var("ARIADNE_RETRY_BASE_DELAY_MS") {
            if let Ok(v) = v.parse::<u64>() {
                cfg.retry.base_delay = Duration::from_millis(v);
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_RETRY_MAX_DELAY_MS") {
            if let Ok(v) = v.parse::<u64>() {
                cfg.retry.max_delay = Duration::from_millis(v);
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_RETRY_MAX_ATTEMPTS") {
            if let Ok(v) = v.parse() {
                cfg.retry.max_attempts = v;
            }
        }

        if let Ok(v) = std::env::var("ARIADNE_LIMITER_ENABLED") {
            cfg.limiter.enabled = v.to_lowercase() == "true";
        }
        if let Ok(v) = std::env::var("ARIADNE_LIMITER_INITIAL_RPS") {
            if let Ok(v) = v.parse() {
                cfg.limiter.initial_rps = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_LIMITER_MIN_RPS") {
            if let Ok(v) = v.parse() {
                cfg.limiter.min_rps = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_LIMITER_MAX_RPS") {
            if let Ok(v) = v.parse() {
                cfg.limiter.max_rps = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_LIMITER_BUCKET_CAPACITY") {
            if let Ok(v) = v.parse() {
                cfg.limiter.bucket_capacity = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_LIMITER_AIMD_INCREASE") {
            if let Ok(v) = v.parse() {
                cfg.limiter.aimd_increase = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_LIMITER_AIMD_DECREASE") {
            if let Ok(v) = v.parse() {
                cfg.limiter.aimd_decrease = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_LIMITER_LATENCY_TARGET_MS") {
            if let Ok(v) = v.parse::<u64>() {
                cfg.limiter.latency_target = Duration::from_millis(v);
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_LIMITER_LATENCY_DEGRADE_FACTOR") {
            if let Ok(v) = v.parse() {
                cfg.limiter.latency_degrade_factor = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_LIMITER_ERROR_RATE_THRESHOLD") {
            if let Ok(v) = v.parse() {
                cfg.limiter.error_rate_threshold = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_LIMITER_MIN_SAMPLES_TO_TRIP") {
            if let Ok(v) = v.parse() {
                cfg.limiter.min_samples_to_trip = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_LIMITER_CONSECUTIVE_FAIL_THRESHOLD") {
            if let Ok(v) = v.parse() {
                cfg.limiter.consecutive_fail_threshold = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_LIMITER_OPEN_STATE_DURATION_MS") {
            if let Ok(v) = v.parse::<u64>() {
                cfg.limiter.open_state_duration = Duration::from_millis(v);
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_LIMITER_HALF_OPEN_PROBES") {
            if let Ok(v) = v.parse() {
                cfg.limiter.half_open_probes = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_LIMITER_STATS_WINDOW_MS") {
            if let Ok(v) = v.parse::<u64>() {
                cfg.limiter.stats_window = Duration::from_millis(v);
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_LIMITER_STATS_BUCKET_MS") {
            if let Ok(v) = v.parse::<u64>() {
                cfg.limiter.stats_bucket = Duration::from_millis(v);
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_LIMITER_DOMAIN_TTL_MS") {
            if let Ok(v) = v.parse::<u64>() {
                cfg.limiter.domain_ttl = Duration::from_millis(v);
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_LIMITER_SHARDS") {
            if let Ok(v) = v.parse() {
                cfg.limiter.shards = v;
            }
        }

        if let Ok(v) = std::env::var("ARIADNE_CACHE_CAPACITY") {
            if let Ok(v) = v.parse() {
                cfg.resources.cache_capacity = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_MAX_IN_FLIGHT") {
            if let Ok(v) = v.parse() {
                cfg.resources.max_in_flight = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_SPILL_DIR") {
            cfg.resources.spill_dir = Some(std::path::PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("ARIADNE_CHECKPOINT_PATH") {
            cfg.resources.checkpoint_path = Some(std::path::PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("ARIADNE_CHECKPOINT_INTERVAL_MS") {
            if let Ok(v) = v.parse::<u64>() {
                cfg.resources.checkpoint_interval = Duration::from_millis(v);
            }
        }

        if let Ok(v) = std::env::var("ARIADNE_RESUME_ENABLED") {
            cfg.resume.enabled = v.to_lowercase() == "true";
        }
        if let Ok(v) = std::env::var("ARIADNE_RESUME_CHECKPOINT_PATH_OVERRIDE") {
            cfg.resume.checkpoint_path_override = Some(std::path::PathBuf::from(v));
        }

        if let Ok(v) = std::env::var("ARIADNE_ASSETS_ENABLED") {
            cfg.assets.enabled = v.to_lowercase() == "true";
        }
        if let Ok(v) = std::env::var("ARIADNE_ASSETS_MAX_BYTES_PER_PAGE") {
            if let Ok(v) = v.parse() {
                cfg.assets.max_bytes_per_page = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_ASSETS_MAX_PER_PAGE") {
            if let Ok(v) = v.parse() {
                cfg.assets.max_per_page = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_ASSETS_INLINE_MAX_BYTES") {
            if let Ok(v) = v.parse() {
                cfg.assets.inline_max_bytes = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_ASSETS_OPTIMIZE") {
            cfg.assets.optimize = v.to_lowercase() == "true";
        }
        if let Ok(v) = std::env::var("ARIADNE_ASSETS_REWRITE_PREFIX") {
            cfg.assets.rewrite_prefix = v;
        }
        if let Ok(v) = std::env::var("ARIADNE_ASSETS_MAX_CONCURRENT") {
            if let Ok(v) = v.parse() {
                cfg.assets.max_concurrent = v;
            }
        }

        if let Ok(v) = std::env::var("ARIADNE_TELEMETRY_PROBE_TTL_MS") {
            if let Ok(v) = v.parse::<u64>() {
                cfg.telemetry.probe_ttl = Duration::from_millis(v);
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_TELEMETRY_PIPELINE_MIN_SAMPLES") {
            if let Ok(v) = v.parse() {
                cfg.telemetry.pipeline_min_samples = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_TELEMETRY_PIPELINE_DEGRADED_RATIO") {
            if let Ok(v) = v.parse() {
                cfg.telemetry.pipeline_degraded_ratio = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_TELEMETRY_PIPELINE_UNHEALTHY_RATIO") {
            if let Ok(v) = v.parse() {
                cfg.telemetry.pipeline_unhealthy_ratio = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_TELEMETRY_RESOURCE_DEGRADED_CHECKPOINT_QUEUED") {
            if let Ok(v) = v.parse() {
                cfg.telemetry.resource_degraded_checkpoint_queued = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_TELEMETRY_RESOURCE_UNHEALTHY_CHECKPOINT_QUEUED") {
            if let Ok(v) = v.parse() {
                cfg.telemetry.resource_unhealthy_checkpoint_queued = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_TELEMETRY_TRACE_SAMPLE_PERCENT") {
            if let Ok(v) = v.parse() {
                cfg.telemetry.trace_sample_percent = v;
            }
        }
        if let Ok(v) = std::env::var("ARIADNE_TELEMETRY_EVENT_BUS_SUBSCRIBER_BUFFER") {
            if let Ok(v) = v.parse() {
                cfg.telemetry.event_bus_subscriber_buffer = v;
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn bad_rewrite_prefix_is_rejected() {
        let mut cfg = Config {
            assets: AssetPolicyConfig {
                enabled: true,
                rewrite_prefix: "assets".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        cfg.assets.rewrite_prefix = "/assets/".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn inverted_rps_bounds_rejected() {
        let cfg = Config {
            limiter: LimiterConfig {
                min_rps: 10.0,
                max_rps: 1.0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    /// `from_env` mutates process-global state, so this single test covers
    /// one field from each sub-config instead of running many tests in
    /// parallel against the same environment.
    #[test]
    fn from_env_overlays_one_field_per_section() {
        std::env::set_var("ARIADNE_DISCOVERY_WORKERS", "9");
        std::env::set_var("ARIADNE_RETRY_MAX_ATTEMPTS", "7");
        std::env::set_var("ARIADNE_LIMITER_SHARDS", "32");
        std::env::set_var("ARIADNE_LIMITER_LATENCY_TARGET_MS", "1234");
        std::env::set_var("ARIADNE_CHECKPOINT_INTERVAL_MS", "99");
        std::env::set_var("ARIADNE_RESUME_ENABLED", "true");
        std::env::set_var("ARIADNE_ASSETS_MAX_PER_PAGE", "3");
        std::env::set_var("ARIADNE_TELEMETRY_TRACE_SAMPLE_PERCENT", "42.5");

        let cfg = Config::from_env();
        assert_eq!(cfg.workers.discovery_workers, 9);
        assert_eq!(cfg.retry.max_attempts, 7);
        assert_eq!(cfg.limiter.shards, 32);
        assert_eq!(cfg.limiter.latency_target, Duration::from_millis(1234));
        assert_eq!(cfg.resources.checkpoint_interval, Duration::from_millis(99));
        assert!(cfg.resume.enabled);
        assert_eq!(cfg.assets.max_per_page, 3);
        assert_eq!(cfg.telemetry.trace_sample_percent, 42.5);

        for key in [
            "ARIADNE_DISCOVERY_WORKERS",
            "ARIADNE_RETRY_MAX_ATTEMPTS",
            "ARIADNE_LIMITER_SHARDS",
            "ARIADNE_LIMITER_LATENCY_TARGET_MS",
            "ARIADNE_CHECKPOINT_INTERVAL_MS",
            "ARIADNE_RESUME_ENABLED",
            "ARIADNE_ASSETS_MAX_PER_PAGE",
            "ARIADNE_TELEMETRY_TRACE_SAMPLE_PERCENT",
        ] {
            std::env::remove_var(key);
        }
    }
}
