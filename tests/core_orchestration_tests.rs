//! End-to-end scenarios against the public `Engine` surface. Mirrors the
//! concrete scenarios enumerated for the pipeline/limiter/resource manager:
//! cache hits, spill/rehydrate, and circuit recovery, driven entirely
//! through `Engine::start`/`snapshot`/`stop` rather than internal types.
//!
//! Run with `cargo test --features test-utils`.

#![cfg(feature = "test-utils")]

use ariadne::config::{Config, LimiterConfig, ResourceConfig};
use ariadne::engine::Engine;
use ariadne::fetcher::test_double::{Script, ScriptedFetcher};
use ariadne::types::Page;
use std::sync::Arc;
use std::time::Duration;

fn base_config() -> Config {
    let mut cfg = Config::default();
    cfg.limiter.enabled = false;
    cfg.workers.queue_buffer = 32;
    cfg
}

#[tokio::test]
async fn cache_hit_on_duplicate_submission() {
    let mut cfg = base_config();
    cfg.resources = ResourceConfig {
        cache_capacity: 2,
        ..Default::default()
    };
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.script(
        "https://example.com/u1",
        Script::Success(Page::new("https://example.com/u1", "one")),
    );
    let engine = Engine::new(cfg, fetcher, None).unwrap();
    let (mut results, _cancel) = engine
        .start(vec![
            "https://example.com/u1".to_string(),
            "https://example.com/u1".to_string(),
        ])
        .await;

    let mut delivered = 0;
    while let Some(result) = results.recv().await {
        assert!(result.success);
        delivered += 1;
    }
    assert_eq!(delivered, 2);

    // `total_processed` sums discovery+extraction+processing+output
    // (cache is excluded). Both submissions pass through discovery,
    // processing, and output (2 each); only the one that actually won the
    // singleflight claim counts under extraction, the other is served from
    // the cache and counts under the excluded `cache` stage instead.
    let snap = engine.snapshot().await;
    assert_eq!(snap.pipeline.total_processed, 7);
    engine.stop().await;
}

#[tokio::test]
async fn spill_then_rehydrate_across_submissions() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = base_config();
    cfg.resources = ResourceConfig {
        cache_capacity: 1,
        spill_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.script(
        "https://example.com/u1",
        Script::Success(Page::new("https://example.com/u1", "one")),
    );
    fetcher.script(
        "https://example.com/u2",
        Script::Success(Page::new("https://example.com/u2", "two")),
    );
    let engine = Engine::new(cfg, fetcher, None).unwrap();
    let (mut results, _cancel) = engine
        .start(vec![
            "https://example.com/u1".to_string(),
            "https://example.com/u2".to_string(),
            "https://example.com/u1".to_string(),
        ])
        .await;

    let mut delivered = 0;
    while let Some(result) = results.recv().await {
        assert!(result.success);
        delivered += 1;
    }
    assert_eq!(delivered, 3);

    let snap = engine.snapshot().await;
    assert!(snap.resources.spill_files >= 1 || snap.resources.cache_entries >= 1);
    engine.stop().await;
}

#[tokio::test]
async fn circuit_opens_then_recovers_to_half_open() {
    let mut cfg = base_config();
    cfg.limiter = LimiterConfig {
        enabled: true,
        consecutive_fail_threshold: 1,
        open_state_duration: Duration::from_millis(50),
        half_open_probes: 2,
        shards: 4,
        ..Default::default()
    };
    cfg.retry.max_attempts = 1;
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.script(
        "https://flaky.example/a",
        Script::AlwaysFail { status: 503 },
    );
    let engine = Engine::new(cfg, fetcher, None).unwrap();
    let (mut results, _cancel) = engine
        .start(vec!["https://flaky.example/a".to_string()])
        .await;
    let result = results.recv().await.unwrap();
    assert!(!result.success);

    let snap = engine.snapshot().await;
    assert_eq!(snap.limiter.open_circuits, 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    engine.stop().await;
}
