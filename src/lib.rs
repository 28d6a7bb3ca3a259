//! Ariadne: an embeddable web-crawling engine core.
//!
//! This crate implements the four-stage processing pipeline, the adaptive
//! per-domain rate limiter, the resource manager (bounded cache + disk
//! spill + checkpoint journal + in-flight admission), and the asset
//! strategy hook that rewrites intra-page references deterministically.
//!
//! Fetch details, content extraction, configuration-file parsing, the
//! command-line wrapper, and telemetry backends are external collaborators
//! — this crate consumes narrow trait contracts ([`fetcher::Fetcher`],
//! [`assets::AssetFetcher`], [`pipeline::AssetHook`]) for them rather than
//! owning an implementation.
//!
//! ```no_run
//! use ariadne::{Config, Engine};
//! use std::sync::Arc;
//!
//! # async fn run(fetcher: Arc<dyn ariadne::fetcher::Fetcher>) -> ariadne::error::Result<()> {
//! let cfg = Config::from_env();
//! let engine = Engine::new(cfg, fetcher, None)?;
//! let (mut results, _cancel) = engine.start(vec!["https://example.com".to_string()]).await;
//! while let Some(result) = results.recv().await {
//!     println!("{} -> {}", result.url, result.success);
//! }
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod assets;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod limiter;
pub mod pipeline;
pub mod resource;
pub mod types;

pub use config::Config;
pub use engine::{Engine, Health, HealthSnapshot, Snapshot};
pub use error::{EngineError, Result};
pub use types::{CrawlResult, Page};
