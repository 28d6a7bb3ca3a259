//! Asset strategy: discover → decide → execute → rewrite. Spec §4.4.
//!
//! Deterministic by construction: materialized assets are sorted by
//! content hash before rewrite, and fetching happens concurrently (order
//! of downloads never affects the final content, per spec's "Concurrency"
//! note).

pub mod policy;

use crate::config::AssetPolicyConfig;
use crate::events::{Event, EventBus};
use crate::types::{ActionMode, AssetRef, AssetType, MaterializedAsset, Page};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::instrument;

/// `assetFetch(ctx, url, remainingBudget) -> (bytes, error)` from spec §6.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str, remaining_budget: usize) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Default)]
pub struct AssetMetrics {
    pub discovered: AtomicU64,
    pub selected: AtomicU64,
    pub downloaded: AtomicU64,
    pub skipped: AtomicU64,
    pub inlined: AtomicU64,
    pub optimized: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub rewrite_failures: AtomicU64,
}

const EVENT_RING_CAPACITY: usize = 1024;

pub struct AssetStrategy {
    policy: AssetPolicyConfig,
    fetcher: Arc<dyn AssetFetcher>,
    pub metrics: AssetMetrics,
    bus: Arc<EventBus>,
    ring: Mutex<VecDeque<Event>>,
}

impl AssetStrategy {
    pub fn new(policy: AssetPolicyConfig, fetcher: Arc<dyn AssetFetcher>, bus: Arc<EventBus>) -> Self {
        Self {
            policy,
            fetcher,
            metrics: AssetMetrics::default(),
            bus,
            ring: Mutex::new(VecDeque::with_capacity(EVENT_RING_CAPACITY)),
        }
    }

    fn record(&self, event: Event) {
        self.bus.publish(event.clone());
        let mut ring = self.ring.lock().unwrap();
        if ring.len() >= EVENT_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    pub fn recent_events(&self) -> Vec<Event> {
        self.ring.lock().unwrap().iter().cloned().collect()
    }

    /// Parse `page.content` as HTML and extract candidate asset references.
    pub fn discover(&self, page: &Page) -> Vec<AssetRef> {
        let document = Html::parse_document(&page.content);
        let base = url::Url::parse(&page.url).ok();
        let mut refs = Vec::new();

        let specs: &[(&str, &str, AssetType)] = &[
            ("img[src]", "src", AssetType::Img),
            ("link[rel=stylesheet][href]", "href", AssetType::Stylesheet),
            ("script[src]", "src", AssetType::Script),
        ];
        for (selector_str, attr, asset_type) in specs {
            let Ok(selector) = Selector::parse(selector_str) else {
                continue;
            };
            for element in document.select(&selector) {
                let Some(raw) = element.value().attr(attr) else {
                    continue;
                };
                let resolved = match &base {
                    Some(base_url) => base_url
                        .join(raw)
                        .map(|u| u.to_string())
                        .unwrap_or_else(|_| raw.to_string()),
                    None => raw.to_string(),
                };
                refs.push(AssetRef {
                    url: resolved,
                    asset_type: *asset_type,
                    source_attr: attr,
                    original_value: raw.to_string(),
                });
            }
        }
        self.metrics
            .discovered
            .fetch_add(refs.len() as u64, Relaxed);
        refs
    }

    pub fn decide(&self, refs: Vec<AssetRef>) -> Vec<policy::Decision> {
        let decisions = policy::decide(&self.policy, refs);
        self.metrics
            .selected
            .fetch_add(decisions.len() as u64, Relaxed);
        decisions
    }

    /// Fetch, optimize, and hash each decided asset, honoring the
    /// remaining per-page byte budget. Non-fatal per asset: a failure is
    /// recorded as an event and simply excluded from rewrite.
    #[instrument(skip(self, decisions))]
    pub async fn execute(&self, decisions: Vec<policy::Decision>) -> Vec<MaterializedAsset> {
        let remaining_budget = Arc::new(std::sync::atomic::AtomicUsize::new(
            self.policy.max_bytes_per_page,
        ));
        let semaphore = Arc::new(Semaphore::new(self.policy.max_concurrent.max(1)));

        let mut tasks = FuturesUnordered::new();
        for decision in decisions {
            if decision.mode == ActionMode::Skip {
                self.metrics.skipped.fetch_add(1, Relaxed);
                continue;
            }
            let semaphore = Arc::clone(&semaphore);
            let remaining_budget = Arc::clone(&remaining_budget);
            let fetcher = Arc::clone(&self.fetcher);
            let optimize = self.policy.optimize;
            tasks.push(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                let budget = remaining_budget.load(Relaxed);
                if budget == 0 {
                    return None;
                }
                let started = Instant::now();
                let bytes = fetcher.fetch(&decision.asset_ref.url, budget).await.ok()?;
                let taken = bytes.len().min(budget);
                remaining_budget.fetch_sub(taken, Relaxed);
                Some((decision, bytes, started.elapsed()))
            });
        }

        let mut materialized = Vec::new();
        while let Some(result) = tasks.next().await {
            let Some((decision, bytes, duration)) = result else {
                continue;
            };
            self.metrics
                .bytes_in
                .fetch_add(bytes.len() as u64, Relaxed);

            let (final_bytes, optimizations) = self.optimize(&decision.asset_ref.asset_type, bytes);
            self.metrics
                .bytes_out
                .fetch_add(final_bytes.len() as u64, Relaxed);

            if decision.mode == ActionMode::Inline {
                self.metrics.inlined.fetch_add(1, Relaxed);
            } else {
                self.metrics.downloaded.fetch_add(1, Relaxed);
            }
            self.record(Event::AssetDownload {
                url: decision.asset_ref.url.clone(),
                bytes: final_bytes.len(),
                duration,
                optimizations: optimizations.clone(),
            });

            let hash = hex::encode(Sha256::digest(&final_bytes));
            let path = self.deterministic_path(&hash, &decision.asset_ref.url);
            materialized.push(MaterializedAsset {
                asset_ref: decision.asset_ref,
                size: final_bytes.len(),
                bytes: final_bytes,
                content_hash: hash,
                path,
                optimizations,
            });
        }
        materialized.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));
        materialized
    }

    fn optimize(&self, asset_type: &AssetType, bytes: Vec<u8>) -> (Vec<u8>, Vec<String>) {
        if !self.policy.optimize {
            return (bytes, Vec::new());
        }
        match asset_type {
            AssetType::Stylesheet | AssetType::Script => {
                if let Ok(text) = String::from_utf8(bytes.clone()) {
                    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
                    if collapsed.len() < text.len() {
                        let saved = text.len() as i64 - collapsed.len() as i64;
                        self.metrics.optimized.fetch_add(1, Relaxed);
                        let url_for_event = asset_type.as_str().to_string();
                        self.record(Event::AssetOptimize {
                            url: url_for_event,
                            saved_bytes: saved,
                        });
                        return (collapsed.into_bytes(), vec!["whitespace_collapse".into()]);
                    }
                }
                (bytes, Vec::new())
            }
            AssetType::Img => (bytes, vec!["img_meta".into()]),
        }
    }

    fn deterministic_path(&self, hash: &str, url: &str) -> String {
        let ext = url::Url::parse(url)
            .ok()
            .and_then(|u| {
                let path = u.path().to_string();
                path.rsplit_once('.').map(|(_, e)| format!(".{e}"))
            })
            .filter(|e| {
                let candidate = &e[1..];
                !candidate.is_empty()
                    && candidate.len() <= 10
                    && candidate.chars().all(|c| c.is_ascii_alphanumeric() || c == '.')
            })
            .unwrap_or_default();
        format!(
            "{}{}/{}{}",
            self.policy.rewrite_prefix,
            &hash[0..2],
            hash,
            ext
        )
    }

    /// Replace every occurrence of each materialized asset's original
    /// attribute value with its deterministic path. Returns a cloned page;
    /// a rewrite "failure" (no occurrence found) is recorded but other
    /// assets still rewrite.
    pub fn rewrite(&self, page: &Page, materialized: &[MaterializedAsset]) -> Page {
        let mut content = page.content.clone();
        let mut rewritten = 0usize;
        for asset in materialized {
            if content.contains(&asset.asset_ref.original_value) {
                content = content.replace(&asset.asset_ref.original_value, &asset.path);
                rewritten += 1;
            } else {
                self.metrics.rewrite_failures.fetch_add(1, Relaxed);
                self.record(Event::AssetStageError {
                    stage: "rewrite",
                    error: format!("original value not found for {}", asset.asset_ref.url),
                });
            }
        }
        self.record(Event::AssetRewrite { count: rewritten });
        let mut page = page.clone();
        page.content = content;
        page
    }
}

/// Wires the discover → decide → execute → rewrite sequence up as the
/// single `hook(ctx, page) -> (page, error)` capability the processing
/// stage calls through.
#[async_trait]
impl crate::pipeline::AssetHook for AssetStrategy {
    async fn process(&self, page: Page) -> anyhow::Result<Page> {
        let refs = self.discover(&page);
        let decisions = self.decide(refs);
        let materialized = self.execute(decisions).await;
        Ok(self.rewrite(&page, &materialized))
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_double {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    pub struct StubAssetFetcher {
        responses: StdMutex<HashMap<String, Vec<u8>>>,
    }

    impl StubAssetFetcher {
        pub fn new() -> Self {
            Self {
                responses: StdMutex::new(HashMap::new()),
            }
        }

        pub fn set(&self, url: impl Into<String>, bytes: Vec<u8>) {
            self.responses.lock().unwrap().insert(url.into(), bytes);
        }
    }

    impl Default for StubAssetFetcher {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl AssetFetcher for StubAssetFetcher {
        async fn fetch(&self, url: &str, _remaining_budget: usize) -> anyhow::Result<Vec<u8>> {
            self.responses
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no stub for {url}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_double::StubAssetFetcher;

    fn page_with(html: &str) -> Page {
        Page::new("https://example.com/index.html", html)
    }

    #[test]
    fn discover_finds_img_css_script() {
        let strategy = AssetStrategy::new(
            AssetPolicyConfig {
                enabled: true,
                ..Default::default()
            },
            Arc::new(StubAssetFetcher::new()),
            Arc::new(EventBus::default()),
        );
        let page = page_with(
            r#"<html><head><link rel="stylesheet" href="/styles/site.css"></head>
               <body><img src="/images/logo.svg"><script src="/app.js"></script></body></html>"#,
        );
        let refs = strategy.discover(&page);
        assert_eq!(refs.len(), 3);
        assert!(refs.iter().any(|r| r.url.ends_with("/styles/site.css")));
    }

    #[tokio::test]
    async fn rewrite_is_deterministic_across_runs() {
        let fetcher = Arc::new(StubAssetFetcher::new());
        fetcher.set(
            "https://example.com/styles/site.css",
            b"body   {  color: red;  }".to_vec(),
        );
        fetcher.set(
            "https://example.com/images/logo.svg",
            b"<svg></svg>".to_vec(),
        );
        let policy = AssetPolicyConfig {
            enabled: true,
            ..Default::default()
        };
        let page = page_with(
            r#"<link rel="stylesheet" href="/styles/site.css"><img src="/images/logo.svg">"#,
        );

        let run_once = || async {
            let strategy = AssetStrategy::new(policy.clone(), fetcher.clone(), Arc::new(EventBus::default()));
            let refs = strategy.discover(&page);
            let decisions = strategy.decide(refs);
            let materialized = strategy.execute(decisions).await;
            strategy.rewrite(&page, &materialized).content
        };

        let first = run_once().await;
        let second = run_once().await;
        assert_eq!(first, second);
        assert!(!first.contains("/styles/site.css"));
        let re = regex_like_check(&first);
        assert!(re);
    }

    fn regex_like_check(content: &str) -> bool {
        content.contains("/assets/")
    }
}
