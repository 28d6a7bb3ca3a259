//! Core data model: [`Page`], [`CrawlResult`], and the small value types
//! that flow between pipeline stages.

use crate::error::StageError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Structured metadata lifted from a page's `<head>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub keywords: Vec<String>,
    pub open_graph: HashMap<String, String>,
}

/// A fetched, and possibly enriched, page.
///
/// Pages are value-like: every component boundary that stores or returns a
/// `Page` does so by deep copy (see [`crate::resource::cache`]) so that
/// mutation on one side never aliases another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page {
    pub url: String,
    pub content: String,
    pub cleaned_text: Option<String>,
    pub markdown: Option<String>,
    pub links: Vec<String>,
    pub images: Vec<String>,
    pub metadata: Metadata,
    pub headers: HashMap<String, String>,
    pub fetched_at: chrono::DateTime<chrono::Utc>,
    pub processed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Page {
    pub fn new(url: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content: content.into(),
            cleaned_text: None,
            markdown: None,
            links: Vec::new(),
            images: Vec::new(),
            metadata: Metadata::default(),
            headers: HashMap::new(),
            fetched_at: chrono::Utc::now(),
            processed_at: None,
        }
    }
}

/// One of the four pipeline stages; also the label stamped into
/// [`CrawlResult::stage`].
pub type Stage = &'static str;

pub const STAGE_DISCOVERY: Stage = "discovery";
pub const STAGE_EXTRACTION: Stage = "extraction";
pub const STAGE_CACHE: Stage = "cache";
pub const STAGE_PROCESSING: Stage = "processing";
pub const STAGE_OUTPUT: Stage = "output";

/// Terminal record for a single submitted URL. Exactly one is emitted per
/// seed (success or terminal failure) unless the root context is cancelled
/// first.
#[derive(Debug)]
pub struct CrawlResult {
    pub url: String,
    pub page: Option<Page>,
    pub error: Option<StageError>,
    pub success: bool,
    pub stage: Stage,
    pub retryable: bool,
}

impl CrawlResult {
    pub fn success(url: impl Into<String>, page: Page, stage: Stage) -> Self {
        Self {
            url: url.into(),
            page: Some(page),
            error: None,
            success: true,
            stage,
            retryable: false,
        }
    }

    pub fn failure(url: impl Into<String>, error: StageError, retryable: bool) -> Self {
        let stage = error.stage;
        Self {
            url: url.into(),
            page: None,
            error: Some(error),
            success: false,
            stage,
            retryable,
        }
    }
}

/// Recirculated by Discovery and the retry scheduler; carries the attempt
/// counter consulted by the retry policy.
#[derive(Debug, Clone)]
pub struct ExtractionTask {
    pub url: String,
    pub attempt: u32,
}

impl ExtractionTask {
    pub fn first(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            attempt: 0,
        }
    }

    pub fn retry(&self) -> Self {
        Self {
            url: self.url.clone(),
            attempt: self.attempt + 1,
        }
    }
}

/// Asset type tag, as discovered from the HTML attribute it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetType {
    Img,
    Stylesheet,
    Script,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Img => "img",
            AssetType::Stylesheet => "stylesheet",
            AssetType::Script => "script",
        }
    }
}

/// A candidate asset reference discovered on a page, before any decision
/// about whether to fetch it has been made.
#[derive(Debug, Clone)]
pub struct AssetRef {
    pub url: String,
    pub asset_type: AssetType,
    pub source_attr: &'static str,
    pub original_value: String,
}

/// The decision the asset strategy made for one [`AssetRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionMode {
    Download,
    Skip,
    Inline,
}

/// An asset whose bytes have been fetched (and possibly optimized), hashed,
/// and assigned a deterministic final path.
#[derive(Debug, Clone)]
pub struct MaterializedAsset {
    pub asset_ref: AssetRef,
    pub bytes: Vec<u8>,
    pub content_hash: String,
    pub path: String,
    pub size: usize,
    pub optimizations: Vec<String>,
}
