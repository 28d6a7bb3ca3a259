//! Disk spill for evicted cache entries. Spec §4.3 "Spill", §6 "Spill file
//! format".

use crate::limiter::domain::fnv1a;
use crate::types::Page;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

pub struct SpillStore {
    dir: Option<PathBuf>,
    index: HashMap<String, PathBuf>,
}

impl SpillStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    fn file_name(url: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        format!("spill-{nanos}-{:016x}.spill.json", fnv1a(url.as_bytes()))
    }

    /// Persist `page` for `url`. Write failures are swallowed: the entry is
    /// simply lost, matching spec §4.3 ("Write failures are swallowed").
    pub fn store(&mut self, url: &str, page: &Page) {
        let Some(dir) = &self.dir else { return };
        let path = dir.join(Self::file_name(url));
        match serde_json::to_vec_pretty(page) {
            Ok(bytes) => match std::fs::write(&path, bytes) {
                Ok(()) => {
                    self.index.insert(url.to_string(), path);
                }
                Err(e) => warn!(url, error = %e, "spill write failed; entry lost"),
            },
            Err(e) => warn!(url, error = %e, "spill serialize failed; entry lost"),
        }
    }

    /// Rehydrate and remove `url` from the spill index, if present.
    pub fn take(&mut self, url: &str) -> Option<Page> {
        let path = self.index.remove(url)?;
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).ok(),
            Err(e) => {
                warn!(url, path = %path.display(), error = %e, "spill read failed");
                None
            }
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.index.contains_key(url)
    }

    pub fn file_for(&self, url: &str) -> Option<&Path> {
        self.index.get(url).map(|p| p.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_take_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut spill = SpillStore::new(Some(dir.path().to_path_buf()));
        let page = Page::new("https://example.com/a", "hello");
        spill.store("https://example.com/a", &page);
        assert_eq!(spill.len(), 1);
        let rehydrated = spill.take("https://example.com/a").unwrap();
        assert_eq!(rehydrated.content, "hello");
        assert_eq!(spill.len(), 0);
    }

    #[test]
    fn disabled_without_dir() {
        let mut spill = SpillStore::new(None);
        spill.store("https://example.com/a", &Page::new("a", "x"));
        assert_eq!(spill.len(), 0);
    }
}
