//! LRU page cache with deep-copy semantics. Spec §4.3 "Cache".

use crate::types::Page;
use std::collections::HashMap;

struct Node {
    key: String,
    page: Page,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Intrusive doubly-linked-list LRU backed by a slab (`Vec<Option<Node>>`)
/// plus a key->index map, matching the teacher's "doubly-linked list plus
/// map" description rather than reaching for an external LRU crate.
pub struct Lru {
    capacity: usize,
    slab: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>, // most recently used
    tail: Option<usize>, // least recently used
}

impl Lru {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slab: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.slab[idx].as_ref().unwrap();
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.slab[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slab[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.slab[idx].as_mut().unwrap();
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.slab[h].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.detach(idx);
        self.push_front(idx);
    }

    /// Insert or refresh `key`. Returns the evicted (key, page) if the cache
    /// was over capacity.
    pub fn insert(&mut self, key: String, page: Page) -> Option<(String, Page)> {
        if let Some(&idx) = self.index.get(&key) {
            self.slab[idx].as_mut().unwrap().page = page;
            self.touch(idx);
            return None;
        }
        let idx = if let Some(free_idx) = self.free.pop() {
            self.slab[free_idx] = Some(Node {
                key: key.clone(),
                page,
                prev: None,
                next: None,
            });
            free_idx
        } else {
            self.slab.push(Some(Node {
                key: key.clone(),
                page,
                prev: None,
                next: None,
            }));
            self.slab.len() - 1
        };
        self.index.insert(key, idx);
        self.push_front(idx);

        if self.index.len() > self.capacity {
            self.evict_lru()
        } else {
            None
        }
    }

    fn evict_lru(&mut self) -> Option<(String, Page)> {
        let tail = self.tail?;
        self.detach(tail);
        let node = self.slab[tail].take().unwrap();
        self.free.push(tail);
        self.index.remove(&node.key);
        Some((node.key, node.page))
    }

    pub fn get(&mut self, key: &str) -> Option<Page> {
        let idx = *self.index.get(key)?;
        self.touch(idx);
        Some(self.slab[idx].as_ref().unwrap().page.clone())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut lru = Lru::new(2);
        assert!(lru.insert("a".into(), Page::new("a", "A")).is_none());
        assert!(lru.insert("b".into(), Page::new("b", "B")).is_none());
        // touch "a" so "b" becomes LRU
        lru.get("a");
        let evicted = lru.insert("c".into(), Page::new("c", "C"));
        assert_eq!(evicted.unwrap().0, "b");
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn get_returns_deep_copy_not_aliased() {
        let mut lru = Lru::new(2);
        lru.insert("a".into(), Page::new("a", "A"));
        let mut p = lru.get("a").unwrap();
        p.content = "mutated".into();
        let p2 = lru.get("a").unwrap();
        assert_eq!(p2.content, "A");
    }
}
