// vim: tw=80
//! LRU cache of map pages

use std::{
    collections::HashMap,
    fmt::{self, Debug},
    hash::BuildHasherDefault,
    sync::Arc,
    time::{Duration, Instant},
};

use metrohash::{MetroBuildHasher, MetroHash64};
use tracing::trace;

use super::page::{MapPage, PageKey};

struct LruEntry {
    page: Arc<MapPage>,
    /// Key of the next less recently used entry
    lru: Option<PageKey>,
    /// Key of the next more recently used entry
    mru: Option<PageKey>,
}

impl Debug for LruEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LruEntry {{ lru: {:?}, mru: {:?} }}", self.lru, self.mru)
    }
}

impl LruEntry {
    /// May this page be dropped from memory?
    fn evictable(&self) -> bool {
        Arc::strong_count(&self.page) == 1 && !self.page.is_dirty()
    }
}

/// Basic LRU cache of map pages.
///
/// Unlike a general purpose cache, it can't always evict down to its capacity:
/// dirty pages and pages that somebody else holds stay put.
#[derive(Debug)]
pub struct PageCache {
    /// Capacity in pages
    capacity: usize,
    /// Least recently used entry
    lru: Option<PageKey>,
    /// Most recently used entry
    mru: Option<PageKey>,
    store: HashMap<PageKey, LruEntry, BuildHasherDefault<MetroHash64>>,
}

impl PageCache {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Every dirty page, in key order
    pub fn dirty_pages(&self) -> Vec<Arc<MapPage>> {
        let mut v = self.store.values()
            .filter(|e| e.page.is_dirty())
            .map(|e| e.page.clone())
            .collect::<Vec<_>>();
        v.sort_unstable_by_key(|p| p.key());
        v
    }

    /// Evict clean, unreferenced pages that haven't been touched in `ageout`.
    pub fn evict_aged(&mut self, ageout: Duration) -> usize {
        let now = Instant::now();
        let victims = self.store.iter()
            .filter(|(_, e)| e.evictable() &&
                    now.saturating_duration_since(e.page.age()) >= ageout)
            .map(|(k, _)| *k)
            .collect::<Vec<_>>();
        for k in victims.iter() {
            self.remove(k);
        }
        victims.len()
    }

    /// Evict least recently used pages until the cache is within its capacity,
    /// skipping pages that can't be evicted.
    ///
    /// Returns `true` if the cache is now within its capacity.
    pub fn evict_excess(&mut self) -> bool {
        let mut cursor = self.lru;
        while self.store.len() > self.capacity {
            let Some(key) = cursor else { break };
            let entry = &self.store[&key];
            cursor = entry.mru;
            if entry.evictable() {
                trace!(?key, "evict");
                self.remove(&key);
            }
        }
        self.store.len() <= self.capacity
    }

    pub fn get(&mut self, key: &PageKey) -> Option<Arc<MapPage>> {
        if self.mru == Some(*key) {
            let page = self.store[key].page.clone();
            page.touch();
            return Some(page);
        }
        let mru = self.mru;
        let (v_mru, v_lru, page) = {
            let v = self.store.get_mut(key)?;
            let r = (v.mru, v.lru, v.page.clone());
            v.mru = None;
            v.lru = mru;
            r
        };
        // Unlink from the old position.  It isn't the MRU, so it has an mru.
        if let Some(m) = v_mru {
            self.store.get_mut(&m).unwrap().lru = v_lru;
        }
        if let Some(l) = v_lru {
            self.store.get_mut(&l).unwrap().mru = v_mru;
        } else {
            debug_assert_eq!(self.lru, Some(*key));
            self.lru = v_mru;
        }
        if let Some(m) = mru {
            self.store.get_mut(&m).unwrap().mru = Some(*key);
        }
        self.mru = Some(*key);
        page.touch();
        Some(page)
    }

    /// Insert a page as the most recently used.  Does not evict anything.
    ///
    /// If the key is already present, the existing page is kept and returned.
    pub fn insert(&mut self, page: Arc<MapPage>) -> Arc<MapPage> {
        let key = page.key();
        if let Some(existing) = self.get(&key) {
            return existing;
        }
        let entry = LruEntry { page: page.clone(), mru: None, lru: self.mru };
        self.store.insert(key, entry);
        if let Some(m) = self.mru {
            let v = self.store.get_mut(&m).unwrap();
            debug_assert!(v.mru.is_none());
            v.mru = Some(key);
        }
        self.mru = Some(key);
        if self.lru.is_none() {
            self.lru = Some(key);
        }
        page
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn remove(&mut self, key: &PageKey) -> Option<Arc<MapPage>> {
        self.store.remove(key).map(|v| {
            if let Some(m) = v.mru {
                self.store.get_mut(&m).unwrap().lru = v.lru;
            } else {
                debug_assert_eq!(self.mru, Some(*key));
                self.mru = v.lru;
            }
            if let Some(l) = v.lru {
                self.store.get_mut(&l).unwrap().mru = v.mru;
            } else {
                debug_assert_eq!(self.lru, Some(*key));
                self.lru = v.mru;
            }
            v.page
        })
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let store = HashMap::with_hasher(MetroBuildHasher::default());
        PageCache { capacity, lru: None, mru: None, store }
    }
}

// LCOV_EXCL_STOP
