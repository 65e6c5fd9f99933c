// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded in-memory cache of upstream images

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

/// Source image bytes as fetched from upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedImage {
    pub bytes: Bytes,
    /// The upstream's own `ETag`, if it sent one.
    pub etag: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub bytes: usize,
}

struct Entry {
    image: CachedImage,
    last_used: u64,
}

#[derive(Default)]
struct Lru {
    entries: HashMap<String, Entry>,
    // last_used -> key, oldest first
    recency: BTreeMap<u64, String>,
    clock: u64,
    bytes: usize,
}

impl Lru {
    fn touch(&mut self, key: &str) -> Option<CachedImage> {
        self.clock += 1;
        let clock = self.clock;
        let entry = self.entries.get_mut(key)?;
        let key = self.recency.remove(&entry.last_used)?;
        entry.last_used = clock;
        let image = entry.image.clone();
        self.recency.insert(clock, key);
        Some(image)
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.last_used);
            self.bytes -= entry.image.bytes.len();
        }
    }

    fn evict_oldest(&mut self) -> bool {
        match self.recency.pop_first() {
            Some((_, key)) => {
                if let Some(entry) = self.entries.remove(&key) {
                    self.bytes -= entry.image.bytes.len();
                }
                true
            }
            None => false,
        }
    }
}

/// Least-recently-used cache bounded by the total size of the cached images.
///
/// Safe to share between requests. Two concurrent misses for the same key may both
/// fetch upstream; whichever inserts last wins.
pub struct ImageCache {
    capacity_bytes: usize,
    lru: Mutex<Lru>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ImageCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            lru: Mutex::new(Lru::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lru(&self) -> MutexGuard<'_, Lru> {
        self.lru.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up `key`, counting a hit or a miss.
    pub fn get(&self, key: &str) -> Option<CachedImage> {
        let image = self.lru().touch(key);
        let counter = if image.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        image
    }

    /// Stores `image`, evicting least recently used entries to make room.
    ///
    /// Returns `false` (and stores nothing) if the image alone exceeds the capacity.
    pub fn insert(&self, key: String, image: CachedImage) -> bool {
        let size = image.bytes.len();
        if size > self.capacity_bytes {
            return false;
        }

        let mut lru = self.lru();
        lru.remove(&key);
        while lru.bytes + size > self.capacity_bytes && lru.evict_oldest() {}

        lru.clock += 1;
        let last_used = lru.clock;
        lru.recency.insert(last_used, key.clone());
        lru.entries.insert(key, Entry { image, last_used });
        lru.bytes += size;
        true
    }

    pub fn stats(&self) -> CacheStats {
        let lru = self.lru();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: lru.entries.len(),
            bytes: lru.bytes,
        }
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("capacity_bytes", &self.capacity_bytes)
            .field("stats", &self.stats())
            .finish()
    }
}
