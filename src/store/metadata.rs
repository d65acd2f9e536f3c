//! Object Info Cache
//!
//! B2 addresses files by id for copy and delete, but cache code works with
//! names. Listings already return the id, so recently listed objects are kept
//! in a Moka cache for a few minutes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::sync::Cache;
use tracing::{debug, trace};

use super::types::ObjectInfo;

const CAPACITY: u64 = 50_000;

const DEFAULT_TTL: Duration = Duration::from_secs(300);

pub struct ObjectInfoCache {
    entries: Cache<String, ObjectInfo>,
    lookups: AtomicU64,
    hits: AtomicU64,
}

impl ObjectInfoCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(CAPACITY)
                .time_to_live(ttl)
                .build(),
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    pub fn get(&self, name: &str) -> Option<ObjectInfo> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let found = self.entries.get(name);
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        trace!(name = name, hit = found.is_some(), "Object info lookup");
        found
    }

    pub fn insert(&self, info: &ObjectInfo) {
        self.entries.insert(info.name.clone(), info.clone());
    }

    /// Drop a deleted or rewritten object
    pub fn invalidate(&self, name: &str) {
        self.entries.invalidate(name);
    }

    /// Share of lookups answered from the cache, `None` before the first lookup
    pub fn hit_ratio(&self) -> Option<f64> {
        let lookups = self.lookups.load(Ordering::Relaxed);
        (lookups > 0).then(|| self.hits.load(Ordering::Relaxed) as f64 / lookups as f64)
    }

    pub fn log_metrics(&self) {
        debug!(
            lookups = self.lookups.load(Ordering::Relaxed),
            hit_ratio = ?self.hit_ratio(),
            entries = self.entries.entry_count(),
            "Object info cache"
        );
    }
}

impl Default for ObjectInfoCache {
    fn default() -> Self {
        Self::new()
    }
}
