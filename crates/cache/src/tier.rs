//! The in-process config cache.
//!
//! Holds positive entries, negative entries ("looked up, nothing there") and
//! aggregate entries (whole result sets such as "all cards"). Nothing expires
//! on its own except negative entries when a negative TTL is configured.
//!
//! Every fill carries the generation observed before its backing-store I/O
//! started. [`ConfigCacheTier::clear`] and the invalidation methods bump the
//! generation under the same lock, so a fill that raced with them is
//! discarded instead of resurrecting pre-refresh state.

use adcp_core::config::ConfigEntry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// A cached lookup result. `entry == None` is a negative entry.
#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub entry: Option<ConfigEntry>,
    pub cached_at: Instant,
}

impl CacheRecord {
    pub fn is_negative(&self) -> bool {
        self.entry.is_none()
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Record(CacheRecord),
    Aggregate(Arc<Vec<ConfigEntry>>),
}

/// How a fill treats an entry that is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillPolicy {
    /// Keep a live entry written by someone else in the meantime. A
    /// positive fill still replaces a negative entry.
    IfAbsent,
    /// Replace whatever is there (strict reads)
    Overwrite,
}

/// Result of a fill attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    Written,
    /// A live entry was already present
    Kept,
    /// The cache was cleared or invalidated after the read started
    Stale,
}

/// Diagnostic snapshot of the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub negative_entries: usize,
    pub aggregates: usize,
    pub generation: u64,
    pub initialized: bool,
    /// First 20 keys in sorted order
    pub sample_keys: Vec<String>,
}

struct Inner {
    slots: RwLock<HashMap<String, Slot>>,
    generation: AtomicU64,
    negative_ttl: Option<Duration>,
}

/// The shared cache. Cloning shares the same map.
#[derive(Clone)]
pub struct ConfigCacheTier {
    inner: Arc<Inner>,
}

impl ConfigCacheTier {
    /// `negative_ttl: None` keeps negative entries until invalidated.
    pub fn new(negative_ttl: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: RwLock::new(HashMap::new()),
                generation: AtomicU64::new(0),
                negative_ttl,
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn is_live(&self, record: &CacheRecord) -> bool {
        match (record.is_negative(), self.inner.negative_ttl) {
            (true, Some(ttl)) => record.cached_at.elapsed() < ttl,
            _ => true,
        }
    }

    /// `None` is a miss; `Some(None)` is a live negative entry.
    pub async fn lookup(&self, key: &str) -> Option<Option<ConfigEntry>> {
        let slots = self.inner.slots.read().await;
        match slots.get(key) {
            Some(Slot::Record(record)) if self.is_live(record) => Some(record.entry.clone()),
            _ => None,
        }
    }

    pub async fn lookup_aggregate(&self, key: &str) -> Option<Arc<Vec<ConfigEntry>>> {
        let slots = self.inner.slots.read().await;
        match slots.get(key) {
            Some(Slot::Aggregate(entries)) => Some(entries.clone()),
            _ => None,
        }
    }

    /// Store a lookup result read at `generation`.
    pub async fn fill(
        &self,
        key: &str,
        entry: Option<ConfigEntry>,
        generation: u64,
        policy: FillPolicy,
    ) -> FillOutcome {
        let mut slots = self.inner.slots.write().await;
        if self.generation() != generation {
            debug!(key = %key, "Cache: discarding stale fill");
            return FillOutcome::Stale;
        }
        if policy == FillPolicy::IfAbsent
            && let Some(Slot::Record(existing)) = slots.get(key)
            && self.is_live(existing)
            && (!existing.is_negative() || entry.is_none())
        {
            return FillOutcome::Kept;
        }
        slots.insert(
            key.to_string(),
            Slot::Record(CacheRecord {
                entry,
                cached_at: Instant::now(),
            }),
        );
        FillOutcome::Written
    }

    /// Store an aggregate result read at `generation`. Aggregates are always
    /// overwritten: they are only rebuilt after a miss or a strict read.
    pub async fn fill_aggregate(
        &self,
        key: &str,
        entries: Vec<ConfigEntry>,
        generation: u64,
    ) -> FillOutcome {
        let mut slots = self.inner.slots.write().await;
        if self.generation() != generation {
            debug!(key = %key, "Cache: discarding stale aggregate fill");
            return FillOutcome::Stale;
        }
        slots.insert(key.to_string(), Slot::Aggregate(Arc::new(entries)));
        FillOutcome::Written
    }

    /// Drop everything. Returns the number of entries removed.
    pub async fn clear(&self) -> usize {
        let mut slots = self.inner.slots.write().await;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let removed = slots.len();
        slots.clear();
        removed
    }

    /// Drop the given keys. Returns how many existed.
    pub async fn invalidate(&self, keys: &[String]) -> usize {
        let mut slots = self.inner.slots.write().await;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        keys.iter().filter(|k| slots.remove(*k).is_some()).count()
    }

    /// Drop every key matching `predicate`. Returns how many were removed.
    pub async fn invalidate_where(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut slots = self.inner.slots.write().await;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let before = slots.len();
        slots.retain(|k, _| !predicate(k));
        before - slots.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.slots.read().await.is_empty()
    }

    pub async fn stats(&self) -> CacheStats {
        let slots = self.inner.slots.read().await;
        let mut keys: Vec<String> = slots.keys().cloned().collect();
        keys.sort();
        keys.truncate(20);

        let mut stats = CacheStats {
            entries: slots.len(),
            generation: self.generation(),
            sample_keys: keys,
            ..Default::default()
        };
        for slot in slots.values() {
            match slot {
                Slot::Record(r) if r.is_negative() => stats.negative_entries += 1,
                Slot::Record(_) => {}
                Slot::Aggregate(_) => stats.aggregates += 1,
            }
        }
        stats
    }
}

impl Default for ConfigCacheTier {
    fn default() -> Self {
        Self::new(None)
    }
}
