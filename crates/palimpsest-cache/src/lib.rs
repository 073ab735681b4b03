//! Content-addressed result cache with single-flight semantics.
//!
//! The cache is the deduplication boundary for both results and work: a
//! `Ready` entry replays the stored result, an `InFlight` entry lets
//! concurrent identical submissions await the primary run's completion, and
//! a miss makes the caller the primary. Subscribers attached after the
//! primary receive only the terminal result, never the intermediate agent
//! chatter. Ready entries live in a size-bounded LRU; `InFlight` entries are
//! never evicted and are removed on failure so the next submission re-runs.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::debug;

use palimpsest_types::{CacheStats, ResurrectionResult};

/// SHA-256 of the submitted bytes, lower-case hex. Collisions are treated as
/// impossible.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:064x}", Sha256::digest(bytes))
}

/// Progress of an in-flight pipeline run, observable through a watch channel.
#[derive(Debug, Clone)]
pub enum RunState {
    Running,
    Done(Arc<ResurrectionResult>),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub result: Arc<ResurrectionResult>,
    pub inserted_at: DateTime<Utc>,
}

struct CacheState {
    ready: LruCache<String, CachedEntry>,
    in_flight: HashMap<String, watch::Receiver<RunState>>,
    hits: u64,
    misses: u64,
    coalesced: u64,
}

#[derive(Clone)]
pub struct ArchiveCache {
    inner: Arc<Mutex<CacheState>>,
    capacity: usize,
}

/// What a submission finds in the cache.
pub enum Submission {
    /// A completed result; replay it as a single cached terminal event.
    Cached(Arc<ResurrectionResult>),
    /// An identical run is already executing; await its terminal state.
    Joined(watch::Receiver<RunState>),
    /// This caller owns the run. The guard must be settled with
    /// [`RunGuard::complete`] or [`RunGuard::fail`]; dropping it unsettled
    /// (client disconnect) removes the entry and fails the subscribers.
    Primary(RunGuard),
}

pub struct RunGuard {
    cache: ArchiveCache,
    hash: String,
    tx: watch::Sender<RunState>,
    settled: bool,
}

impl RunGuard {
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Install the result as `Ready` and wake every subscriber.
    pub fn complete(mut self, result: Arc<ResurrectionResult>) {
        self.settled = true;
        self.cache.install(&self.hash, result.clone());
        let _ = self.tx.send(RunState::Done(result));
    }

    /// Remove the `InFlight` entry so the next identical submission re-runs.
    pub fn fail(mut self, reason: impl Into<String>) {
        self.settled = true;
        self.cache.remove_in_flight(&self.hash);
        let _ = self.tx.send(RunState::Failed(reason.into()));
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.cache.remove_in_flight(&self.hash);
            let _ = self.tx.send(RunState::Failed("run abandoned".to_string()));
        }
    }
}

impl ArchiveCache {
    pub fn new(capacity: usize) -> Self {
        let bounded = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(CacheState {
                ready: LruCache::new(bounded),
                in_flight: HashMap::new(),
                hits: 0,
                misses: 0,
                coalesced: 0,
            })),
            capacity: bounded.get(),
        }
    }

    /// Classify a submission and, on a miss, claim the primary slot.
    pub fn begin(&self, hash: &str) -> Submission {
        let mut state = self.lock();

        if let Some(entry) = state.ready.get(hash) {
            let result = entry.result.clone();
            state.hits += 1;
            return Submission::Cached(result);
        }

        if let Some(rx) = state.in_flight.get(hash) {
            let rx = rx.clone();
            state.coalesced += 1;
            return Submission::Joined(rx);
        }

        state.misses += 1;
        let (tx, rx) = watch::channel(RunState::Running);
        state.in_flight.insert(hash.to_string(), rx);
        debug!(hash, "claimed primary slot for submission");
        Submission::Primary(RunGuard {
            cache: self.clone(),
            hash: hash.to_string(),
            tx,
            settled: false,
        })
    }

    /// Archive lookup by content hash; does not touch the hit counters.
    pub fn lookup(&self, hash: &str) -> Option<Arc<ResurrectionResult>> {
        self.lock().ready.get(hash).map(|e| e.result.clone())
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entries: state.ready.len(),
            in_flight: state.in_flight.len(),
            capacity: self.capacity,
            hits: state.hits,
            misses: state.misses,
            coalesced: state.coalesced,
        }
    }

    fn install(&self, hash: &str, result: Arc<ResurrectionResult>) {
        let mut state = self.lock();
        state.in_flight.remove(hash);
        state.ready.put(
            hash.to_string(),
            CachedEntry {
                result,
                inserted_at: Utc::now(),
            },
        );
    }

    fn remove_in_flight(&self, hash: &str) {
        self.lock().in_flight.remove(hash);
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Await the terminal state of a joined run. A primary that vanishes without
/// settling reads as a failure.
pub async fn await_joined(mut rx: watch::Receiver<RunState>) -> RunState {
    match rx.wait_for(|state| !matches!(state, RunState::Running)).await {
        Ok(state) => state.clone(),
        Err(_) => RunState::Failed("run abandoned".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palimpsest_types::RestorationSummary;

    fn result(tag: &str) -> Arc<ResurrectionResult> {
        Arc::new(ResurrectionResult {
            overall_confidence: 70.0,
            processing_time_ms: 10,
            raw_ocr_text: tag.to_string(),
            transliterated_text: tag.to_string(),
            enhanced_image_base64: String::new(),
            repair_recommendations: Vec::new(),
            damage_hotspots: Vec::new(),
            restoration_summary: RestorationSummary::default(),
        })
    }

    #[test]
    fn content_hash_is_stable_hex() {
        let a = content_hash(b"parchment");
        let b = content_hash(b"parchment");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_hash(b"parchment!"));
    }

    #[test]
    fn miss_then_complete_then_hit() {
        let cache = ArchiveCache::new(8);
        let hash = content_hash(b"img");

        let Submission::Primary(guard) = cache.begin(&hash) else {
            panic!("first submission must be primary");
        };
        guard.complete(result("one"));

        let Submission::Cached(cached) = cache.begin(&hash) else {
            panic!("second submission must hit");
        };
        assert_eq!(cached.raw_ocr_text, "one");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn concurrent_identical_submission_joins_the_primary() {
        let cache = ArchiveCache::new(8);
        let hash = content_hash(b"img");

        let Submission::Primary(guard) = cache.begin(&hash) else {
            panic!("expected primary");
        };
        let Submission::Joined(rx) = cache.begin(&hash) else {
            panic!("expected joined");
        };

        let waiter = tokio::spawn(await_joined(rx));
        guard.complete(result("shared"));

        match waiter.await.unwrap() {
            RunState::Done(res) => assert_eq!(res.raw_ocr_text, "shared"),
            other => panic!("unexpected terminal state: {other:?}"),
        }
        assert_eq!(cache.stats().coalesced, 1);
    }

    #[tokio::test]
    async fn failed_run_is_removed_so_the_next_submission_retries() {
        let cache = ArchiveCache::new(8);
        let hash = content_hash(b"img");

        let Submission::Primary(guard) = cache.begin(&hash) else {
            panic!("expected primary");
        };
        let Submission::Joined(rx) = cache.begin(&hash) else {
            panic!("expected joined");
        };
        guard.fail("model outage");

        match await_joined(rx).await {
            RunState::Failed(reason) => assert_eq!(reason, "model outage"),
            other => panic!("unexpected terminal state: {other:?}"),
        }
        assert!(matches!(cache.begin(&hash), Submission::Primary(_)));
    }

    #[tokio::test]
    async fn dropped_guard_reads_as_abandoned_run() {
        let cache = ArchiveCache::new(8);
        let hash = content_hash(b"img");

        let Submission::Primary(guard) = cache.begin(&hash) else {
            panic!("expected primary");
        };
        let Submission::Joined(rx) = cache.begin(&hash) else {
            panic!("expected joined");
        };
        drop(guard);

        assert!(matches!(await_joined(rx).await, RunState::Failed(_)));
        assert_eq!(cache.stats().in_flight, 0);
        assert!(matches!(cache.begin(&hash), Submission::Primary(_)));
    }

    #[test]
    fn ready_side_is_lru_bounded() {
        let cache = ArchiveCache::new(2);
        for tag in ["a", "b", "c"] {
            let hash = content_hash(tag.as_bytes());
            let Submission::Primary(guard) = cache.begin(&hash) else {
                panic!("expected primary");
            };
            guard.complete(result(tag));
        }
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        // The oldest entry was evicted.
        assert!(cache.lookup(&content_hash(b"a")).is_none());
        assert!(cache.lookup(&content_hash(b"c")).is_some());
    }

    #[test]
    fn lookup_does_not_skew_hit_counters() {
        let cache = ArchiveCache::new(4);
        let hash = content_hash(b"img");
        let Submission::Primary(guard) = cache.begin(&hash) else {
            panic!("expected primary");
        };
        guard.complete(result("x"));
        let _ = cache.lookup(&hash);
        assert_eq!(cache.stats().hits, 0);
    }
}
