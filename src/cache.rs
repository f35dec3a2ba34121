//! Refresh-bound snapshot cache with single-flight rebuilds.
//!
//! One [`Slot`] per collector key holds:
//! - an async gate serializing rebuilds of that key,
//! - the current [`CacheEntry`], published with an atomic pointer swap,
//! - the number of completed rebuild attempts and the last failure.
//!
//! Entry age counts from the start of the rebuild that produced it.
//!
//! A caller that finds the entry expired takes the gate. If another rebuild
//! finished while it waited, that outcome is reused; otherwise it spawns the
//! rebuild as its own task holding the gate, so an abandoned scrape cannot
//! cancel it half way.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{CollectorError, CollectorResult, UpstreamError};
use crate::join::dedupe_rows;
use crate::model::JoinedRow;

// ----------------------------------------------------------------------------
// 1. Entries & Snapshots
// ----------------------------------------------------------------------------

/// The published output of one collector rebuild. Never mutated.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: String,
    /// Rows in build order, row keys unique
    pub rows: Arc<Vec<JoinedRow>>,
    /// Monotonic time the rebuild started, used for freshness
    pub built_at: Instant,
    /// Wall-clock build time, for logs and diagnostics
    pub created: DateTime<Utc>,
    /// 1 for the first successful build of this key
    pub generation: u64,
}

impl CacheEntry {
    pub fn age(&self) -> Duration {
        self.built_at.elapsed()
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SnapshotStatus {
    /// Served from a fresh entry, or from a rebuild another caller ran
    Cached,
    /// Built by this call
    Rebuilt,
    /// Rebuild failed; the last good entry is served
    Stale,
}

/// What `get_or_build` hands back to a collector.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub entry: Arc<CacheEntry>,
    pub status: SnapshotStatus,
}

impl Snapshot {
    pub fn rows(&self) -> &[JoinedRow] {
        &self.entry.rows
    }

    pub fn is_stale(&self) -> bool {
        self.status == SnapshotStatus::Stale
    }
}

// ----------------------------------------------------------------------------
// 2. Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    rebuilds: AtomicU64,
    failures: AtomicU64,
    stale_served: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Successful rebuilds
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn stale_served(&self) -> u64 {
        self.stale_served.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ----------------------------------------------------------------------------
// 3. Slots
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Slot {
    gate: Arc<AsyncMutex<()>>,
    current: ArcSwapOption<CacheEntry>,
    /// Completed rebuild attempts, successful or not
    attempts: AtomicU64,
    /// Attempt number and error of the latest attempt, when it failed
    last_failure: Mutex<Option<(u64, CollectorError)>>,
}

impl Slot {
    /// `None` when no entry exists, it has expired, or no `ttl` is given.
    fn fresh_entry(&self, ttl: Option<Duration>) -> Option<Arc<CacheEntry>> {
        let ttl = ttl?;
        self.current.load_full().filter(|entry| entry.is_fresh(ttl))
    }

    fn failure_of(&self, attempt: u64) -> Option<CollectorError> {
        match &*self.last_failure.lock() {
            Some((n, err)) if *n == attempt => Some(err.clone()),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// 4. Store
// ----------------------------------------------------------------------------

/// Map from collector key to its cached snapshot.
#[derive(Debug)]
pub struct CacheStore {
    slots: DashMap<String, Arc<Slot>>,
    build_timeout: Duration,
    stats: Arc<CacheStats>,
}

impl CacheStore {
    pub fn new(build_timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            build_timeout,
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn build_timeout(&self) -> Duration {
        self.build_timeout
    }

    /// Current entry for `key`, fresh or not.
    pub fn peek(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.slots.get(key).and_then(|slot| slot.current.load_full())
    }

    fn slot(&self, key: &str) -> Arc<Slot> {
        if let Some(slot) = self.slots.get(key) {
            return Arc::clone(slot.value());
        }
        let slot = self.slots.entry(key.to_string()).or_default();
        Arc::clone(slot.value())
    }

    /// Return the snapshot for `key`, rebuilding it with `build` when the
    /// entry is missing or older than `ttl`.
    ///
    /// `build` runs at most once per expiry, however many callers arrive.
    /// Fails only when the rebuild fails and no previous entry exists.
    pub async fn get_or_build<F, Fut>(&self, key: &str, ttl: Duration, build: F) -> CollectorResult<Snapshot>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CollectorResult<Vec<JoinedRow>>> + Send + 'static,
    {
        self.acquire(key, Some(ttl), build).await
    }

    /// Rebuild `key` regardless of the current entry's age.
    ///
    /// A rebuild that completes while this call waits on the gate is reused.
    /// Stale-if-error applies as in [`CacheStore::get_or_build`].
    pub async fn refresh<F, Fut>(&self, key: &str, build: F) -> CollectorResult<Snapshot>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CollectorResult<Vec<JoinedRow>>> + Send + 'static,
    {
        self.acquire(key, None, build).await
    }

    /// `ttl` of `None` skips the freshness checks.
    async fn acquire<F, Fut>(&self, key: &str, ttl: Option<Duration>, build: F) -> CollectorResult<Snapshot>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CollectorResult<Vec<JoinedRow>>> + Send + 'static,
    {
        let slot = self.slot(key);

        if let Some(entry) = slot.fresh_entry(ttl) {
            CacheStats::bump(&self.stats.hits);
            return Ok(Snapshot {
                entry,
                status: SnapshotStatus::Cached,
            });
        }

        let observed = slot.attempts.load(Ordering::Acquire);
        let guard = Arc::clone(&slot.gate).lock_owned().await;

        if let Some(entry) = slot.fresh_entry(ttl) {
            CacheStats::bump(&self.stats.hits);
            return Ok(Snapshot {
                entry,
                status: SnapshotStatus::Cached,
            });
        }

        let latest = slot.attempts.load(Ordering::Acquire);
        if latest != observed {
            // Another caller's rebuild completed while this one waited.
            drop(guard);
            return match slot.failure_of(latest) {
                Some(err) => self.serve_stale(key, &slot, err, true),
                None => match slot.current.load_full() {
                    Some(entry) => {
                        CacheStats::bump(&self.stats.hits);
                        Ok(Snapshot {
                            entry,
                            status: SnapshotStatus::Cached,
                        })
                    }
                    None => Err(CollectorError::BuildAborted {
                        key: key.to_string(),
                        message: "previous rebuild published nothing".into(),
                    }),
                },
            };
        }

        CacheStats::bump(&self.stats.misses);
        let task = tokio::spawn(run_rebuild(
            key.to_string(),
            Arc::clone(&slot),
            Arc::clone(&self.stats),
            self.build_timeout,
            guard,
            build,
        ));

        match task.await {
            Ok(Ok(entry)) => Ok(Snapshot {
                entry,
                status: SnapshotStatus::Rebuilt,
            }),
            Ok(Err(err)) => self.serve_stale(key, &slot, err, false),
            Err(join_err) => {
                let err = CollectorError::BuildAborted {
                    key: key.to_string(),
                    message: join_err.to_string(),
                };
                self.serve_stale(key, &slot, err, false)
            }
        }
    }

    fn serve_stale(&self, key: &str, slot: &Slot, err: CollectorError, shared: bool) -> CollectorResult<Snapshot> {
        match slot.current.load_full() {
            Some(entry) if err.is_recoverable() => {
                CacheStats::bump(&self.stats.stale_served);
                warn!(
                    target: "exporter::cache",
                    key,
                    generation = entry.generation,
                    age_secs = entry.age().as_secs(),
                    error = %err,
                    "Rebuild failed, serving stale snapshot"
                );
                Ok(Snapshot {
                    entry,
                    status: SnapshotStatus::Stale,
                })
            }
            _ if shared => Err(CollectorError::SharedFailure {
                key: key.to_string(),
                message: err.to_string(),
            }),
            _ => Err(err),
        }
    }
}

/// Body of the spawned rebuild task. Holds the gate until the outcome is
/// recorded.
async fn run_rebuild<F, Fut>(
    key: String,
    slot: Arc<Slot>,
    stats: Arc<CacheStats>,
    build_timeout: Duration,
    _guard: OwnedMutexGuard<()>,
    build: F,
) -> CollectorResult<Arc<CacheEntry>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = CollectorResult<Vec<JoinedRow>>> + Send + 'static,
{
    let started = Instant::now();
    debug!(target: "exporter::cache", key = %key, "Rebuilding snapshot");

    let outcome = match tokio::time::timeout(build_timeout, AssertUnwindSafe(build()).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(_panic)) => Err(CollectorError::BuildAborted {
            key: key.clone(),
            message: "rebuild panicked".into(),
        }),
        Err(_elapsed) => Err(UpstreamError::timeout(
            format!("rebuild of {key}"),
            build_timeout.as_millis() as u64,
        )
        .into()),
    };

    let attempt = slot.attempts.load(Ordering::Acquire) + 1;
    let result = match outcome {
        Ok(rows) => {
            let rows = dedupe_rows(&key, rows);
            let generation = slot.current.load_full().map_or(1, |e| e.generation + 1);
            let entry = Arc::new(CacheEntry {
                key: key.clone(),
                rows: Arc::new(rows),
                built_at: started,
                created: Utc::now(),
                generation,
            });
            slot.current.store(Some(Arc::clone(&entry)));
            *slot.last_failure.lock() = None;
            CacheStats::bump(&stats.rebuilds);
            info!(
                target: "exporter::cache",
                key = %key,
                generation,
                rows = entry.rows.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Snapshot published"
            );
            Ok(entry)
        }
        Err(err) => {
            CacheStats::bump(&stats.failures);
            error!(
                target: "exporter::cache",
                key = %key,
                category = err.category(),
                error = %err,
                "Rebuild failed"
            );
            *slot.last_failure.lock() = Some((attempt, err.clone()));
            Err(err)
        }
    };
    slot.attempts.store(attempt, Ordering::Release);
    result
}
