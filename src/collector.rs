//! The collector contract.
//!
//! A collector owns one reporting concern. It knows how to fetch and join its
//! rows ([`Collector::build_rows`]) and how to project a snapshot onto metric
//! families ([`Collector::families`]). Caching, single-flight and rendering
//! are shared and live in the default [`Collector::render`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cache::{CacheStore, Snapshot, SnapshotStatus};
use crate::counter::CounterAccumulator;
use crate::error::CollectorResult;
use crate::exposition::{MetricExposer, MetricFamily};
use crate::model::JoinedRow;

// ----------------------------------------------------------------------------
// 1. Shared Context
// ----------------------------------------------------------------------------

/// Engine services handed to every collector at construction.
#[derive(Debug, Clone)]
pub struct CollectorContext {
    /// Value of the `region` label on every sample
    pub region: String,
    /// Snapshot cache shared by all collectors
    pub cache: Arc<CacheStore>,
    /// Process-lifetime counters for failure-style collectors
    pub counters: Arc<CounterAccumulator>,
    pub exposer: MetricExposer,
}

impl CollectorContext {
    pub fn new(region: impl Into<String>, cache: Arc<CacheStore>, counters: Arc<CounterAccumulator>) -> Self {
        Self {
            region: region.into(),
            cache,
            counters,
            exposer: MetricExposer::new(),
        }
    }

    /// A new row carrying the region label.
    pub fn row(&self, key: impl Into<String>) -> JoinedRow {
        JoinedRow::new(key).with_field("region", self.region.as_str())
    }
}

// ----------------------------------------------------------------------------
// 2. Collector Trait
// ----------------------------------------------------------------------------

#[async_trait]
pub trait Collector: Send + Sync + 'static {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Key of this collector's entry in the [`CacheStore`]. Unique per
    /// collector instance.
    fn cache_key(&self) -> &str;

    fn context(&self) -> &CollectorContext;

    /// Fetch from the backends and join into rows.
    ///
    /// Runs only on a cache miss. Failure-style collectors record their
    /// counter increments here, so a cache hit can never count twice.
    async fn build_rows(&self) -> CollectorResult<Vec<JoinedRow>>;

    /// Project a snapshot onto the families this collector exposes.
    fn families(&self, snapshot: &Snapshot) -> CollectorResult<Vec<MetricFamily>>;

    /// Rebuild the snapshot now, whatever its age. Used by the background
    /// refresher so each tick starts a new poll.
    async fn refresh(self: Arc<Self>) -> CollectorResult<Snapshot> {
        let ctx = self.context().clone();
        let builder = Arc::clone(&self);
        ctx.cache
            .refresh(self.cache_key(), move || async move { builder.build_rows().await })
            .await
    }

    /// Fetch or reuse the snapshot, then render it.
    async fn render(self: Arc<Self>, ttl: Duration) -> CollectorResult<Vec<u8>> {
        let started = Instant::now();
        let ctx = self.context().clone();
        let builder = Arc::clone(&self);

        let snapshot = ctx
            .cache
            .get_or_build(self.cache_key(), ttl, move || async move { builder.build_rows().await })
            .await?;

        if snapshot.status == SnapshotStatus::Stale {
            warn!(
                target: "exporter::collector",
                collector = self.name(),
                generation = snapshot.entry.generation,
                built = %snapshot.entry.created,
                "Rendering stale snapshot"
            );
        }

        let families = self.families(&snapshot)?;
        let bytes = ctx.exposer.render(&families)?;

        debug!(
            target: "exporter::collector",
            collector = self.name(),
            status = ?snapshot.status,
            rows = snapshot.rows().len(),
            families = families.len(),
            bytes = bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Collector rendered"
        );
        Ok(bytes)
    }
}

// ----------------------------------------------------------------------------
// 3. Projection Helpers
// ----------------------------------------------------------------------------

/// One sample per row carrying `stat`, labeled by the family's declared names.
pub fn push_rows_with_stat(family: &mut MetricFamily, rows: &[JoinedRow], stat: &str) {
    for row in rows {
        if let Some(value) = row.stat(stat) {
            let labels = row.label_values(&family.label_names);
            family.push(labels, value);
        }
    }
}

/// One sample per row, value from `value_fn`; rows yielding `None` are skipped.
pub fn push_rows<F>(family: &mut MetricFamily, rows: &[JoinedRow], value_fn: F)
where
    F: Fn(&JoinedRow) -> Option<f64>,
{
    for row in rows {
        if let Some(value) = value_fn(row) {
            let labels = row.label_values(&family.label_names);
            family.push(labels, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CollectorError, UpstreamError};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Fixed {
        ctx: CollectorContext,
        builds: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Collector for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn cache_key(&self) -> &str {
            "fixed"
        }

        fn context(&self) -> &CollectorContext {
            &self.ctx
        }

        async fn build_rows(&self) -> CollectorResult<Vec<JoinedRow>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(UpstreamError::unavailable("static", "down").into());
            }
            Ok(vec![
                self.ctx.row("a").with_field("name", "a").with_stat("up", 1.0),
                self.ctx.row("b").with_stat("up", 0.0),
            ])
        }

        fn families(&self, snapshot: &Snapshot) -> CollectorResult<Vec<MetricFamily>> {
            let mut family = MetricFamily::gauge("fixed_up", "Fixed", &["region", "name"]);
            push_rows_with_stat(&mut family, snapshot.rows(), "up");
            Ok(vec![family])
        }
    }

    fn fixed(fail: bool) -> Arc<Fixed> {
        let ctx = CollectorContext::new(
            "r1",
            Arc::new(CacheStore::new(Duration::from_secs(5))),
            Arc::new(CounterAccumulator::new()),
        );
        Arc::new(Fixed {
            ctx,
            builds: AtomicUsize::new(0),
            fail: AtomicBool::new(fail),
        })
    }

    #[tokio::test]
    async fn test_render_uses_cache_between_scrapes() {
        let collector = fixed(false);
        let ttl = Duration::from_secs(60);

        let first = Arc::clone(&collector).render(ttl).await.unwrap();
        let second = Arc::clone(&collector).render(ttl).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(collector.builds.load(Ordering::SeqCst), 1);
        let text = String::from_utf8(first).unwrap();
        assert!(text.contains("fixed_up{region=\"r1\",name=\"a\"} 1\n"));
        assert!(text.contains("fixed_up{region=\"r1\",name=\"\"} 0\n"));
    }

    #[tokio::test]
    async fn test_render_propagates_without_snapshot() {
        let collector = fixed(true);
        let err = collector.render(Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, CollectorError::Upstream(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_serves_last_snapshot_when_upstream_fails() {
        let collector = fixed(false);
        let ttl = Duration::from_secs(60);

        let good = Arc::clone(&collector).render(ttl).await.unwrap();
        tokio::time::advance(ttl + Duration::from_secs(1)).await;
        collector.fail.store(true, Ordering::SeqCst);
        let stale = Arc::clone(&collector).render(ttl).await.unwrap();

        assert_eq!(good, stale);
        assert_eq!(collector.builds.load(Ordering::SeqCst), 2);
        assert_eq!(collector.ctx.cache.stats().stale_served(), 1);
    }

    #[tokio::test]
    async fn test_refresh_ignores_fresh_entry() {
        let collector = fixed(false);
        let ttl = Duration::from_secs(60);

        Arc::clone(&collector).render(ttl).await.unwrap();
        let snapshot = Arc::clone(&collector).refresh().await.unwrap();

        assert_eq!(snapshot.status, SnapshotStatus::Rebuilt);
        assert_eq!(snapshot.entry.generation, 2);
        assert_eq!(collector.builds.load(Ordering::SeqCst), 2);
    }
}
