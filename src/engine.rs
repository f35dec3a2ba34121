//! Scrape orchestration.
//!
//! The [`Exporter`] owns the shared collector context and the configured
//! collectors. A scrape renders every collector concurrently and
//! concatenates their output in configuration order; one failing collector
//! never fails the scrape.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheStats, CacheStore};
use crate::collector::{Collector, CollectorContext};
use crate::collectors;
use crate::config::ExporterConfig;
use crate::counter::CounterAccumulator;
use crate::error::{CollectorError, ConfigError};

pub struct Exporter {
    ctx: CollectorContext,
    collectors: Vec<Arc<dyn Collector>>,
    refresh_interval: Duration,
    shutdown: watch::Sender<bool>,
    started: DateTime<Utc>,
}

impl Exporter {
    pub fn new(ctx: CollectorContext, collectors: Vec<Arc<dyn Collector>>, refresh_interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx,
            collectors,
            refresh_interval,
            shutdown,
            started: Utc::now(),
        }
    }

    /// Validate `config` and wire every enabled collector to HTTP backends.
    pub fn from_config(config: &ExporterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let ctx = CollectorContext::new(
            config.exporter.region.as_str(),
            Arc::new(CacheStore::new(config.build_timeout())),
            Arc::new(CounterAccumulator::new()),
        );
        let collectors = collectors::from_config(config, &ctx)?;
        Ok(Self::new(ctx, collectors, config.refresh_interval()))
    }

    pub fn context(&self) -> &CollectorContext {
        &self.ctx
    }

    pub fn collector_names(&self) -> Vec<&str> {
        self.collectors.iter().map(|c| c.name()).collect()
    }

    pub fn cache_stats(&self) -> &CacheStats {
        self.ctx.cache.stats()
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    /// Render every collector once, pairing each result with its name.
    async fn render_all(&self) -> Vec<(&str, Result<Vec<u8>, CollectorError>)> {
        let ttl = self.refresh_interval;
        let renders = self
            .collectors
            .iter()
            .map(|collector| async move { (collector.name(), Arc::clone(collector).render(ttl).await) });
        join_all(renders).await
    }

    /// One scrape body. Failing collectors contribute nothing.
    pub async fn scrape(&self) -> Vec<u8> {
        let started = Instant::now();
        let mut body = Vec::new();
        let mut failed = 0usize;

        for (name, result) in self.render_all().await {
            match result {
                Ok(bytes) => body.extend_from_slice(&bytes),
                Err(e) => {
                    failed += 1;
                    log_failure(name, &e);
                }
            }
        }

        debug!(
            target: "exporter::engine",
            collectors = self.collectors.len(),
            failed,
            bytes = body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scrape rendered"
        );
        body
    }

    /// Rebuild every collector's snapshot, whatever its age. Returns the
    /// number of collectors whose rebuild failed, stale or not.
    pub async fn refresh_all(&self) -> usize {
        let refreshes = self
            .collectors
            .iter()
            .map(|collector| async move { (collector.name(), Arc::clone(collector).refresh().await) });
        let mut failed = 0usize;
        for (name, result) in join_all(refreshes).await {
            match result {
                Ok(snapshot) if snapshot.is_stale() => failed += 1,
                Ok(_) => {}
                Err(e) => {
                    failed += 1;
                    log_failure(name, &e);
                }
            }
        }
        failed
    }

    /// Stop the background refresher.
    pub fn shutdown(&self) {
        info!(target: "exporter::engine", "Shutdown requested");
        self.shutdown.send_replace(true);
    }

    /// Rebuild all caches every refresh interval until [`Exporter::shutdown`].
    pub fn spawn_refresher(self: &Arc<Self>) -> JoinHandle<()> {
        let exporter = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(exporter.refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                target: "exporter::engine",
                interval_secs = exporter.refresh_interval.as_secs(),
                "Background refresher started"
            );

            loop {
                if *stop.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        let failed = exporter.refresh_all().await;
                        debug!(target: "exporter::engine", failed, "Background refresh complete");
                    }
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!(target: "exporter::engine", "Background refresher stopped");
        })
    }
}

fn log_failure(collector: &str, e: &CollectorError) {
    if e.is_recoverable() {
        warn!(target: "exporter::engine", collector, category = e.category(), error = %e, "Collector failed");
    } else {
        error!(target: "exporter::engine", collector, category = e.category(), error = %e, "Collector failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Resource;
    use crate::collectors::fixtures::Testbed;
    use crate::collectors::{launch_failures, BaremetalStatsCollector, LaunchFailuresCollector, NodeStatsCollector};

    const TTL: Duration = Duration::from_secs(300);

    fn exporter(collectors: impl FnOnce(&CollectorContext) -> Vec<Arc<dyn Collector>>) -> Exporter {
        let ctx = Testbed::context();
        let collectors = collectors(&ctx);
        Exporter::new(ctx, collectors, TTL)
    }

    fn samples(body: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(body)
            .lines()
            .filter(|line| !line.starts_with('#'))
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_unreserved_node_gets_empty_project() {
        let testbed = Testbed::new();
        let exporter = exporter(|ctx| vec![Arc::new(NodeStatsCollector::new(ctx.clone(), testbed.node_sources()))]);

        let samples = samples(&exporter.scrape().await);
        assert_eq!(samples.len(), 3);
        let unreserved: Vec<_> = samples.iter().filter(|s| s.contains("project_name=\"\"")).collect();
        assert_eq!(unreserved.len(), 1);
        assert!(unreserved[0].contains("name=\"nc03\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_scrapes_share_one_rebuild() {
        let testbed = Testbed::new();
        let exporter = exporter(|ctx| vec![Arc::new(NodeStatsCollector::new(ctx.clone(), testbed.node_sources()))]);

        exporter.scrape().await;
        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        testbed.ironic.set_delay(Duration::from_millis(200));
        let fetches = testbed.ironic.fetch_count();

        let (first, second) = tokio::join!(exporter.scrape(), exporter.scrape());
        assert_eq!(testbed.ironic.fetch_count(), fetches + 1);
        assert_eq!(first, second);
        assert_eq!(samples(&first).len(), 3);
        assert_eq!(exporter.cache_stats().rebuilds(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_counter_accumulates_across_polls() {
        let testbed = Testbed::new();
        testbed.nova.set_records(&Resource::NOVA_SERVERS, Testbed::server_items(2));
        let mut launch_failures = None;
        let exporter = exporter(|ctx| {
            let collector = Arc::new(LaunchFailuresCollector::new(ctx.clone(), testbed.node_sources(), TTL));
            launch_failures = Some(Arc::clone(&collector));
            vec![collector as Arc<dyn Collector>]
        });

        exporter.scrape().await;
        // Wall-clock time does not follow the paused runtime clock.
        launch_failures
            .unwrap()
            .set_last_poll(Some(chrono::Utc::now() - chrono::Duration::seconds(90)));
        testbed.nova.set_records(&Resource::NOVA_SERVERS, Testbed::server_items(3));
        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        let body = String::from_utf8(exporter.scrape().await).unwrap();

        let alpha = vec!["r1".to_string(), "p1".into(), "alpha".into()];
        assert_eq!(exporter.context().counters.value(launch_failures::FAMILY, &alpha), Some(5.0));
        assert!(body.contains("launch_failure{region=\"r1\",project_id=\"p1\",project_name=\"alpha\"} 5\n"));
    }

    #[tokio::test]
    async fn test_failing_collector_is_isolated() {
        let testbed = Testbed::new();
        testbed.keystone.set_failing(true);
        let exporter = exporter(|ctx| {
            vec![
                Arc::new(NodeStatsCollector::new(ctx.clone(), testbed.node_sources())),
                Arc::new(BaremetalStatsCollector::new(ctx.clone(), testbed.ironic.clone())),
            ]
        });

        let body = String::from_utf8(exporter.scrape().await).unwrap();
        assert!(!body.contains("ironic_node_totals"));
        assert!(body.contains("total_nodes{region=\"r1\"} 3\n"));
        assert_eq!(exporter.refresh_all().await, 1);
    }

    #[tokio::test]
    async fn test_output_follows_configuration_order() {
        let testbed = Testbed::new();
        let exporter = exporter(|ctx| {
            vec![
                Arc::new(BaremetalStatsCollector::new(ctx.clone(), testbed.ironic.clone())),
                Arc::new(NodeStatsCollector::new(ctx.clone(), testbed.node_sources())),
            ]
        });

        let body = String::from_utf8(exporter.scrape().await).unwrap();
        let baremetal = body.find("total_nodes{").unwrap();
        let nodes = body.find("ironic_node_totals{").unwrap();
        assert!(baremetal < nodes);
        assert_eq!(exporter.collector_names(), vec!["baremetal totals", "node inventory"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresher_warms_cache_until_shutdown() {
        let testbed = Testbed::new();
        let exporter = Arc::new(exporter(|ctx| {
            vec![Arc::new(BaremetalStatsCollector::new(ctx.clone(), testbed.ironic.clone()))]
        }));

        let handle = exporter.spawn_refresher();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(testbed.ironic.fetch_count(), 1);

        tokio::time::sleep(TTL).await;
        assert_eq!(testbed.ironic.fetch_count(), 2);

        exporter.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresher_polls_every_interval_despite_latency() {
        let testbed = Testbed::new();
        testbed.ironic.set_delay(Duration::from_millis(10));
        let exporter = Arc::new(exporter(|ctx| {
            vec![Arc::new(BaremetalStatsCollector::new(ctx.clone(), testbed.ironic.clone()))]
        }));

        let handle = exporter.spawn_refresher();
        let mut fetches = Vec::new();
        tokio::time::sleep(Duration::from_secs(1)).await;
        fetches.push(testbed.ironic.fetch_count());
        for _ in 0..3 {
            tokio::time::sleep(TTL).await;
            fetches.push(testbed.ironic.fetch_count());
        }

        assert_eq!(fetches, vec![1, 2, 3, 4]);
        exporter.shutdown();
        handle.await.unwrap();
    }

    #[test]
    fn test_from_config_rejects_invalid_config() {
        let mut config = ExporterConfig::default();
        config.exporter.refresh_interval_secs = 0;
        assert!(Exporter::from_config(&config).is_err());
    }

    #[test]
    fn test_from_config_wires_enabled_collectors() {
        let exporter = Exporter::from_config(&ExporterConfig::default()).unwrap();
        assert_eq!(exporter.context().region, "RegionOne");
        assert!(!exporter.collector_names().is_empty());
    }
}
