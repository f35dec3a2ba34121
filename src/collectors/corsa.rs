//! Switch-port counters from Corsa switches, attributed to the ironic node
//! cabled to each port.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::inventory::NodeSources;
use crate::backend::{Backend, Resource};
use crate::cache::Snapshot;
use crate::collector::{push_rows_with_stat, Collector, CollectorContext};
use crate::error::CollectorResult;
use crate::exposition::{sanitize_metric_name, MetricFamily};
use crate::join::{index_by, join, last_token, FieldMap, JoinPolicy};
use crate::model::{JoinedRow, RawRecord};

pub const HELP: &str = "Corsa Port Stat Statistics";
pub const LABELS: [&str; 7] = [
    "region",
    "switch",
    "port",
    "node",
    "provision_state",
    "node_type",
    "project_name",
];

/// One configured switch and its REST client.
#[derive(Clone)]
pub struct CorsaSwitch {
    /// Matched against the port's `switch_info`
    pub name: String,
    pub backend: Arc<dyn Backend>,
}

pub struct CorsaStatsCollector {
    ctx: CollectorContext,
    sources: NodeSources,
    switches: Vec<CorsaSwitch>,
    stats: Vec<String>,
}

impl CorsaStatsCollector {
    pub const CACHE_KEY: &'static str = "corsa_stats";

    pub fn new(ctx: CollectorContext, sources: NodeSources, switches: Vec<CorsaSwitch>, stats: Vec<String>) -> Self {
        Self {
            ctx,
            sources,
            switches,
            stats,
        }
    }

    fn family_name(stat: &str) -> String {
        sanitize_metric_name(&format!("corsa_{stat}"))
    }

    /// Join one switch's port stats onto the nodes cabled to it.
    fn switch_rows(&self, switch: &str, nodes: &[JoinedRow], port_stats: &[RawRecord]) -> Vec<JoinedRow> {
        let by_port = index_by(switch, port_stats, |stat| Some(stat.id.clone()));
        let cabled: Vec<JoinedRow> = nodes
            .iter()
            .filter(|node| node.field("switch_info") == Some(switch))
            .cloned()
            .collect();

        let joined = join(
            cabled,
            &by_port,
            |node| node.field("port_id").and_then(last_token).map(str::to_string),
            &[FieldMap::same("port")],
            &JoinPolicy::DropUnmatched,
        );

        joined
            .into_iter()
            .filter_map(|mut row| {
                let port = row.field("port")?.to_string();
                let record = by_port.get(&port)?;
                let node = row.field("name").unwrap_or_default().to_string();
                row.key = format!("{switch}/{port}");
                row.set_field("switch", switch);
                row.set_field("node", node);
                for stat in &self.stats {
                    if let Some(value) = record.f64_field(stat) {
                        row.push_stat(stat, value);
                    }
                }
                Some(row)
            })
            .collect()
    }
}

#[async_trait]
impl Collector for CorsaStatsCollector {
    fn name(&self) -> &str {
        "corsa port stats"
    }

    fn cache_key(&self) -> &str {
        Self::CACHE_KEY
    }

    fn context(&self) -> &CollectorContext {
        &self.ctx
    }

    /// Any switch failing fails the whole rebuild, so the cache keeps the
    /// last snapshot that covered every switch.
    async fn build_rows(&self) -> CollectorResult<Vec<JoinedRow>> {
        let nodes = self.sources.node_details(&self.ctx.region, true).await?;
        let mut rows = Vec::new();
        for switch in &self.switches {
            let port_stats = switch.backend.list(&Resource::CORSA_PORT_STATS, &[]).await?;
            let switch_rows = self.switch_rows(&switch.name, &nodes, &port_stats);
            debug!(
                target: "exporter::collector::corsa",
                switch = %switch.name,
                ports = port_stats.len(),
                matched = switch_rows.len(),
                "Switch joined"
            );
            rows.extend(switch_rows);
        }
        Ok(rows)
    }

    fn families(&self, snapshot: &Snapshot) -> CollectorResult<Vec<MetricFamily>> {
        Ok(self
            .stats
            .iter()
            .map(|stat| {
                let mut family = MetricFamily::gauge(Self::family_name(stat), HELP, &LABELS);
                push_rows_with_stat(&mut family, snapshot.rows(), stat);
                family
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::fixtures::Testbed;
    use crate::DEFAULT_CORSA_STATS;
    use std::time::Duration;

    fn collector(testbed: &Testbed) -> Arc<CorsaStatsCollector> {
        Arc::new(CorsaStatsCollector::new(
            Testbed::context(),
            testbed.node_sources(),
            vec![CorsaSwitch {
                name: "corsa-1".into(),
                backend: testbed.corsa.clone(),
            }],
            DEFAULT_CORSA_STATS.iter().map(|s| s.to_string()).collect(),
        ))
    }

    #[tokio::test]
    async fn test_ports_attributed_to_nodes() {
        let testbed = Testbed::new();
        let rows = collector(&testbed).build_rows().await.unwrap();

        let keys: Vec<_> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["corsa-1/12", "corsa-1/13"]);
        assert_eq!(
            rows[1].label_values(&LABELS),
            vec!["r1", "corsa-1", "13", "nc02", "deploy failed", "gpu_rtx_6000", "beta"]
        );
        assert_eq!(rows[0].stat("tx_bytes"), Some(100.0));
        assert_eq!(rows[0].stat("tx_dropped"), None);
    }

    #[tokio::test]
    async fn test_render_one_family_per_stat() {
        let testbed = Testbed::new();
        let text = String::from_utf8(collector(&testbed).render(Duration::from_secs(60)).await.unwrap()).unwrap();
        assert!(text.contains("# HELP corsa_tx_bytes Corsa Port Stat Statistics\n"));
        assert!(text.contains(
            "corsa_rx_bytes{region=\"r1\",switch=\"corsa-1\",port=\"12\",node=\"nc01\",provision_state=\"active\",\
             node_type=\"compute_haswell\",project_name=\"alpha\"} 50\n"
        ));
        assert!(!text.contains("corsa_tx_dropped"));
        assert!(!text.contains("port=\"40\""));
    }

    #[tokio::test]
    async fn test_failing_switch_fails_rebuild() {
        let testbed = Testbed::new();
        testbed.corsa.set_failing(true);
        assert!(collector(&testbed).build_rows().await.is_err());
    }
}
