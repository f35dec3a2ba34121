use async_trait::async_trait;

use super::inventory::NodeSources;
use crate::cache::Snapshot;
use crate::collector::{push_rows, Collector, CollectorContext};
use crate::error::CollectorResult;
use crate::exposition::MetricFamily;
use crate::model::JoinedRow;

pub const FAMILY: &str = "ironic_node_totals";
pub const HELP: &str = "OpenStack Ironic Nodes statistic";
pub const LABELS: [&str; 6] = ["region", "name", "maintenance", "provision_state", "node_type", "project_name"];

/// One `ironic_node_totals` sample per node, labeled with its reservation
/// and node type.
pub struct NodeStatsCollector {
    ctx: CollectorContext,
    sources: NodeSources,
}

impl NodeStatsCollector {
    pub const CACHE_KEY: &'static str = "node_stats";

    pub fn new(ctx: CollectorContext, sources: NodeSources) -> Self {
        Self { ctx, sources }
    }
}

#[async_trait]
impl Collector for NodeStatsCollector {
    fn name(&self) -> &str {
        "node inventory"
    }

    fn cache_key(&self) -> &str {
        Self::CACHE_KEY
    }

    fn context(&self) -> &CollectorContext {
        &self.ctx
    }

    async fn build_rows(&self) -> CollectorResult<Vec<JoinedRow>> {
        Ok(self.sources.node_details(&self.ctx.region, false).await?)
    }

    fn families(&self, snapshot: &Snapshot) -> CollectorResult<Vec<MetricFamily>> {
        let mut family = MetricFamily::gauge(FAMILY, HELP, &LABELS);
        push_rows(&mut family, snapshot.rows(), |_| Some(1.0));
        Ok(vec![family])
    }
}
