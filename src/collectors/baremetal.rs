use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::{Backend, Resource};
use crate::cache::Snapshot;
use crate::collector::{Collector, CollectorContext};
use crate::error::CollectorResult;
use crate::exposition::MetricFamily;
use crate::model::JoinedRow;

pub const HELP: &str = "OpenStack Baremetal statistic";
pub const STATS: [&str; 3] = ["total_nodes", "provisioned_nodes", "maintenance_mode_nodes"];

/// Region-wide node totals: all, provisioned (`active`), in maintenance.
pub struct BaremetalStatsCollector {
    ctx: CollectorContext,
    ironic: Arc<dyn Backend>,
}

impl BaremetalStatsCollector {
    pub const CACHE_KEY: &'static str = "baremetal_stats";

    pub fn new(ctx: CollectorContext, ironic: Arc<dyn Backend>) -> Self {
        Self { ctx, ironic }
    }
}

#[async_trait]
impl Collector for BaremetalStatsCollector {
    fn name(&self) -> &str {
        "baremetal totals"
    }

    fn cache_key(&self) -> &str {
        Self::CACHE_KEY
    }

    fn context(&self) -> &CollectorContext {
        &self.ctx
    }

    async fn build_rows(&self) -> CollectorResult<Vec<JoinedRow>> {
        let nodes = self.ironic.list(&Resource::IRONIC_NODES, &[]).await?;
        Ok(nodes
            .iter()
            .map(|node| {
                let provisioned = node.str_field("provision_state").as_deref() == Some("active");
                let maintenance = node.bool_field("maintenance").unwrap_or(false);
                let mut row = self.ctx.row(node.id.as_str());
                row.set_opt_field("name", node.str_field("name"));
                row.with_stat("total_nodes", 1.0)
                    .with_stat("provisioned_nodes", f64::from(u8::from(provisioned)))
                    .with_stat("maintenance_mode_nodes", f64::from(u8::from(maintenance)))
            })
            .collect())
    }

    fn families(&self, snapshot: &Snapshot) -> CollectorResult<Vec<MetricFamily>> {
        Ok(STATS
            .iter()
            .map(|stat| {
                let mut family = MetricFamily::gauge(*stat, HELP, &["region"]);
                let total: f64 = snapshot.rows().iter().filter_map(|row| row.stat(stat)).sum();
                family.push(vec![self.ctx.region.clone()], total);
                family
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::fixtures::Testbed;
    use std::time::Duration;

    #[tokio::test]
    async fn test_totals_are_summed_per_region() {
        let testbed = Testbed::new();
        let collector = Arc::new(BaremetalStatsCollector::new(Testbed::context(), testbed.ironic.clone()));

        let text = String::from_utf8(collector.render(Duration::from_secs(300)).await.unwrap()).unwrap();
        assert!(text.contains("# HELP total_nodes OpenStack Baremetal statistic\n"));
        assert!(text.contains("total_nodes{region=\"r1\"} 3\n"));
        assert!(text.contains("provisioned_nodes{region=\"r1\"} 1\n"));
        assert!(text.contains("maintenance_mode_nodes{region=\"r1\"} 1\n"));
    }
}
