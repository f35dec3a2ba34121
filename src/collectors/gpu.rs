//! GPU utilisation from the metric service.
//!
//! CUDA resources are keyed by hypervisor hostname. Only resources whose
//! blazar host is flagged `gpu.gpu` are kept (their node type becomes the
//! `gpu_type` label). Each metric name like `gpu1.utilization` splits into a
//! GPU index (`1`) and a stat name (`utilization`); metric ids sharing
//! `(gpu_type, stat, index)` are aggregated in one query.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::backend::{Backend, MetricSeries, Resource};
use crate::cache::Snapshot;
use crate::collector::{push_rows_with_stat, Collector, CollectorContext};
use crate::error::CollectorResult;
use crate::exposition::MetricFamily;
use crate::join::{first_number, group_by, index_by, join, last_segment, AggregationSpec, FieldMap, JoinPolicy};
use crate::model::{JoinedRow, RawRecord};

pub const FAMILY: &str = "gnocchi_gpu_stats";
pub const HELP: &str = "Gnocchi GPU statistics";
pub const LABELS: [&str; 4] = ["region", "stat_name", "gpu_type", "gpu_index"];
const VALUE: &str = "value";

/// One metric id of one GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
struct GpuMetric {
    gpu_type: String,
    stat_name: String,
    gpu_index: String,
    resource: String,
    metric_id: String,
}

pub struct GpuStatsCollector {
    ctx: CollectorContext,
    blazar: Arc<dyn Backend>,
    gnocchi: Arc<dyn MetricSeries>,
    spec: AggregationSpec,
}

impl GpuStatsCollector {
    pub const CACHE_KEY: &'static str = "gpu_stats";

    pub fn new(
        ctx: CollectorContext,
        blazar: Arc<dyn Backend>,
        gnocchi: Arc<dyn MetricSeries>,
        spec: AggregationSpec,
    ) -> Self {
        Self {
            ctx,
            blazar,
            gnocchi,
            spec,
        }
    }
}

/// Blazar capability flags arrive as strings (`"True"`, `"False"`).
fn flag_is_set(record: &RawRecord, key: &str) -> bool {
    match record.get(key) {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::String(s)) => matches!(s.to_lowercase().as_str(), "true" | "yes" | "1"),
        Some(JsonValue::Number(n)) => n.as_f64().map_or(false, |v| v != 0.0),
        _ => false,
    }
}

/// Correlate CUDA resources with GPU hosts and split their metrics.
fn gpu_metrics(hosts: &[RawRecord], resources: &[RawRecord]) -> Vec<GpuMetric> {
    let gpu_hosts: Vec<RawRecord> = hosts.iter().filter(|h| flag_is_set(h, "gpu.gpu")).cloned().collect();
    let by_hostname = index_by("gpu hosts", &gpu_hosts, |h| h.str_field("hypervisor_hostname"));
    let by_id: HashMap<&str, &RawRecord> = resources.iter().map(|r| (r.id.as_str(), r)).collect();

    let rows: Vec<JoinedRow> = resources.iter().map(|r| JoinedRow::new(r.id.as_str())).collect();
    let typed = join(
        rows,
        &by_hostname,
        |row| Some(row.key.clone()),
        &[FieldMap::new("node_type", "gpu_type")],
        &JoinPolicy::DropUnmatched,
    );

    let mut metrics = Vec::new();
    for row in typed {
        let Some(resource) = by_id.get(row.key.as_str()) else {
            continue;
        };
        let gpu_type = row.field("gpu_type").unwrap_or_default().to_string();
        let Some(series) = resource.get("metrics").and_then(JsonValue::as_object) else {
            continue;
        };
        for (name, id) in series {
            let Some(gpu_index) = first_number(name) else {
                debug!(target: "exporter::collector::gpu", metric = %name, "Metric without GPU index skipped");
                continue;
            };
            let Some(metric_id) = id.as_str() else {
                continue;
            };
            metrics.push(GpuMetric {
                gpu_type: gpu_type.clone(),
                stat_name: last_segment(name).to_string(),
                gpu_index: gpu_index.to_string(),
                resource: resource.id.clone(),
                metric_id: metric_id.to_string(),
            });
        }
    }
    metrics
}

/// Distinct `(resource, gpu index)` pairs per GPU type.
fn gpu_counts(metrics: &[GpuMetric]) -> BTreeMap<&str, usize> {
    let mut gpus: BTreeMap<&str, BTreeSet<(&str, &str)>> = BTreeMap::new();
    for metric in metrics {
        gpus.entry(metric.gpu_type.as_str())
            .or_default()
            .insert((metric.resource.as_str(), metric.gpu_index.as_str()));
    }
    gpus.into_iter().map(|(gpu_type, set)| (gpu_type, set.len())).collect()
}

#[async_trait]
impl Collector for GpuStatsCollector {
    fn name(&self) -> &str {
        "gpu stats"
    }

    fn cache_key(&self) -> &str {
        Self::CACHE_KEY
    }

    fn context(&self) -> &CollectorContext {
        &self.ctx
    }

    async fn build_rows(&self) -> CollectorResult<Vec<JoinedRow>> {
        let (hosts, resources) = tokio::try_join!(
            self.blazar.list(&Resource::BLAZAR_HOSTS, &[]),
            self.gnocchi.list(&Resource::GNOCCHI_CUDA_RESOURCES, &[]),
        )?;
        let metrics = gpu_metrics(&hosts, &resources);

        let groups = group_by(metrics.iter(), |m| {
            Some((m.gpu_type.clone(), m.stat_name.clone(), m.gpu_index.clone()))
        });
        let queries = groups.iter().map(|(key, members)| {
            let ids: Vec<String> = members.iter().map(|m| m.metric_id.clone()).collect();
            async move { self.gnocchi.aggregate(&ids, &self.spec).await.map(|value| (key, value)) }
        });
        let aggregates = try_join_all(queries).await?;

        let mut rows = Vec::with_capacity(aggregates.len());
        for ((gpu_type, stat_name, gpu_index), value) in aggregates {
            let Some(value) = value else {
                debug!(target: "exporter::collector::gpu", gpu_type = %gpu_type, stat = %stat_name, gpu = %gpu_index, "No measures");
                continue;
            };
            rows.push(
                self.ctx
                    .row(format!("{gpu_type}/{stat_name}/{gpu_index}"))
                    .with_field("stat_name", stat_name.as_str())
                    .with_field("gpu_type", gpu_type.as_str())
                    .with_field("gpu_index", gpu_index.as_str())
                    .with_stat(VALUE, value),
            );
        }

        for (gpu_type, count) in gpu_counts(&metrics) {
            rows.push(
                self.ctx
                    .row(format!("{gpu_type}/gpu_count"))
                    .with_field("stat_name", "gpu_count")
                    .with_field("gpu_type", gpu_type)
                    .with_field("gpu_index", "")
                    .with_stat(VALUE, count as f64),
            );
        }
        Ok(rows)
    }

    fn families(&self, snapshot: &Snapshot) -> CollectorResult<Vec<MetricFamily>> {
        let mut family = MetricFamily::gauge(FAMILY, HELP, &LABELS);
        push_rows_with_stat(&mut family, snapshot.rows(), VALUE);
        Ok(vec![family])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::fixtures::Testbed;
    use crate::join::Aggregation;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn collector(testbed: &Testbed) -> Arc<GpuStatsCollector> {
        Arc::new(GpuStatsCollector::new(
            Testbed::context(),
            testbed.blazar.clone(),
            testbed.metric_series(),
            AggregationSpec::new(Aggregation::Max, 60),
        ))
    }

    #[tokio::test]
    async fn test_rows_per_gpu_and_counts() {
        let testbed = Testbed::new();
        let rows = collector(&testbed).build_rows().await.unwrap();

        let projected: Vec<_> = rows
            .iter()
            .map(|r| (r.label_values(&LABELS[1..]), r.stat(VALUE).unwrap()))
            .collect();
        assert_eq!(
            projected,
            vec![
                (vec!["memory_used".to_string(), "gpu_rtx_6000".into(), "0".into()], 512.0),
                (vec!["utilization".to_string(), "gpu_rtx_6000".into(), "0".into()], 80.0),
                (vec!["utilization".to_string(), "gpu_rtx_6000".into(), "1".into()], 20.0),
                (vec!["gpu_count".to_string(), "gpu_rtx_6000".into(), "".into()], 2.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_render_family() {
        let testbed = Testbed::new();
        let text = String::from_utf8(collector(&testbed).render(Duration::from_secs(60)).await.unwrap()).unwrap();
        assert!(text.contains("# TYPE gnocchi_gpu_stats gauge\n"));
        assert!(text.contains(
            "gnocchi_gpu_stats{region=\"r1\",stat_name=\"utilization\",gpu_type=\"gpu_rtx_6000\",gpu_index=\"1\"} 20\n"
        ));
        assert!(!text.contains("driver_version"));
    }

    #[test]
    fn test_flag_parsing() {
        let record = RawRecord::from_json(
            serde_json::json!({"id": "h", "a": "True", "b": "False", "c": true, "d": 0}),
            "id",
        )
        .unwrap();
        assert!(flag_is_set(&record, "a"));
        assert!(!flag_is_set(&record, "b"));
        assert!(flag_is_set(&record, "c"));
        assert!(!flag_is_set(&record, "d"));
        assert!(!flag_is_set(&record, "missing"));
    }
}
