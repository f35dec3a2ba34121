use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;

use super::{Backend, MetricSeries, Resource};
use crate::error::{UpstreamError, UpstreamResult};
use crate::join::AggregationSpec;
use crate::model::RawRecord;

/// In-memory backend holding fixed records per resource.
///
/// Counts every fetch and can inject latency or failures. Stands in for real
/// services in collector and engine tests.
#[derive(Debug, Default)]
pub struct StaticBackend {
    name: String,
    records: RwLock<HashMap<&'static str, Vec<RawRecord>>>,
    /// Latest measure per metric id
    measures: RwLock<HashMap<String, f64>>,
    fetches: AtomicUsize,
    delay: RwLock<Duration>,
    failing: AtomicBool,
}

impl StaticBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builder-style [`StaticBackend::set_records`].
    pub fn with_records(self, resource: &Resource, items: Vec<JsonValue>) -> Self {
        self.set_records(resource, items);
        self
    }

    /// Replace the records of `resource`. Items without an id are dropped.
    pub fn set_records(&self, resource: &Resource, items: Vec<JsonValue>) {
        let records = items
            .into_iter()
            .filter_map(|item| RawRecord::from_json(item, resource.id_field))
            .collect();
        self.records.write().insert(resource.path, records);
    }

    pub fn with_measure(self, metric_id: impl Into<String>, value: f64) -> Self {
        self.measures.write().insert(metric_id.into(), value);
        self
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.write() = delay;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of list, get and aggregate calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    async fn begin_fetch(&self, what: &str) -> UpstreamResult<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::unavailable(&self.name, format!("{what}: injected failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for StaticBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self, resource: &Resource, filters: &[(&str, &str)]) -> UpstreamResult<Vec<RawRecord>> {
        self.begin_fetch(resource.name).await?;
        let records = self.records.read();
        let Some(stored) = records.get(resource.path) else {
            return Err(UpstreamError::malformed(
                &self.name,
                format!("{} response has no '{}' array", resource.name, resource.envelope.unwrap_or("top-level")),
            ));
        };
        Ok(stored
            .iter()
            .filter(|record| {
                filters
                    .iter()
                    .all(|(key, value)| record.str_field(key).as_deref() == Some(*value))
            })
            .cloned()
            .collect())
    }

    async fn get(&self, resource: &Resource, id: &str) -> UpstreamResult<RawRecord> {
        self.begin_fetch(resource.name).await?;
        self.records
            .read()
            .get(resource.path)
            .and_then(|records| records.iter().find(|r| r.id == id).cloned())
            .ok_or_else(|| UpstreamError::NotFound {
                backend: self.name.clone(),
                id: id.to_string(),
            })
    }
}

#[async_trait]
impl MetricSeries for StaticBackend {
    async fn aggregate(&self, metric_ids: &[String], spec: &AggregationSpec) -> UpstreamResult<Option<f64>> {
        self.begin_fetch("aggregation").await?;
        let measures = self.measures.read();
        let values: Vec<f64> = metric_ids.iter().filter_map(|id| measures.get(id).copied()).collect();
        Ok(spec.method.reduce(&values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::Aggregation;
    use serde_json::json;

    fn ironic() -> StaticBackend {
        StaticBackend::new("ironic").with_records(
            &Resource::IRONIC_NODES,
            vec![
                json!({"uuid": "n1", "name": "nc01", "provision_state": "active"}),
                json!({"uuid": "n2", "name": "nc02", "provision_state": "available"}),
            ],
        )
    }

    #[tokio::test]
    async fn test_list_applies_filters_and_counts() {
        let backend = ironic();
        let all = backend.list(&Resource::IRONIC_NODES, &[]).await.unwrap();
        let active = backend
            .list(&Resource::IRONIC_NODES, &[("provision_state", "active")])
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(active.len(), 1);
        assert_eq!(backend.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_unset_resource_is_malformed() {
        let err = ironic().list(&Resource::IRONIC_PORTS, &[]).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_get_and_failure_toggle() {
        let backend = ironic();
        assert_eq!(backend.get(&Resource::IRONIC_NODES, "n2").await.unwrap().id, "n2");
        assert!(matches!(
            backend.get(&Resource::IRONIC_NODES, "n9").await,
            Err(UpstreamError::NotFound { .. })
        ));

        backend.set_failing(true);
        assert!(matches!(
            backend.list(&Resource::IRONIC_NODES, &[]).await,
            Err(UpstreamError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_aggregate_reduces_known_measures() {
        let backend = StaticBackend::new("gnocchi").with_measure("m1", 40.0).with_measure("m2", 90.0);
        let spec = AggregationSpec::new(Aggregation::Max, 60);
        let ids = vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];
        assert_eq!(backend.aggregate(&ids, &spec).await.unwrap(), Some(90.0));
        assert_eq!(backend.aggregate(&["m3".to_string()], &spec).await.unwrap(), None);
    }
}
