//! Backend clients.
//!
//! A backend is anything that can list and fetch [`RawRecord`]s for a
//! [`Resource`]. Collectors receive backends as trait objects at
//! construction, so the HTTP client and the in-memory [`StaticBackend`] are
//! interchangeable.

mod http;
mod memory;
mod resource;

pub use http::{last_aggregate_value, records_from_json, HttpBackend};
pub use memory::StaticBackend;
pub use resource::{Method, Resource};

use async_trait::async_trait;

use crate::error::UpstreamResult;
use crate::join::AggregationSpec;
use crate::model::RawRecord;

/// Record source for one upstream service.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Service name used in errors and logs (`ironic`, `nova`, `corsa-1`, ...)
    fn name(&self) -> &str;

    /// All records of `resource` matching `filters`, in upstream order.
    async fn list(&self, resource: &Resource, filters: &[(&str, &str)]) -> UpstreamResult<Vec<RawRecord>>;

    /// One record by id.
    async fn get(&self, resource: &Resource, id: &str) -> UpstreamResult<RawRecord>;
}

/// A backend that also serves aggregated metric series.
#[async_trait]
pub trait MetricSeries: Backend {
    /// Aggregate the latest measures of `metric_ids` into one value.
    /// `None` when the series have no measures.
    async fn aggregate(&self, metric_ids: &[String], spec: &AggregationSpec) -> UpstreamResult<Option<f64>>;
}
