use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client as HttpClient;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use super::{Backend, Method, MetricSeries, Resource};
use crate::config::BackendConfig;
use crate::error::{ConfigError, UpstreamError, UpstreamResult};
use crate::join::AggregationSpec;
use crate::model::RawRecord;

/// JSON-over-HTTP backend with static token authentication.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    name: String,
    base_url: String,
    client: HttpClient,
    timeout: Duration,
}

impl HttpBackend {
    /// Build a client from one `[backends.*]` table.
    pub fn from_config(name: impl Into<String>, config: &BackendConfig) -> Result<Self, ConfigError> {
        let name = name.into();
        let field = |suffix: &str| format!("backends.{name}.{suffix}");

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let header = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| ConfigError::invalid_value(field("headers"), e.to_string()))?;
            let value =
                HeaderValue::from_str(value).map_err(|e| ConfigError::invalid_value(field("headers"), e.to_string()))?;
            headers.insert(header, value);
        }
        if let Some(token) = &config.token {
            let header = HeaderName::from_bytes(config.token_header.as_bytes())
                .map_err(|e| ConfigError::invalid_value(field("token_header"), e.to_string()))?;
            let mut value =
                HeaderValue::from_str(token).map_err(|e| ConfigError::invalid_value(field("token"), e.to_string()))?;
            value.set_sensitive(true);
            headers.insert(header, value);
        }

        let timeout = Duration::from_secs(config.timeout_secs);
        let client = HttpClient::builder()
            .timeout(timeout)
            .default_headers(headers)
            .danger_accept_invalid_certs(!config.verify_tls)
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| ConfigError::invalid_value(field("url"), e.to_string()))?;

        Ok(Self {
            name,
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn transport_error(&self, url: &str, err: reqwest::Error) -> UpstreamError {
        if err.is_timeout() {
            UpstreamError::timeout(format!("{} {}", self.name, url), self.timeout.as_millis() as u64)
        } else {
            UpstreamError::unavailable(&self.name, err.to_string())
        }
    }

    async fn fetch_json<Q>(&self, method: Method, path: &str, query: &Q) -> UpstreamResult<JsonValue>
    where
        Q: serde::Serialize + ?Sized + Sync,
    {
        let url = self.url(path);
        let request = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url).json(&json!({})),
        };

        let response = request
            .query(query)
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                backend: self.name.clone(),
                status: status.as_u16(),
                url,
            });
        }

        let body = response
            .json::<JsonValue>()
            .await
            .map_err(|e| UpstreamError::malformed(&self.name, format!("{url}: {e}")))?;
        debug!(target: "exporter::backend", backend = %self.name, url = %url, "Fetched");
        Ok(body)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self, resource: &Resource, filters: &[(&str, &str)]) -> UpstreamResult<Vec<RawRecord>> {
        let query: Vec<(&str, &str)> = resource.default_query.iter().chain(filters).copied().collect();
        let body = self.fetch_json(resource.method, resource.path, &query).await?;
        records_from_json(&self.name, resource, body)
    }

    async fn get(&self, resource: &Resource, id: &str) -> UpstreamResult<RawRecord> {
        let Some(item_path) = resource.item_path else {
            return self
                .list(resource, &[(resource.id_field, id)])
                .await?
                .into_iter()
                .find(|r| r.id == id)
                .ok_or_else(|| UpstreamError::NotFound {
                    backend: self.name.clone(),
                    id: id.to_string(),
                });
        };

        let body = self
            .fetch_json(Method::Get, &format!("{item_path}/{id}"), &[] as &[(&str, &str)])
            .await?;
        let item = match resource.item_envelope {
            Some(key) => body.get(key).cloned().ok_or_else(|| {
                UpstreamError::malformed(&self.name, format!("{} response has no '{key}'", resource.name))
            })?,
            None => body,
        };
        RawRecord::from_json(item, resource.id_field)
            .ok_or_else(|| UpstreamError::malformed(&self.name, format!("{} '{id}' has no id", resource.name)))
    }
}

#[async_trait]
impl MetricSeries for HttpBackend {
    async fn aggregate(&self, metric_ids: &[String], spec: &AggregationSpec) -> UpstreamResult<Option<f64>> {
        let granularity = spec.granularity_secs.to_string();
        let mut query: Vec<(&str, &str)> = metric_ids.iter().map(|id| ("metric", id.as_str())).collect();
        query.push(("aggregation", spec.method.as_str()));
        query.push(("granularity", granularity.as_str()));
        if let Some(fill) = &spec.fill {
            query.push(("fill", fill.as_str()));
        }

        let body = self.fetch_json(Method::Get, "v1/aggregation/metric", &query).await?;
        Ok(last_aggregate_value(&body))
    }
}

// ----------------------------------------------------------------------------
// Response parsing
// ----------------------------------------------------------------------------

/// Unwrap a listing response into records.
///
/// A missing envelope makes the whole response unusable. Individual entries
/// without an id are skipped.
pub fn records_from_json(backend: &str, resource: &Resource, body: JsonValue) -> UpstreamResult<Vec<RawRecord>> {
    let items = match resource.envelope {
        Some(key) => match body {
            JsonValue::Object(mut map) => map.remove(key),
            _ => None,
        },
        None => Some(body),
    };
    let Some(JsonValue::Array(items)) = items else {
        return Err(UpstreamError::malformed(
            backend,
            format!("{} response has no '{}' array", resource.name, resource.envelope.unwrap_or("top-level")),
        ));
    };

    let total = items.len();
    let records: Vec<RawRecord> = items
        .into_iter()
        .filter_map(|item| RawRecord::from_json(item, resource.id_field))
        .collect();
    if records.len() < total {
        warn!(
            target: "exporter::backend",
            backend,
            resource = resource.name,
            skipped = total - records.len(),
            "Records without an id skipped"
        );
    }
    Ok(records)
}

/// Value of the last measure in a gnocchi aggregation response
/// (`[[timestamp, granularity, value], ...]`).
pub fn last_aggregate_value(body: &JsonValue) -> Option<f64> {
    body.as_array()?.last()?.as_array()?.last()?.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_records_from_enveloped_listing() {
        let body = json!({"nodes": [
            {"uuid": "n1", "name": "nc01"},
            {"name": "no-id"},
            {"uuid": "n2", "name": "nc02"},
        ]});
        let records = records_from_json("ironic", &Resource::IRONIC_NODES, body).unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["n1", "n2"]);
    }

    #[test]
    fn test_records_from_bare_array() {
        let body = json!([{"id": "r1", "metrics": {"gpu0.util": "m1"}}]);
        let records = records_from_json("gnocchi", &Resource::GNOCCHI_CUDA_RESOURCES, body).unwrap();
        assert_eq!(records[0].str_at(&["metrics", "gpu0.util"]).as_deref(), Some("m1"));
    }

    #[test]
    fn test_missing_envelope_is_malformed() {
        let err = records_from_json("nova", &Resource::NOVA_AGGREGATES, json!({"error": "x"})).unwrap_err();
        assert!(matches!(err, UpstreamError::Malformed { .. }));
        let err = records_from_json("nova", &Resource::NOVA_AGGREGATES, json!([])).unwrap_err();
        assert!(matches!(err, UpstreamError::Malformed { .. }));
    }

    #[test]
    fn test_last_aggregate_value() {
        let body = json!([
            ["2024-01-01T00:00:00+00:00", 60.0, 12.0],
            ["2024-01-01T00:01:00+00:00", 60.0, 87.5],
        ]);
        assert_eq!(last_aggregate_value(&body), Some(87.5));
        assert_eq!(last_aggregate_value(&json!([])), None);
        assert_eq!(last_aggregate_value(&json!([["t", 60.0, null]])), None);
    }

    #[test]
    fn test_from_config_rejects_bad_header() {
        let config = BackendConfig {
            url: "http://ironic:6385/".into(),
            headers: BTreeMap::from([("bad header".to_string(), "1".to_string())]),
            ..BackendConfig::default()
        };
        assert!(HttpBackend::from_config("baremetal", &config).is_err());
    }

    #[test]
    fn test_url_joining() {
        let config = BackendConfig {
            url: "http://ironic:6385/".into(),
            token: Some("secret".into()),
            ..BackendConfig::default()
        };
        let backend = HttpBackend::from_config("baremetal", &config).unwrap();
        assert_eq!(backend.url("v1/nodes/detail"), "http://ironic:6385/v1/nodes/detail");
        assert_eq!(backend.url("/os-hosts"), "http://ironic:6385/os-hosts");
    }
}
