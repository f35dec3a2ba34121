//! Rendering of labeled samples into the Prometheus text exposition format.
//!
//! Families are assembled as `prometheus` protobuf models and written with
//! the crate's `TextEncoder`, which keeps label pairs in the order given. The
//! declared label order of a family is therefore the order on the wire.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use prometheus::proto;
use prometheus::{Encoder, TextEncoder};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::error::RenderError;

/// `Content-Type` of rendered output.
pub const CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

static METRIC_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").expect("static regex"));
static LABEL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("static regex"));
static INVALID_NAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_:]").expect("static regex"));

// ----------------------------------------------------------------------------
// 1. Names
// ----------------------------------------------------------------------------

/// Map an arbitrary string onto the metric-name character set.
///
/// Collectors call this on any name segment taken from upstream data.
pub fn sanitize_metric_name(raw: &str) -> String {
    let mut name = INVALID_NAME_CHARS.replace_all(raw, "_").into_owned();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

pub fn is_valid_metric_name(name: &str) -> bool {
    METRIC_NAME.is_match(name)
}

pub fn is_valid_label_name(name: &str) -> bool {
    LABEL_NAME.is_match(name) && !name.starts_with("__")
}

// ----------------------------------------------------------------------------
// 2. Families & Samples
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    fn proto_type(&self) -> proto::MetricType {
        match self {
            MetricKind::Gauge => proto::MetricType::GAUGE,
            MetricKind::Counter => proto::MetricType::COUNTER,
        }
    }
}

/// One sample: label values in the family's declared order, plus a value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub labels: Vec<String>,
    pub value: f64,
}

/// A metric family ready for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub label_names: Vec<String>,
    pub samples: Vec<Sample>,
}

impl MetricFamily {
    pub fn new(name: impl Into<String>, help: impl Into<String>, kind: MetricKind, label_names: &[&str]) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind,
            label_names: label_names.iter().map(|l| l.to_string()).collect(),
            samples: Vec::new(),
        }
    }

    pub fn gauge(name: impl Into<String>, help: impl Into<String>, label_names: &[&str]) -> Self {
        Self::new(name, help, MetricKind::Gauge, label_names)
    }

    pub fn push(&mut self, labels: Vec<String>, value: f64) {
        self.samples.push(Sample { labels, value });
    }

    /// Check names and that every sample matches the declared arity.
    pub fn validate(&self) -> Result<(), RenderError> {
        if !is_valid_metric_name(&self.name) {
            return Err(RenderError::InvalidFamilyName {
                name: self.name.clone(),
            });
        }
        if let Some(label) = self.label_names.iter().find(|l| !is_valid_label_name(l)) {
            return Err(RenderError::InvalidLabelName {
                family: self.name.clone(),
                label: label.clone(),
            });
        }
        let expected = self.label_names.len();
        if let Some(sample) = self.samples.iter().find(|s| s.labels.len() != expected) {
            return Err(RenderError::LabelArity {
                family: self.name.clone(),
                expected,
                actual: sample.labels.len(),
            });
        }
        Ok(())
    }

    /// Build the protobuf model. A repeated label vector keeps its first
    /// position and takes the last value.
    fn to_proto(&self) -> proto::MetricFamily {
        let mut positions: HashMap<&[String], usize> = HashMap::with_capacity(self.samples.len());
        let mut unique: Vec<&Sample> = Vec::with_capacity(self.samples.len());
        for sample in &self.samples {
            match positions.get(sample.labels.as_slice()) {
                Some(&pos) => {
                    debug!(target: "exporter::exposition", family = %self.name, labels = ?sample.labels, "Repeated label vector, last value wins");
                    unique[pos] = sample;
                }
                None => {
                    positions.insert(sample.labels.as_slice(), unique.len());
                    unique.push(sample);
                }
            }
        }

        let mut family = proto::MetricFamily::default();
        family.set_name(self.name.clone());
        family.set_help(self.help.clone());
        family.set_field_type(self.kind.proto_type());

        for sample in unique {
            let mut metric = proto::Metric::default();
            for (name, value) in self.label_names.iter().zip(&sample.labels) {
                let mut pair = proto::LabelPair::default();
                pair.set_name(name.clone());
                pair.set_value(value.clone());
                metric.mut_label().push(pair);
            }
            match self.kind {
                MetricKind::Gauge => {
                    let mut gauge = proto::Gauge::default();
                    gauge.set_value(sample.value);
                    metric.set_gauge(gauge);
                }
                MetricKind::Counter => {
                    let mut counter = proto::Counter::default();
                    counter.set_value(sample.value);
                    metric.set_counter(counter);
                }
            }
            family.mut_metric().push(metric);
        }
        family
    }
}

// ----------------------------------------------------------------------------
// 3. Exposer
// ----------------------------------------------------------------------------

/// Renders metric families to exposition bytes.
///
/// Output is deterministic: families and samples appear in input order,
/// families without samples are omitted.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricExposer;

impl MetricExposer {
    pub fn new() -> Self {
        Self
    }

    pub fn render(&self, families: &[MetricFamily]) -> Result<Vec<u8>, RenderError> {
        let mut seen = HashSet::with_capacity(families.len());
        let mut protos = Vec::with_capacity(families.len());

        for family in families {
            family.validate()?;
            if !seen.insert(family.name.as_str()) {
                return Err(RenderError::DuplicateFamily {
                    family: family.name.clone(),
                });
            }
            if family.samples.is_empty() {
                continue;
            }
            protos.push(family.to_proto());
        }

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&protos, &mut buffer)
            .map_err(|e| RenderError::Encoding {
                message: e.to_string(),
            })?;
        Ok(buffer)
    }

    /// Convenience wrapper returning UTF-8 text.
    pub fn render_to_string(&self, families: &[MetricFamily]) -> Result<String, RenderError> {
        let bytes = self.render(families)?;
        String::from_utf8(bytes).map_err(|e| RenderError::Encoding {
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_render_keeps_declared_label_order() {
        let mut family = MetricFamily::gauge(
            "ironic_node_totals",
            "OpenStack Ironic Nodes statistic",
            &["region", "name", "project_name"],
        );
        family.push(labels(&["r1", "nc02", "alpha"]), 1.0);
        family.push(labels(&["r1", "nc01", ""]), 1.0);

        let text = MetricExposer::new().render_to_string(&[family]).unwrap();
        assert_eq!(
            text,
            "# HELP ironic_node_totals OpenStack Ironic Nodes statistic\n\
             # TYPE ironic_node_totals gauge\n\
             ironic_node_totals{region=\"r1\",name=\"nc02\",project_name=\"alpha\"} 1\n\
             ironic_node_totals{region=\"r1\",name=\"nc01\",project_name=\"\"} 1\n"
        );
    }

    #[test]
    fn test_render_counter_type() {
        let mut family = MetricFamily::new("launch_failure", "Failures", MetricKind::Counter, &["project_id"]);
        family.push(labels(&["p1"]), 5.0);
        let text = MetricExposer::new().render_to_string(&[family]).unwrap();
        assert!(text.contains("# TYPE launch_failure counter\n"));
        assert!(text.contains("launch_failure{project_id=\"p1\"} 5\n"));
    }

    #[test]
    fn test_arity_mismatch_fails_loudly() {
        let mut family = MetricFamily::gauge("corsa_rx_bytes", "help", &["region", "switch", "port"]);
        family.push(labels(&["r1", "sw1"]), 3.0);
        let err = MetricExposer::new().render(&[family]).unwrap_err();
        assert_eq!(
            err,
            RenderError::LabelArity {
                family: "corsa_rx_bytes".into(),
                expected: 3,
                actual: 2,
            }
        );
    }

    #[test]
    fn test_duplicate_family_rejected() {
        let mut a = MetricFamily::gauge("total_nodes", "help", &["region"]);
        a.push(labels(&["r1"]), 1.0);
        let b = a.clone();
        assert!(matches!(
            MetricExposer::new().render(&[a, b]),
            Err(RenderError::DuplicateFamily { .. })
        ));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let family = MetricFamily::gauge("corsa-rx bytes", "help", &["region"]);
        assert!(matches!(
            MetricExposer::new().render(&[family]),
            Err(RenderError::InvalidFamilyName { .. })
        ));

        let family = MetricFamily::gauge("ok_name", "help", &["bad-label"]);
        assert!(matches!(
            MetricExposer::new().render(&[family]),
            Err(RenderError::InvalidLabelName { .. })
        ));
    }

    #[test]
    fn test_empty_families_are_omitted() {
        let empty = MetricFamily::gauge("gnocchi_gpu_stats", "help", &["region"]);
        let text = MetricExposer::new().render_to_string(&[empty]).unwrap();
        assert_eq!(text, "");
    }

    #[test]
    fn test_repeated_label_vector_last_value_wins() {
        let mut family = MetricFamily::gauge("g", "help", &["k"]);
        family.push(labels(&["a"]), 1.0);
        family.push(labels(&["b"]), 2.0);
        family.push(labels(&["a"]), 3.0);
        let text = MetricExposer::new().render_to_string(&[family]).unwrap();
        let samples: Vec<_> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(samples, vec!["g{k=\"a\"} 3", "g{k=\"b\"} 2"]);
    }

    #[test]
    fn test_output_is_deterministic() {
        let build = || {
            let mut family = MetricFamily::gauge("g", "help", &["k"]);
            for key in ["z", "m", "a"] {
                family.push(labels(&[key]), 1.0);
            }
            family
        };
        let exposer = MetricExposer::new();
        assert_eq!(exposer.render(&[build()]).unwrap(), exposer.render(&[build()]).unwrap());
    }

    #[rstest]
    #[case("tx_packets", "tx_packets")]
    #[case("corsa_rx-bytes", "corsa_rx_bytes")]
    #[case("gpu.utilization", "gpu_utilization")]
    #[case("3d_engine", "_3d_engine")]
    #[case("", "_")]
    fn test_sanitize_metric_name(#[case] raw: &str, #[case] expected: &str) {
        let sanitized = sanitize_metric_name(raw);
        assert_eq!(sanitized, expected);
        assert!(is_valid_metric_name(&sanitized));
    }
}
