//! Configuration loading.
//!
//! A TOML file merged with `OSEXPORTER_`-prefixed environment variables
//! (`__` separates nesting levels, e.g. `OSEXPORTER_EXPORTER__REGION`).
//! Every field has a serde default, so a file only lists what it changes.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::exposition::is_valid_metric_name;
use crate::join::{Aggregation, AggregationSpec};
use crate::{
    DEFAULT_BUILD_TIMEOUT_SECS, DEFAULT_CORSA_STATS, DEFAULT_FREEPOOL_AGGREGATE_ID, DEFAULT_GPU_GRANULARITY_SECS,
    DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_LISTEN_PORT, DEFAULT_REFRESH_INTERVAL_SECS,
};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "OSEXPORTER_";

// ----------------------------------------------------------------------------
// 1. Root Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    #[serde(default)]
    pub exporter: GeneralConfig,

    #[serde(default)]
    pub backends: BackendsConfig,

    #[serde(default)]
    pub collectors: CollectorsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ExporterConfig {
    /// Every backend at its conventional local endpoint.
    fn default() -> Self {
        Self {
            exporter: GeneralConfig::default(),
            backends: BackendsConfig::local(),
            collectors: CollectorsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ExporterConfig {
    /// Load a configuration file with environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::extract(Figment::new().merge(Toml::file(path)))
    }

    /// Built-in defaults with environment overrides, for running without a file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract(Figment::from(Serialized::defaults(Self::default())))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError { message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string without environment overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError { message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let general = &self.exporter;
        if general.refresh_interval_secs == 0 {
            return Err(ConfigError::invalid_value(
                "exporter.refresh_interval_secs",
                "Refresh interval must be at least 1 second",
            ));
        }
        if general.build_timeout_secs == 0 {
            return Err(ConfigError::invalid_value(
                "exporter.build_timeout_secs",
                "Build timeout must be at least 1 second",
            ));
        }
        if general.region.is_empty() {
            return Err(ConfigError::missing_field("exporter.region"));
        }
        general
            .listen_address
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::invalid_value("exporter.listen_address", e.to_string()))?;

        for (name, backend) in self.backends.iter() {
            if let Some(backend) = backend {
                backend.validate(&format!("backends.{name}"))?;
            }
        }

        let collectors = &self.collectors;
        for (collector, enabled, needs) in [
            ("node_stats", collectors.node_stats.enabled, &NODE_DETAIL_BACKENDS[..]),
            ("baremetal_stats", collectors.baremetal_stats.enabled, &["baremetal"][..]),
            ("gpu_stats", collectors.gpu_stats.enabled, &["reservation", "metric"][..]),
            ("corsa_stats", collectors.corsa_stats.enabled, &NODE_DETAIL_BACKENDS[..]),
            ("launch_failures", collectors.launch_failures.enabled, &NODE_DETAIL_BACKENDS[..]),
        ] {
            if !enabled {
                continue;
            }
            if let Some(missing) = needs.iter().find(|name| self.backends.get(name).is_none()) {
                return Err(ConfigError::missing_field(format!(
                    "backends.{missing} (required by collectors.{collector})"
                )));
            }
        }

        if collectors.gpu_stats.granularity_secs == 0 {
            return Err(ConfigError::invalid_value(
                "collectors.gpu_stats.granularity_secs",
                "Granularity must be at least 1 second",
            ));
        }

        collectors.corsa_stats.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// The default configuration as TOML.
    pub fn generate_default_config() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::default()).map_err(|e| ConfigError::ParseError { message: e.to_string() })
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.exporter.refresh_interval_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.exporter.build_timeout_secs)
    }

    /// Names of the enabled collectors, in scrape order.
    pub fn enabled_collectors(&self) -> Vec<&'static str> {
        let c = &self.collectors;
        [
            ("node_stats", c.node_stats.enabled),
            ("baremetal_stats", c.baremetal_stats.enabled),
            ("gpu_stats", c.gpu_stats.enabled),
            ("corsa_stats", c.corsa_stats.enabled),
            ("launch_failures", c.launch_failures.enabled),
        ]
        .into_iter()
        .filter_map(|(name, enabled)| enabled.then_some(name))
        .collect()
    }
}

/// Backends read by the shared node-details pipeline.
const NODE_DETAIL_BACKENDS: [&str; 4] = ["baremetal", "compute", "identity", "reservation"];

// ----------------------------------------------------------------------------
// 2. General Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Value of the `region` label
    #[serde(default = "default_region")]
    pub region: String,

    /// Address of the `/metrics` listener
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Cache TTL, also the look-back window for launch failures
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Upper bound on one collector rebuild
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Rebuild every cache once per refresh interval, even without scrapes
    #[serde(default = "default_true")]
    pub background_refresh: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            listen_address: default_listen_address(),
            refresh_interval_secs: default_refresh_interval(),
            build_timeout_secs: default_build_timeout(),
            background_refresh: true,
        }
    }
}

// ----------------------------------------------------------------------------
// 3. Backends
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendsConfig {
    /// Ironic
    #[serde(default)]
    pub baremetal: Option<BackendConfig>,
    /// Nova
    #[serde(default)]
    pub compute: Option<BackendConfig>,
    /// Keystone
    #[serde(default)]
    pub identity: Option<BackendConfig>,
    /// Blazar
    #[serde(default)]
    pub reservation: Option<BackendConfig>,
    /// Gnocchi
    #[serde(default)]
    pub metric: Option<BackendConfig>,
}

impl BackendsConfig {
    /// Every service at its default port on localhost.
    pub fn local() -> Self {
        Self {
            baremetal: Some(BackendConfig::at("http://localhost:6385")),
            compute: Some(BackendConfig::at("http://localhost:8774/v2.1")),
            identity: Some(BackendConfig::at("http://localhost:5000")),
            reservation: Some(BackendConfig::at("http://localhost:1234/v1")),
            metric: Some(BackendConfig::at("http://localhost:8041")),
        }
    }

    pub fn get(&self, name: &str) -> Option<&BackendConfig> {
        match name {
            "baremetal" => self.baremetal.as_ref(),
            "compute" => self.compute.as_ref(),
            "identity" => self.identity.as_ref(),
            "reservation" => self.reservation.as_ref(),
            "metric" => self.metric.as_ref(),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, Option<&BackendConfig>)> {
        [
            ("baremetal", self.baremetal.as_ref()),
            ("compute", self.compute.as_ref()),
            ("identity", self.identity.as_ref()),
            ("reservation", self.reservation.as_ref()),
            ("metric", self.metric.as_ref()),
        ]
        .into_iter()
    }
}

/// Connection settings for one JSON-over-HTTP service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL; resource paths are appended
    pub url: String,

    /// Static auth token
    #[serde(default)]
    pub token: Option<String>,

    /// Header carrying `token`
    #[serde(default = "default_token_header")]
    pub token_header: String,

    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_true")]
    pub verify_tls: bool,

    /// Extra headers sent with every request (API microversions etc.)
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: None,
            token_header: default_token_header(),
            timeout_secs: default_http_timeout(),
            verify_tls: true,
            headers: BTreeMap::new(),
        }
    }
}

impl BackendConfig {
    pub fn at(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ConfigError::invalid_value(
                format!("{field}.url"),
                format!("'{}' is not an http(s) URL", self.url),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::invalid_value(
                format!("{field}.timeout_secs"),
                "Timeout must be at least 1 second",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 4. Collectors
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorsConfig {
    /// Nova aggregate whose hosts are unreserved
    #[serde(default = "default_freepool_aggregate_id")]
    pub freepool_aggregate_id: i64,

    #[serde(default)]
    pub node_stats: ToggleConfig,

    #[serde(default)]
    pub baremetal_stats: ToggleConfig,

    #[serde(default)]
    pub gpu_stats: GpuStatsConfig,

    #[serde(default)]
    pub corsa_stats: CorsaStatsConfig,

    #[serde(default)]
    pub launch_failures: ToggleConfig,
}

impl Default for CollectorsConfig {
    fn default() -> Self {
        Self {
            freepool_aggregate_id: default_freepool_aggregate_id(),
            node_stats: ToggleConfig::default(),
            baremetal_stats: ToggleConfig::default(),
            gpu_stats: GpuStatsConfig::default(),
            corsa_stats: CorsaStatsConfig::default(),
            launch_failures: ToggleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToggleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ToggleConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuStatsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Reduction across the metric ids of one GPU
    #[serde(default = "default_gpu_aggregation")]
    pub aggregation: Aggregation,

    #[serde(default = "default_gpu_granularity")]
    pub granularity_secs: u64,

    /// Gap fill value passed to the metric service
    #[serde(default)]
    pub fill: Option<String>,
}

impl Default for GpuStatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            aggregation: default_gpu_aggregation(),
            granularity_secs: default_gpu_granularity(),
            fill: None,
        }
    }
}

impl GpuStatsConfig {
    pub fn aggregation_spec(&self) -> AggregationSpec {
        let spec = AggregationSpec::new(self.aggregation, self.granularity_secs);
        match &self.fill {
            Some(fill) => spec.with_fill(fill.as_str()),
            None => spec,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsaStatsConfig {
    /// Off by default: needs at least one switch
    #[serde(default)]
    pub enabled: bool,

    /// Port counters to export, one family each
    #[serde(default = "default_corsa_stats")]
    pub stats: Vec<String>,

    #[serde(default)]
    pub switches: Vec<CorsaSwitchConfig>,
}

impl Default for CorsaStatsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            stats: default_corsa_stats(),
            switches: Vec::new(),
        }
    }
}

impl CorsaStatsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.switches.is_empty() {
            return Err(ConfigError::missing_field("collectors.corsa_stats.switches"));
        }
        let mut names = HashSet::new();
        for switch in &self.switches {
            if !names.insert(switch.name.as_str()) {
                return Err(ConfigError::invalid_value(
                    "collectors.corsa_stats.switches",
                    format!("Duplicate switch name '{}'", switch.name),
                ));
            }
            switch
                .backend_config()
                .validate(&format!("collectors.corsa_stats.switches.{}", switch.name))?;
        }
        let mut stats = HashSet::new();
        for stat in &self.stats {
            if !is_valid_metric_name(&format!("corsa_{stat}")) {
                return Err(ConfigError::invalid_value(
                    "collectors.corsa_stats.stats",
                    format!("'{stat}' does not form a valid metric name"),
                ));
            }
            if !stats.insert(stat.as_str()) {
                return Err(ConfigError::invalid_value(
                    "collectors.corsa_stats.stats",
                    format!("Duplicate stat '{stat}'"),
                ));
            }
        }
        Ok(())
    }
}

/// One Corsa switch REST endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsaSwitchConfig {
    /// Matched against `local_link_connection.switch_info` of ironic ports
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl CorsaSwitchConfig {
    /// Corsa expects the raw token in `Authorization`.
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            url: self.address.clone(),
            token: self.token.clone(),
            token_header: "Authorization".into(),
            timeout_secs: self.timeout_secs,
            verify_tls: self.ssl_verify,
            headers: BTreeMap::new(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5. Logging
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter level; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include file and line of each event
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

impl LoggingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.format.as_str(), "pretty" | "compact" | "json") {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("'{}' is not one of pretty, compact, json", self.format),
            ));
        }
        if !matches!(
            self.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "warning" | "error"
        ) {
            return Err(ConfigError::invalid_value(
                "logging.level",
                format!("Unknown level '{}'", self.level),
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 6. Defaults
// ----------------------------------------------------------------------------

fn default_true() -> bool {
    true
}
fn default_region() -> String {
    "RegionOne".into()
}
fn default_listen_address() -> String {
    format!("0.0.0.0:{DEFAULT_LISTEN_PORT}")
}
fn default_refresh_interval() -> u64 {
    DEFAULT_REFRESH_INTERVAL_SECS
}
fn default_build_timeout() -> u64 {
    DEFAULT_BUILD_TIMEOUT_SECS
}
fn default_token_header() -> String {
    "X-Auth-Token".into()
}
fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}
fn default_freepool_aggregate_id() -> i64 {
    DEFAULT_FREEPOOL_AGGREGATE_ID
}
fn default_gpu_aggregation() -> Aggregation {
    Aggregation::Max
}
fn default_gpu_granularity() -> u64 {
    DEFAULT_GPU_GRANULARITY_SECS
}
fn default_corsa_stats() -> Vec<String> {
    DEFAULT_CORSA_STATS.iter().map(|s| s.to_string()).collect()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}
