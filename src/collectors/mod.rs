//! Concrete collectors, one per reporting concern.

pub mod baremetal;
pub mod corsa;
pub mod gpu;
pub mod inventory;
pub mod launch_failures;
pub mod node_stats;

use std::sync::Arc;

use tracing::info;

pub use baremetal::BaremetalStatsCollector;
pub use corsa::{CorsaStatsCollector, CorsaSwitch};
pub use gpu::GpuStatsCollector;
pub use inventory::NodeSources;
pub use launch_failures::LaunchFailuresCollector;
pub use node_stats::NodeStatsCollector;

use crate::backend::{Backend, HttpBackend};
use crate::collector::{Collector, CollectorContext};
use crate::config::{BackendConfig, ExporterConfig};
use crate::error::ConfigError;

fn http_backend(name: &str, config: Option<&BackendConfig>) -> Result<Arc<HttpBackend>, ConfigError> {
    let config = config.ok_or_else(|| ConfigError::missing_field(format!("backends.{name}")))?;
    Ok(Arc::new(HttpBackend::from_config(name, config)?))
}

/// Instantiate every enabled collector against HTTP backends, in scrape order.
pub fn from_config(config: &ExporterConfig, ctx: &CollectorContext) -> Result<Vec<Arc<dyn Collector>>, ConfigError> {
    let backends = &config.backends;
    let settings = &config.collectors;
    let mut collectors: Vec<Arc<dyn Collector>> = Vec::new();

    let node_sources = || -> Result<NodeSources, ConfigError> {
        Ok(NodeSources {
            ironic: http_backend("baremetal", backends.baremetal.as_ref())?,
            nova: http_backend("compute", backends.compute.as_ref())?,
            keystone: http_backend("identity", backends.identity.as_ref())?,
            blazar: http_backend("reservation", backends.reservation.as_ref())?,
            freepool_aggregate_id: settings.freepool_aggregate_id,
        })
    };

    if settings.node_stats.enabled {
        collectors.push(Arc::new(NodeStatsCollector::new(ctx.clone(), node_sources()?)));
    }
    if settings.baremetal_stats.enabled {
        let ironic: Arc<dyn Backend> = http_backend("baremetal", backends.baremetal.as_ref())?;
        collectors.push(Arc::new(BaremetalStatsCollector::new(ctx.clone(), ironic)));
    }
    if settings.gpu_stats.enabled {
        collectors.push(Arc::new(GpuStatsCollector::new(
            ctx.clone(),
            http_backend("reservation", backends.reservation.as_ref())?,
            http_backend("metric", backends.metric.as_ref())?,
            settings.gpu_stats.aggregation_spec(),
        )));
    }
    if settings.corsa_stats.enabled {
        let switches = settings
            .corsa_stats
            .switches
            .iter()
            .map(|switch| {
                let backend = HttpBackend::from_config(switch.name.as_str(), &switch.backend_config())?;
                Ok(CorsaSwitch {
                    name: switch.name.clone(),
                    backend: Arc::new(backend),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        collectors.push(Arc::new(CorsaStatsCollector::new(
            ctx.clone(),
            node_sources()?,
            switches,
            settings.corsa_stats.stats.clone(),
        )));
    }
    if settings.launch_failures.enabled {
        collectors.push(Arc::new(LaunchFailuresCollector::new(
            ctx.clone(),
            node_sources()?,
            config.refresh_interval(),
        )));
    }

    info!(
        target: "exporter::init",
        collectors = ?collectors.iter().map(|c| c.name()).collect::<Vec<_>>(),
        "Collectors configured"
    );
    Ok(collectors)
}
