//! # OpenStack Exporter
//!
//! Polls the inventory and telemetry backends of a bare-metal testbed
//! (Ironic, Nova, Keystone, Blazar, Gnocchi and Corsa switches) and
//! republishes a joined, labeled snapshot of their state as Prometheus
//! samples.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  /metrics → EXPORTER → COLLECTORS → CACHE STORE → BACKENDS            │
//! │                             │             │                          │
//! │                             ▼             ▼                          │
//! │                    COUNTER ACCUMULATOR   ENTITY JOINER               │
//! │                             │                                        │
//! │                             ▼                                        │
//! │                       METRIC EXPOSER (text format 0.0.4)             │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every collector implements the [`Collector`](collector::Collector) trait.
//! On a cache miss it fetches raw records from its injected backends, joins
//! them with the pure functions in [`join`], and publishes the rows through
//! the single-flight, stale-if-error [`CacheStore`](cache::CacheStore).
//! Rendering always goes through the [`MetricExposer`](exposition::MetricExposer).

pub mod backend;
pub mod cache;
pub mod collector;
pub mod collectors;
pub mod config;
pub mod counter;
pub mod engine;
pub mod error;
pub mod exposition;
pub mod join;
pub mod logging;
pub mod model;
pub mod server;

pub use cache::{CacheEntry, CacheStats, CacheStore, Snapshot, SnapshotStatus};
pub use collector::{Collector, CollectorContext};
pub use config::ExporterConfig;
pub use counter::{CounterAccumulator, CounterState};
pub use engine::Exporter;
pub use error::{
    CollectorError, CollectorResult, ExporterError, ExporterResult, RenderError, UpstreamError,
    UpstreamResult,
};
pub use exposition::{MetricExposer, MetricFamily, MetricKind, Sample};
pub use join::{Aggregation, AggregationSpec, JoinPolicy};
pub use model::{JoinedRow, RawRecord, Stat};

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Exporter version - follows semantic versioning
pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EXPORTER_NAME: &str = "openstack-exporter";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default cache TTL and launch-failure window (seconds)
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 300;

/// Upper bound on a single collector rebuild (seconds)
pub const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 120;

/// Default timeout for one backend HTTP request (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Grace period for shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 10;

// ----------------------------------------------------------------------------
// Network
// ----------------------------------------------------------------------------

/// Default listen port for the `/metrics` endpoint
pub const DEFAULT_LISTEN_PORT: u16 = 9183;

// ----------------------------------------------------------------------------
// Domain defaults
// ----------------------------------------------------------------------------

/// Nova aggregate holding unreserved nodes; hosts in it have no owner.
pub const DEFAULT_FREEPOOL_AGGREGATE_ID: i64 = 1;

/// Granularity of GPU metric aggregation queries (seconds)
pub const DEFAULT_GPU_GRANULARITY_SECS: u64 = 60;

/// Port counters exported for every Corsa switch port
pub const DEFAULT_CORSA_STATS: [&str; 8] = [
    "tx_packets",
    "tx_errors",
    "tx_bytes",
    "tx_dropped",
    "rx_packets",
    "rx_errors",
    "rx_bytes",
    "rx_dropped",
];
