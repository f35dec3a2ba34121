//! Logging initialisation.

use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{ExporterError, ExporterResult};

/// Map a level name onto a filter, defaulting to `INFO`.
pub fn parse_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// Install the global subscriber, writing to stderr. `RUST_LOG` directives
/// override the configured level.
pub fn init_logging(config: &LoggingConfig) -> ExporterResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(parse_level(&config.level).into())
        .from_env_lossy();

    let installed = match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_current_span(false),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .compact()
                        .with_writer(std::io::stderr)
                        .with_ansi(config.colors)
                        .with_target(true),
                );
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    installed.map_err(|e| ExporterError::Internal(format!("Failed to set logger: {e}")))?;

    info!(
        target: "exporter::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );
    Ok(())
}
