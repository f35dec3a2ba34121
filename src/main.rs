use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use openstack_exporter::logging::init_logging;
use openstack_exporter::{server, Exporter, ExporterConfig, EXPORTER_NAME, EXPORTER_VERSION, SHUTDOWN_GRACE_PERIOD_SECS};

/// Prometheus exporter for an OpenStack bare-metal testbed
#[derive(Parser, Debug)]
#[command(
    name = "openstack-exporter",
    version,
    about = "Prometheus exporter for OpenStack bare-metal testbeds",
    long_about = "Joins node inventory, reservations, switch port counters and GPU \
                  utilisation from OpenStack services into labeled Prometheus metrics, \
                  cached per refresh interval."
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "openstack-exporter.toml", env = "OSEXPORTER_CONFIG")]
    config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "OSEXPORTER_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve /metrics (default)
    Run,

    /// Validate the configuration file
    Validate {
        /// Print the parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Write the default configuration
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Render a single scrape to stdout and exit
    Once,
}

fn load_config(path: &Path) -> Result<(ExporterConfig, bool)> {
    if path.exists() {
        let config =
            ExporterConfig::load(path).with_context(|| format!("Failed to load config from {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((ExporterConfig::from_env().context("Invalid default configuration")?, false))
    }
}

fn handle_validate(path: &Path, verbose: bool) -> Result<()> {
    println!("Validating configuration file: {}", path.display());
    let config = ExporterConfig::load(path).with_context(|| format!("{} is not valid", path.display()))?;
    println!("Configuration is valid");

    if verbose {
        println!("\n{}", toml::to_string_pretty(&config).context("Failed to serialize configuration")?);
    }

    println!("  region:           {}", config.exporter.region);
    println!("  listen address:   {}", config.exporter.listen_address);
    println!("  refresh interval: {}s", config.exporter.refresh_interval_secs);
    println!("  collectors:       {}", config.enabled_collectors().join(", "));
    for (name, backend) in config.backends.iter() {
        if let Some(backend) = backend {
            println!("  backend {name:<12} {}", backend.url);
        }
    }
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> Result<()> {
    let rendered = ExporterConfig::generate_default_config()?;
    match output {
        Some(path) => {
            fs::write(path, &rendered).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to {}", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(target: "exporter::main", error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(target: "exporter::main", error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(target: "exporter::main", "Received SIGINT"),
        _ = terminate => info!(target: "exporter::main", "Received SIGTERM"),
    }
}

async fn run(config: ExporterConfig) -> Result<()> {
    let addr: SocketAddr = config
        .exporter
        .listen_address
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.exporter.listen_address))?;
    let exporter = Arc::new(Exporter::from_config(&config)?);

    let refresher = config.exporter.background_refresh.then(|| exporter.spawn_refresher());

    server::serve(Arc::clone(&exporter), addr, shutdown_signal()).await?;

    exporter.shutdown();
    if let Some(refresher) = refresher {
        if tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS), refresher)
            .await
            .is_err()
        {
            warn!(target: "exporter::main", "Background refresher did not stop within the grace period");
        }
    }
    info!(target: "exporter::main", "Shutdown complete");
    Ok(())
}

async fn once(config: ExporterConfig) -> Result<()> {
    let exporter = Exporter::from_config(&config)?;
    let body = exporter.scrape().await;
    std::io::stdout().lock().write_all(&body)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, *verbose),
        _ => {}
    }

    let (config, from_file) = load_config(&cli.config)?;
    let mut logging = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    init_logging(&logging)?;

    info!(target: "exporter::main", version = EXPORTER_VERSION, "Starting {EXPORTER_NAME}");
    if !from_file {
        warn!(
            target: "exporter::main",
            path = %cli.config.display(),
            "Config file not found, using defaults and environment"
        );
    }

    match cli.command {
        Some(Commands::Once) => once(config).await,
        _ => run(config).await,
    }
}
