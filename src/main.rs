//! Service Monitor Binary

use clap::Parser;
use service_monitor::{Config, Result, ServiceId, ServiceMonitor};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(
    name = "service-monitor",
    version,
    about = "Watch registered services and log their health"
)]
struct Cli {
    /// Service ids to watch; every registered service when omitted
    #[arg(long = "service", env = "WATCH_SERVICES", value_delimiter = ',')]
    services: Vec<ServiceId>,

    /// Revalidate at the detail-view cadence with the larger history window
    #[arg(long, env = "WATCH_DETAIL")]
    detail: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();
    let cli = Cli::parse();

    info!("Starting Service Monitor v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!(
        "Monitor configuration - API: {}, detail refresh: {:?}, overview refresh: {:?}",
        config.api_base_url, config.detail_refresh_interval, config.overview_refresh_interval
    );

    let monitor = ServiceMonitor::from_config(config)?;

    if let Err(e) = monitor.start(cli.services, cli.detail).await {
        error!("Monitor failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Initialize structured logging
fn initialize_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
