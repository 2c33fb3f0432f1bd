//! PLC tag service
//!
//! Loads the tag configuration, connects every tag channel, reads the status
//! tag in the background until a shutdown signal arrives, then disconnects.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info, warn, Level};

use common::logging::{self, LogConfig};
use plcsrv::config::DEFAULT_CONFIG_PATH;
use plcsrv::{
    ConnectionRegistry, GisStatusView, MemoryStore, PlcAccess, PlcConfig, SimulatedPlc,
    TracingHealthReporter,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "plcsrv", version, about = "PLC tag connection and polling service")]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "PLCSRV_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Console log level (overrides the configured one)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Controller address (overrides the configured one)
    #[arg(long)]
    address: Option<String>,

    /// Run against the built-in simulated controller
    #[arg(long)]
    simulated: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Validated after the command-line overrides below
    let mut config: PlcConfig = PlcConfig::figment(&args.config)
        .extract()
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(level) = &args.log_level {
        config.service.log_level = level.clone();
    }
    if let Some(address) = &args.address {
        config.connection.address = Some(address.clone());
    }
    if args.simulated {
        config.connection.simulated = true;
    }
    config.validate()?;

    let console_level = Level::from_str(&config.service.log_level).unwrap_or(Level::INFO);
    logging::init_with_config(LogConfig {
        service_name: config.service.name.clone(),
        log_dir: config.service.log_dir.clone(),
        console_level,
        enable_json: config.service.log_json,
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    info!(
        "Starting {} v{} with {} (log filter {})",
        config.service.name,
        env!("CARGO_PKG_VERSION"),
        args.config.display(),
        logging::get_log_level()
    );

    if !config.connection.simulated {
        bail!(
            "no hardware driver is built into this binary; set connection.simulated or pass --simulated"
        );
    }
    let access = Arc::new(PlcAccess::new(SimulatedPlc::new()));

    let address = config
        .connection
        .address
        .clone()
        .unwrap_or_else(|| "localhost".to_string());
    let store = Arc::new(MemoryStore::new());
    let reporter = Arc::new(TracingHealthReporter::new());
    let registry = ConnectionRegistry::new(config, access, store, reporter);

    registry.connect(&[address.as_str()]).await?;
    registry.start_plc_tag_readers()?;

    let signal = common::wait_for_shutdown().await;
    info!("{} received, shutting down", signal);

    let status = GisStatusView::new(registry.clone());
    if let Some(time) = status.plc_time() {
        info!("Last controller time {}", time);
    }

    registry.stop_plc_tag_readers().await;
    if let Err(e) = registry.disconnect().await {
        warn!("Disconnect finished with an error: {}", e);
    }

    match serde_json::to_string(&registry.snapshot()) {
        Ok(json) => info!("Final state: {}", json),
        Err(e) => error!("Failed to serialize final state: {}", e),
    }
    info!("Shutdown complete");
    Ok(())
}
