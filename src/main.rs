//! Cloudlink gateway daemon - Main Entry Point
//!
//! Loads the gateway configuration, opens the cloud connection and keeps it
//! up until SIGINT/SIGTERM or until reconnection is given up.

use cloudlink::cloud::CloudConnection;
use cloudlink::config::GatewayConfig;
use cloudlink::device::{DeviceProfile, StaticDeviceInfo};
use cloudlink::observability::init_default_logging;
use cloudlink::transport::mqtt::MqttClient;
use cloudlink::transport::Transport;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{error, info, warn};

/// Cloud connection daemon for IoT edge gateways
#[derive(Parser)]
#[command(name = "cloudlink")]
#[command(about = "Cloud connection core for IoT edge gateways")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CLOUDLINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the cloud and run until signalled
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_default_logging() {
        eprintln!("Logging already initialised: {}", e);
    }

    info!("Starting cloudlink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_gateway(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<GatewayConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(GatewayConfig::load_from_file(path)?);
    }

    for path_str in ["cloudlink.toml", "config/cloudlink.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(GatewayConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create cloudlink.toml".into())
}

async fn run_gateway(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        client_id = %config.mqtt.client_id,
        account = %config.mqtt.account_name,
        "Gateway starting"
    );

    let mqtt = Arc::new(MqttClient::new(&config.mqtt, &config.cloud)?);
    let transport: Arc<dyn Transport> = mqtt.clone();
    let device = Arc::new(StaticDeviceInfo::new(DeviceProfile::from_config(&config.device)));

    let connection = CloudConnection::new(config.cloud.clone(), transport, device, None)?;

    // The transport keeps retrying in the background after a failed first attempt
    if let Err(e) = connection.start().await {
        warn!(error = %e, "Initial connection attempt failed, retrying in background");
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Gateway is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = monitor_connection_health(&mqtt) => {
            error!("MQTT connection permanently lost, shutting down...");
        }
    }

    connection.shutdown().await;
    Ok(())
}

fn handle_config_command(
    config: GatewayConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

/// Resolve once the transport has given up reconnecting
async fn monitor_connection_health(mqtt: &MqttClient) {
    loop {
        if mqtt.is_permanently_disconnected() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
}
