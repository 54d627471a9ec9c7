mod cloud;
mod config;

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use pouch_core::GatewayError;
use pouch_gateway::{event_channel, CertError, EventSender, Gateway, ServerCertStore};
use pouch_transport::cloud::CloudTransport;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::cloud::SpoolCloud;
use crate::config::NodeConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Run the gateway (default)
    Run,
    /// Print the effective configuration
    ShowConfig,
}

#[derive(Debug, Error)]
enum NodeError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Gateway(#[from] GatewayError),
    #[error("server certificate: {0}")]
    Cert(#[from] CertError),
    #[error("invalid server certificate serial: {0}")]
    Serial(#[from] hex::FromHexError),
    #[error("radio: {0}")]
    Radio(String),
}

fn main() {
    let filter = std::env::var("POUCH_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let config = match NodeConfig::new(cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::ShowConfig => println!("{config:#?}"),
        Commands::Run => {
            if let Err(err) = run(&config) {
                error!("gateway failed: {err}");
                std::process::exit(1);
            }
        }
    }
}

fn run(config: &NodeConfig) -> Result<(), NodeError> {
    let gateway_config = config.gateway_config();
    gateway_config.validate()?;

    let cloud = Arc::new(SpoolCloud::open(&config.spool_dir, config.downlink_block_size)?);
    let certs = ServerCertStore::new(gateway_config.limits.server_cert_max_len);
    provision_server_certificate(config, &certs, cloud.as_ref())?;

    let (events, rx) = event_channel();
    watch_signals(events.clone())?;
    info!(
        scan_restart = ?config.scan_restart_interval,
        connect_timeout = ?config.connect_timeout,
        mtu = config.default_mtu,
        "opening radio"
    );
    let radio = open_radio(config, events.clone())?;

    let mut gateway = Gateway::new(radio, cloud, certs, gateway_config, events)?;
    gateway.start()?;
    gateway.run(&rx);

    let stats = gateway.stats().snapshot();
    info!(
        connections = stats.connections,
        completed = stats.exchanges_completed,
        failures = stats.failures(),
        uplink_bytes = stats.uplink_bytes,
        downlink_bytes = stats.downlink_bytes,
        "gateway stopped"
    );
    Ok(())
}

fn provision_server_certificate(
    config: &NodeConfig,
    certs: &ServerCertStore,
    cloud: &dyn CloudTransport,
) -> Result<(), NodeError> {
    if let Some(path) = &config.server_cert_path {
        let der = fs::read(path)?;
        let version = certs.load_builtin(der, config.server_cert_serial()?)?;
        info!(path = %path.display(), version, "builtin server certificate loaded");
        return Ok(());
    }
    match certs.refresh(cloud) {
        Ok(version) => info!(version, "server certificate fetched"),
        Err(err) => warn!(%err, "no server certificate available, devices will not be provisioned"),
    }
    Ok(())
}

/// Turns SIGINT/SIGTERM into a gateway shutdown event.
fn watch_signals(events: EventSender) -> Result<(), NodeError> {
    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;
    thread::Builder::new()
        .name("signal-watch".into())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(100));
            }
            info!("shutdown requested");
            events.shutdown();
        })?;
    Ok(())
}

#[cfg(feature = "btleplug")]
fn open_radio(
    config: &NodeConfig,
    events: EventSender,
) -> Result<pouch_transport_ble::btleplug_backend::BtleplugRadio, NodeError> {
    pouch_transport_ble::btleplug_backend::BtleplugRadio::spawn(
        config.radio_config(),
        Arc::new(events),
    )
    .map_err(|err| NodeError::Radio(err.to_string()))
}

#[cfg(not(feature = "btleplug"))]
fn open_radio(
    _config: &NodeConfig,
    _events: EventSender,
) -> Result<pouch_transport::radio::MockRadio, NodeError> {
    Err(NodeError::Radio(
        "built without a radio backend, rebuild with the `btleplug` feature".into(),
    ))
}
