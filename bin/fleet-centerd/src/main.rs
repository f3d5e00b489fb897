//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "binary"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Binary entrypoint for the fleet center daemon."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleet_common::{init_tracing, AppConfig, LogFormat};
use fleet_metrics::{new_registry, spawn_http_server, TransportMetrics};
use fleet_msg::{Bus, MessagingMetricsExporter, ModuleManager};
use fleet_net::{ProxyConfig, TlsAssets, WsServerProxy};
use tokio::signal;
use tracing::{info, warn};

mod status;

use status::FleetStatusModule;

const DEFAULT_CONFIG_CANDIDATES: [&str; 2] = ["config/fleet.toml", "/etc/fleet/fleet.toml"];

#[derive(Debug, Parser)]
#[command(author, version, about = "Fleet center daemon", long_about = None)]
struct Cli {
    #[arg(
        long,
        value_name = "FILE",
        env = "FLEET_CONFIG",
        help = "Path to configuration file"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "FORMAT",
        help = "Override log format (structured-json or pretty)"
    )]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the server proxy and bus until ctrl-c")]
    Run,
    #[command(about = "Load and validate configuration, then exit")]
    CheckConfig,
}

fn load_config(cli: &Cli) -> Result<(AppConfig, PathBuf)> {
    match &cli.config {
        Some(path) => Ok((AppConfig::from_path(path)?, path.clone())),
        None => {
            let loaded = AppConfig::load_with_source(&DEFAULT_CONFIG_CANDIDATES)?;
            Ok((loaded.config, loaded.source))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (mut config, config_path) = load_config(&cli)?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            config.validate()?;
            ProxyConfig::from_settings(&config.websocket, config.bus.sync_timeout)?;
            TlsAssets::from_config(&config.tls)
                .with_context(|| "failed to load TLS material")?;
            println!("Configuration OK: {}", config_path.display());
            Ok(())
        }
        Commands::Run => run(config, config_path).await,
    }
}

async fn run(config: AppConfig, config_path: PathBuf) -> Result<()> {
    init_tracing("fleet-centerd", &config.logging)?;
    info!(config = %config_path.display(), "configuration loaded");

    let registry = new_registry();
    let messaging = MessagingMetricsExporter::register(&registry)
        .with_context(|| "failed to register bus metrics")?;
    let transport = TransportMetrics::new(registry.clone())?;

    let bus = Bus::with_metrics(config.bus.clone(), messaging);
    let manager = ModuleManager::new(bus.clone());

    let proxy_config = ProxyConfig::from_settings(&config.websocket, config.bus.sync_timeout)?;
    let grace = proxy_config.shutdown_grace;
    let tls = TlsAssets::from_config(&config.tls)
        .with_context(|| "failed to load TLS material")?
        .server_config()?;
    let server = WsServerProxy::new(proxy_config, tls, bus.clone());

    let attached = Arc::new(AtomicUsize::new(0));
    {
        let transport = transport.clone();
        let attached = attached.clone();
        let proxy = server.name().to_owned();
        server.on_connect(move |peer| {
            let count = attached.fetch_add(1, Ordering::SeqCst) + 1;
            transport.set_peers(&proxy, count);
            info!(peer = %peer.name, address = %peer.address, peers = count, "edge node attached");
        });
    }
    {
        let transport = transport.clone();
        let attached = attached.clone();
        let proxy = server.name().to_owned();
        server.on_disconnect(move |peer| {
            let count = attached.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            transport.set_peers(&proxy, count);
            info!(peer = %peer.name, peers = count, "edge node detached");
        });
    }

    manager.register(Arc::new(FleetStatusModule::new(server.clone())?))?;
    let started = manager.start();
    info!(modules = started, "modules started");

    let tracker = transport.track(server.name(), server.subscribe());
    let addr = server.start().await?;
    info!(proxy = %server.name(), address = %addr, "server proxy listening");

    let metrics_server = if config.metrics.enabled {
        match spawn_http_server(registry, config.metrics.listen) {
            Ok(server) => Some(server),
            Err(err) => {
                warn!(error = %err, "failed to start metrics exporter");
                None
            }
        }
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    if let Err(err) = server.stop().await {
        warn!(error = %err, "server proxy did not stop cleanly");
    }
    manager.shutdown(grace).await;
    if tokio::time::timeout(grace, tracker).await.is_err() {
        warn!("transport metrics tracker did not finish in time");
    }
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    info!("shutdown complete");
    Ok(())
}
