//! Oblivion Node
//!
//! Runs the overlay engine: mesh membership, DHT, NAT traversal, circuits,
//! bridges and onion resolution.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use oblivion_core::{
    Bootstrap, Components, ConnectOptions, EngineStatus, OnionAddress, OverlayEngine,
};
use oblivion_net::PeerId;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod config;

use config::NodeConfig;

/// Oblivion - censorship-resistant overlay node
#[derive(Parser)]
#[command(name = "oblivion-node")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "oblivion.toml")]
    config: PathBuf,

    /// Log level (overrides the config file)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node until interrupted
    Start {
        /// Enter the network through bridges only
        #[arg(long)]
        bridges_only: bool,

        /// Seconds between status lines
        #[arg(long, default_value = "60")]
        status_interval: u64,
    },

    /// Write a default config with a fresh identity
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Validate an onion address without touching the network
    Check {
        address: String,
    },

    /// Resolve an onion address and exit
    Resolve {
        address: String,

        /// Also open a stream to the service
        #[arg(long)]
        connect: bool,
    },

    /// Fetch a content filter list and write it to stdout
    Filter {
        name: String,
    },

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Init { .. } | Commands::Check { .. } => None,
        _ => Some(NodeConfig::load_or_create(&cli.config).await?),
    };

    let level = cli
        .log_level
        .clone()
        .or_else(|| config.as_ref().map(|c| c.logging.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level)?;

    match (cli.command, config) {
        (Commands::Init { force }, _) => cmd_init(&cli.config, force).await,
        (Commands::Check { address }, _) => cmd_check(&address),
        (Commands::Start { bridges_only, status_interval }, Some(mut config)) => {
            if bridges_only {
                config.core.circuit.bridges_only = true;
            }
            cmd_start(config, Duration::from_secs(status_interval.max(1))).await
        }
        (Commands::Resolve { address, connect }, Some(config)) => cmd_resolve(config, &address, connect).await,
        (Commands::Filter { name }, Some(config)) => cmd_filter(config, &name).await,
        (Commands::Config, Some(config)) => cmd_config(&config),
        (_, None) => anyhow::bail!("No configuration loaded"),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

/// Build the engine with real network components
async fn build_engine(config: NodeConfig) -> Result<Arc<OverlayEngine>> {
    config.validate()?;
    let peer_id = config.peer_id()?.unwrap_or_else(PeerId::random);

    let components = Components::udp(&config.core, peer_id)
        .await
        .context("Failed to bind mesh transport")?;
    let bootstrap = Bootstrap {
        bridges: config.bootstrap.bridges,
        relays: config.bootstrap.relays,
    };

    let engine = OverlayEngine::new(config.core, peer_id, components, bootstrap)?;
    engine.initialize().await?;
    Ok(engine)
}

async fn cmd_start(config: NodeConfig, status_interval: Duration) -> Result<()> {
    info!("Starting Oblivion node...");
    let engine = build_engine(config).await?;
    print_status(&engine.status().await);

    let mut ticker = tokio::time::interval(status_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => log_status(&engine.status().await),
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Signal handler failed: {}", e);
                }
                break;
            }
        }
    }

    info!("Shutting down...");
    engine.shutdown().await?;
    Ok(())
}

async fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {:?}. Use --force to overwrite.",
            config_path
        );
    }

    let peer_id = PeerId::random();
    let mut config = NodeConfig::default();
    config.node.peer_id = Some(peer_id.to_full_hex());
    config.save(config_path).await?;

    info!("Config saved to {:?}", config_path);
    println!("\nOblivion node initialized");
    println!("Peer ID: {}", peer_id.to_full_hex());
    println!("\nStart the node with: oblivion-node start");
    Ok(())
}

fn cmd_check(address: &str) -> Result<()> {
    match OnionAddress::parse(address) {
        Ok(parsed) => {
            println!("✓ {} (v{})", parsed.as_str(), parsed.version().number());
            Ok(())
        }
        Err(e) => anyhow::bail!("✗ {}", e),
    }
}

async fn cmd_resolve(config: NodeConfig, address: &str, connect: bool) -> Result<()> {
    let engine = build_engine(config).await?;

    let result = async {
        let resolution = engine.resolve(address).await?;
        println!("Address:      {}", resolution.address.as_str());
        println!("Version:      v{}", resolution.version().number());
        println!("Intro points: {}", resolution.introduction_points.len());
        for point in &resolution.introduction_points {
            println!("  {} {} ({} failures)", &point.fingerprint[..16.min(point.fingerprint.len())], point.address, point.failures);
        }

        if connect {
            let connection = engine.connect(address, ConnectOptions::default()).await?;
            println!(
                "Connected: circuit {} stream {}",
                connection.circuit_id, connection.stream_id
            );
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    engine.shutdown().await?;
    result
}

async fn cmd_filter(config: NodeConfig, name: &str) -> Result<()> {
    let engine = build_engine(config).await?;
    let result = engine.request_filter_list(name).await;
    engine.shutdown().await?;

    let content = result.with_context(|| format!("Filter list '{}' unavailable", name))?;
    info!("Fetched '{}' ({} bytes)", name, content.len());
    print!("{}", String::from_utf8_lossy(&content));
    Ok(())
}

fn cmd_config(config: &NodeConfig) -> Result<()> {
    let toml = toml::to_string_pretty(config)?;
    println!("{}", toml);
    Ok(())
}

fn log_status(status: &EngineStatus) {
    info!(
        "{:?}: {} peers ({} connected), {} routes, {} circuits ready, {} bridges, nat {}",
        status.state,
        status.known_peers,
        status.connected_peers,
        status.routes,
        status.circuits.ready,
        status.active_bridges,
        status.nat_type
    );
}

fn print_status(status: &EngineStatus) {
    println!("Oblivion Node Status");
    println!("====================");
    println!("State:     {:?}", status.state);
    println!("Peer ID:   {}", status.peer_id);
    println!("NAT type:  {}", status.nat_type);
    println!("Peers:     {} known, {} connected", status.known_peers, status.connected_peers);
    println!("Routes:    {}", status.routes);
    println!("DHT:       {} entries", status.dht_entries);
    println!("Relays:    {} known, {} sessions", status.relays_known, status.relay_sessions);
    println!(
        "Circuits:  {} ready, {} building, {} degraded",
        status.circuits.ready, status.circuits.building, status.circuits.degraded
    );
    println!(
        "Bridges:   {} active, {} sessions{}",
        status.active_bridges,
        status.bridge_sessions,
        if status.bridges_only { " (bridge-only entry)" } else { "" }
    );
}
