//! Parley CLI
//!
//! Rendezvous relay and connection negotiation for peers without direct
//! addressability.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use parley_broker::loopback::{LoopbackFactory, LoopbackNetwork, LoopbackOptions};
use parley_broker::{BrokerConfig, ListenOptions, RemoteBroker, TransportFactory};
use parley_relay::RelayServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use config::{Config, parse_relay_url};

/// How long one-shot commands wait for the relay
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Parley - meet peers through a relay, then talk directly
#[derive(Parser)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay server
    Relay {
        /// Listen address
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// List hosts registered at a relay
    List {
        /// Relay WebSocket URL
        #[arg(short, long)]
        relay: Option<String>,

        /// Application protocol tag sent with the request
        #[arg(short, long)]
        protocol: Option<String>,

        /// Print the raw host records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Measure the round-trip time to a relay
    Ping {
        /// Relay WebSocket URL
        #[arg(short, long)]
        relay: Option<String>,

        /// Number of probes
        #[arg(short = 'n', long, default_value_t = 4)]
        count: u32,
    },

    /// Connect two in-process peers through a relay and echo a message
    Demo {
        /// Relay WebSocket URL; an ephemeral local relay when absent
        #[arg(short, long)]
        relay: Option<String>,

        /// Message to send
        #[arg(short, long, default_value = "hello from parley")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None if Config::default_path().exists() => Config::load(Config::default_path())?,
        None => Config::default(),
    };
    config.validate()?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    match cli.command {
        Commands::Relay { bind } => run_relay(bind, &config).await?,
        Commands::List {
            relay,
            protocol,
            json,
        } => list_hosts(relay, protocol, json, &config).await?,
        Commands::Ping { relay, count } => ping_relay(relay, count, &config).await?,
        Commands::Demo { relay, message } => run_demo(relay, message, &config).await?,
    }

    Ok(())
}

fn relay_url(arg: Option<String>, config: &Config) -> anyhow::Result<String> {
    match arg {
        Some(raw) => Ok(parse_relay_url(&raw)?.to_string()),
        None => Ok(config.relay_url()?.to_string()),
    }
}

/// Brokers that only talk to the relay never open a peer transport
fn relay_only_factory() -> Arc<dyn TransportFactory> {
    Arc::new(LoopbackFactory::new())
}

async fn connect(
    url: &str,
    factory: Arc<dyn TransportFactory>,
    config: BrokerConfig,
) -> anyhow::Result<RemoteBroker> {
    let remote = RemoteBroker::connect(url, factory, config).await?;
    let alias = tokio::time::timeout(COMMAND_TIMEOUT, remote.broker().wait_identified())
        .await
        .context("Relay did not assign an alias")??;
    tracing::debug!(%alias, "Identified");
    Ok(remote)
}

/// Run a relay until Ctrl+C
async fn run_relay(bind: Option<String>, config: &Config) -> anyhow::Result<()> {
    let addr = match bind {
        Some(bind) => bind.parse().with_context(|| format!("Invalid bind address {bind}"))?,
        None => config.parse_listen_addr()?,
    };

    let server = RelayServer::bind_with_config(addr, config.relay_config()).await?;
    println!("Parley relay");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: ws://{}/", server.local_addr()?);
    println!("Max peers: {}", config.relay.max_peers);
    println!("Press Ctrl+C to stop");

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    println!("\nShutting down...");
    Ok(())
}

/// Print the hosts registered at a relay
async fn list_hosts(
    relay: Option<String>,
    protocol: Option<String>,
    json: bool,
    config: &Config,
) -> anyhow::Result<()> {
    let url = relay_url(relay, config)?;
    let mut broker_config = config.broker_config();
    if protocol.is_some() {
        broker_config.protocol = protocol;
    }

    let remote = connect(&url, relay_only_factory(), broker_config).await?;
    let servers = tokio::time::timeout(COMMAND_TIMEOUT, remote.broker().request_server_list())
        .await
        .context("Relay did not answer the server list request")??;

    if json {
        println!("{}", serde_json::to_string_pretty(&servers)?);
        return Ok(());
    }

    if servers.is_empty() {
        println!("No hosts registered at {url}");
        return Ok(());
    }
    println!("{:<20} {:<24} {:<12} META", "ALIAS", "NAME", "PROTOCOL");
    for server in &servers {
        println!(
            "{:<20} {:<24} {:<12} {}",
            server.alias,
            server.name,
            server.protocol.as_deref().unwrap_or("-"),
            server.meta.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

/// Ping a relay `count` times and print the round-trip times
async fn ping_relay(relay: Option<String>, count: u32, config: &Config) -> anyhow::Result<()> {
    let url = relay_url(relay, config)?;
    let remote = connect(&url, relay_only_factory(), config.broker_config()).await?;
    println!("PING {url}");

    let mut samples = Vec::new();
    for seq in 0..count {
        if seq > 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        match tokio::time::timeout(COMMAND_TIMEOUT, remote.broker().ping()).await {
            Ok(Ok(rtt)) => {
                println!("seq={seq} time={:.2} ms", rtt.as_secs_f64() * 1000.0);
                samples.push(rtt);
            }
            Ok(Err(e)) => {
                println!("seq={seq} failed: {e}");
                break;
            }
            Err(_) => println!("seq={seq} timed out"),
        }
    }

    if let (Some(min), Some(max)) = (samples.iter().min(), samples.iter().max()) {
        let total: Duration = samples.iter().sum();
        let avg = total / u32::try_from(samples.len()).unwrap_or(u32::MAX);
        println!(
            "{} received, min/avg/max = {:.2}/{:.2}/{:.2} ms",
            samples.len(),
            min.as_secs_f64() * 1000.0,
            avg.as_secs_f64() * 1000.0,
            max.as_secs_f64() * 1000.0,
        );
    }
    Ok(())
}

/// Host and guest in one process, linked through a relay by loopback transports
async fn run_demo(relay: Option<String>, message: String, config: &Config) -> anyhow::Result<()> {
    let mut local_relay = None;
    let url = match relay {
        Some(raw) => parse_relay_url(&raw)?.to_string(),
        None => {
            let server =
                RelayServer::bind_with_config("127.0.0.1:0".parse()?, config.relay_config()).await?;
            let url = format!("ws://{}/", server.local_addr()?);
            local_relay = Some(tokio::spawn(server.run()));
            url
        }
    };
    println!("Relay: {url}");

    let network = Arc::new(LoopbackNetwork::default());
    let factory = |network: &Arc<LoopbackNetwork>| -> Arc<dyn TransportFactory> {
        Arc::new(LoopbackFactory::on_network(
            Arc::clone(network),
            LoopbackOptions::default(),
        ))
    };

    let host = connect(&url, factory(&network), config.broker_config()).await?;
    let host_alias = host.broker().alias().context("Host has no alias")?;
    host.broker()
        .listen(
            ListenOptions {
                name: Some("parley demo".to_string()),
                meta: None,
            },
            |socket| {
                let mut inbound = socket.subscribe_data();
                tokio::spawn(async move {
                    while let Some(data) = inbound.recv().await {
                        if let Err(e) = socket.send(&data, true) {
                            tracing::warn!("Echo failed: {e}");
                            break;
                        }
                    }
                });
            },
        )
        .await?;
    println!("Host: {host_alias}");

    let guest = connect(&url, factory(&network), config.broker_config()).await?;
    let socket = guest.broker().connect(&host_alias).await?;
    tokio::time::timeout(COMMAND_TIMEOUT, socket.wait_connected())
        .await
        .context("Peers did not connect")??;
    println!(
        "Connected: {} <-> {}",
        socket.socket_id(),
        socket.remote_socket_id().unwrap_or_default()
    );

    let mut echoes = socket.subscribe_data();
    socket.send(message.as_bytes(), true)?;
    let echo = tokio::time::timeout(COMMAND_TIMEOUT, echoes.recv())
        .await
        .context("No echo received")?
        .context("Socket closed before the echo")?;
    println!("Echo: {}", String::from_utf8_lossy(&echo));

    socket.close();
    if let Some(task) = local_relay {
        task.abort();
    }
    Ok(())
}
