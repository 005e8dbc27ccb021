//! Demo: several participants join one room inside this process
//!
//! ```bash
//! roomcall --participants 3 --room demo --wait-secs 5
//! RUST_LOG=roomcall=debug roomcall --config mesh.json --receive-only
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use roomcall::media::{LoggingRenderer, SyntheticCapture};
use roomcall::peer::ServerConfig;
use roomcall::signaling::{MemoryBroker, ReconnectingRelay};
use roomcall::{logger, MeshConfig, Room, RoomId, RtcConnector};

/// Peer-to-peer mesh signaling demo over an in-process relay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of participants to spawn
    #[arg(short, long, default_value_t = 2, env = "ROOMCALL_PARTICIPANTS")]
    participants: usize,

    /// Room every participant joins
    #[arg(short, long, default_value = "demo", env = "ROOMCALL_ROOM")]
    room: String,

    /// JSON config file; flags below override it
    #[arg(short, long, env = "ROOMCALL_CONFIG")]
    config: Option<PathBuf>,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',')]
    stun_servers: Vec<String>,

    /// Negotiation deadline per peer in milliseconds
    #[arg(long)]
    negotiation_timeout_ms: Option<u64>,

    /// Join without local media
    #[arg(long, default_value_t = false)]
    receive_only: bool,

    /// Seconds to let negotiation run before printing snapshots
    #[arg(short, long, default_value_t = 5)]
    wait_secs: u64,

    /// Log level when RUST_LOG is unset
    #[arg(long, env = "ROOMCALL_LOG_LEVEL")]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> anyhow::Result<MeshConfig> {
    let mut config = match &args.config {
        Some(path) => MeshConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => MeshConfig::default(),
    };

    if !args.stun_servers.is_empty() {
        config.ice_servers = args
            .stun_servers
            .iter()
            .enumerate()
            .map(|(i, url)| ServerConfig::stun(&format!("cli-stun-{}", i), url))
            .collect();
    }
    if let Some(ms) = args.negotiation_timeout_ms {
        config.negotiation_timeout_ms = ms;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    logger::init(&config.log_level);

    info!("Starting roomcall demo");
    info!("  Participants: {}", args.participants);
    info!("  Room: {}", args.room);
    info!("  ICE servers: {}", config.ice_servers.len());

    let room_id = RoomId::new(args.room.clone())?;
    let broker = MemoryBroker::new();
    let connector = Arc::new(RtcConnector::new(config.ice_servers.clone()));
    let renderer = Arc::new(LoggingRenderer);

    let mut handles = Vec::with_capacity(args.participants);
    for _ in 0..args.participants {
        let relay = ReconnectingRelay::new(broker.endpoint(), config.reconnect.clone());
        let mut room = Room::new(
            config.clone(),
            Arc::new(relay),
            connector.clone(),
            renderer.clone(),
        );
        if !args.receive_only {
            let capture = SyntheticCapture::new(room.key().to_string());
            room = room.with_capture(Arc::new(capture));
        }

        let handle = room
            .join(room_id.clone())
            .await
            .context("joining room")?;
        info!(key = %handle.key(), "participant joined");
        handles.push(handle);
    }

    tokio::time::sleep(Duration::from_secs(args.wait_secs)).await;

    for handle in &handles {
        let snapshot = handle.snapshot().await?;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    for handle in handles {
        handle.leave().await?;
    }
    info!(frames = broker.history().len(), "demo finished");
    Ok(())
}
