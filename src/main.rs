//! Headless mesh call participant.
//!
//! Joins a room through the signaling relay, publishes a camera stream and
//! logs roster changes until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use meshcall::{
    ClientConfig, LocalMedia, LocalStream, RoomContext, SignalingClient, SignalingCoordinator,
    WebRtcTransportFactory,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const MAX_CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_DELAY_MS: u64 = 1000;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "MESHCALL_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket URL of the signaling relay
    #[arg(long, env = "MESHCALL_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// Room to join
    #[arg(long, env = "MESHCALL_ROOM")]
    room: Option<String>,

    /// Display name shown to other participants
    #[arg(long, env = "MESHCALL_USERNAME")]
    username: Option<String>,
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meshcall=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClientConfig::default(),
    };

    if let Some(url) = &args.signaling_url {
        config.signaling_url = url.clone();
    }
    if let Some(room) = &args.room {
        config.room_id = Some(room.clone());
    }
    if let Some(username) = &args.username {
        config.username = username.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn connect(url: &str) -> Result<SignalingClient> {
    let mut attempts = 0;
    loop {
        match SignalingClient::connect(url).await {
            Ok(client) => return Ok(client),
            Err(e) if attempts + 1 < MAX_CONNECT_ATTEMPTS => {
                attempts += 1;
                warn!(attempts, error = %e, "Connection to relay failed, retrying");
                sleep(Duration::from_millis(CONNECT_DELAY_MS)).await;
            }
            Err(e) => return Err(e).context("Max connection attempts reached"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = load_config(&args)?;
    let room_id = config
        .room_id
        .clone()
        .context("no room configured, pass --room or set room_id")?;

    let client = connect(&config.signaling_url).await?;
    let (sender, inbound) = client.into_parts();

    let media = Arc::new(LocalMedia::new(
        config.local_stream_attempts,
        config.local_stream_retry(),
    ));
    media.set_stream(LocalStream::camera(&format!("{}-camera", config.username)));

    // The relay never tells a client its own socket id, so the coordinator
    // recognises this client's roster entries by username
    let coordinator = SignalingCoordinator::new(
        config.coordinator(),
        Arc::new(WebRtcTransportFactory::new(config.ice_servers.clone())),
        Arc::new(sender),
        media.clone(),
        RoomContext::new(),
    );
    coordinator.join_room(&room_id).await?;
    info!(room_id = %room_id, username = %config.username, "Joined room");

    let mut roster = coordinator.subscribe_roster();
    let runner = coordinator.clone();
    let mut run = tokio::spawn(async move { runner.run(inbound).await });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving room");
                break;
            }
            _ = &mut run => {
                warn!("Signaling connection closed");
                break;
            }
            changed = roster.changed() => {
                if changed.is_err() {
                    break;
                }
                let participants = roster.borrow_and_update();
                let active = participants.iter().filter(|p| p.active).count();
                let speaking: Vec<&str> = participants
                    .iter()
                    .filter(|p| p.is_speaking)
                    .map(|p| p.username.as_str())
                    .collect();
                info!(participants = participants.len(), active, ?speaking, "Roster updated");
            }
        }
    }

    coordinator.shutdown().await;
    media.stop_stream();
    Ok(())
}
