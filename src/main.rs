use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pxp::{
    Channel, ConnectInfo, FnDiscovery, MemoryTransport, Peer, PeerConfig, PeerEvent, SessionList,
};

#[derive(Parser, Debug)]
#[command(name = "pxp-demo")]
#[command(author, version, about = "Run a hub and two leaves over in-memory transports", long_about = None)]
struct Args {
    /// Network id shared by every session.
    #[arg(short, long, default_value = "demo")]
    network: String,

    /// Payload sent through the relay.
    #[arg(short, long, default_value = "hello through the relay")]
    message: String,

    /// Candidate lifetime on the hub, in milliseconds.
    #[arg(long, default_value = "15000")]
    candidate_ttl_ms: u64,

    /// Give up if the demo has not finished after this many seconds.
    #[arg(short, long, default_value = "10")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    time::timeout(Duration::from_secs(args.timeout), run(&args))
        .await
        .context("demo timed out")?
}

async fn run(args: &Args) -> Result<()> {
    let network = args.network.as_str();
    let hub_sessions = SessionList::new();
    let hub_config = PeerConfig::new()
        .with_shared_network(network, Arc::new(hub_sessions.clone()))
        .with_connect_info(ConnectInfo {
            relay: true,
            pxp: true,
            ..ConnectInfo::default()
        })
        .with_candidate_ttl(Duration::from_millis(args.candidate_ttl_ms));

    let (hub_a_end, leaf_a_end) = MemoryTransport::pair();
    let (hub_b_end, leaf_b_end) = MemoryTransport::pair();

    let (hub_a, events) = Peer::spawn(hub_a_end, hub_config.clone()).await?;
    tokio::spawn(drive_events("hub-a", events));
    let (hub_b, events) = Peer::spawn(hub_b_end, hub_config).await?;
    tokio::spawn(drive_events("hub-b", events));
    hub_sessions.add(hub_a.clone());
    hub_sessions.add(hub_b.clone());

    let (leaf_a, events) = Peer::spawn(
        leaf_a_end,
        PeerConfig::new().with_network(network, FnDiscovery::new(|| Ok(Vec::new()))),
    )
    .await?;
    tokio::spawn(drive_events("leaf-a", events));

    let (leaf_b, events) = Peer::spawn(
        leaf_b_end,
        PeerConfig::new()
            .with_network(network, FnDiscovery::new(|| Ok(Vec::new())))
            .with_connect_info(ConnectInfo::default().with_attribute("demo", "leaf-b")),
    )
    .await?;
    tokio::spawn(drive_events("leaf-b", events));

    leaf_a.ready().await.context("leaf-a handshake failed")?;
    leaf_b.ready().await.context("leaf-b handshake failed")?;
    info!(hub_sessions = hub_sessions.len(), "all sessions ready");

    let mut data = leaf_a.connect(network).await.context("connect failed")?;
    let echoed = round_trip(&mut data, b"ping").await?;
    info!(channel = data.name(), echoed = %String::from_utf8_lossy(&echoed), "data channel echo");
    drop(data);

    let candidates = leaf_a.get_peers(network).await.context("getpeers failed")?;
    info!(count = candidates.len(), "discovered candidates");
    let candidate = candidates.first().context("hub offered no candidates")?;
    info!(
        candidate = %&candidate.id[..8],
        connect_info = ?candidate.connect_info,
        "relaying to candidate"
    );

    let mut relayed = leaf_a.relay(candidate).await.context("relay failed")?;
    let echoed = round_trip(&mut relayed, args.message.as_bytes()).await?;
    info!(echoed = %String::from_utf8_lossy(&echoed), "relay echo");
    anyhow::ensure!(echoed == args.message.as_bytes(), "relay corrupted the payload");

    for peer in [&leaf_a, &leaf_b, &hub_a, &hub_b] {
        peer.close().await;
    }
    Ok(())
}

/// Write `payload`, half-close, and read until the remote closes.
async fn round_trip(channel: &mut Channel, payload: &[u8]) -> Result<Vec<u8>> {
    channel.write_all(payload).await?;
    channel.shutdown().await?;
    let mut received = Vec::new();
    channel.read_to_end(&mut received).await?;
    Ok(received)
}

async fn echo(channel: Channel) {
    let name = channel.name().to_string();
    let (mut reader, mut writer) = tokio::io::split(channel);
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => info!(channel = %name, bytes, "echo finished"),
        Err(e) => warn!(channel = %name, error = %e, "echo failed"),
    }
    let _ = writer.shutdown().await;
}

async fn drive_events(name: &'static str, mut events: mpsc::Receiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::Ready => info!(session = name, "ready"),
            PeerEvent::Connect { network, channel } => {
                info!(session = name, network = %network, "inbound data channel");
                tokio::spawn(echo(channel));
            }
            PeerEvent::Incoming(channel) => {
                info!(session = name, channel = channel.name(), "inbound relay");
                tokio::spawn(echo(channel));
            }
            PeerEvent::Upgrade { request, responder } => {
                info!(session = name, transport = %request.transport, "upgrade declined");
                let _ = responder.respond(Vec::new()).await;
            }
            PeerEvent::Error(e) => warn!(session = name, error = %e, "session error"),
            PeerEvent::Disconnect => {
                info!(session = name, "disconnected");
                break;
            }
        }
    }
}
