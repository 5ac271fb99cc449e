//! Entry point for `packet-engine`.
//!
//! Parses CLI arguments and dispatches into either **listen** or **send**
//! mode. All protocol work is delegated to the library; `main.rs` owns only
//! process setup (logging, argument parsing, binding the UDP transport).

use std::net::SocketAddrV4;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use packet_engine::udp::packet_dest;
use packet_engine::{CloseReason, EngineConfig, EngineError, PacketEngine, UdpTransport};

/// Reliable, ordered channels over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept channels and echo everything received on them.
    Listen {
        /// Network interface to bind (e.g. eth0, lo).
        #[arg(short, long, default_value = "lo")]
        iface: String,
        /// Local UDP port.
        #[arg(short, long, default_value_t = 9955)]
        port: u16,
    },
    /// Open a channel, send one message and print the echo.
    Send {
        /// Network interface to bind.
        #[arg(short, long, default_value = "lo")]
        iface: String,
        /// Local UDP port; 0 picks a free one.
        #[arg(short, long, default_value_t = 0)]
        port: u16,
        /// Listener address (e.g. 127.0.0.1:9955).
        #[arg(long)]
        peer: SocketAddrV4,
        /// Message lifetime in milliseconds; 0 never expires.
        #[arg(long, default_value_t = 0)]
        ttl: u32,
        /// Message to send.
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Listen { iface, port } => listen(&iface, port).await,
        Mode::Send { iface, port, peer, ttl, message } => send(&iface, port, peer, ttl, &message).await,
    }
}

async fn listen(iface: &str, port: u16) -> Result<()> {
    let transport = UdpTransport::bind(iface, port)
        .await
        .with_context(|| format!("binding {iface}:{port}"))?;
    info!("Listening on {}", transport.local_addr());
    let engine = PacketEngine::start(EngineConfig::default(), transport)?;

    loop {
        let stream = engine.accept(None).await?;
        info!("Channel {:#010x} from {}", stream.channel_id(), stream.peer_name());
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                match stream.pull_bytes(&mut buf, None).await {
                    Ok(n) => {
                        if let Err(e) = stream.push_bytes(&buf[..n]).await {
                            warn!("Echo on {:#010x} failed: {e}", stream.channel_id());
                            break;
                        }
                    }
                    Err(EngineError::ChannelClosed(CloseReason::Peer)) => {
                        info!("Channel {:#010x} closed by peer", stream.channel_id());
                        break;
                    }
                    Err(e) => {
                        warn!("Channel {:#010x}: {e}", stream.channel_id());
                        break;
                    }
                }
            }
        });
    }
}

async fn send(iface: &str, port: u16, peer: SocketAddrV4, ttl: u32, message: &str) -> Result<()> {
    let transport = UdpTransport::bind(iface, port)
        .await
        .with_context(|| format!("binding {iface}:{port}"))?;
    let engine = PacketEngine::start(EngineConfig::default(), transport)?;

    let stream = engine
        .connect(packet_dest(*peer.ip(), peer.port()))
        .await
        .with_context(|| format!("connecting to {peer}"))?;
    info!("Connected on channel {:#010x}", stream.channel_id());

    let payload = message.as_bytes();
    let sent = stream.push_bytes_with_ttl(payload, ttl).await?;
    if sent < payload.len() {
        bail!("only {sent} of {} bytes were accepted", payload.len());
    }

    let mut echo = Vec::with_capacity(payload.len());
    let mut buf = vec![0u8; 4096];
    while echo.len() < payload.len() {
        let n = stream.pull_bytes(&mut buf, Some(Duration::from_secs(5))).await?;
        echo.extend_from_slice(&buf[..n]);
    }
    println!("{}", String::from_utf8_lossy(&echo));

    stream.close().await;
    engine.stop().await;
    Ok(())
}
