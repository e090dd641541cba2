//! Demo peerbus node.
//!
//! Starts a bus with an `rpc` category (`rpc.ping` answered with
//! `rpc.pong`), admits the peers named in the config file, and optionally
//! pings one of them on an interval until Ctrl-C.

use anyhow::{bail, Context, Result};
use clap::Parser;
use peerbus::{Access, Allow, AuthLevel, BusBuilder, PubKey};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::NodeConfig;

/// Demo peerbus node
#[derive(Parser, Debug)]
#[command(name = "peerbus-node", version, about = "Demo peerbus node")]
struct Args {
    /// Path to a YAML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:7700 (overrides the config file)
    #[arg(long)]
    listen: Option<std::net::SocketAddr>,

    /// Hex pubkey of a configured peer to ping periodically
    #[arg(long)]
    ping: Option<String>,

    /// Interval between pings, e.g. 10s
    #[arg(long, default_value = "10s")]
    ping_interval: humantime::Duration,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut config = NodeConfig::load(args.config.as_ref())?;
    if let Some(listen) = args.listen {
        config.listen = Some(listen);
    }

    let peers = Arc::new(config.peer_map()?);

    let mut builder = BusBuilder::new()
        .service_node(config.service_node)
        .general_workers(config.general_workers);

    if let Some((pubkey, seckey)) = config.keypair()? {
        builder = builder.keypair(pubkey, seckey).context("bad keypair")?;
    }
    if let Some(listen) = config.listen {
        builder = builder.listen_on(listen);
    }

    // Admit configured peers as basic users (service nodes as flagged);
    // anyone else is refused.
    let admit = peers.clone();
    builder = builder.allow(move |ip, pubkey| match admit.get(pubkey.as_bytes()) {
        Some(entry) => Some(Allow {
            auth: AuthLevel::Basic,
            remote_sn: entry.service_node,
        }),
        None => {
            warn!("refusing unknown peer {} from {}", pubkey, ip);
            None
        }
    });

    let lookup = peers.clone();
    builder = builder
        .peer_lookup(move |pubkey: &PubKey| lookup.get(pubkey.as_bytes()).map(|e| e.addr.clone()));

    let bus = builder
        .add_category("rpc", Access::level(AuthLevel::Basic), 1, Some(peerbus::DEFAULT_MAX_QUEUE))?
        .add_command("rpc", "ping", |msg| {
            info!("ping from {}", msg.pubkey());
            if let Err(e) = msg.reply("rpc.pong", &[]) {
                warn!("failed to queue pong: {}", e);
            }
        })?
        .add_command("rpc", "pong", |msg| {
            info!("pong from {}", msg.pubkey());
        })?
        .start()?;

    info!("node {} running", bus.pubkey());
    for addr in bus.listen_addrs() {
        info!("listening on {}", addr);
    }

    let ping_target = match &args.ping {
        Some(hex_key) => {
            let bytes = hex::decode(hex_key).context("--ping expects a hex pubkey")?;
            let Some(target) = PubKey::from_slice(&bytes) else {
                bail!("--ping expects a 32-byte pubkey");
            };
            if !peers.contains_key(target.as_bytes()) {
                bail!("--ping target is not in the configured peer list");
            }
            Some(target)
        }
        None => None,
    };

    let mut interval = tokio::time::interval(args.ping_interval.into());
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Some(target) = &ping_target {
                    if let Err(e) = bus.send(target, "rpc.ping", &[], &[]) {
                        warn!("failed to queue ping: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    drop(bus);
    Ok(())
}
