//! Configuration handling for the demo node.
//!
//! Reads an optional YAML config file and applies environment-variable
//! overrides on top, so a node can be pointed at a different port or peer
//! set without editing the file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use tracing::{info, warn};

/// One known peer: its hex-encoded pubkey and where to reach it.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerEntry {
    /// 64-character hex x25519 pubkey
    pub pubkey: String,
    /// Connect address, e.g. `127.0.0.1:7700`
    pub addr: String,
    /// Whether this peer is a service node
    #[serde(default)]
    pub service_node: bool,
}

/// Node configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Listen address; `None` means outgoing-only
    pub listen: Option<SocketAddr>,
    /// Hex-encoded x25519 public key (with `seckey`); empty to generate
    pub pubkey: Option<String>,
    /// Hex-encoded x25519 secret key
    pub seckey: Option<String>,
    /// Whether this node runs as a service node
    pub service_node: bool,
    /// Number of general worker threads (0 = hardware parallelism)
    pub general_workers: usize,
    /// Known peers, used for lookup and admission
    pub peers: Vec<PeerEntry>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: None,
            pubkey: None,
            seckey: None,
            service_node: false,
            general_workers: 0,
            peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a YAML file and the environment.
    pub fn load<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {:?}", path.as_ref()))?;
            config = serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse {:?}", path.as_ref()))?;
            info!("loaded configuration from {:?}", path.as_ref());
        }

        config.apply_environment_overrides();
        Ok(config)
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(listen) = std::env::var("PEERBUS_LISTEN") {
            match listen.parse() {
                Ok(addr) => {
                    self.listen = Some(addr);
                    info!("listen address overridden by environment: {}", addr);
                }
                Err(_) => warn!("ignoring invalid PEERBUS_LISTEN value `{}`", listen),
            }
        }
        if let Ok(workers) = std::env::var("PEERBUS_WORKERS") {
            match workers.parse() {
                Ok(count) => self.general_workers = count,
                Err(_) => warn!("ignoring invalid PEERBUS_WORKERS value `{}`", workers),
            }
        }
    }

    /// Decode the configured keypair, if one is present.
    pub fn keypair(&self) -> Result<Option<([u8; 32], [u8; 32])>> {
        match (&self.pubkey, &self.seckey) {
            (Some(pubkey), Some(seckey)) => {
                let pubkey = decode_key(pubkey).context("invalid pubkey")?;
                let seckey = decode_key(seckey).context("invalid seckey")?;
                Ok(Some((pubkey, seckey)))
            }
            (None, None) => Ok(None),
            _ => bail!("pubkey and seckey must be configured together"),
        }
    }

    /// Peer table keyed by decoded pubkey bytes.
    pub fn peer_map(&self) -> Result<HashMap<[u8; 32], PeerEntry>> {
        let mut map = HashMap::new();
        for entry in &self.peers {
            let key = decode_key(&entry.pubkey)
                .with_context(|| format!("invalid peer pubkey `{}`", entry.pubkey))?;
            map.insert(key, entry.clone());
        }
        Ok(map)
    }
}

fn decode_key(hex_key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_key).context("not valid hex")?;
    match <[u8; 32]>::try_from(bytes.as_slice()) {
        Ok(key) => Ok(key),
        Err(_) => bail!("expected 32 bytes, got {}", bytes.len()),
    }
}
