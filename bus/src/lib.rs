//! Authenticated, service-node-aware command bus.
//!
//! A `PeerBus` lets a process listen for encrypted-and-authenticated peer
//! connections, establish outgoing connections on demand to peers
//! identified by a 32-byte x25519 public key, and dispatch named remote
//! commands (`category.command`) to registered handlers running on a pool
//! of worker threads.
//!
//! Internally a single proxy thread owns every socket and every piece of
//! shared state; caller threads and workers communicate with it purely over
//! channels, so `send` and `connect` never block beyond enqueuing a control
//! message.
//!
//! ## Example
//!
//! ```rust,no_run
//! use peerbus::{Access, Allow, AuthLevel, BusBuilder};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut bus = BusBuilder::new()
//!     .listen_on("127.0.0.1:7700".parse()?)
//!     .allow(|_ip, _pubkey| {
//!         Some(Allow {
//!             auth: AuthLevel::None,
//!             remote_sn: false,
//!         })
//!     })
//!     .add_category("rpc", Access::default(), 1, Some(peerbus::DEFAULT_MAX_QUEUE))?
//!     .add_command("rpc", "ping", |msg| {
//!         let _ = msg.reply("rpc.pong", &[]);
//!     })?
//!     .start()?;
//!
//! // ... later:
//! bus.stop();
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

mod auth;
mod category;
mod control;
mod error;
mod keys;
mod message;
mod options;
mod peers;
mod proxy;
mod socket;
mod workers;

pub use auth::{Access, Allow, AuthLevel};
pub use category::{CommandHandler, MAX_CATEGORY_LENGTH, MAX_COMMAND_LENGTH};
pub use error::{ConfigError, StartError, Stopped};
pub use keys::{Keypair, PubKey};
pub use message::Message;
pub use options::SendOption;
pub use proxy::{DEFAULT_CONNECT_KEEP_ALIVE, DEFAULT_SEND_KEEP_ALIVE};
pub use socket::Tunables;

/// Default cap on a category's pending-job queue.
pub const DEFAULT_MAX_QUEUE: usize = 200;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;
use zeroize::Zeroizing;

use crate::category::Registry;
use crate::control::Client;
use crate::proxy::{Proxy, ProxyConfig};

/// Configures a bus and starts it.
///
/// Categories, commands, and aliases are registered here, before `start()`;
/// the builder is consumed by `start()`, which is what seals configuration
/// once the bus is running.
pub struct BusBuilder {
    keypair: Option<Keypair>,
    service_node: bool,
    binds: Vec<SocketAddr>,
    lookup: Option<Arc<auth::LookupFn>>,
    allow: Option<Arc<auth::AllowFn>>,
    general_workers: usize,
    tunables: Tunables,
    registry: Registry,
}

impl BusBuilder {
    /// Start configuring a bus.
    pub fn new() -> Self {
        Self {
            keypair: None,
            service_node: false,
            binds: Vec::new(),
            lookup: None,
            allow: None,
            general_workers: 0,
            tunables: Tunables::default(),
            registry: Registry::new(),
        }
    }

    /// Use the given long-term x25519 keypair as this instance's identity.
    ///
    /// Without this an ephemeral keypair is generated at start; service
    /// nodes must supply their keys explicitly.
    pub fn keypair(mut self, pubkey: [u8; 32], seckey: [u8; 32]) -> Result<Self, ConfigError> {
        self.keypair = Some(Keypair::from_bytes(pubkey, seckey)?);
        Ok(self)
    }

    /// Mark this instance as a service node for `local_sn` access checks.
    pub fn service_node(mut self, service_node: bool) -> Self {
        self.service_node = service_node;
        self
    }

    /// Listen for incoming connections on the given address (repeatable).
    pub fn listen_on(mut self, addr: SocketAddr) -> Self {
        self.binds.push(addr);
        self
    }

    /// Set the callback resolving a peer pubkey to a `host:port` address
    /// for outgoing connections.
    pub fn peer_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&PubKey) -> Option<String> + Send + Sync + 'static,
    {
        self.lookup = Some(Arc::new(lookup));
        self
    }

    /// Set the callback deciding whether an incoming connection is admitted
    /// and with what credentials. The default refuses everything.
    pub fn allow<F>(mut self, allow: F) -> Self
    where
        F: Fn(IpAddr, &PubKey) -> Option<Allow> + Send + Sync + 'static,
    {
        self.allow = Some(Arc::new(allow));
        self
    }

    /// Number of general worker threads; 0 means the hardware parallelism.
    /// Categories with reserved threads add to this.
    pub fn general_workers(mut self, count: usize) -> Self {
        self.general_workers = count;
        self
    }

    /// How long connection handshakes may take (default 10 s).
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.tunables.handshake_timeout = timeout;
        self
    }

    /// Cap on a single incoming message (default 1 MiB); `None` removes
    /// the cap.
    pub fn max_message_size(mut self, max: Option<usize>) -> Self {
        self.tunables.max_message_size = max;
        self
    }

    /// How long a closing connection may spend flushing queued writes
    /// (default 5 s).
    pub fn close_linger(mut self, linger: Duration) -> Self {
        self.tunables.close_linger = linger;
        self
    }

    /// Register a command category.
    ///
    /// `reserved_threads` workers are guaranteed to this category on top of
    /// the general pool. `max_queue` bounds jobs waiting for a worker:
    /// `None` is unbounded, `Some(0)` drops whenever no worker is free.
    pub fn add_category(
        mut self,
        name: &str,
        access: Access,
        reserved_threads: usize,
        max_queue: Option<usize>,
    ) -> Result<Self, ConfigError> {
        self.registry
            .add_category(name, access, reserved_threads, max_queue)?;
        Ok(self)
    }

    /// Register a command in an existing category.
    pub fn add_command<F>(mut self, category: &str, name: &str, handler: F) -> Result<Self, ConfigError>
    where
        F: Fn(Message<'_>) + Send + Sync + 'static,
    {
        self.registry.add_command(category, name, Arc::new(handler))?;
        Ok(self)
    }

    /// Map one command token to another, for renamed commands. Access is
    /// checked against the target's category.
    pub fn add_command_alias(mut self, from: &str, to: &str) -> Result<Self, ConfigError> {
        self.registry.add_alias(from, to)?;
        Ok(self)
    }

    /// Bind the listeners and launch the proxy thread.
    pub fn start(self) -> Result<PeerBus, StartError> {
        let keypair = match self.keypair {
            Some(keypair) => keypair,
            None if self.service_node => return Err(ConfigError::MissingKeypair.into()),
            None => Keypair::generate(),
        };

        let mut listeners = Vec::new();
        let mut listen_addrs = Vec::new();
        for addr in &self.binds {
            let listener = std::net::TcpListener::bind(addr).map_err(|source| StartError::Bind {
                addr: *addr,
                source,
            })?;
            listener
                .set_nonblocking(true)
                .map_err(|source| StartError::Bind {
                    addr: *addr,
                    source,
                })?;
            if let Ok(local) = listener.local_addr() {
                listen_addrs.push(local);
            }
            listeners.push(listener);
        }

        let general_workers = if self.general_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.general_workers
        };

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let client = Client::new(control_tx, Arc::new(AtomicBool::new(false)));

        let config = ProxyConfig {
            local_pubkey: keypair.public(),
            local_sn: self.service_node,
            general_workers,
            tunables: self.tunables,
            lookup: self.lookup.unwrap_or_else(|| {
                Arc::new(|pubkey: &PubKey| {
                    warn!("no peer lookup configured; cannot resolve {}", pubkey);
                    None
                })
            }),
            allow: self
                .allow
                .unwrap_or_else(|| Arc::new(|_ip, _pubkey: &PubKey| None)),
            registry: self.registry,
            listeners,
        };
        let proxy = Proxy::new(config, control_rx, client.clone());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(StartError::Runtime)?;
        let thread = std::thread::Builder::new()
            .name("peerbus-proxy".into())
            .spawn(move || runtime.block_on(proxy.run()))
            .map_err(StartError::Spawn)?;

        Ok(PeerBus {
            client,
            proxy: Some(thread),
            pubkey: keypair.public(),
            seckey: keypair.secret_bytes(),
            listen_addrs,
        })
    }
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running bus instance.
///
/// Dropping the handle shuts the bus down: in-flight handlers run to
/// completion, workers and the proxy thread are joined, and every socket is
/// closed.
pub struct PeerBus {
    client: Client,
    proxy: Option<std::thread::JoinHandle<()>>,
    pubkey: PubKey,
    seckey: Zeroizing<[u8; 32]>,
    listen_addrs: Vec<SocketAddr>,
}

impl PeerBus {
    /// This instance's public key (generated at start if none was given).
    pub fn pubkey(&self) -> &PubKey {
        &self.pubkey
    }

    /// This instance's secret key.
    pub fn seckey(&self) -> &[u8; 32] {
        &self.seckey
    }

    /// The addresses the listeners actually bound (useful with port 0).
    pub fn listen_addrs(&self) -> &[SocketAddr] {
        &self.listen_addrs
    }

    /// Queue a command for the given peer.
    ///
    /// An outgoing connection is established if needed (subject to the
    /// options); the call itself only enqueues a control message.
    pub fn send(
        &self,
        pubkey: &PubKey,
        command: &str,
        parts: &[Bytes],
        options: &[SendOption],
    ) -> Result<(), Stopped> {
        self.client.send(pubkey, command, parts, options)
    }

    /// Ask the proxy to establish an outgoing connection in anticipation of
    /// needing one, or to raise the idle timeout of an existing one.
    ///
    /// `DEFAULT_CONNECT_KEEP_ALIVE` is the conventional keep-alive here;
    /// sends that connect implicitly use the much shorter
    /// `DEFAULT_SEND_KEEP_ALIVE`.
    pub fn connect(
        &self,
        pubkey: &PubKey,
        keep_alive: Duration,
        hint: Option<&str>,
    ) -> Result<(), Stopped> {
        self.client.connect(pubkey, keep_alive, hint)
    }

    /// Drop any outgoing connection to the peer.
    pub fn disconnect(&self, pubkey: &PubKey) -> Result<(), Stopped> {
        self.client.disconnect(pubkey)
    }

    /// Shut the bus down and wait for the proxy thread to finish.
    pub fn stop(&mut self) {
        if let Some(handle) = self.proxy.take() {
            self.client.begin_shutdown();
            if handle.join().is_err() {
                warn!("proxy thread panicked during shutdown");
            }
        }
    }
}

impl Drop for PeerBus {
    fn drop(&mut self) {
        self.stop();
    }
}
