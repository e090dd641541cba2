//! The proxy loop.
//!
//! One dedicated thread owns every socket and every piece of mutable state:
//! the peer table, the remotes vector, the category registry, and the idle
//! worker set. Caller threads and workers only ever talk to it over
//! channels, so none of that state needs a lock. The loop services, in
//! fairness order: control messages, worker signals, admission requests,
//! listener events, and outgoing-remote events, waking early for the idle
//! expiry scan.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use peerbus_wire::{dict_get_bytes, dict_get_int, dict_get_list, dict_get_str, Dict, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{self, AllowFn, AuthRequest, Authenticator, LookupFn};
use crate::category::Registry;
use crate::control::{Client, ControlFrame, ControlVerb};
use crate::keys::PubKey;
use crate::peers::PeerTable;
use crate::socket::{self, IncomingEvent, ListenerCtx, Multipart, RemoteEvent, RouteId, Tunables};
use crate::workers::{Job, WorkerEvent, WorkerPool};

/// Keep-alive applied when a send implicitly opens a connection.
pub const DEFAULT_SEND_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Keep-alive applied by an explicit connect when none is given.
pub const DEFAULT_CONNECT_KEEP_ALIVE: Duration = Duration::from_secs(300);

/// Cadence of the idle-expiry scan.
const EXPIRY_INTERVAL: Duration = Duration::from_millis(250);

/// Connection-teardown primitive handled inline, never by a worker.
const BYE: &str = "BYE";

/// Where an incoming frame arrived, and therefore where replies to it go.
enum Source {
    Route(RouteId),
    Remote(usize),
}

/// Where an outgoing message leaves.
enum Destination {
    Route(RouteId),
    Remote(usize),
}

enum ProxyState {
    Running,
    Draining,
}

/// One wake-up of the loop.
enum Wake {
    Control(Option<ControlFrame>),
    Worker(Option<WorkerEvent>),
    Auth(Option<AuthRequest>),
    Incoming(Option<IncomingEvent>),
    Remote(usize, RemoteEvent),
    Expiry,
}

#[derive(Default)]
struct ProxyStats {
    dispatched: u64,
    queue_dropped: u64,
    auth_denied: u64,
    send_dropped: u64,
}

/// Everything the proxy needs from the builder.
pub(crate) struct ProxyConfig {
    pub local_pubkey: PubKey,
    pub local_sn: bool,
    pub general_workers: usize,
    pub tunables: Tunables,
    pub lookup: Arc<LookupFn>,
    pub allow: Arc<AllowFn>,
    pub registry: Registry,
    pub listeners: Vec<std::net::TcpListener>,
}

pub(crate) struct Proxy {
    local_pubkey: PubKey,
    local_sn: bool,
    general_workers: usize,
    /// Total slot count while running; zeroed on QUIT so nothing new
    /// dispatches during the drain.
    max_workers: usize,
    general_in_use: usize,
    tunables: Tunables,
    lookup: Arc<LookupFn>,
    authenticator: Authenticator,
    registry: Registry,
    table: PeerTable,
    pool: WorkerPool,
    state: ProxyState,
    control_rx: mpsc::UnboundedReceiver<ControlFrame>,
    worker_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    auth_rx: mpsc::UnboundedReceiver<AuthRequest>,
    incoming_rx: mpsc::UnboundedReceiver<IncomingEvent>,
    listener_ctx: ListenerCtx,
    std_listeners: Vec<std::net::TcpListener>,
    listener_tasks: Vec<tokio::task::JoinHandle<()>>,
    next_expiry: tokio::time::Instant,
    stats: ProxyStats,
}

impl Proxy {
    pub fn new(
        config: ProxyConfig,
        control_rx: mpsc::UnboundedReceiver<ControlFrame>,
        client: Client,
    ) -> Self {
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let max_workers = config.general_workers + config.registry.reserved_total();
        let pool = WorkerPool::new(max_workers, worker_tx, client);

        let listener_ctx = ListenerCtx {
            local_pubkey: config.local_pubkey,
            auth_tx,
            events_tx: incoming_tx,
            routes: Arc::new(AtomicU64::new(1)),
            tunables: config.tunables.clone(),
        };

        Self {
            local_pubkey: config.local_pubkey,
            local_sn: config.local_sn,
            general_workers: config.general_workers,
            max_workers,
            general_in_use: 0,
            tunables: config.tunables,
            lookup: config.lookup,
            authenticator: Authenticator::new(config.allow),
            registry: config.registry,
            table: PeerTable::new(),
            pool,
            state: ProxyState::Running,
            control_rx,
            worker_rx,
            auth_rx,
            incoming_rx,
            listener_ctx,
            std_listeners: config.listeners,
            listener_tasks: Vec::new(),
            next_expiry: tokio::time::Instant::now() + EXPIRY_INTERVAL,
            stats: ProxyStats::default(),
        }
    }

    pub async fn run(mut self) {
        for std_listener in std::mem::take(&mut self.std_listeners) {
            match TcpListener::from_std(std_listener) {
                Ok(listener) => self
                    .listener_tasks
                    .push(socket::spawn_listener(listener, self.listener_ctx.clone())),
                Err(e) => warn!("failed to register listener: {}", e),
            }
        }
        self.next_expiry = tokio::time::Instant::now() + EXPIRY_INTERVAL;
        info!(
            "proxy started: {} worker slots ({} general), {} listener(s)",
            self.pool.size(),
            self.general_workers,
            self.listener_tasks.len()
        );

        loop {
            let wake = tokio::select! {
                biased;

                frame = self.control_rx.recv() => Wake::Control(frame),
                event = self.worker_rx.recv() => Wake::Worker(event),
                request = self.auth_rx.recv() => Wake::Auth(request),
                event = self.incoming_rx.recv() => Wake::Incoming(event),
                (index, event) = self.table.next_remote_event() => Wake::Remote(index, event),
                _ = tokio::time::sleep_until(self.next_expiry) => Wake::Expiry,
            };

            match wake {
                Wake::Control(Some(frame)) => self.handle_control(frame),
                Wake::Control(None) => {
                    warn!("control channel closed without QUIT; shutting down");
                    self.begin_quit();
                }
                Wake::Worker(Some(event)) => self.handle_worker(event),
                Wake::Worker(None) => {}
                Wake::Auth(Some(request)) => self.authenticator.handle(request),
                Wake::Auth(None) => {}
                Wake::Incoming(Some(event)) => self.handle_incoming(event),
                Wake::Incoming(None) => {}
                Wake::Remote(index, event) => self.handle_remote(index, event),
                Wake::Expiry => {
                    self.table.expire_idle(Instant::now());
                    self.next_expiry = tokio::time::Instant::now() + EXPIRY_INTERVAL;
                }
            }

            if matches!(self.state, ProxyState::Draining) && self.pool.all_stopped() {
                break;
            }
        }

        for task in &self.listener_tasks {
            task.abort();
        }
        self.table.clear();
        self.pool.join_all();
        info!(
            "proxy stopped: {} jobs dispatched, {} queue drops, {} access denials, {} undeliverable sends, {} connections refused",
            self.stats.dispatched,
            self.stats.queue_dropped,
            self.stats.auth_denied,
            self.stats.send_dropped,
            self.authenticator.denied(),
        );
    }

    fn handle_control(&mut self, frame: ControlFrame) {
        if let ControlVerb::Quit = frame.verb {
            self.begin_quit();
            return;
        }
        if matches!(self.state, ProxyState::Draining) {
            debug!("ignoring {} during drain", frame.verb.as_str());
            return;
        }

        let dict = match peerbus_wire::decode(&frame.data) {
            Ok(Value::Dict(dict)) => dict,
            _ => {
                warn!("malformed {} control message", frame.verb.as_str());
                return;
            }
        };
        match frame.verb {
            ControlVerb::Send => self.proxy_send(dict),
            ControlVerb::Reply => self.proxy_reply(dict),
            ControlVerb::Connect => self.proxy_connect(dict),
            ControlVerb::Disconnect => self.proxy_disconnect(dict),
            ControlVerb::Quit => {}
        }
    }

    fn begin_quit(&mut self) {
        if matches!(self.state, ProxyState::Draining) {
            return;
        }
        info!(
            "quit received; draining {} active job(s)",
            self.registry.active_total()
        );
        self.state = ProxyState::Draining;
        self.max_workers = 0;
        for task in &self.listener_tasks {
            task.abort();
        }
        self.pool.begin_quit();
    }

    /// SEND: resolve a connection to the peer (opening one if allowed and
    /// needed) and queue the frames on it.
    fn proxy_send(&mut self, dict: Dict) {
        let Some(pubkey) = dict_pubkey(&dict) else {
            warn!("SEND without a valid pubkey");
            return;
        };
        let Some((command, data)) = dict_send_parts(&dict) else {
            warn!("SEND without message parts");
            return;
        };
        let hint = dict_get_str(&dict, "hint");
        let optional = dict_get_int(&dict, "optional").unwrap_or(0) != 0;
        let incoming_only = dict_get_int(&dict, "incoming").unwrap_or(0) != 0;
        let keep_alive = dict_get_int(&dict, "keep-alive")
            .map(|ms| Duration::from_millis(ms.max(0) as u64))
            .unwrap_or(DEFAULT_SEND_KEEP_ALIVE);

        let Some(dest) =
            self.resolve_destination(&pubkey, hint.as_deref(), optional, incoming_only, keep_alive)
        else {
            self.stats.send_dropped += 1;
            return;
        };
        self.write_to(dest, assemble(command, data));
    }

    /// REPLY: like SEND but restricted to the peer's incoming route; never
    /// initiates a connection.
    fn proxy_reply(&mut self, dict: Dict) {
        let Some(pubkey) = dict_pubkey(&dict) else {
            warn!("REPLY without a valid pubkey");
            return;
        };
        let Some((command, data)) = dict_send_parts(&dict) else {
            warn!("REPLY without message parts");
            return;
        };
        let Some(route) = self.table.peer(&pubkey).and_then(|p| p.incoming) else {
            debug!("dropping reply to {}: incoming connection is gone", pubkey);
            self.stats.send_dropped += 1;
            return;
        };
        if let Some(peer) = self.table.peer_mut(&pubkey) {
            peer.activity();
        }
        self.write_to(Destination::Route(route), assemble(command, data));
    }

    /// CONNECT: ensure an outgoing connection exists, raising the idle
    /// timeout of one that already does.
    fn proxy_connect(&mut self, dict: Dict) {
        let Some(pubkey) = dict_pubkey(&dict) else {
            warn!("CONNECT without a valid pubkey");
            return;
        };
        let keep_alive = dict_get_int(&dict, "keep-alive")
            .map(|ms| Duration::from_millis(ms.max(0) as u64))
            .unwrap_or(DEFAULT_CONNECT_KEEP_ALIVE);
        let hint = dict_get_str(&dict, "hint");

        if let Some(peer) = self.table.peer_mut(&pubkey) {
            if peer.outgoing.is_some() {
                peer.idle_expiry = peer.idle_expiry.max(keep_alive);
                peer.activity();
                return;
            }
        }
        let _ = self.open_remote(&pubkey, hint.as_deref(), keep_alive);
    }

    fn proxy_disconnect(&mut self, dict: Dict) {
        let Some(pubkey) = dict_pubkey(&dict) else {
            warn!("DISCONNECT without a valid pubkey");
            return;
        };
        if let Some(index) = self.table.peer(&pubkey).and_then(|p| p.outgoing) {
            info!("disconnecting from {}", pubkey);
            self.table.close_remote(index);
        }
    }

    /// Pick the connection a message should leave on: an existing outgoing
    /// slot first, then an existing incoming route, and only then a fresh
    /// outgoing connection (unless the options forbid it).
    fn resolve_destination(
        &mut self,
        pubkey: &PubKey,
        hint: Option<&str>,
        optional: bool,
        incoming_only: bool,
        keep_alive: Duration,
    ) -> Option<Destination> {
        if let Some(peer) = self.table.peer_mut(pubkey) {
            if incoming_only {
                if let Some(route) = peer.incoming {
                    peer.activity();
                    return Some(Destination::Route(route));
                }
                debug!("dropping message for {}: no incoming route", pubkey);
                return None;
            }
            if let Some(index) = peer.outgoing {
                peer.idle_expiry = peer.idle_expiry.max(keep_alive);
                peer.activity();
                return Some(Destination::Remote(index));
            }
            if let Some(route) = peer.incoming {
                peer.activity();
                return Some(Destination::Route(route));
            }
        }
        if optional || incoming_only {
            debug!("dropping message for {}: not connected", pubkey);
            return None;
        }
        self.open_remote(pubkey, hint, keep_alive)
            .map(Destination::Remote)
    }

    fn open_remote(
        &mut self,
        pubkey: &PubKey,
        hint: Option<&str>,
        keep_alive: Duration,
    ) -> Option<usize> {
        let addr = match hint.filter(|h| !h.is_empty()) {
            Some(hint) => hint.to_string(),
            None => match (self.lookup)(pubkey) {
                Some(addr) => addr,
                None => {
                    warn!("no address known for {}; dropping", pubkey);
                    return None;
                }
            },
        };
        info!("connecting to {} at {}", pubkey, addr);
        let (sender, events) =
            socket::spawn_remote(addr, *pubkey, self.local_pubkey, self.tunables.clone());
        Some(self.table.open_remote(*pubkey, keep_alive, sender, events))
    }

    fn write_to(&mut self, dest: Destination, parts: Multipart) {
        let queued = match dest {
            Destination::Remote(index) => self
                .table
                .remote(index)
                .map(|slot| slot.sender.send(parts).is_ok())
                .unwrap_or(false),
            Destination::Route(route) => self
                .table
                .route(route)
                .map(|r| r.sender.send(parts).is_ok())
                .unwrap_or(false),
        };
        if !queued {
            warn!("failed to queue message: connection is closing");
            self.stats.send_dropped += 1;
        }
    }

    fn handle_incoming(&mut self, event: IncomingEvent) {
        match event {
            IncomingEvent::Opened {
                route,
                pubkey,
                allow,
                writer,
            } => {
                self.table
                    .open_route(route, pubkey, allow.auth, allow.remote_sn, writer);
            }
            IncomingEvent::Message { route, parts } => {
                let Some(pubkey) = self.table.route(route).map(|r| r.pubkey) else {
                    debug!("message on unknown route {}", route);
                    return;
                };
                if let Some(peer) = self.table.peer_mut(&pubkey) {
                    peer.activity();
                }
                self.dispatch(Source::Route(route), pubkey, parts);
            }
            IncomingEvent::Closed { route } => self.table.close_route(route),
        }
    }

    fn handle_remote(&mut self, index: usize, event: RemoteEvent) {
        match event {
            RemoteEvent::Connected => {
                if let Some(pubkey) = self.table.remote(index).map(|s| s.pubkey) {
                    debug!("connection to {} ready", pubkey);
                    if let Some(peer) = self.table.peer_mut(&pubkey) {
                        peer.activity();
                    }
                }
            }
            RemoteEvent::Message { parts } => {
                let Some(pubkey) = self.table.remote(index).map(|s| s.pubkey) else {
                    return;
                };
                if let Some(peer) = self.table.peer_mut(&pubkey) {
                    peer.activity();
                }
                self.dispatch(Source::Remote(index), pubkey, parts);
            }
            RemoteEvent::Closed => self.table.close_remote(index),
        }
    }

    /// Route one incoming message: builtins inline, everything else through
    /// resolution, the access check, and the scheduler.
    fn dispatch(&mut self, source: Source, pubkey: PubKey, mut parts: Multipart) {
        let Some(first) = parts.first() else {
            return;
        };
        let Ok(mut command) = String::from_utf8(first.to_vec()) else {
            warn!("non-UTF-8 command token from {}", pubkey);
            return;
        };

        if self.handle_builtin(&source, &pubkey, &command) {
            return;
        }

        let Some(resolved) = self.registry.resolve(&mut command) else {
            return;
        };
        let Some(peer) = self.table.peer(&pubkey) else {
            warn!("message from unknown peer {}", pubkey);
            return;
        };
        if !auth::access_granted(
            &resolved.access,
            peer.auth_level,
            peer.service_node,
            self.local_sn,
        ) {
            warn!(
                "dropping `{}` from {}: insufficient access (auth {}, sn {})",
                command, pubkey, peer.auth_level, peer.service_node
            );
            self.stats.auth_denied += 1;
            return;
        }

        let data = parts.split_off(1);
        self.schedule(Job {
            category: resolved.category,
            command,
            pubkey,
            service_node: peer.service_node,
            callback: resolved.handler,
            parts: data,
        });
    }

    fn handle_builtin(&mut self, source: &Source, pubkey: &PubKey, command: &str) -> bool {
        if command != BYE {
            return false;
        }
        info!("peer {} said BYE; closing connection", pubkey);
        match *source {
            Source::Route(route) => self.table.close_route(route),
            Source::Remote(index) => self.table.close_remote(index),
        }
        true
    }

    /// Admit a job to a worker, preferring the category's reservation, then
    /// the general pool, then the pending queue (bounded by the category's
    /// cap).
    fn schedule(&mut self, job: Job) {
        if self.max_workers == 0 {
            debug!("draining; dropping `{}`", job.command);
            return;
        }
        let Some(cat) = self.registry.get_mut(&job.category) else {
            return;
        };
        let use_reserved = cat.active_threads < cat.reserved_threads;
        let use_general = !use_reserved && self.general_in_use < self.general_workers;

        if (use_reserved || use_general) && self.pool.has_idle() {
            self.run_job(job, !use_reserved);
            return;
        }

        if let Some(cat) = self.registry.get_mut(&job.category) {
            let fits = match cat.max_queue {
                None => true,
                Some(max) => cat.pending.len() < max,
            };
            if fits {
                cat.pending.push_back(job);
            } else {
                warn!(
                    "queue for category `{}` is full; dropping `{}`",
                    job.category, job.command
                );
                self.stats.queue_dropped += 1;
            }
        }
    }

    fn run_job(&mut self, job: Job, counts_general: bool) {
        if let Some(cat) = self.registry.get_mut(&job.category) {
            cat.active_threads += 1;
        }
        if counts_general {
            self.general_in_use += 1;
        }
        self.stats.dispatched += 1;
        debug!(
            "dispatching `{}` on a {} slot",
            job.command,
            if counts_general { "general" } else { "reserved" }
        );

        if let Err(job) = self.pool.run(job, counts_general) {
            warn!("no worker slot available for `{}`; dropping", job.command);
            if let Some(cat) = self.registry.get_mut(&job.category) {
                cat.active_threads = cat.active_threads.saturating_sub(1);
            }
            if counts_general {
                self.general_in_use -= 1;
            }
            self.stats.dispatched -= 1;
        }
    }

    fn handle_worker(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready(index) => {
                if let Some(active) = self.pool.complete(index) {
                    if let Some(cat) = self.registry.get_mut(&active.category) {
                        cat.active_threads = cat.active_threads.saturating_sub(1);
                    }
                    if active.counts_general {
                        self.general_in_use -= 1;
                    }
                }
                if matches!(self.state, ProxyState::Draining) {
                    self.pool.quit_slot(index);
                } else {
                    self.pool.mark_idle(index);
                    self.drain_pending();
                }
            }
            WorkerEvent::Stopped(index) => self.pool.note_stopped(index),
        }
    }

    /// After a completion, hand the freed slot to a category still under
    /// its reservation first, then to anyone with pending work the general
    /// pool can cover.
    fn drain_pending(&mut self) {
        if self.max_workers == 0 || !self.pool.has_idle() {
            return;
        }
        if let Some(job) = self
            .registry
            .take_pending(|c| c.active_threads < c.reserved_threads)
        {
            self.run_job(job, false);
            return;
        }
        if self.general_in_use < self.general_workers {
            if let Some(job) = self.registry.take_pending(|_| true) {
                self.run_job(job, true);
            }
        }
    }
}

fn dict_pubkey(dict: &Dict) -> Option<PubKey> {
    dict_get_bytes(dict, "pubkey").and_then(PubKey::from_slice)
}

/// Pull the command token and payload parts out of a SEND/REPLY dict.
fn dict_send_parts(dict: &Dict) -> Option<(String, Vec<Bytes>)> {
    let list = dict_get_list(dict, "send")?;
    let mut iter = list.iter();
    let command = iter
        .next()?
        .as_bytes()
        .and_then(|b| std::str::from_utf8(b).ok())?
        .to_string();
    let parts = iter
        .map(|v| v.as_bytes().map(Bytes::copy_from_slice))
        .collect::<Option<Vec<_>>>()?;
    Some((command, parts))
}

fn assemble(command: String, data: Vec<Bytes>) -> Multipart {
    let mut parts = Vec::with_capacity(1 + data.len());
    parts.push(Bytes::from(command.into_bytes()));
    parts.extend(data);
    parts
}
