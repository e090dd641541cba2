//! The peer table and the remotes vector.
//!
//! Peers are keyed by pubkey. A record exists while at least one side of a
//! connection does: an incoming route on the listener, an outgoing slot in
//! the remotes vector, or both at once. The remotes vector and the vector
//! of per-remote event receivers the proxy polls are strictly parallel and
//! are always mutated together, using swap-and-pop so the pollable set
//! stays contiguous.

use std::collections::HashMap;
use std::task::Poll;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::auth::AuthLevel;
use crate::keys::PubKey;
use crate::socket::{Multipart, RemoteEvent, RouteId};

/// State for one known peer.
pub(crate) struct Peer {
    /// Authenticated as a service node (checked at connection time only).
    pub service_node: bool,
    /// Auth level stamped by the admission dialog.
    pub auth_level: AuthLevel,
    /// Live incoming connection, if any.
    pub incoming: Option<RouteId>,
    /// Index into the remotes vector, if we hold an outgoing connection.
    pub outgoing: Option<usize>,
    /// Last send or receive involving this peer.
    pub last_activity: Instant,
    /// Inactivity span after which the outgoing side is closed.
    pub idle_expiry: Duration,
}

impl Peer {
    fn new() -> Self {
        Self {
            service_node: false,
            auth_level: AuthLevel::None,
            incoming: None,
            outgoing: None,
            last_activity: Instant::now(),
            idle_expiry: Duration::ZERO,
        }
    }

    pub fn activity(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// One outgoing connection: the peer it reaches and its send queue.
pub(crate) struct RemoteSlot {
    pub pubkey: PubKey,
    pub sender: mpsc::UnboundedSender<Multipart>,
}

/// One admitted incoming connection.
pub(crate) struct Route {
    pub pubkey: PubKey,
    pub sender: mpsc::UnboundedSender<Multipart>,
}

/// All connection state owned by the proxy.
pub(crate) struct PeerTable {
    peers: HashMap<PubKey, Peer>,
    remotes: Vec<RemoteSlot>,
    /// Parallel to `remotes`; the proxy's pollable descriptors.
    remote_events: Vec<mpsc::UnboundedReceiver<RemoteEvent>>,
    routes: HashMap<RouteId, Route>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            remotes: Vec::new(),
            remote_events: Vec::new(),
            routes: HashMap::new(),
        }
    }

    pub fn peer(&self, pubkey: &PubKey) -> Option<&Peer> {
        self.peers.get(pubkey)
    }

    pub fn peer_mut(&mut self, pubkey: &PubKey) -> Option<&mut Peer> {
        self.peers.get_mut(pubkey)
    }

    pub fn remote(&self, index: usize) -> Option<&RemoteSlot> {
        self.remotes.get(index)
    }

    pub fn route(&self, route: RouteId) -> Option<&Route> {
        self.routes.get(&route)
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    /// Record an admitted incoming connection, stamping the peer with the
    /// identity granted by the admission dialog.
    pub fn open_route(
        &mut self,
        route: RouteId,
        pubkey: PubKey,
        auth_level: AuthLevel,
        service_node: bool,
        sender: mpsc::UnboundedSender<Multipart>,
    ) {
        self.routes.insert(route, Route { pubkey, sender });
        let peer = self.peers.entry(pubkey).or_insert_with(Peer::new);
        peer.incoming = Some(route);
        peer.auth_level = auth_level;
        peer.service_node = service_node;
        peer.activity();
    }

    /// Drop an incoming connection; removes the peer record if no outgoing
    /// slot remains.
    pub fn close_route(&mut self, route: RouteId) {
        let Some(entry) = self.routes.remove(&route) else {
            return;
        };
        if let Some(peer) = self.peers.get_mut(&entry.pubkey) {
            // A reconnect may already have replaced the route.
            if peer.incoming == Some(route) {
                peer.incoming = None;
                if peer.outgoing.is_none() {
                    self.peers.remove(&entry.pubkey);
                }
            }
        }
        debug!("incoming route {} closed", route);
    }

    /// Append an outgoing connection, keeping both vectors parallel, and
    /// point the peer record at the new slot.
    pub fn open_remote(
        &mut self,
        pubkey: PubKey,
        keep_alive: Duration,
        sender: mpsc::UnboundedSender<Multipart>,
        events: mpsc::UnboundedReceiver<RemoteEvent>,
    ) -> usize {
        let index = self.remotes.len();
        self.remotes.push(RemoteSlot { pubkey, sender });
        self.remote_events.push(events);

        let peer = self.peers.entry(pubkey).or_insert_with(|| {
            // An outgoing connection means we resolved this peer through the
            // service-node lookup; stamp it accordingly.
            let mut peer = Peer::new();
            peer.service_node = true;
            peer
        });
        peer.outgoing = Some(index);
        peer.idle_expiry = peer.idle_expiry.max(keep_alive);
        peer.activity();
        index
    }

    /// Close an outgoing slot with swap-and-pop, fixing up the slot index
    /// of whichever peer got swapped into the hole. Removes the peer record
    /// if no incoming route remains.
    pub fn close_remote(&mut self, index: usize) {
        if index >= self.remotes.len() {
            return;
        }
        let slot = self.remotes.swap_remove(index);
        let _events = self.remote_events.swap_remove(index);

        if index < self.remotes.len() {
            let moved = self.remotes[index].pubkey;
            if let Some(peer) = self.peers.get_mut(&moved) {
                peer.outgoing = Some(index);
            }
        }

        if let Some(peer) = self.peers.get_mut(&slot.pubkey) {
            peer.outgoing = None;
            if peer.incoming.is_none() {
                self.peers.remove(&slot.pubkey);
            }
        }
        debug!("outgoing connection to {} closed", slot.pubkey);
    }

    /// Close every outgoing slot whose idle expiry has elapsed. Incoming
    /// routes are never expired; they belong to the remote end.
    pub fn expire_idle(&mut self, now: Instant) -> usize {
        let expired: Vec<PubKey> = self
            .peers
            .iter()
            .filter(|(_, p)| {
                p.outgoing.is_some() && now.duration_since(p.last_activity) > p.idle_expiry
            })
            .map(|(pk, _)| *pk)
            .collect();

        let count = expired.len();
        for pubkey in expired {
            if let Some(index) = self.peers.get(&pubkey).and_then(|p| p.outgoing) {
                info!("closing idle connection to {}", pubkey);
                self.close_remote(index);
            }
        }
        count
    }

    /// Wait for the next event from any outgoing connection.
    ///
    /// Pends forever while no remotes exist. A receiver whose tasks are
    /// gone reads as `Closed` so the slot is still retired cleanly.
    pub async fn next_remote_event(&mut self) -> (usize, RemoteEvent) {
        std::future::poll_fn(|cx| {
            for (index, events) in self.remote_events.iter_mut().enumerate() {
                match events.poll_recv(cx) {
                    Poll::Ready(Some(event)) => return Poll::Ready((index, event)),
                    Poll::Ready(None) => return Poll::Ready((index, RemoteEvent::Closed)),
                    Poll::Pending => {}
                }
            }
            Poll::Pending
        })
        .await
    }

    /// Drop all connection state (used at shutdown; the channel senders
    /// going away closes every writer).
    pub fn clear(&mut self) {
        self.peers.clear();
        self.remotes.clear();
        self.remote_events.clear();
        self.routes.clear();
    }

    /// Invariant check used by tests: both remote vectors are parallel and
    /// every slot index round-trips through its peer record.
    #[cfg(test)]
    fn check_parallel(&self) {
        assert_eq!(self.remotes.len(), self.remote_events.len());
        for (index, slot) in self.remotes.iter().enumerate() {
            assert_eq!(self.peers[&slot.pubkey].outgoing, Some(index));
        }
        for peer in self.peers.values() {
            assert!(peer.incoming.is_some() || peer.outgoing.is_some());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(byte: u8) -> PubKey {
        PubKey::from_bytes([byte; 32])
    }

    fn add_remote(table: &mut PeerTable, byte: u8) -> usize {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_event_tx, event_rx) = mpsc::unbounded_channel();
        table.open_remote(pk(byte), Duration::from_secs(30), tx, event_rx)
    }

    #[test]
    fn test_swap_and_pop_keeps_indices_consistent() {
        let mut table = PeerTable::new();
        for byte in 1..=4u8 {
            add_remote(&mut table, byte);
        }
        table.check_parallel();

        // Closing the first slot swaps the last into its place.
        table.close_remote(0);
        table.check_parallel();
        assert_eq!(table.remote_count(), 3);
        assert_eq!(table.remote(0).unwrap().pubkey, pk(4));
        assert_eq!(table.peer(&pk(4)).unwrap().outgoing, Some(0));
        assert!(table.peer(&pk(1)).is_none());

        table.close_remote(1);
        table.check_parallel();
        table.close_remote(0);
        table.close_remote(0);
        table.check_parallel();
        assert_eq!(table.remote_count(), 0);
    }

    #[test]
    fn test_record_survives_while_one_side_remains() {
        let mut table = PeerTable::new();
        let (route_tx, _keep) = mpsc::unbounded_channel();
        table.open_route(7, pk(1), AuthLevel::Basic, false, route_tx);
        let index = add_remote(&mut table, 1);

        let peer = table.peer(&pk(1)).unwrap();
        assert_eq!(peer.incoming, Some(7));
        assert_eq!(peer.outgoing, Some(index));
        // Stamped identity is preserved by the outgoing open.
        assert_eq!(peer.auth_level, AuthLevel::Basic);

        table.close_remote(index);
        assert!(table.peer(&pk(1)).is_some());

        table.close_route(7);
        assert!(table.peer(&pk(1)).is_none());
    }

    #[test]
    fn test_keep_alive_only_raises() {
        let mut table = PeerTable::new();
        add_remote(&mut table, 1);
        table.peer_mut(&pk(1)).unwrap().idle_expiry = Duration::from_secs(300);

        // Re-opening bookkeeping with a shorter keep-alive must not lower it.
        let peer = table.peer_mut(&pk(1)).unwrap();
        peer.idle_expiry = peer.idle_expiry.max(Duration::from_secs(30));
        assert_eq!(peer.idle_expiry, Duration::from_secs(300));
    }

    #[test]
    fn test_expiry_closes_only_outgoing() {
        let mut table = PeerTable::new();

        let (route_tx, _keep) = mpsc::unbounded_channel();
        table.open_route(1, pk(1), AuthLevel::None, false, route_tx);

        let index = add_remote(&mut table, 2);
        table.peer_mut(&pk(2)).unwrap().idle_expiry = Duration::from_millis(10);
        let _ = index;

        // Neither expires immediately.
        assert_eq!(table.expire_idle(Instant::now()), 0);

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(table.expire_idle(later), 1);
        assert!(table.peer(&pk(2)).is_none());
        // The incoming-only peer is untouched no matter how stale.
        assert!(table.peer(&pk(1)).is_some());
        table.check_parallel();
    }
}
