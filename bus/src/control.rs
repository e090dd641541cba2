//! The control channel between caller threads and the proxy.
//!
//! Every externally triggered mutation crosses this channel as a typed verb
//! plus an encoded dictionary, so the proxy's peer table, remotes vector,
//! and categories never need locks. Callers only ever enqueue; nothing on
//! this path blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use peerbus_wire::{Dict, Value};
use tokio::sync::mpsc;

use crate::error::Stopped;
use crate::keys::PubKey;
use crate::options::{build_send_dict, SendOption};

/// Control verbs understood by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlVerb {
    Send,
    Reply,
    Connect,
    Disconnect,
    Quit,
}

impl ControlVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlVerb::Send => "SEND",
            ControlVerb::Reply => "REPLY",
            ControlVerb::Connect => "CONNECT",
            ControlVerb::Disconnect => "DISCONNECT",
            ControlVerb::Quit => "QUIT",
        }
    }
}

/// One marshalled control message: the verb plus its encoded dictionary.
#[derive(Debug)]
pub(crate) struct ControlFrame {
    pub verb: ControlVerb,
    pub data: Bytes,
}

/// Caller-side endpoint of the control channel.
///
/// Cloned into every worker thread (for replies) and held by the public
/// handle. Once the shutdown guard is set new control messages are refused,
/// which keeps late callers from racing the teardown.
#[derive(Clone)]
pub(crate) struct Client {
    control: mpsc::UnboundedSender<ControlFrame>,
    shutting_down: Arc<AtomicBool>,
}

impl Client {
    pub fn new(
        control: mpsc::UnboundedSender<ControlFrame>,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        Self {
            control,
            shutting_down,
        }
    }

    /// Marshal and enqueue one control message.
    pub fn send_control(&self, verb: ControlVerb, data: Dict) -> Result<(), Stopped> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(Stopped);
        }
        let data = peerbus_wire::encode(&Value::Dict(data));
        self.control
            .send(ControlFrame { verb, data })
            .map_err(|_| Stopped)
    }

    /// Queue a message for the given peer.
    pub fn send(
        &self,
        pubkey: &PubKey,
        command: &str,
        parts: &[Bytes],
        options: &[SendOption],
    ) -> Result<(), Stopped> {
        let dict = build_send_dict(pubkey, command, parts, options);
        self.send_control(ControlVerb::Send, dict)
    }

    /// Queue a reply over the peer's incoming route.
    pub fn reply(&self, pubkey: &PubKey, command: &str, parts: &[Bytes]) -> Result<(), Stopped> {
        let dict = build_send_dict(pubkey, command, parts, &[]);
        self.send_control(ControlVerb::Reply, dict)
    }

    /// Ask the proxy to establish (or refresh) an outgoing connection.
    pub fn connect(
        &self,
        pubkey: &PubKey,
        keep_alive: Duration,
        hint: Option<&str>,
    ) -> Result<(), Stopped> {
        let mut dict = Dict::new();
        dict.insert("pubkey".into(), Value::from(&pubkey.as_bytes()[..]));
        dict.insert(
            "keep-alive".into(),
            Value::Int(keep_alive.as_millis() as i64),
        );
        if let Some(hint) = hint {
            dict.insert("hint".into(), Value::from(hint));
        }
        self.send_control(ControlVerb::Connect, dict)
    }

    /// Ask the proxy to drop any outgoing connection to the peer.
    pub fn disconnect(&self, pubkey: &PubKey) -> Result<(), Stopped> {
        let mut dict = Dict::new();
        dict.insert("pubkey".into(), Value::from(&pubkey.as_bytes()[..]));
        self.send_control(ControlVerb::Disconnect, dict)
    }

    /// Set the shutdown guard and tell the proxy to quit.
    ///
    /// The guard goes up first so no further control messages from other
    /// threads can slip in behind the QUIT.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let _ = self.control.send(ControlFrame {
            verb: ControlVerb::Quit,
            data: Bytes::new(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_guard_refuses_new_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = Client::new(tx, Arc::new(AtomicBool::new(false)));
        let pk = PubKey::from_bytes([3u8; 32]);

        client.send(&pk, "x.a", &[], &[]).unwrap();
        client.begin_shutdown();
        assert_eq!(client.send(&pk, "x.b", &[], &[]), Err(Stopped));

        // The SEND and the QUIT both made it through; nothing after.
        assert_eq!(rx.try_recv().unwrap().verb, ControlVerb::Send);
        assert_eq!(rx.try_recv().unwrap().verb, ControlVerb::Quit);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_control_dict_roundtrip() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = Client::new(tx, Arc::new(AtomicBool::new(false)));
        let pk = PubKey::from_bytes([5u8; 32]);

        client
            .connect(&pk, Duration::from_millis(1500), Some("10.0.0.1:7000"))
            .unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.verb, ControlVerb::Connect);

        let value = peerbus_wire::decode(&frame.data).unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(peerbus_wire::dict_get_int(dict, "keep-alive"), Some(1500));
        assert_eq!(
            peerbus_wire::dict_get_str(dict, "hint").as_deref(),
            Some("10.0.0.1:7000")
        );
        assert_eq!(
            peerbus_wire::dict_get_bytes(dict, "pubkey"),
            Some(&[5u8; 32][..])
        );
    }
}
