//! The message view handed to command handlers.

use bytes::Bytes;

use crate::control::Client;
use crate::error::Stopped;
use crate::keys::PubKey;
use crate::options::SendOption;

/// An incoming command as seen by a handler.
///
/// The view borrows frames owned by the dispatching job and is only valid
/// for the duration of the handler call; the lifetime makes retaining it
/// impossible.
pub struct Message<'a> {
    pubkey: &'a PubKey,
    service_node: bool,
    data: &'a [Bytes],
    client: &'a Client,
}

impl<'a> Message<'a> {
    pub(crate) fn new(
        pubkey: &'a PubKey,
        service_node: bool,
        data: &'a [Bytes],
        client: &'a Client,
    ) -> Self {
        Self {
            pubkey,
            service_node,
            data,
            client,
        }
    }

    /// The originator's public key.
    pub fn pubkey(&self) -> &PubKey {
        self.pubkey
    }

    /// Whether the originator was authenticated as a service node.
    pub fn is_service_node(&self) -> bool {
        self.service_node
    }

    /// The payload parts that followed the command token.
    pub fn data(&self) -> &[Bytes] {
        self.data
    }

    /// Send a reply back to the originator.
    ///
    /// For service-node originators this is a strong send: the proxy will
    /// re-establish an outgoing connection if the original one is gone. For
    /// anyone else the reply rides the existing connection and is dropped if
    /// that connection has since closed.
    pub fn reply(&self, command: &str, parts: &[Bytes]) -> Result<(), Stopped> {
        if self.service_node {
            self.client.send(self.pubkey, command, parts, &[])
        } else {
            self.client
                .send(self.pubkey, command, parts, &[SendOption::Optional])
        }
    }
}
