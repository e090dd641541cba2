//! Send options and control-dictionary assembly.
//!
//! The variadic options of the embedding API are a tagged sum type here;
//! each option either adjusts the control dictionary handed to the proxy or
//! appends a pre-encoded payload part.

use std::time::Duration;

use bytes::Bytes;
use peerbus_wire::{Dict, Value};

use crate::keys::PubKey;

/// Options accepted by `send()`.
#[derive(Debug, Clone)]
pub enum SendOption {
    /// Candidate connect address, used to skip the peer-lookup callback when
    /// a new outgoing connection is needed.
    Hint(String),
    /// Drop the message unless a connection (either side) already exists.
    Optional,
    /// Deliver only over an existing incoming route; drop otherwise.
    Incoming,
    /// Raise (never lower) the outgoing connection's idle timeout.
    KeepAlive(Duration),
    /// Append a pre-encoded payload part, serialized once by the caller.
    Serialized(Bytes),
}

/// Assemble the control dictionary for a SEND.
pub(crate) fn build_send_dict(
    pubkey: &PubKey,
    command: &str,
    parts: &[Bytes],
    options: &[SendOption],
) -> Dict {
    let mut send_parts: Vec<Value> = Vec::with_capacity(1 + parts.len());
    send_parts.push(Value::from(command));
    send_parts.extend(parts.iter().map(|p| Value::from(p.clone())));

    let mut dict = Dict::new();
    for option in options {
        match option {
            SendOption::Hint(addr) => {
                dict.insert("hint".into(), Value::from(addr.as_str()));
            }
            SendOption::Optional => {
                dict.insert("optional".into(), Value::Int(1));
            }
            SendOption::Incoming => {
                dict.insert("incoming".into(), Value::Int(1));
            }
            SendOption::KeepAlive(duration) => {
                dict.insert("keep-alive".into(), Value::Int(duration.as_millis() as i64));
            }
            SendOption::Serialized(data) => {
                send_parts.push(Value::from(data.clone()));
            }
        }
    }

    dict.insert("pubkey".into(), Value::from(&pubkey.as_bytes()[..]));
    dict.insert("send".into(), Value::List(send_parts));
    dict
}
