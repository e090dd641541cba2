//! Wire framing and structured-value encoding for peerbus.
//!
//! This crate provides the two low-level building blocks the bus core sits
//! on: multipart message framing with an incremental decoder, and a small
//! structured-value codec (integers, byte strings, lists, and string-keyed
//! ordered dictionaries) used for control messages and payload metadata.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod value;

pub use error::WireError;
pub use frame::{encode_message, MessageDecoder, DEFAULT_MAX_MESSAGE_SIZE};
pub use value::{
    decode, dict_get_bytes, dict_get_int, dict_get_list, dict_get_str, encode, Dict, Value,
};
