//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Message exceeds the configured size limit
    #[error("message size limit exceeded: {0}")]
    TooLarge(usize),

    /// Frame lengths do not add up to the message body
    #[error("malformed message framing")]
    Malformed,

    /// A message must carry at least one frame
    #[error("empty message")]
    Empty,

    /// Value encoding failed
    #[error("value encoding failed")]
    Encode,

    /// Bytes did not decode to a structured value
    #[error("value decoding failed")]
    Decode,
}
