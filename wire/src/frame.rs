//! Multipart message framing.
//!
//! Each logical message travels as a length-prefixed body containing one or
//! more frames; frame 0 is the command token and the rest are opaque payload
//! parts. The decoder works incrementally against a read buffer so partial
//! reads can simply be retried once more data arrives.
//!
//! ```text
//! +---------------------+-------------------------------+
//! | u32 body_len        | length of bytes that follow   |
//! +---------------------+-------------------------------+
//! | u32 frame_len       | repeated once per frame       |
//! | frame bytes         |                               |
//! +---------------------+-------------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::WireError;

/// Default cap on a single incoming message (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Encode a multipart message to a contiguous buffer.
pub fn encode_message(parts: &[Bytes]) -> Bytes {
    let body_len: usize = parts.iter().map(|p| 4 + p.len()).sum();
    let mut buf = BytesMut::with_capacity(4 + body_len);

    buf.put_u32(body_len as u32);
    for part in parts {
        buf.put_u32(part.len() as u32);
        buf.put_slice(part);
    }

    buf.freeze()
}

/// Incremental multipart decoder.
///
/// `None` for the size limit disables the cap entirely.
#[derive(Debug)]
pub struct MessageDecoder {
    max_message_size: Option<usize>,
}

impl MessageDecoder {
    /// Create a decoder with the given message size cap.
    pub fn new(max_message_size: Option<usize>) -> Self {
        Self { max_message_size }
    }

    /// Decode one message from the buffer.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// message; the caller should read more bytes and retry.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Bytes>>, WireError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if let Some(max) = self.max_message_size {
            if body_len > max {
                return Err(WireError::TooLarge(body_len));
            }
        }

        if buf.len() < 4 + body_len {
            return Ok(None);
        }

        buf.advance(4);
        let mut body = buf.split_to(body_len).freeze();

        let mut parts = Vec::new();
        while !body.is_empty() {
            if body.len() < 4 {
                return Err(WireError::Malformed);
            }
            let frame_len = body.get_u32() as usize;
            if body.len() < frame_len {
                return Err(WireError::Malformed);
            }
            parts.push(body.split_to(frame_len));
        }

        if parts.is_empty() {
            return Err(WireError::Empty);
        }

        Ok(Some(parts))
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new(Some(DEFAULT_MAX_MESSAGE_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(items: &[&[u8]]) -> Vec<Bytes> {
        items.iter().map(|i| Bytes::copy_from_slice(i)).collect()
    }

    #[test]
    fn test_encode_decode() {
        let msg = parts(&[b"x.echo", b"hi", b""]);
        let encoded = encode_message(&msg);

        let mut decoder = MessageDecoder::default();
        let mut buf = BytesMut::from(encoded.as_ref());
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_input() {
        let encoded = encode_message(&parts(&[b"cat.cmd", b"payload"]));
        let mut decoder = MessageDecoder::default();

        // Feed the message one byte at a time; only the final byte completes it.
        let mut buf = BytesMut::new();
        for (i, byte) in encoded.iter().enumerate() {
            buf.put_u8(*byte);
            let result = decoder.decode(&mut buf).unwrap();
            if i + 1 < encoded.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(result.unwrap().len(), 2);
            }
        }
    }

    #[test]
    fn test_two_messages_back_to_back() {
        let first = parts(&[b"a.one"]);
        let second = parts(&[b"b.two", b"data"]);

        let mut buf = BytesMut::new();
        buf.put_slice(&encode_message(&first));
        buf.put_slice(&encode_message(&second));

        let mut decoder = MessageDecoder::default();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), second);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_size_cap() {
        let encoded = encode_message(&parts(&[&[0u8; 128]]));
        let mut decoder = MessageDecoder::new(Some(64));
        let mut buf = BytesMut::from(encoded.as_ref());

        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WireError::TooLarge(_))
        ));

        // Unlimited decoder accepts the same message.
        let mut unlimited = MessageDecoder::new(None);
        let mut buf = BytesMut::from(encoded.as_ref());
        assert!(unlimited.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_malformed_body() {
        // body_len of 6 but the inner frame claims 32 bytes
        let mut buf = BytesMut::new();
        buf.put_u32(6);
        buf.put_u32(32);
        buf.put_slice(b"ab");

        let mut decoder = MessageDecoder::default();
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WireError::Malformed)
        ));
    }

    #[test]
    fn test_empty_message_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);

        let mut decoder = MessageDecoder::default();
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Empty)));
    }
}
