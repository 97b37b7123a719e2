//! Frame value types.
//!
//! A [`Frame`] is the unit of every protocol exchange: a 32-bit type tag, a
//! 64-bit message id correlating a request with its response, and an opaque
//! body. Retries of a request reuse the same message id so receivers can
//! deduplicate.

use bytes::Bytes;
use std::net::SocketAddr;

/// One protocol record on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type tag; request and response types are distinct values.
    pub frame_type: i32,
    /// Correlation key. Unique per in-flight request on a connection;
    /// reused verbatim when the same request is retransmitted.
    pub message_id: i64,
    /// Opaque body, JSON for typed messages and raw bytes for file chunks.
    pub body: Bytes,
}

impl Frame {
    pub fn new(frame_type: i32, message_id: i64, body: Bytes) -> Self {
        Self {
            frame_type,
            message_id,
            body,
        }
    }

    /// Length of the encoded frame excluding the stream length prefix.
    pub fn encoded_len(&self) -> usize {
        4 + 8 + self.body.len()
    }
}

/// A frame plus the peer it came from or should go to.
///
/// TCP connections have a fixed peer and leave `peer` as `None`; UDP tasks
/// fill in the datagram sender on receive and require a target on send.
/// Server-role responses are always addressed to the originating peer.
#[derive(Debug, Clone)]
pub struct AddressedFrame {
    pub peer: Option<SocketAddr>,
    pub frame: Frame,
}

impl AddressedFrame {
    pub fn direct(frame: Frame) -> Self {
        Self { peer: None, frame }
    }

    pub fn to_peer(peer: SocketAddr, frame: Frame) -> Self {
        Self {
            peer: Some(peer),
            frame,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_len_counts_headers_and_body() {
        let f = Frame::new(7, 42, Bytes::from_static(b"hello"));
        assert_eq!(f.encoded_len(), 4 + 8 + 5);

        let empty = Frame::new(0, 0, Bytes::new());
        assert_eq!(empty.encoded_len(), 12);
    }
}
