//! UDP transport task.
//!
//! One bound socket serves many peers: every inbound frame is tagged with
//! the datagram's source address, and every outbound frame must carry its
//! target. One datagram is one frame; partial or trailing bytes are a
//! protocol violation and the datagram is dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::MAX_BODY_SIZE;
use crate::core::codec::{decode_datagram, encode_datagram};
use crate::core::frame::AddressedFrame;
use crate::error::{ProtocolError, Result};
use crate::transport::connection::{wait_terminal, Connection, StateCell};
use crate::transport::ConnectionState;

/// Bind a UDP socket and return it as a [`Connection`].
///
/// `broadcast` additionally enables `SO_BROADCAST` so discovery frames can
/// be sent to the subnet broadcast address.
pub async fn bind(addr: SocketAddr, broadcast: bool) -> Result<Connection> {
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|e| ProtocolError::BindFailed {
            addr,
            attempts: 1,
            cause: e.to_string(),
        })?;
    if broadcast {
        socket.set_broadcast(true)?;
    }
    let local_addr = socket.local_addr()?;
    debug!(%local_addr, broadcast, "UDP socket bound");

    let socket = Arc::new(socket);
    let state = Arc::new(StateCell::new(ConnectionState::Active));
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<AddressedFrame>(64);
    let (inbound_tx, inbound_rx) = mpsc::channel::<AddressedFrame>(64);

    // Writer: every frame needs an explicit target.
    let write_socket = socket.clone();
    let writer_state = state.clone();
    tokio::spawn(async move {
        while let Some(addressed) = outbound_rx.recv().await {
            let Some(peer) = addressed.peer else {
                warn!("Dropping UDP frame without a target address");
                continue;
            };
            let datagram = match encode_datagram(&addressed.frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "Dropping unencodable frame");
                    continue;
                }
            };
            if let Err(e) = write_socket.send_to(&datagram, peer).await {
                writer_state.advance(ConnectionState::Error(format!("send failed: {e}")));
                return;
            }
        }
    });

    // Reader: one datagram, one frame, tagged with its sender.
    let reader_state = state.clone();
    let mut stop_watch = state.subscribe();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4 + 12 + MAX_BODY_SIZE];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => {
                        let frame = match decode_datagram(&buf[..len]) {
                            Ok(f) => f,
                            Err(e) => {
                                warn!(%from, error = %e, "Dropping malformed datagram");
                                continue;
                            }
                        };
                        if inbound_tx
                            .send(AddressedFrame::to_peer(from, frame))
                            .await
                            .is_err()
                        {
                            reader_state.advance(ConnectionState::Closed);
                            return;
                        }
                    }
                    Err(e) => {
                        reader_state.advance(ConnectionState::Error(format!("recv failed: {e}")));
                        return;
                    }
                },
                _ = wait_terminal(&mut stop_watch) => {
                    return;
                }
            }
        }
    });

    Ok(Connection::from_parts(
        local_addr,
        None,
        outbound_tx,
        inbound_rx,
        state,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::Frame;
    use bytes::Bytes;

    #[tokio::test]
    async fn frames_carry_sender_address() {
        let a = bind("127.0.0.1:0".parse().unwrap(), false).await.unwrap();
        let b = bind("127.0.0.1:0".parse().unwrap(), false).await.unwrap();
        let mut b_inbound = b.take_inbound().unwrap();

        let frame = Frame::new(1, 7, Bytes::from_static(b"hello"));
        a.send(AddressedFrame::to_peer(b.local_addr(), frame.clone()))
            .await
            .unwrap();

        let received = b_inbound.recv().await.unwrap();
        assert_eq!(received.frame, frame);
        assert_eq!(received.peer, Some(a.local_addr()));
    }

    #[tokio::test]
    async fn unaddressed_frames_are_dropped_not_fatal() {
        let a = bind("127.0.0.1:0".parse().unwrap(), false).await.unwrap();
        let b = bind("127.0.0.1:0".parse().unwrap(), false).await.unwrap();
        let mut b_inbound = b.take_inbound().unwrap();

        a.send(AddressedFrame::direct(Frame::new(1, 1, Bytes::new())))
            .await
            .unwrap();
        a.send(AddressedFrame::to_peer(
            b.local_addr(),
            Frame::new(2, 2, Bytes::new()),
        ))
        .await
        .unwrap();

        let received = b_inbound.recv().await.unwrap();
        assert_eq!(received.frame.frame_type, 2);
    }
}
