//! Socket-owning connection task.
//!
//! A [`Connection`] wraps one framed socket behind two channels: an outbound
//! mpsc the owner writes frames into, and an inbound mpsc the owner drains.
//! Reader and writer run as independent tasks; whichever hits a socket error
//! first drives the state to `Error`, a clean EOF drives it to `Closed`, and
//! only the first terminal transition wins.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::core::codec::FrameCodec;
use crate::core::frame::AddressedFrame;
use crate::error::{ProtocolError, Result};
use crate::transport::ConnectionState;

/// Depth of the outbound/inbound frame queues per connection.
const FRAME_QUEUE_DEPTH: usize = 64;

/// Shared state cell enforcing the terminal-once rule.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub(crate) fn new(initial: ConnectionState) -> Self {
        Self {
            tx: watch::Sender::new(initial),
        }
    }

    /// Apply `next` unless the current state is already terminal.
    /// Returns whether the transition was honored.
    pub(crate) fn advance(&self, next: ConnectionState) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

/// One live socket: frames out via [`Connection::send`], frames in via
/// [`Connection::take_inbound`], lifecycle via [`Connection::state`].
#[derive(Debug)]
pub struct Connection {
    local_addr: SocketAddr,
    peer_addr: Option<SocketAddr>,
    outbound: mpsc::Sender<AddressedFrame>,
    state: Arc<StateCell>,
    inbound: Mutex<Option<mpsc::Receiver<AddressedFrame>>>,
}

impl Connection {
    /// Wrap an established TCP stream, spawning its reader/writer tasks.
    pub(crate) fn from_stream(stream: TcpStream) -> Result<Self> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;

        let state = Arc::new(StateCell::new(ConnectionState::Active));
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<AddressedFrame>(FRAME_QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel::<AddressedFrame>(FRAME_QUEUE_DEPTH);

        let framed = Framed::new(stream, FrameCodec);
        let (mut sink, mut frames) = framed.split();

        // Writer: drain the outbound queue until the connection terminates
        // or the socket fails. The writer owns the sink, so it is the task
        // that actually closes the socket.
        let writer_state = state.clone();
        let mut writer_stop = state.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = outbound_rx.recv() => match next {
                        Some(addressed) => {
                            if let Err(e) = sink.send(addressed.frame).await {
                                writer_state
                                    .advance(ConnectionState::Error(format!("write failed: {e}")));
                                return;
                            }
                        }
                        None => {
                            // Owner dropped the connection: flush and close.
                            let _ = sink.close().await;
                            return;
                        }
                    },
                    _ = wait_terminal(&mut writer_stop) => {
                        // Local stop or reader failure: close so the peer
                        // sees EOF even while the Connection value lives.
                        let _ = sink.close().await;
                        return;
                    }
                }
            }
        });

        // Reader: deliver frames until EOF, decode error, or local stop.
        let reader_state = state.clone();
        let mut stop_watch = state.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = frames.next() => match next {
                        Some(Ok(frame)) => {
                            trace!(frame_type = frame.frame_type, message_id = frame.message_id, "Frame received");
                            if inbound_tx
                                .send(AddressedFrame::to_peer(peer_addr, frame))
                                .await
                                .is_err()
                            {
                                // Owner went away; treat as local close.
                                reader_state.advance(ConnectionState::Closed);
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            reader_state.advance(ConnectionState::Error(format!("read failed: {e}")));
                            return;
                        }
                        None => {
                            debug!(peer = %peer_addr, "Connection closed by peer");
                            reader_state.advance(ConnectionState::Closed);
                            return;
                        }
                    },
                    _ = wait_terminal(&mut stop_watch) => {
                        // Local stop; the writer task closes the socket.
                        return;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            peer_addr: Some(peer_addr),
            outbound: outbound_tx,
            state,
            inbound: Mutex::new(Some(inbound_rx)),
        })
    }

    /// Build a connection from pre-wired channels (used by the UDP task).
    pub(crate) fn from_parts(
        local_addr: SocketAddr,
        peer_addr: Option<SocketAddr>,
        outbound: mpsc::Sender<AddressedFrame>,
        inbound: mpsc::Receiver<AddressedFrame>,
        state: Arc<StateCell>,
    ) -> Self {
        Self {
            local_addr,
            peer_addr,
            outbound,
            state,
            inbound: Mutex::new(Some(inbound)),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Queue one frame for sending.
    pub async fn send(&self, frame: AddressedFrame) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Take the inbound frame queue. Yields `None` after the first call.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<AddressedFrame>> {
        self.inbound.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.state.subscribe().borrow().clone()
    }

    /// Close the connection. Idempotent; later calls are no-ops.
    pub fn stop(&self) {
        self.state.advance(ConnectionState::Closed);
    }

    pub(crate) fn fail(&self, cause: String) {
        self.state.advance(ConnectionState::Error(cause));
    }
}

/// Resolve once the watched state becomes terminal.
pub async fn wait_terminal(state: &mut watch::Receiver<ConnectionState>) {
    loop {
        if state.borrow().is_terminal() {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_transition_happens_once() {
        let cell = StateCell::new(ConnectionState::Active);
        assert!(cell.advance(ConnectionState::Closed));
        assert!(!cell.advance(ConnectionState::Error("late".into())));
        assert_eq!(*cell.subscribe().borrow(), ConnectionState::Closed);
    }

    #[test]
    fn non_terminal_transitions_flow() {
        let cell = StateCell::new(ConnectionState::NotExecute);
        assert!(cell.advance(ConnectionState::Connecting));
        assert!(cell.advance(ConnectionState::Active));
        assert!(cell.advance(ConnectionState::Error("reset".into())));
        assert!(!cell.advance(ConnectionState::Closed));
    }
}
