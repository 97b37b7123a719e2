//! One connection, both roles.
//!
//! The dispatch loop owns the connection's inbound queue. Every frame is
//! first offered to the client role as a response to a pending request;
//! if no waiter claims it, the server role routes it to a handler; frames
//! nobody wants are dropped. The loop exits when the connection reaches a
//! terminal state.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::core::frame::{AddressedFrame, Frame};
use crate::error::{ProtocolError, Result};
use crate::protocol::client::{ClientManager, RequestRetry};
use crate::protocol::server::{FrameHandler, ServerManager};
use crate::transport::Connection;

/// A [`Connection`] wired to the client and server roles.
pub struct Endpoint {
    connection: Arc<Connection>,
    client: ClientManager,
    server: ServerManager,
}

impl Endpoint {
    /// Wrap `connection` and start its dispatch loop.
    ///
    /// Takes the connection's inbound queue; an endpoint must be the sole
    /// consumer of its connection.
    pub fn spawn(connection: Connection) -> Result<Arc<Self>> {
        let mut inbound = connection
            .take_inbound()
            .ok_or_else(|| ProtocolError::Custom("Connection inbound queue already taken".into()))?;

        let endpoint = Arc::new(Self {
            connection: Arc::new(connection),
            client: ClientManager::new(),
            server: ServerManager::new(),
        });

        let dispatch: Weak<Self> = Arc::downgrade(&endpoint);
        tokio::spawn(async move {
            while let Some(addressed) = inbound.recv().await {
                let Some(endpoint) = dispatch.upgrade() else {
                    return;
                };
                endpoint.dispatch(addressed).await;
            }
            debug!("Endpoint dispatch loop finished");
        });

        Ok(endpoint)
    }

    async fn dispatch(&self, addressed: AddressedFrame) {
        let peer = addressed.peer;
        let frame = addressed.frame;

        if self.client.complete(frame.clone()) {
            return;
        }

        if let Some(response) = self.server.dispatch(peer, frame).await {
            let out = match peer {
                Some(peer) => AddressedFrame::to_peer(peer, response),
                None => AddressedFrame::direct(response),
            };
            if let Err(e) = self.connection.send(out).await {
                warn!(error = %e, "Failed to send response");
            }
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Register `handler` for inbound frames of `frame_type`.
    pub fn register(&self, frame_type: i32, handler: Arc<dyn FrameHandler>) {
        self.server.register(frame_type, handler);
    }

    pub fn unregister(&self, frame_type: i32) {
        self.server.unregister(frame_type);
    }

    /// Issue one request and wait for its paired response.
    ///
    /// Retries resend the identical frame with the same message id so the
    /// responder can deduplicate. On a connected transport `peer` is
    /// `None`; over UDP it is the target address.
    pub async fn request(
        &self,
        req_type: i32,
        resp_type: i32,
        request_body: Bytes,
        peer: Option<SocketAddr>,
        retry: RequestRetry,
    ) -> Result<Frame> {
        let message_id = self.client.next_message_id();
        let frame = Frame::new(req_type, message_id, request_body);
        let mut rx = self.client.register_waiter(message_id, resp_type);

        for attempt in 0..retry.attempts() {
            if attempt > 0 {
                trace!(message_id, attempt, "Retransmitting request");
            }
            let out = match peer {
                Some(peer) => AddressedFrame::to_peer(peer, frame.clone()),
                None => AddressedFrame::direct(frame.clone()),
            };
            if let Err(e) = self.connection.send(out).await {
                self.client.remove_waiter(message_id);
                return Err(e);
            }

            match timeout(retry.timeout, &mut rx).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(_)) => {
                    // Dispatch loop gone; the connection is dead.
                    self.client.remove_waiter(message_id);
                    return Err(ProtocolError::ConnectionClosed);
                }
                Err(_) => continue,
            }
        }

        self.client.remove_waiter(message_id);
        Err(ProtocolError::RequestTimeout {
            retry_times: retry.retry_times,
        })
    }

    /// Typed request: JSON-encode the body, decode the response body.
    pub async fn request_typed<Req, Resp>(
        &self,
        req_type: i32,
        resp_type: i32,
        request: &Req,
        peer: Option<SocketAddr>,
        retry: RequestRetry,
    ) -> Result<Resp>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let request_body = crate::core::body::encode(request)?;
        let response = self
            .request(req_type, resp_type, request_body, peer, retry)
            .await?;
        crate::core::body::decode(&response.body)
    }

    /// Close the underlying connection, ending the dispatch loop.
    pub fn stop(&self) {
        self.connection.stop();
    }
}
