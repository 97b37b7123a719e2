//! # Request/Response Protocol
//!
//! Both peers of a connection carry both roles at once: a client side that
//! issues correlated requests with bounded retransmission, and a server
//! side that routes inbound requests to registered handlers with duplicate
//! detection. [`Endpoint`] ties one [`crate::transport::Connection`] to
//! both roles through a single dispatch loop.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

pub mod client;
pub mod endpoint;
pub mod explore;
pub mod messages;
pub mod server;

pub use client::RequestRetry;
pub use endpoint::Endpoint;
pub use explore::FileExplore;
pub use server::{FrameHandler, RequestContext};

/// The addressing triple a discovery layer hands to this crate: where we
/// are, where the peer is, and which side plays the server role on the
/// explore port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLink {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub is_server: bool,
}

impl PeerLink {
    pub fn new(local: SocketAddr, remote: SocketAddr, is_server: bool) -> Self {
        Self {
            local,
            remote,
            is_server,
        }
    }
}
