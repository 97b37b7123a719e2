//! TCP client connects and listener accept loop.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};
use crate::transport::Connection;
use crate::utils::retry::RetryPolicy;

/// Connect to `addr` with the standard connect retry schedule.
pub async fn connect(addr: SocketAddr) -> Result<Connection> {
    connect_with(addr, RetryPolicy::connect()).await
}

/// Connect to `addr`, retrying per `policy`.
pub async fn connect_with(addr: SocketAddr, policy: RetryPolicy) -> Result<Connection> {
    let stream = policy
        .run(|attempt| async move {
            debug!(%addr, attempt, "Connecting");
            TcpStream::connect(addr).await
        })
        .await
        .map_err(|e| ProtocolError::ConnectFailed {
            addr,
            attempts: policy.attempts,
            cause: e.to_string(),
        })?;
    stream.set_nodelay(true)?;
    Connection::from_stream(stream)
}

/// A bound TCP listener whose accept loop yields one [`Connection`] per
/// accepted peer.
#[derive(Debug)]
pub struct Listener {
    local_addr: SocketAddr,
    accepted: mpsc::Receiver<Connection>,
    shutdown: mpsc::Sender<()>,
}

impl Listener {
    /// Bind `addr` with the standard connect retry schedule and start
    /// accepting.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with(addr, RetryPolicy::connect()).await
    }

    pub async fn bind_with(addr: SocketAddr, policy: RetryPolicy) -> Result<Self> {
        let listener = policy
            .run(|attempt| async move {
                debug!(%addr, attempt, "Binding listener");
                TcpListener::bind(addr).await
            })
            .await
            .map_err(|e| ProtocolError::BindFailed {
                addr,
                attempts: policy.attempts,
                cause: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Listener bound");

        let (accepted_tx, accepted_rx) = mpsc::channel(16);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, peer)) => {
                            debug!(%peer, "Accepted connection");
                            if stream.set_nodelay(true).is_err() {
                                continue;
                            }
                            let conn = match Connection::from_stream(stream) {
                                Ok(c) => c,
                                Err(e) => {
                                    warn!(%peer, error = %e, "Dropping accepted socket");
                                    continue;
                                }
                            };
                            if accepted_tx.send(conn).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(%local_addr, error = %e, "Accept failed");
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        debug!(%local_addr, "Listener stopped");
                        return;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            accepted: accepted_rx,
            shutdown: shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next accepted connection, or `None` once the accept loop has exited.
    pub async fn accept(&mut self) -> Option<Connection> {
        self.accepted.recv().await
    }

    /// Stop the accept loop. Already-yielded connections keep running.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(()).await;
    }
}
