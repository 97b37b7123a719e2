//! # Socket Transports
//!
//! One lightweight task per socket: TCP clients, TCP listeners yielding one
//! child [`Connection`] per accepted peer, and a UDP task where every frame
//! carries its datagram address.
//!
//! Each connection publishes its lifecycle on a `watch` channel:
//! `NotExecute → Connecting → Active → {Closed, Error}`. Terminal states are
//! entered at most once; `stop()` is idempotent and safe to call from any
//! task.

pub mod connection;
pub mod tcp;
pub mod udp;

pub use connection::Connection;

/// Lifecycle of one socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created but not started.
    NotExecute,
    /// Connect or bind in progress.
    Connecting,
    /// Socket is up and frames flow.
    Active,
    /// Graceful close. Terminal.
    Closed,
    /// Socket-level failure. Terminal.
    Error(String),
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Error(_))
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!ConnectionState::NotExecute.is_terminal());
        assert!(!ConnectionState::Connecting.is_terminal());
        assert!(!ConnectionState::Active.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Error("boom".into()).is_terminal());
    }
}
