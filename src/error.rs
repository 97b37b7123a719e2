//! # Error Types
//!
//! Comprehensive error handling for the transfer protocol.
//!
//! This module defines all error variants that can occur during protocol
//! operations, from low-level I/O errors to high-level protocol violations.
//!
//! ## Error Categories
//! - **I/O Errors**: Network and file system failures
//! - **Protocol Errors**: Malformed frames, out-of-range fragment bounds
//! - **Transfer Errors**: Remote aborts, user cancellation, timeouts
//!
//! Connect and bind failures are the only retryable conditions; retries are
//! bounded and driven by [`crate::utils::retry::RetryPolicy`]. Everything
//! else is fatal to the transfer that produced it.

use std::io;
use thiserror::Error;

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Connect to {addr} failed after {attempts} attempts: {cause}")]
    ConnectFailed {
        addr: std::net::SocketAddr,
        attempts: u32,
        cause: String,
    },

    #[error("Bind {addr} failed after {attempts} attempts: {cause}")]
    BindFailed {
        addr: std::net::SocketAddr,
        attempts: u32,
        cause: String,
    },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timed out after {retry_times} retries")]
    RequestTimeout { retry_times: u32 },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Oversized frame: {0} bytes")]
    OversizedFrame(usize),

    #[error("Remote error: {0}")]
    RemoteAbort(String),

    #[error("Canceled by user")]
    Canceled,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
