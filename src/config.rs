//! # Configuration Management
//!
//! Centralized configuration for the transfer protocol library.
//!
//! Well-known ports and the protocol version are compile-time constants
//! shared by both peers; everything tunable (chunk sizing, timeouts, retry
//! policy parameters) lives in [`TransferConfig`].
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Current supported protocol version, exchanged in the explore handshake
pub const PROTOCOL_VERSION: i32 = 2;

/// Max allowed frame payload size (covers the largest chunk plus headroom)
pub const MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

/// LAN broadcast discovery scan port
pub const BROADCAST_SCANNER_PORT: u16 = 8881;

/// LAN broadcast transfer-request port
pub const BROADCAST_TRANSFER_PORT: u16 = 8882;

/// Control connection port (handshake, directory browsing, transfer requests)
pub const FILE_EXPLORE_PORT: u16 = 8883;

/// Dedicated file-transfer port (fragment connections)
pub const FILE_TRANSFER_PORT: u16 = 8884;

/// WiFi-direct group owner port
pub const P2P_PORT: u16 = 8885;

/// QR-code address exchange port
pub const QR_SCAN_PORT: u16 = 8886;

/// Smallest chunk the adaptive controller may shrink to
pub const MIN_CHUNK_SIZE: usize = 512;

/// Initial chunk size for a fragment sender
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Largest chunk the adaptive controller may grow to
pub const MAX_CHUNK_SIZE: usize = 3 * 1024 * 1024;

/// Smallest fragment worth its own TCP connection
pub const MIN_FRAGMENT_SIZE: u64 = 10 * 1024 * 1024;

/// Tunable knobs for the transfer engine and request layer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferConfig {
    /// Target per-chunk round-trip used by the adaptive buffer controller
    #[serde(with = "duration_serde")]
    pub anchor_duration: Duration,

    /// Maximum parallel fragment connections per file
    pub max_connections: u32,

    /// Smallest fragment worth its own connection
    pub min_fragment_size: u64,

    /// Timeout for one chunk send before the frame is retransmitted
    #[serde(with = "duration_serde")]
    pub chunk_request_timeout: Duration,

    /// Additional resends of a timed-out chunk before failing
    pub chunk_retry_times: u32,

    /// Connect/bind attempts before giving up
    pub connect_attempts: u32,

    /// First connect/bind retry delay; doubles per attempt
    #[serde(with = "duration_serde")]
    pub connect_base_delay: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            anchor_duration: Duration::from_millis(200),
            max_connections: 8,
            min_fragment_size: MIN_FRAGMENT_SIZE,
            chunk_request_timeout: Duration::from_millis(4000),
            chunk_retry_times: 1,
            connect_attempts: 5,
            connect_base_delay: Duration::from_millis(1000),
        }
    }
}

impl TransferConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables, starting from defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("LAN_TRANSFER_MAX_CONNECTIONS") {
            if let Ok(val) = v.parse::<u32>() {
                config.max_connections = val;
            }
        }

        if let Ok(v) = std::env::var("LAN_TRANSFER_ANCHOR_MS") {
            if let Ok(val) = v.parse::<u64>() {
                config.anchor_duration = Duration::from_millis(val);
            }
        }

        if let Ok(v) = std::env::var("LAN_TRANSFER_MIN_FRAGMENT_SIZE") {
            if let Ok(val) = v.parse::<u64>() {
                config.min_fragment_size = val;
            }
        }

        config
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_connections == 0 {
            errors.push("max_connections must be greater than 0".to_string());
        } else if self.max_connections > 64 {
            errors.push(format!(
                "max_connections very high: {} (each fragment holds a TCP connection)",
                self.max_connections
            ));
        }

        if self.min_fragment_size == 0 {
            errors.push("min_fragment_size must be greater than 0".to_string());
        }

        if self.anchor_duration.as_millis() < 10 {
            errors.push("anchor_duration too short (minimum: 10ms)".to_string());
        } else if self.anchor_duration.as_secs() > 10 {
            errors.push("anchor_duration too long (maximum: 10s)".to_string());
        }

        if self.chunk_request_timeout < self.anchor_duration {
            errors.push("chunk_request_timeout must not be shorter than anchor_duration".to_string());
        }

        if self.connect_attempts == 0 {
            errors.push("connect_attempts must be greater than 0".to_string());
        }

        if self.connect_base_delay.as_millis() < 10 {
            errors.push("connect_base_delay too short (minimum: 10ms)".to_string());
        }

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Helper module for Duration serialization/deserialization as milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
