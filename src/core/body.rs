//! JSON body helpers.
//!
//! Typed messages travel as JSON bodies; file chunks bypass this module and
//! ride as raw bytes. An empty body decodes as `()` so acknowledgment-only
//! responses need no payload at all.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Serialize a typed message into a frame body.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| ProtocolError::SerializeError(e.to_string()))
}

/// Deserialize a frame body into a typed message.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    // Unit responses are sent as empty bodies rather than "null".
    if body.is_empty() {
        return serde_json::from_slice(b"null")
            .map_err(|e| ProtocolError::DeserializeError(e.to_string()));
    }
    serde_json::from_slice(body).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
}
