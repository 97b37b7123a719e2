//! # Core Wire Format
//!
//! Frame value types and the codec that moves them over sockets.
//!
//! ## Components
//! - **Frame**: `(type, message_id, body)` record, the unit of every exchange
//! - **Codec**: length-prefixed stream framing plus datagram helpers
//! - **Body**: JSON helpers for typed frame bodies

pub mod body;
pub mod codec;
pub mod frame;

pub use codec::FrameCodec;
pub use frame::{AddressedFrame, Frame};
