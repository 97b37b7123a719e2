//! # Utility Modules
//!
//! Supporting utilities used throughout the protocol implementation.
//!
//! ## Components
//! - **Dedup**: bounded recently-seen message-id cache for retransmit detection
//! - **Retry**: reusable bounded-attempt backoff policy
//! - **Logging**: structured logging configuration

pub mod dedup;
pub mod logging;
pub mod retry;

pub use dedup::SeenCache;
pub use retry::RetryPolicy;
