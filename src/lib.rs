//! # LAN Transfer
//!
//! Peer-to-peer file transfer for local networks: a length-prefixed frame
//! protocol, symmetric request/response endpoints over TCP and UDP, and a
//! fragmented parallel transfer engine with adaptive chunk sizing.
//!
//! ## Layers
//! - [`core`] — frame layout, stream codec, JSON body encoding
//! - [`transport`] — socket tasks: TCP connections and listeners, UDP
//! - [`protocol`] — request correlation, retransmission, handler dispatch,
//!   and the file-explore control session
//! - [`transfer`] — the sender/downloader pair moving file batches over
//!   parallel fragment connections
//!
//! ## Example
//!
//! Serving one file and pulling it back over loopback:
//!
//! ```no_run
//! use lan_transfer::config::TransferConfig;
//! use lan_transfer::protocol::messages::FileEntry;
//! use lan_transfer::transfer::{FileDownloader, FileSender, SenderFile};
//!
//! # async fn run() -> lan_transfer::error::Result<()> {
//! let entry = FileEntry {
//!     name: "photo.jpg".into(),
//!     path: "photo.jpg".into(),
//!     size: 1024,
//!     last_modify: 0,
//! };
//! let (sender, _events) = FileSender::new(
//!     vec![SenderFile { path: "photo.jpg".into(), entry: entry.clone() }],
//!     "0.0.0.0:8884".parse().unwrap(),
//!     128 * 1024,
//!     TransferConfig::default(),
//! );
//! let addr = sender.start().await?;
//!
//! let (downloader, _events) = FileDownloader::new(
//!     vec![entry],
//!     addr,
//!     "/tmp/downloads".into(),
//!     TransferConfig::default(),
//! );
//! downloader.start();
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transfer;
pub mod transport;
pub mod utils;

pub use config::TransferConfig;
pub use error::{ProtocolError, Result};
pub use protocol::messages::FileEntry;
pub use protocol::{Endpoint, FileExplore, PeerLink, RequestRetry};
pub use transfer::{
    FileDownloader, FileSender, SenderFile, SpeedCalculator, TransferEvent, TransferState,
};
pub use transport::{Connection, ConnectionState};
