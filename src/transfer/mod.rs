//! # File Transfer Engine
//!
//! Sender and downloader for batches of files: sequential per file,
//! parallel across fragment connections within a file, chunk-by-chunk in
//! lockstep within a fragment. Progress and lifecycle are published over
//! channels so embedders observe without polling.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::protocol::messages::FileEntry;

pub mod downloader;
pub mod fsio;
pub mod ranges;
pub mod sender;
pub mod speed;

pub use downloader::FileDownloader;
pub use sender::FileSender;
pub use speed::SpeedCalculator;

/// Lifecycle of one transfer run. `Finished`, `Canceled`, `Error` and
/// `RemoteError` are terminal; the first terminal transition wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    NotExecute,
    Started,
    Finished,
    Canceled,
    /// Local failure; the peer is notified.
    Error(String),
    /// Peer-reported failure; no notice is sent back.
    RemoteError(String),
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferState::NotExecute | TransferState::Started)
    }
}

/// Progress events published while a transfer runs.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    State(TransferState),
    /// Work on `entry` began.
    StartFile(FileEntry),
    /// Bytes moved for the current file so far.
    Progress {
        entry: FileEntry,
        transferred: u64,
        total: u64,
    },
    /// Work on `entry` completed.
    EndFile(FileEntry),
}

/// A file queued on the sending side: its local path plus the entry the
/// peer will see.
#[derive(Debug, Clone)]
pub struct SenderFile {
    pub path: PathBuf,
    pub entry: FileEntry,
}

/// State publisher shared by sender and downloader: a `watch` for the
/// current state plus an event stream, with terminal-once enforcement.
pub(crate) struct TransferProgress {
    state: watch::Sender<TransferState>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferProgress {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let progress = Arc::new(Self {
            state: watch::Sender::new(TransferState::NotExecute),
            events,
        });
        (progress, events_rx)
    }

    /// Apply `next` unless already terminal; publishes the change as an
    /// event too. Returns whether the transition was honored.
    pub(crate) fn advance(&self, next: TransferState) -> bool {
        let moved = self.state.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if moved {
            debug!(state = ?next, "Transfer state changed");
            let _ = self.events.send(TransferEvent::State(next));
        }
        moved
    }

    pub(crate) fn current(&self) -> TransferState {
        self.state.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<TransferState> {
        self.state.subscribe()
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}

/// Resolve once the watched transfer state becomes terminal.
pub(crate) async fn wait_transfer_terminal(state: &mut watch::Receiver<TransferState>) {
    loop {
        if state.borrow().is_terminal() {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_state_is_sticky() {
        let (progress, mut events) = TransferProgress::new();
        assert!(progress.advance(TransferState::Started));
        assert!(progress.advance(TransferState::Canceled));
        assert!(!progress.advance(TransferState::Error("late".into())));
        assert_eq!(progress.current(), TransferState::Canceled);

        assert!(matches!(
            events.try_recv().unwrap(),
            TransferEvent::State(TransferState::Started)
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            TransferEvent::State(TransferState::Canceled)
        ));
        assert!(events.try_recv().is_err());
    }
}
