//! Sending side of the transfer engine.
//!
//! The sender binds the transfer listener and serves one file at a time.
//! Each accepted connection carries one fragment: the peer claims a byte
//! range with a download request, then the sender streams that range as a
//! sequence of acknowledged chunk requests, resizing the chunk after every
//! round-trip. Fragment requests for a file that is not yet active are
//! queued and replayed when it becomes active, so the downloader may race
//! ahead of the sender's file cursor without losing anything.

use std::collections::VecDeque;
use std::fs::File;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{TransferConfig, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::error::{ProtocolError, Result};
use crate::protocol::client::RequestRetry;
use crate::protocol::endpoint::Endpoint;
use crate::protocol::messages::{transfer_types, DownloadReq, ErrorReq, FileEntry};
use crate::protocol::server::typed_handler;
use crate::transfer::ranges::FragmentRange;
use crate::transfer::speed::SpeedCalculator;
use crate::transfer::{
    wait_transfer_terminal, SenderFile, TransferEvent, TransferProgress, TransferState,
};
use crate::transport::tcp;
use crate::utils::retry::RetryPolicy;

/// Timeout for the fragment-finished notice and the error notice; neither
/// is retransmitted.
const NOTICE_TIMEOUT: Duration = Duration::from_millis(2500);

/// One acknowledged round-trip adjusts the next chunk size toward the
/// anchor duration: `next = current - (elapsed - anchor) / anchor *
/// current`, clamped to the chunk bounds. Slow round-trips shrink the
/// chunk, fast ones grow it.
pub(crate) fn next_chunk_size(current: usize, elapsed: Duration, anchor: Duration) -> usize {
    let anchor_s = anchor.as_secs_f64();
    let drift = (elapsed.as_secs_f64() - anchor_s) / anchor_s;
    let next = current as f64 - drift * current as f64;
    (next.max(0.0) as usize).clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

#[derive(Clone)]
struct ActiveFile {
    entry: FileEntry,
    handle: Arc<File>,
    sent: Arc<AtomicU64>,
}

/// A fragment request that arrived before its file became active.
struct QueuedFragment {
    endpoint: Arc<Endpoint>,
    req: DownloadReq,
}

struct SenderQueue {
    waiting: VecDeque<SenderFile>,
    active: Option<ActiveFile>,
    unhandled: Vec<QueuedFragment>,
    endpoints: Vec<Arc<Endpoint>>,
}

struct SenderShared {
    initial_chunk_size: usize,
    config: TransferConfig,
    progress: Arc<TransferProgress>,
    speed: Arc<SpeedCalculator>,
    queue: Mutex<SenderQueue>,
}

/// The sending half of a transfer run.
pub struct FileSender {
    shared: Arc<SenderShared>,
    listen_addr: SocketAddr,
}

impl FileSender {
    /// Build a sender for `files`, to be served from `listen_addr`.
    /// `initial_chunk_size` is the peer-negotiated starting chunk size.
    /// Zero-size files are dropped from the queue up front.
    pub fn new(
        files: Vec<SenderFile>,
        listen_addr: SocketAddr,
        initial_chunk_size: usize,
        config: TransferConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (progress, events) = TransferProgress::new();
        let waiting: VecDeque<SenderFile> = files
            .into_iter()
            .filter(|f| {
                if f.entry.size == 0 {
                    debug!(name = %f.entry.name, "Skipping zero-size file");
                    false
                } else {
                    true
                }
            })
            .collect();

        let shared = Arc::new(SenderShared {
            initial_chunk_size: initial_chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE),
            config,
            progress,
            speed: Arc::new(SpeedCalculator::new()),
            queue: Mutex::new(SenderQueue {
                waiting,
                active: None,
                unhandled: Vec::new(),
                endpoints: Vec::new(),
            }),
        });

        (
            Self {
                shared,
                listen_addr,
            },
            events,
        )
    }

    /// Bind the transfer listener, activate the first file and start
    /// accepting fragment connections. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.shared.progress.current() != TransferState::NotExecute {
            return Err(ProtocolError::Custom("Transfer already started".into()));
        }
        self.shared.progress.advance(TransferState::Started);
        self.shared.clone().activate_next(None)?;

        let policy = RetryPolicy::new(
            self.shared.config.connect_attempts,
            self.shared.config.connect_base_delay,
            2,
        );
        let mut listener = match tcp::Listener::bind_with(self.listen_addr, policy).await {
            Ok(l) => l,
            Err(e) => {
                self.shared
                    .progress
                    .advance(TransferState::Error(e.to_string()));
                return Err(e);
            }
        };
        let local_addr = listener.local_addr();
        info!(%local_addr, "Transfer listener ready");

        let shared = self.shared.clone();
        let mut state = shared.progress.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Some(conn) => shared.clone().attach_connection(conn),
                        None => return,
                    },
                    _ = wait_transfer_terminal(&mut state) => {
                        listener.stop().await;
                        return;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Cancel the run. No error notice goes to the peer; the fragment
    /// connections just close.
    pub fn cancel(&self) {
        if self.shared.progress.advance(TransferState::Canceled) {
            self.shared.close_endpoints(None);
        }
    }

    pub fn state(&self) -> watch::Receiver<TransferState> {
        self.shared.progress.subscribe()
    }

    pub fn speed(&self) -> &SpeedCalculator {
        &self.shared.speed
    }
}

impl SenderShared {
    /// Wrap an accepted fragment connection and wire its handlers.
    fn attach_connection(self: Arc<Self>, conn: crate::transport::Connection) {
        let endpoint = match Endpoint::spawn(conn) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "Dropping fragment connection");
                return;
            }
        };

        let shared = Arc::downgrade(&self);
        let weak_endpoint = Arc::downgrade(&endpoint);
        endpoint.register(
            transfer_types::DOWNLOAD_REQ,
            typed_handler(move |_ctx, is_new, req: DownloadReq| {
                let shared = shared.clone();
                let weak_endpoint = weak_endpoint.clone();
                async move {
                    let (Some(shared), Some(endpoint)) =
                        (shared.upgrade(), weak_endpoint.upgrade())
                    else {
                        return Ok(None);
                    };
                    if !is_new {
                        // Retransmit; the fragment stream is already up.
                        return Ok(Some(()));
                    }
                    if shared.accept_fragment(endpoint, req) {
                        Ok(Some(()))
                    } else {
                        Ok(None)
                    }
                }
            }),
        );

        let shared = Arc::downgrade(&self);
        endpoint.register(
            transfer_types::ERROR_REQ,
            typed_handler(move |_ctx, _is_new, req: ErrorReq| {
                let shared = shared.clone();
                async move {
                    if let Some(shared) = shared.upgrade() {
                        warn!(error = %req.error_msg, "Peer aborted the transfer");
                        shared
                            .progress
                            .advance(TransferState::RemoteError(req.error_msg));
                    }
                    Ok(Some(()))
                }
            }),
        );

        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if self.progress.current().is_terminal() {
            drop(queue);
            endpoint.stop();
            return;
        }
        queue.endpoints.push(endpoint);
    }

    /// Route one fragment request: stream now, queue for later, or reject.
    fn accept_fragment(self: Arc<Self>, endpoint: Arc<Endpoint>, req: DownloadReq) -> bool {
        if req.start > req.end || req.end > req.file.size {
            self.fail(
                Some(endpoint),
                format!(
                    "Fragment bounds [{}, {}) out of range for {} ({} bytes)",
                    req.start, req.end, req.file.name, req.file.size
                ),
            );
            return false;
        }

        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(active) = queue.active.clone() {
            if active.entry == req.file {
                drop(queue);
                self.clone().spawn_stream(endpoint, active, req);
                return true;
            }
        }
        if queue.waiting.iter().any(|f| f.entry == req.file) {
            debug!(name = %req.file.name, "Queueing fragment request for inactive file");
            queue.unhandled.push(QueuedFragment { endpoint, req });
            return true;
        }
        warn!(name = %req.file.name, "Dropping fragment request for unknown file");
        false
    }

    fn spawn_stream(self: Arc<Self>, endpoint: Arc<Endpoint>, active: ActiveFile, req: DownloadReq) {
        let range = FragmentRange {
            start: req.start,
            end: req.end,
        };
        tokio::spawn(async move {
            self.stream_fragment(endpoint, active, range).await;
        });
    }

    /// Stream one fragment chunk by chunk, resizing after each round-trip.
    async fn stream_fragment(
        self: Arc<Self>,
        endpoint: Arc<Endpoint>,
        active: ActiveFile,
        range: FragmentRange,
    ) {
        let anchor = self.config.anchor_duration;
        let chunk_retry = RequestRetry::new(
            self.config.chunk_retry_times,
            self.config.chunk_request_timeout,
        );
        let mut chunk_size = self.initial_chunk_size;
        let mut offset = range.start;

        while offset < range.end {
            if self.progress.current().is_terminal() {
                endpoint.stop();
                self.release_endpoint(&endpoint);
                return;
            }

            let len = chunk_size.min((range.end - offset) as usize);
            let data = match crate::transfer::fsio::read_chunk(active.handle.clone(), offset, len)
                .await
            {
                Ok(data) => data,
                Err(e) => {
                    self.fail(Some(endpoint), format!("Read failed: {e}"));
                    return;
                }
            };

            let started = tokio::time::Instant::now();
            if let Err(e) = endpoint
                .request(
                    transfer_types::SEND_REQ,
                    transfer_types::SEND_RESP,
                    data,
                    None,
                    chunk_retry,
                )
                .await
            {
                if !self.progress.current().is_terminal() {
                    self.fail(Some(endpoint), format!("Chunk send failed: {e}"));
                }
                return;
            }
            chunk_size = next_chunk_size(chunk_size, started.elapsed(), anchor);

            offset += len as u64;
            self.speed.record(len as u64);
            let total = active.sent.fetch_add(len as u64, Ordering::SeqCst) + len as u64;
            self.progress.emit(TransferEvent::Progress {
                entry: active.entry.clone(),
                transferred: total,
                total: active.entry.size,
            });
            if total == active.entry.size {
                // This fragment delivered the last byte of the file.
                if let Err(e) = self.clone().activate_next(Some(active.entry.clone())) {
                    self.fail(Some(endpoint.clone()), e.to_string());
                    return;
                }
            }
        }

        // Fragment complete: tell the peer, then drop the connection. A
        // lost notice is not fatal; the peer's byte count completes it.
        let _ = endpoint
            .request_typed::<_, ()>(
                transfer_types::FINISHED_REQ,
                transfer_types::FINISHED_RESP,
                &(),
                None,
                RequestRetry::new(0, NOTICE_TIMEOUT),
            )
            .await;
        endpoint.stop();
        self.release_endpoint(&endpoint);
    }

    /// Drop a finished fragment's endpoint from the tracked set so a long
    /// multi-file run does not hold on to closed connections.
    fn release_endpoint(&self, endpoint: &Arc<Endpoint>) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.endpoints.retain(|e| !Arc::ptr_eq(e, endpoint));
    }

    /// Retire `finished` (if any) and activate the next waiting file,
    /// replaying fragment requests that queued up for it. With nothing
    /// left to send the whole run is finished.
    fn activate_next(self: Arc<Self>, finished: Option<FileEntry>) -> Result<()> {
        let (next, replay) = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(finished) = &finished {
                match &queue.active {
                    Some(active) if &active.entry == finished => queue.active = None,
                    _ => return Ok(()),
                }
            }

            match queue.waiting.pop_front() {
                Some(file) => {
                    let handle = File::open(&file.path).map_err(|e| {
                        ProtocolError::Custom(format!(
                            "Open {} failed: {e}",
                            file.path.display()
                        ))
                    })?;
                    let active = ActiveFile {
                        entry: file.entry.clone(),
                        handle: Arc::new(handle),
                        sent: Arc::new(AtomicU64::new(0)),
                    };
                    queue.active = Some(active.clone());

                    let mut replay = Vec::new();
                    let mut i = 0;
                    while i < queue.unhandled.len() {
                        if queue.unhandled[i].req.file == active.entry {
                            replay.push(queue.unhandled.remove(i));
                        } else {
                            i += 1;
                        }
                    }
                    (Some(active), replay)
                }
                None => (None, Vec::new()),
            }
        };

        if let Some(finished) = finished {
            self.progress.emit(TransferEvent::EndFile(finished));
        }
        match next {
            Some(active) => {
                info!(name = %active.entry.name, size = active.entry.size, "Sending file");
                self.speed.reset();
                self.progress.emit(TransferEvent::StartFile(active.entry.clone()));
                for queued in replay {
                    self.clone()
                        .spawn_stream(queued.endpoint.clone(), active.clone(), queued.req);
                }
            }
            None => {
                self.progress.advance(TransferState::Finished);
            }
        }
        Ok(())
    }

    /// Move to `Error`, notify the peer over `endpoint` and shut down.
    fn fail(&self, endpoint: Option<Arc<Endpoint>>, msg: String) {
        if !self.progress.advance(TransferState::Error(msg.clone())) {
            return;
        }
        warn!(error = %msg, "Transfer failed");
        self.close_endpoints(endpoint.as_ref());
        if let Some(endpoint) = endpoint {
            let notice = ErrorReq { error_msg: msg };
            tokio::spawn(async move {
                let _ = endpoint
                    .request_typed::<_, ()>(
                        transfer_types::ERROR_REQ,
                        transfer_types::ERROR_RESP,
                        &notice,
                        None,
                        RequestRetry::new(0, NOTICE_TIMEOUT),
                    )
                    .await;
                endpoint.stop();
            });
        }
    }

    /// Stop every tracked endpoint except `keep` (the one carrying an
    /// in-flight error notice).
    fn close_endpoints(&self, keep: Option<&Arc<Endpoint>>) {
        let endpoints = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.unhandled.clear();
            std::mem::take(&mut queue.endpoints)
        };
        for endpoint in endpoints {
            if keep.is_some_and(|k| Arc::ptr_eq(k, &endpoint)) {
                continue;
            }
            endpoint.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_grows_on_fast_round_trips() {
        let anchor = Duration::from_millis(200);
        let next = next_chunk_size(128 * 1024, Duration::from_millis(100), anchor);
        // elapsed at half the anchor: chunk grows by half.
        assert_eq!(next, 128 * 1024 + 64 * 1024);
    }

    #[test]
    fn chunk_shrinks_on_slow_round_trips() {
        let anchor = Duration::from_millis(200);
        let next = next_chunk_size(128 * 1024, Duration::from_millis(300), anchor);
        assert_eq!(next, 64 * 1024);
    }

    #[test]
    fn chunk_respects_bounds() {
        let anchor = Duration::from_millis(200);
        // Extremely slow: clamps to the floor instead of going negative.
        assert_eq!(
            next_chunk_size(1024, Duration::from_secs(10), anchor),
            MIN_CHUNK_SIZE
        );
        // Instant ack: clamps to the ceiling.
        assert_eq!(
            next_chunk_size(2 * 1024 * 1024, Duration::ZERO, anchor),
            MAX_CHUNK_SIZE
        );
    }

    #[test]
    fn on_anchor_round_trip_is_stable() {
        let anchor = Duration::from_millis(200);
        assert_eq!(next_chunk_size(128 * 1024, anchor, anchor), 128 * 1024);
    }

    #[tokio::test]
    async fn finished_fragments_release_their_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        std::fs::write(&path, vec![7u8; 64 * 1024]).unwrap();
        let entry = FileEntry {
            name: "src.bin".into(),
            path: "src.bin".into(),
            size: 64 * 1024,
            last_modify: 0,
        };

        let (sender, _events) = FileSender::new(
            vec![SenderFile {
                path,
                entry: entry.clone(),
            }],
            "127.0.0.1:0".parse().unwrap(),
            128 * 1024,
            TransferConfig::default(),
        );
        let addr = sender.start().await.unwrap();

        let (downloader, _dl_events) = crate::transfer::FileDownloader::new(
            vec![entry],
            addr,
            dir.path().to_path_buf(),
            TransferConfig::default(),
        );
        downloader.start();

        let mut state = sender.state();
        while !state.borrow().is_terminal() {
            state.changed().await.unwrap();
        }
        assert_eq!(*state.borrow(), TransferState::Finished);

        // The prune runs just after the finished notice; poll briefly.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            if sender.shared.queue.lock().unwrap().endpoints.is_empty() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "finished fragment endpoints still tracked"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn zero_size_files_never_enter_the_queue() {
        let files = vec![
            SenderFile {
                path: "/tmp/a".into(),
                entry: FileEntry {
                    name: "a".into(),
                    path: "a".into(),
                    size: 0,
                    last_modify: 0,
                },
            },
            SenderFile {
                path: "/tmp/b".into(),
                entry: FileEntry {
                    name: "b".into(),
                    path: "b".into(),
                    size: 10,
                    last_modify: 0,
                },
            },
        ];
        let (sender, _events) = FileSender::new(
            files,
            "127.0.0.1:0".parse().unwrap(),
            128 * 1024,
            TransferConfig::default(),
        );
        let queue = sender.shared.queue.lock().unwrap();
        assert_eq!(queue.waiting.len(), 1);
        assert_eq!(queue.waiting[0].entry.name, "b");
    }
}
