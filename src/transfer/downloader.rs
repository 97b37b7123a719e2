//! Receiving side of the transfer engine.
//!
//! The downloader works through its file list strictly in order. For each
//! file it partitions the size into fragment ranges, opens one TCP
//! connection per fragment, claims the range with a download request, and
//! writes every arriving chunk at its exact offset in a preallocated
//! `.downloading` temp file. When the byte counts add up the temp file is
//! renamed into place, bumping a numeric suffix past any name collision.
//! Cancel deletes the in-flight temp file; an error leaves it on disk for
//! diagnostics.

use std::fs::File;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::client::RequestRetry;
use crate::protocol::endpoint::Endpoint;
use crate::protocol::messages::{transfer_types, DownloadReq, ErrorReq, FileEntry};
use crate::protocol::server::{typed_handler, FrameHandler, RequestContext};
use crate::transfer::fsio;
use crate::transfer::ranges::{fragment_ranges, FragmentRange};
use crate::transfer::speed::SpeedCalculator;
use crate::transfer::{
    wait_transfer_terminal, TransferEvent, TransferProgress, TransferState,
};
use crate::transport::tcp;
use crate::utils::retry::RetryPolicy;

const DOWNLOADING_SUFFIX: &str = ".downloading";

struct DownloaderShared {
    remote: SocketAddr,
    save_dir: PathBuf,
    config: TransferConfig,
    progress: Arc<TransferProgress>,
    speed: Arc<SpeedCalculator>,
    endpoints: Mutex<Vec<Arc<Endpoint>>>,
}

/// The receiving half of a transfer run.
pub struct FileDownloader {
    shared: Arc<DownloaderShared>,
    files: Mutex<Option<Vec<FileEntry>>>,
}

impl FileDownloader {
    /// Build a downloader pulling `files` from the sender at `remote` into
    /// `save_dir`. Zero-size files are dropped from the queue up front.
    pub fn new(
        files: Vec<FileEntry>,
        remote: SocketAddr,
        save_dir: PathBuf,
        config: TransferConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (progress, events) = TransferProgress::new();
        let files: Vec<FileEntry> = files
            .into_iter()
            .filter(|f| {
                if f.size == 0 {
                    debug!(name = %f.name, "Skipping zero-size file");
                    false
                } else {
                    true
                }
            })
            .collect();

        let shared = Arc::new(DownloaderShared {
            remote,
            save_dir,
            config,
            progress,
            speed: Arc::new(SpeedCalculator::new()),
            endpoints: Mutex::new(Vec::new()),
        });

        (
            Self {
                shared,
                files: Mutex::new(Some(files)),
            },
            events,
        )
    }

    /// Start the run as a background task. Calling twice is a no-op.
    pub fn start(&self) {
        let Some(files) = self
            .files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };
        self.shared.progress.advance(TransferState::Started);
        let shared = self.shared.clone();
        tokio::spawn(async move {
            shared.run_all(files).await;
        });
    }

    /// Cancel the run: in-flight temp files are deleted, connections
    /// closed, no error notice sent.
    pub fn cancel(&self) {
        if self.shared.progress.advance(TransferState::Canceled) {
            self.shared.close_endpoints();
        }
    }

    pub fn state(&self) -> watch::Receiver<TransferState> {
        self.shared.progress.subscribe()
    }

    pub fn speed(&self) -> &SpeedCalculator {
        &self.shared.speed
    }
}

impl DownloaderShared {
    async fn run_all(self: Arc<Self>, files: Vec<FileEntry>) {
        for entry in files {
            if self.progress.current().is_terminal() {
                return;
            }
            if let Err(e) = self.clone().transfer_file(&entry).await {
                match e {
                    ProtocolError::Canceled => {}
                    e => self.fail(e.to_string()),
                }
                return;
            }
        }
        self.progress.advance(TransferState::Finished);
    }

    /// Transfer one file across its fragment connections. On return the
    /// temp file is either renamed into place, deleted (cancel) or left
    /// behind (error).
    async fn transfer_file(self: Arc<Self>, entry: &FileEntry) -> Result<()> {
        let temp_path = self
            .save_dir
            .join(format!("{}{DOWNLOADING_SUFFIX}", entry.name));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp_path)?;
        file.set_len(entry.size)?;
        let file = Arc::new(file);

        info!(name = %entry.name, size = entry.size, "Downloading file");
        self.speed.reset();
        self.progress.emit(TransferEvent::StartFile(entry.clone()));

        let transferred = Arc::new(AtomicU64::new(0));
        let ranges = fragment_ranges(
            entry.size,
            self.config.max_connections,
            self.config.min_fragment_size,
        );

        let mut fragments = JoinSet::new();
        for range in ranges {
            let shared = self.clone();
            let entry = entry.clone();
            let file = file.clone();
            let transferred = transferred.clone();
            fragments.spawn(async move {
                shared.fragment_download(entry, file, range, transferred).await
            });
        }

        let mut result: Result<()> = Ok(());
        while let Some(joined) = fragments.join_next().await {
            let fragment_result = joined
                .unwrap_or_else(|e| Err(ProtocolError::Custom(format!("Fragment task failed: {e}"))));
            if let Err(e) = fragment_result {
                fragments.abort_all();
                result = Err(e);
                break;
            }
        }
        drop(fragments);
        drop(file);

        if let Err(e) = result {
            let canceled = matches!(e, ProtocolError::Canceled)
                || self.progress.current() == TransferState::Canceled;
            if canceled {
                // User cancel: nothing worth keeping. Errors leave the
                // temp file behind for diagnostics.
                let _ = std::fs::remove_file(&temp_path);
                return Err(ProtocolError::Canceled);
            }
            return Err(e);
        }

        let received = transferred.load(Ordering::SeqCst);
        if received != entry.size {
            return Err(ProtocolError::Custom(format!(
                "Byte count mismatch for {}: {received} of {}",
                entry.name, entry.size
            )));
        }

        let final_path = resolve_collision(&self.save_dir, &entry.name);
        tokio::fs::rename(&temp_path, &final_path).await?;
        info!(path = %final_path.display(), "File complete");
        self.progress.emit(TransferEvent::EndFile(entry.clone()));
        Ok(())
    }

    /// Pull one fragment over its own connection.
    async fn fragment_download(
        self: Arc<Self>,
        entry: FileEntry,
        file: Arc<File>,
        range: FragmentRange,
        transferred: Arc<AtomicU64>,
    ) -> Result<()> {
        let policy = RetryPolicy::new(
            self.config.connect_attempts,
            self.config.connect_base_delay,
            2,
        );
        let conn = tcp::connect_with(self.remote, policy).await?;
        let endpoint = Endpoint::spawn(conn)?;
        {
            let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
            endpoints.push(endpoint.clone());
        }

        let received = Arc::new(AtomicU64::new(0));
        let finished = Arc::new(Notify::new());

        endpoint.register(
            transfer_types::SEND_REQ,
            Arc::new(ChunkWriter {
                shared: Arc::downgrade(&self),
                entry: entry.clone(),
                file,
                range,
                received: received.clone(),
                transferred,
            }),
        );

        let finished_signal = finished.clone();
        endpoint.register(
            transfer_types::FINISHED_REQ,
            typed_handler(move |_ctx, _is_new, (): ()| {
                let finished_signal = finished_signal.clone();
                async move {
                    finished_signal.notify_one();
                    Ok(Some(()))
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

        let claim = DownloadReq {
            file: entry,
            start: range.start,
            end: range.end,
        };
        let claimed = endpoint
            .request_typed::<_, ()>(
                transfer_types::DOWNLOAD_REQ,
                transfer_types::DOWNLOAD_RESP,
                &claim,
                None,
                RequestRetry::default(),
            )
            .await;

        let result = match claimed {
            Err(e) => Err(e),
            Ok(()) => {
                let mut state = self.progress.subscribe();
                let mut conn_state = endpoint.connection().state();
                tokio::select! {
                    biased;
                    _ = finished.notified() => {
                        if received.load(Ordering::SeqCst) == range.len() {
                            Ok(())
                        } else {
                            Err(ProtocolError::ProtocolViolation(format!(
                                "Fragment finished short: {} of {} bytes",
                                received.load(Ordering::SeqCst),
                                range.len()
                            )))
                        }
                    }
                    _ = wait_transfer_terminal(&mut state) => match self.progress.current() {
                        TransferState::Canceled => Err(ProtocolError::Canceled),
                        TransferState::RemoteError(msg) => Err(ProtocolError::RemoteAbort(msg)),
                        TransferState::Error(msg) => Err(ProtocolError::Custom(msg)),
                        _ => Err(ProtocolError::ConnectionClosed),
                    },
                    _ = crate::transport::connection::wait_terminal(&mut conn_state) => {
                        Err(ProtocolError::ConnectionClosed)
                    }
                }
            }
        };
        // Release the chunk writer (and its file handle) before the temp
        // file gets renamed.
        endpoint.unregister(transfer_types::SEND_REQ);
        endpoint.stop();
        {
            let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
            endpoints.retain(|e| !Arc::ptr_eq(e, &endpoint));
        }
        result
    }

    /// Move to `Error`, notify the peer over any open fragment connection
    /// and shut the rest down.
    fn fail(&self, msg: String) {
        if !self.progress.advance(TransferState::Error(msg.clone())) {
            return;
        }
        warn!(error = %msg, "Transfer failed");
        let notice_endpoint = {
            let endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
            endpoints
                .iter()
                .find(|e| !e.connection().current_state().is_terminal())
                .cloned()
        };
        if let Some(endpoint) = notice_endpoint {
            let notice = ErrorReq { error_msg: msg };
            tokio::spawn(async move {
                let _ = endpoint
                    .request_typed::<_, ()>(
                        transfer_types::ERROR_REQ,
                        transfer_types::ERROR_RESP,
                        &notice,
                        None,
                        RequestRetry::new(0, std::time::Duration::from_millis(2500)),
                    )
                    .await;
                endpoint.stop();
            });
        }
    }

    fn close_endpoints(&self) {
        let endpoints = {
            let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *endpoints)
        };
        for endpoint in endpoints {
            endpoint.stop();
        }
    }
}

/// Writes inbound chunks at `fragment_start + received_so_far`. Duplicate
/// deliveries are acknowledged without re-writing; a failed write aborts
/// the whole transfer rather than risking a resend landing twice.
struct ChunkWriter {
    shared: Weak<DownloaderShared>,
    entry: FileEntry,
    file: Arc<File>,
    range: FragmentRange,
    received: Arc<AtomicU64>,
    transferred: Arc<AtomicU64>,
}

impl FrameHandler for ChunkWriter {
    fn handle(
        &self,
        _ctx: RequestContext,
        is_new: bool,
        request_body: Bytes,
    ) -> BoxFuture<'_, Result<Option<Bytes>>> {
        Box::pin(async move {
            let Some(shared) = self.shared.upgrade() else {
                return Ok(None);
            };
            if shared.progress.current().is_terminal() {
                return Ok(None);
            }
            if !is_new {
                // The ack was lost, not the chunk. Ack again, write once.
                return Ok(Some(Bytes::new()));
            }

            let len = request_body.len() as u64;
            let offset_in_fragment = self.received.load(Ordering::SeqCst);
            if offset_in_fragment + len > self.range.len() {
                shared.fail(format!(
                    "Chunk overruns fragment of {}: {} + {len} > {}",
                    self.entry.name,
                    offset_in_fragment,
                    self.range.len()
                ));
                return Ok(None);
            }

            let offset = self.range.start + offset_in_fragment;
            if let Err(e) = fsio::write_chunk(self.file.clone(), offset, request_body).await {
                shared.fail(format!("Write failed: {e}"));
                return Ok(None);
            }

            self.received.fetch_add(len, Ordering::SeqCst);
            let total = self.transferred.fetch_add(len, Ordering::SeqCst) + len;
            shared.speed.record(len);
            shared.progress.emit(TransferEvent::Progress {
                entry: self.entry.clone(),
                transferred: total,
                total: self.entry.size,
            });
            Ok(Some(Bytes::new()))
        })
    }
}

/// First free destination name: `name.ext`, then `name-1.ext`,
/// `name-2.ext` and so on, the suffix always directly before the
/// extension.
fn resolve_collision(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    for n in 1u32.. {
        let bumped = match ext {
            Some(ext) => format!("{stem}-{n}.{ext}"),
            None => format!("{stem}-{n}"),
        };
        let candidate = dir.join(bumped);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("collision counter exhausted");
}
