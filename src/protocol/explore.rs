//! File-explore control session.
//!
//! The long-lived control connection between two peers: a version handshake
//! first, then directory browsing and the negotiation requests that start
//! file transfers. The embedder supplies handlers for the requests it wants
//! to answer; unhandled request types are dropped silently.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::PROTOCOL_VERSION;
use crate::error::Result;
use crate::protocol::client::RequestRetry;
use crate::protocol::endpoint::Endpoint;
use crate::protocol::messages::{
    explore_types, DirEntry, DownloadFilesReq, DownloadFilesResp, FileEntry, HandshakeReq,
    HandshakeResp, ScanDirReq, ScanDirResp, SendFilesReq, SendFilesResp, SendMsgReq,
};
use crate::protocol::server::typed_handler;
use crate::transport::tcp;

/// Lifecycle of one explore session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExploreState {
    NoConnection,
    Connecting,
    /// Handshake completed; requests flow.
    Active,
}

/// Handshake and control requests time out like ordinary requests.
fn control_retry() -> RequestRetry {
    RequestRetry::new(2, Duration::from_millis(1000))
}

/// One side of the control connection.
pub struct FileExplore {
    endpoint: Arc<Endpoint>,
    state: watch::Sender<ExploreState>,
}

impl FileExplore {
    /// Connect to a peer's explore listener and complete the handshake.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let (state, _) = watch::channel(ExploreState::Connecting);
        let connection = tcp::connect(addr).await?;
        let endpoint = Endpoint::spawn(connection)?;

        let session = Self { endpoint, state };
        session.handshake().await?;
        session.state.send_replace(ExploreState::Active);
        info!(%addr, "Explore session established");
        Ok(session)
    }

    /// Wrap an accepted control connection. The handshake handler is wired
    /// immediately; the session turns `Active` when the peer's handshake
    /// arrives with a matching version.
    pub fn serve(connection: crate::transport::Connection) -> Result<Self> {
        let endpoint = Endpoint::spawn(connection)?;
        let (state, _) = watch::channel(ExploreState::Connecting);

        let activated = state.clone();
        endpoint.register(
            explore_types::HANDSHAKE_REQ,
            typed_handler(move |_ctx, _is_new, req: HandshakeReq| {
                let activated = activated.clone();
                async move {
                    if req.version != PROTOCOL_VERSION {
                        warn!(
                            peer_version = req.version,
                            local_version = PROTOCOL_VERSION,
                            "Dropping handshake with unsupported version"
                        );
                        return Ok(None);
                    }
                    activated.send_replace(ExploreState::Active);
                    Ok(Some(HandshakeResp {
                        file_separator: std::path::MAIN_SEPARATOR.to_string(),
                    }))
                }
            }),
        );

        Ok(Self { endpoint, state })
    }

    /// Bind an explore listener. Each accepted connection becomes its own
    /// session via [`FileExplore::serve`].
    pub async fn bind(addr: SocketAddr) -> Result<tcp::Listener> {
        tcp::Listener::bind(addr).await
    }

    pub fn state(&self) -> watch::Receiver<ExploreState> {
        self.state.subscribe()
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    async fn handshake(&self) -> Result<HandshakeResp> {
        let req = HandshakeReq {
            version: PROTOCOL_VERSION,
            file_separator: std::path::MAIN_SEPARATOR.to_string(),
        };
        self.endpoint
            .request_typed(
                explore_types::HANDSHAKE_REQ,
                explore_types::HANDSHAKE_RESP,
                &req,
                None,
                control_retry(),
            )
            .await
    }

    /// Ask the peer to list a directory.
    pub async fn request_scan_dir(&self, path: String) -> Result<ScanDirResp> {
        self.endpoint
            .request_typed(
                explore_types::SCAN_DIR_REQ,
                explore_types::SCAN_DIR_RESP,
                &ScanDirReq { path },
                None,
                control_retry(),
            )
            .await
    }

    /// Announce files we want to push; the peer answers with the chunk
    /// size it wants us to start from.
    pub async fn request_send_files(
        &self,
        files: Vec<FileEntry>,
        max_connection: u32,
    ) -> Result<SendFilesResp> {
        self.endpoint
            .request_typed(
                explore_types::SEND_FILES_REQ,
                explore_types::SEND_FILES_RESP,
                &SendFilesReq {
                    files,
                    max_connection,
                },
                None,
                control_retry(),
            )
            .await
    }

    /// Ask the peer to serve files for us to pull; the peer answers with
    /// the fragment connection count it will accept.
    pub async fn request_download_files(
        &self,
        files: Vec<FileEntry>,
        buffer_size: u32,
    ) -> Result<DownloadFilesResp> {
        self.endpoint
            .request_typed(
                explore_types::DOWNLOAD_FILES_REQ,
                explore_types::DOWNLOAD_FILES_RESP,
                &DownloadFilesReq { files, buffer_size },
                None,
                control_retry(),
            )
            .await
    }

    /// Free-form text message to the peer.
    pub async fn send_msg(&self, text: String) -> Result<()> {
        self.endpoint
            .request_typed::<_, ()>(
                explore_types::SEND_MSG_REQ,
                explore_types::SEND_MSG_RESP,
                &SendMsgReq { text },
                None,
                control_retry(),
            )
            .await
    }

    /// Register a typed handler for one explore request type.
    pub fn on_request<Req, Resp, F, Fut>(&self, req_type: i32, handler: F)
    where
        Req: serde::de::DeserializeOwned + Send + 'static,
        Resp: serde::Serialize + Send + 'static,
        F: Fn(bool, Req) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Option<Resp>> + Send + 'static,
    {
        self.endpoint.register(
            req_type,
            typed_handler(move |_ctx, is_new, req: Req| {
                let fut = handler(is_new, req);
                async move { Ok(fut.await) }
            }),
        );
    }

    /// Close the session.
    pub fn stop(&self) {
        self.state.send_replace(ExploreState::NoConnection);
        self.endpoint.stop();
    }
}

/// List `path` into a [`ScanDirResp`], skipping entries whose metadata
/// cannot be read.
pub fn scan_dir(path: &Path) -> Result<ScanDirResp> {
    let mut children_dirs = Vec::new();
    let mut children_files = Vec::new();

    for entry in std::fs::read_dir(path)? {
        let Ok(entry) = entry else { continue };
        let Ok(meta) = entry.metadata() else {
            debug!(entry = %entry.path().display(), "Skipping unreadable entry");
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let entry_path = entry.path().to_string_lossy().into_owned();
        let last_modify = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        if meta.is_dir() {
            let child_count = std::fs::read_dir(entry.path())
                .map(|children| children.count() as u32)
                .unwrap_or(0);
            children_dirs.push(DirEntry {
                name,
                path: entry_path,
                child_count,
                last_modify,
            });
        } else if meta.is_file() {
            children_files.push(FileEntry {
                name,
                path: entry_path,
                size: meta.len(),
                last_modify,
            });
        }
    }

    children_dirs.sort_by(|a, b| a.name.cmp(&b.name));
    children_files.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(ScanDirResp {
        path: path.to_string_lossy().into_owned(),
        children_dirs,
        children_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_dir_lists_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.txt"), b"bb").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let resp = scan_dir(dir.path()).unwrap();
        assert_eq!(resp.children_dirs.len(), 1);
        assert_eq!(resp.children_dirs[0].name, "sub");
        let names: Vec<_> = resp.children_files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt"]);
        assert_eq!(resp.children_files[0].size, 1);
    }
}
