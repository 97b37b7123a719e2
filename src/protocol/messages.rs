//! Wire message bodies and frame type tags.
//!
//! Two independent type spaces share the same frame layout: the explore
//! space runs on the control connection, the transfer space on each file
//! transfer connection. Within a space every request tag is even and its
//! response tag is the next odd value, so `resp = req + 1` holds for every
//! pair.

use serde::{Deserialize, Serialize};

/// Frame types on the file-explore (control) connection.
pub mod explore_types {
    pub const HANDSHAKE_REQ: i32 = 0;
    pub const HANDSHAKE_RESP: i32 = 1;
    pub const SCAN_DIR_REQ: i32 = 2;
    pub const SCAN_DIR_RESP: i32 = 3;
    pub const SEND_FILES_REQ: i32 = 4;
    pub const SEND_FILES_RESP: i32 = 5;
    pub const DOWNLOAD_FILES_REQ: i32 = 6;
    pub const DOWNLOAD_FILES_RESP: i32 = 7;
    pub const SEND_MSG_REQ: i32 = 8;
    pub const SEND_MSG_RESP: i32 = 9;
}

/// Frame types on a file-transfer connection.
pub mod transfer_types {
    pub const DOWNLOAD_REQ: i32 = 0;
    pub const DOWNLOAD_RESP: i32 = 1;
    pub const SEND_REQ: i32 = 2;
    pub const SEND_RESP: i32 = 3;
    pub const FINISHED_REQ: i32 = 4;
    pub const FINISHED_RESP: i32 = 5;
    pub const ERROR_REQ: i32 = 6;
    pub const ERROR_RESP: i32 = 7;
}

/// One transferable file as the peers describe it to each other.
///
/// `path` is the sender-side path relative to the shared root; the
/// downloader derives its destination name from `name` alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub last_modify: i64,
}

/// One directory listed by a scan response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    pub child_count: u32,
    pub last_modify: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReq {
    pub version: i32,
    pub file_separator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResp {
    pub file_separator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanDirReq {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanDirResp {
    pub path: String,
    pub children_dirs: Vec<DirEntry>,
    pub children_files: Vec<FileEntry>,
}

/// Ask the peer to receive the listed files; we will act as the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFilesReq {
    pub files: Vec<FileEntry>,
    pub max_connection: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFilesResp {
    pub buffer_size: u32,
}

/// Ask the peer to serve the listed files; we will act as the downloader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFilesReq {
    pub files: Vec<FileEntry>,
    pub buffer_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFilesResp {
    pub max_connection: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMsgReq {
    pub text: String,
}

/// Claim the fragment `[start, end)` of `file` on a fresh transfer
/// connection. Bounds are validated by the sender; `start > end` or
/// `end > file.size` aborts the transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadReq {
    pub file: FileEntry,
    pub start: u64,
    pub end: u64,
}

/// Abort notice carrying the failing side's error text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReq {
    pub error_msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::body;

    #[test]
    fn response_tags_follow_request_tags() {
        assert_eq!(explore_types::HANDSHAKE_RESP, explore_types::HANDSHAKE_REQ + 1);
        assert_eq!(explore_types::SEND_MSG_RESP, explore_types::SEND_MSG_REQ + 1);
        assert_eq!(transfer_types::DOWNLOAD_RESP, transfer_types::DOWNLOAD_REQ + 1);
        assert_eq!(transfer_types::ERROR_RESP, transfer_types::ERROR_REQ + 1);
    }

    #[test]
    fn download_req_round_trips_as_json() {
        let req = DownloadReq {
            file: FileEntry {
                name: "report.txt".into(),
                path: "docs/report.txt".into(),
                size: 4096,
                last_modify: 1_700_000_000_000,
            },
            start: 0,
            end: 4095,
        };
        let bytes = body::encode(&req).unwrap();
        let back: DownloadReq = body::decode(&bytes).unwrap();
        assert_eq!(back, req);
    }
}
