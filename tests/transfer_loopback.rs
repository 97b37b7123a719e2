#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end transfer tests over loopback: byte-identical round trips,
//! collision-resolved naming, cancellation and failure semantics.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use lan_transfer::config::TransferConfig;
use lan_transfer::core::body;
use lan_transfer::core::frame::Frame;
use lan_transfer::protocol::messages::{transfer_types, DownloadReq, FileEntry};
use lan_transfer::protocol::{Endpoint, RequestRetry};
use lan_transfer::transfer::{FileDownloader, FileSender, SenderFile, TransferState};
use lan_transfer::transport::tcp;
use rand::RngCore;

// ============================================================================
// HELPERS
// ============================================================================

fn init_tracing() {
    lan_transfer::utils::logging::init();
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::rng().fill_bytes(&mut data);
    data
}

fn entry_for(name: &str, data: &[u8]) -> FileEntry {
    FileEntry {
        name: name.to_string(),
        path: name.to_string(),
        size: data.len() as u64,
        last_modify: 0,
    }
}

async fn wait_terminal(
    mut state: tokio::sync::watch::Receiver<TransferState>,
) -> TransferState {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let current = state.borrow().clone();
            if current.is_terminal() {
                return current;
            }
            state.changed().await.expect("state channel closed");
        }
    })
    .await
    .expect("transfer did not terminate")
}

/// Run a full sender/downloader pair over loopback and wait for both
/// sides to terminate.
async fn run_transfer(
    files: &[(&str, Vec<u8>)],
    config: TransferConfig,
    dest: &Path,
) -> (TransferState, TransferState) {
    init_tracing();
    let src = tempfile::tempdir().unwrap();
    let mut sender_files = Vec::new();
    let mut entries = Vec::new();
    for (name, data) in files {
        let path = src.path().join(name);
        std::fs::write(&path, data).unwrap();
        let entry = entry_for(name, data);
        entries.push(entry.clone());
        sender_files.push(SenderFile { path, entry });
    }

    let (sender, _sender_events) = FileSender::new(
        sender_files,
        "127.0.0.1:0".parse().unwrap(),
        128 * 1024,
        config.clone(),
    );
    let addr = sender.start().await.unwrap();

    let (downloader, _dl_events) =
        FileDownloader::new(entries, addr, dest.to_path_buf(), config);
    downloader.start();

    let dl_state = wait_terminal(downloader.state()).await;
    let sender_state = wait_terminal(sender.state()).await;
    (sender_state, dl_state)
}

// ============================================================================
// ROUND TRIPS
// ============================================================================

#[tokio::test]
async fn test_single_byte_round_trip() {
    let dest = tempfile::tempdir().unwrap();
    let data = vec![0x5A];
    let (sender_state, dl_state) =
        run_transfer(&[("one.bin", data.clone())], TransferConfig::default(), dest.path()).await;

    assert_eq!(sender_state, TransferState::Finished);
    assert_eq!(dl_state, TransferState::Finished);
    assert_eq!(std::fs::read(dest.path().join("one.bin")).unwrap(), data);
    assert!(!dest.path().join("one.bin.downloading").exists());
}

#[tokio::test]
async fn test_megabyte_round_trip_is_byte_identical() {
    let dest = tempfile::tempdir().unwrap();
    let data = random_bytes(1024 * 1024 + 37);
    let (sender_state, dl_state) =
        run_transfer(&[("big.bin", data.clone())], TransferConfig::default(), dest.path()).await;

    assert_eq!(sender_state, TransferState::Finished);
    assert_eq!(dl_state, TransferState::Finished);
    assert_eq!(std::fs::read(dest.path().join("big.bin")).unwrap(), data);
}

#[tokio::test]
async fn test_multi_fragment_round_trip() {
    let dest = tempfile::tempdir().unwrap();
    // A tiny fragment minimum forces a real parallel multi-fragment run.
    let config = TransferConfig {
        min_fragment_size: 64 * 1024,
        max_connections: 4,
        ..TransferConfig::default()
    };
    let data = random_bytes(2 * 1024 * 1024 + 11);
    let (sender_state, dl_state) =
        run_transfer(&[("frag.bin", data.clone())], config, dest.path()).await;

    assert_eq!(sender_state, TransferState::Finished);
    assert_eq!(dl_state, TransferState::Finished);
    assert_eq!(std::fs::read(dest.path().join("frag.bin")).unwrap(), data);
}

#[tokio::test]
async fn test_multiple_files_arrive_in_order() {
    let dest = tempfile::tempdir().unwrap();
    let a = random_bytes(300 * 1024);
    let b = random_bytes(17);
    let c = random_bytes(512 * 1024);
    let (sender_state, dl_state) = run_transfer(
        &[("a.bin", a.clone()), ("b.bin", b.clone()), ("c.bin", c.clone())],
        TransferConfig::default(),
        dest.path(),
    )
    .await;

    assert_eq!(sender_state, TransferState::Finished);
    assert_eq!(dl_state, TransferState::Finished);
    assert_eq!(std::fs::read(dest.path().join("a.bin")).unwrap(), a);
    assert_eq!(std::fs::read(dest.path().join("b.bin")).unwrap(), b);
    assert_eq!(std::fs::read(dest.path().join("c.bin")).unwrap(), c);
}

#[tokio::test]
async fn test_zero_size_files_are_skipped() {
    let dest = tempfile::tempdir().unwrap();
    let data = random_bytes(64);
    let (sender_state, dl_state) = run_transfer(
        &[("empty.bin", Vec::new()), ("real.bin", data.clone())],
        TransferConfig::default(),
        dest.path(),
    )
    .await;

    assert_eq!(sender_state, TransferState::Finished);
    assert_eq!(dl_state, TransferState::Finished);
    assert!(!dest.path().join("empty.bin").exists());
    assert_eq!(std::fs::read(dest.path().join("real.bin")).unwrap(), data);
}

// ============================================================================
// NAMING
// ============================================================================

#[tokio::test]
async fn test_collision_appends_numeric_suffix() {
    let dest = tempfile::tempdir().unwrap();
    std::fs::write(dest.path().join("report.txt"), b"existing").unwrap();
    std::fs::write(dest.path().join("report-1.txt"), b"also existing").unwrap();

    let data = random_bytes(2048);
    let (_, dl_state) =
        run_transfer(&[("report.txt", data.clone())], TransferConfig::default(), dest.path())
            .await;

    assert_eq!(dl_state, TransferState::Finished);
    assert_eq!(std::fs::read(dest.path().join("report.txt")).unwrap(), b"existing");
    assert_eq!(std::fs::read(dest.path().join("report-2.txt")).unwrap(), data);
}

// ============================================================================
// CANCELLATION AND FAILURE
// ============================================================================

#[tokio::test]
async fn test_cancel_removes_the_temp_file() {
    // A sender that accepts fragment connections but never answers, so
    // the transfer stays in flight until we cancel it.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _hold = tokio::spawn(async move {
        let mut sockets = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            sockets.push(socket);
        }
    });

    let dest = tempfile::tempdir().unwrap();
    let entry = FileEntry {
        name: "stuck.bin".into(),
        path: "stuck.bin".into(),
        size: 4096,
        last_modify: 0,
    };
    let (downloader, _events) = FileDownloader::new(
        vec![entry],
        addr,
        dest.path().to_path_buf(),
        TransferConfig::default(),
    );
    downloader.start();

    let temp = dest.path().join("stuck.bin.downloading");
    tokio::time::timeout(Duration::from_secs(5), async {
        while !temp.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("temp file never appeared");

    downloader.cancel();
    assert_eq!(wait_terminal(downloader.state()).await, TransferState::Canceled);

    tokio::time::timeout(Duration::from_secs(10), async {
        while temp.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("temp file survived the cancel");
    assert!(!dest.path().join("stuck.bin").exists());
}

#[tokio::test]
async fn test_connect_exhaustion_fails_the_transfer() {
    // Grab a free port and release it so connects are refused.
    let refused: SocketAddr = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap()
    };

    let dest = tempfile::tempdir().unwrap();
    let config = TransferConfig {
        connect_attempts: 2,
        connect_base_delay: Duration::from_millis(10),
        ..TransferConfig::default()
    };
    let entry = FileEntry {
        name: "nope.bin".into(),
        path: "nope.bin".into(),
        size: 1024,
        last_modify: 0,
    };
    let (downloader, _events) =
        FileDownloader::new(vec![entry], refused, dest.path().to_path_buf(), config);
    downloader.start();

    let state = wait_terminal(downloader.state()).await;
    assert!(matches!(state, TransferState::Error(_)), "got {state:?}");
    assert!(!dest.path().join("nope.bin").exists());
    // Unlike a cancel, an error leaves the partial temp file in place.
    assert!(dest.path().join("nope.bin.downloading").exists());
}

#[tokio::test]
async fn test_malformed_fragment_bounds_fail_the_sender() {
    let src = tempfile::tempdir().unwrap();
    let data = random_bytes(1024);
    std::fs::write(src.path().join("victim.bin"), &data).unwrap();
    let entry = entry_for("victim.bin", &data);

    let (sender, _events) = FileSender::new(
        vec![SenderFile {
            path: src.path().join("victim.bin"),
            entry: entry.clone(),
        }],
        "127.0.0.1:0".parse().unwrap(),
        128 * 1024,
        TransferConfig::default(),
    );
    let addr = sender.start().await.unwrap();

    // Hand-rolled downloader claiming an inverted range.
    let conn = tcp::connect(addr).await.unwrap();
    let endpoint = Endpoint::spawn(conn).unwrap();
    let claim = DownloadReq {
        file: entry,
        start: 512,
        end: 128,
    };
    let _ = endpoint
        .request(
            transfer_types::DOWNLOAD_REQ,
            transfer_types::DOWNLOAD_RESP,
            body::encode(&claim).unwrap(),
            None,
            RequestRetry::new(0, Duration::from_millis(500)),
        )
        .await;

    let state = wait_terminal(sender.state()).await;
    assert!(matches!(state, TransferState::Error(_)), "got {state:?}");
}

// ============================================================================
// WIRE SANITY
// ============================================================================

#[tokio::test]
async fn test_raw_frame_reaches_sender_unscathed() {
    // A frame with an arbitrary type is dropped by the sender without
    // killing the connection.
    let src = tempfile::tempdir().unwrap();
    let data = random_bytes(256);
    std::fs::write(src.path().join("f.bin"), &data).unwrap();
    let entry = entry_for("f.bin", &data);

    let (sender, _events) = FileSender::new(
        vec![SenderFile {
            path: src.path().join("f.bin"),
            entry,
        }],
        "127.0.0.1:0".parse().unwrap(),
        128 * 1024,
        TransferConfig::default(),
    );
    let addr = sender.start().await.unwrap();

    let conn = tcp::connect(addr).await.unwrap();
    conn.send(lan_transfer::core::frame::AddressedFrame::direct(Frame::new(
        999,
        1,
        bytes::Bytes::from_static(b"junk"),
    )))
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!conn.current_state().is_terminal());
    assert!(!sender.state().borrow().is_terminal());
}
