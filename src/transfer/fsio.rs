//! Positional file I/O.
//!
//! Fragment tasks share one file handle and touch disjoint byte ranges, so
//! all disk access is positional rather than seek-then-read. Unix has
//! `pread`/`pwrite` natively; Windows gets the same contract from
//! `seek_read`/`seek_write` loops. The async wrappers run on the blocking
//! pool so fragment tasks never stall the runtime on disk latency.

use std::fs::File;
use std::io;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;

#[cfg(unix)]
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
pub fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Read exactly `len` bytes at `offset` on the blocking pool.
pub async fn read_chunk(file: Arc<File>, offset: u64, len: usize) -> Result<Bytes> {
    let bytes = tokio::task::spawn_blocking(move || -> io::Result<Bytes> {
        let mut buf = vec![0u8; len];
        read_exact_at(&file, &mut buf, offset)?;
        Ok(Bytes::from(buf))
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
    Ok(bytes)
}

/// Write all of `data` at `offset` on the blocking pool.
pub async fn write_chunk(file: Arc<File>, offset: u64, data: Bytes) -> Result<()> {
    tokio::task::spawn_blocking(move || write_all_at(&file, &data, offset))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
    Ok(())
}
