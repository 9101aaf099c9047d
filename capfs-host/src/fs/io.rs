//! Scatter/gather I/O between guest memory and host handles
//!
//! Transfers are split into host calls of at most [`MAX_HOST_CHUNK`] bytes,
//! so one guest call can move any amount of data without a matching host
//! allocation. Iovec buffers must have been validated by
//! [`GuestMemory::read_iovecs`] first; out-of-bounds buffers fault before
//! any byte moves.
//!
//! Partial transfers are not errors. A short host read or write ends the
//! call and the bytes moved so far are reported; an error after some bytes
//! moved is logged and resurfaces on the guest's next call.

use super::error::FsError;
use super::fd_table::FileEntry;
use super::memory::GuestMemory;
use capfs_abi::{Fdflags, Iovec};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Largest single host read or write
pub const MAX_HOST_CHUNK: usize = 64 * 1024;

/// Bytes moved by one guest call, and the error that stopped it early
#[derive(Debug)]
pub struct Transfer {
    pub bytes: u64,
    pub error: Option<io::Error>,
}

impl Transfer {
    /// Report the byte count, or the error if nothing moved
    pub fn finish(self, op: &'static str) -> Result<u32, FsError> {
        match self.error {
            Some(e) if self.bytes == 0 => Err(FsError::host_io(op, e)),
            Some(e) => {
                tracing::warn!(op, bytes = self.bytes, error = %e, "partial transfer");
                Ok(clamp_u32(self.bytes))
            }
            None => Ok(clamp_u32(self.bytes)),
        }
    }
}

fn clamp_u32(bytes: u64) -> u32 {
    u32::try_from(bytes).unwrap_or(u32::MAX)
}

/// Fill guest buffers from `reader`
///
/// Each iovec is filled in chunks; a host read that returns fewer bytes
/// than asked for (including 0 at end of file) ends the whole call.
pub fn scatter_read<R: Read + ?Sized>(
    reader: &mut R,
    memory: &mut GuestMemory<'_>,
    iovs: &[Iovec],
) -> Result<Transfer, FsError> {
    let mut total: u64 = 0;

    for iov in iovs {
        let budget = u64::from(u32::MAX) - total;
        let len = u64::from(iov.buf_len).min(budget) as u32;
        let buf = memory.slice_mut(iov.buf, len)?;

        let mut filled = 0;
        while filled < buf.len() {
            let end = (filled + MAX_HOST_CHUNK).min(buf.len());
            let want = end - filled;
            match reader.read(&mut buf[filled..end]) {
                Ok(n) => {
                    filled += n;
                    total += n as u64;
                    if n < want {
                        return Ok(Transfer { bytes: total, error: None });
                    }
                }
                Err(e) => return Ok(Transfer { bytes: total, error: Some(e) }),
            }
        }
    }

    Ok(Transfer { bytes: total, error: None })
}

/// Drain guest buffers into `writer`
///
/// A host write that accepts fewer bytes than offered ends the call.
pub fn gather_write<W: Write + ?Sized>(
    writer: &mut W,
    memory: &GuestMemory<'_>,
    iovs: &[Iovec],
) -> Result<Transfer, FsError> {
    let mut total: u64 = 0;

    for iov in iovs {
        let budget = u64::from(u32::MAX) - total;
        let len = u64::from(iov.buf_len).min(budget) as u32;
        let data = memory.read_bytes(iov.buf, len)?;

        let mut written = 0;
        while written < data.len() {
            let end = (written + MAX_HOST_CHUNK).min(data.len());
            let offered = end - written;
            match writer.write(&data[written..end]) {
                Ok(n) => {
                    written += n;
                    total += n as u64;
                    if n < offered {
                        return Ok(Transfer { bytes: total, error: None });
                    }
                }
                Err(e) => return Ok(Transfer { bytes: total, error: Some(e) }),
            }
        }
    }

    Ok(Transfer { bytes: total, error: None })
}

/// `fd_read` against a file at its stored offset
pub fn read_file(
    entry: &mut FileEntry,
    memory: &mut GuestMemory<'_>,
    iovs: &[Iovec],
) -> Result<u32, FsError> {
    entry
        .file
        .seek(SeekFrom::Start(entry.offset))
        .map_err(|e| FsError::host_io("seek", e))?;
    let transfer = scatter_read(&mut entry.file, memory, iovs)?;
    entry.offset += transfer.bytes;
    transfer.finish("read")
}

/// `fd_write` against a file at its stored offset, or at the end for
/// append-mode descriptors
pub fn write_file(
    entry: &mut FileEntry,
    memory: &GuestMemory<'_>,
    iovs: &[Iovec],
) -> Result<u32, FsError> {
    let append = entry.fdflags.contains(Fdflags::APPEND);
    let start = if append {
        SeekFrom::End(0)
    } else {
        SeekFrom::Start(entry.offset)
    };
    let position = entry
        .file
        .seek(start)
        .map_err(|e| FsError::host_io("seek", e))?;

    let transfer = gather_write(&mut entry.file, memory, iovs)?;
    entry.offset = position + transfer.bytes;
    transfer.finish("write")
}

/// Positional read; the stored offset is left untouched
pub fn pread_file(
    entry: &mut FileEntry,
    memory: &mut GuestMemory<'_>,
    iovs: &[Iovec],
    offset: u64,
) -> Result<u32, FsError> {
    entry
        .file
        .seek(SeekFrom::Start(offset))
        .map_err(|e| FsError::host_io("seek", e))?;
    scatter_read(&mut entry.file, memory, iovs)?.finish("pread")
}

/// Positional write; the stored offset is left untouched
pub fn pwrite_file(
    entry: &mut FileEntry,
    memory: &GuestMemory<'_>,
    iovs: &[Iovec],
    offset: u64,
) -> Result<u32, FsError> {
    entry
        .file
        .seek(SeekFrom::Start(offset))
        .map_err(|e| FsError::host_io("seek", e))?;
    gather_write(&mut entry.file, memory, iovs)?.finish("pwrite")
}
