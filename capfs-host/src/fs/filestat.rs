//! Host metadata to preview1 `filestat`

use super::error::GuestFault;
use super::memory::GuestMemory;
use capfs_abi::{Filestat, Filetype};
use std::fs::{FileType, Metadata};
use std::time::{SystemTime, UNIX_EPOCH};

/// Build a filestat record from host metadata
pub fn from_metadata(meta: &Metadata) -> Filestat {
    let (dev, ino, nlink) = identity(meta);
    Filestat {
        dev,
        ino,
        filetype: filetype(&meta.file_type()),
        nlink,
        size: meta.len(),
        atim: nanos(meta.accessed().ok()),
        mtim: nanos(meta.modified().ok()),
        ctim: change_time(meta),
    }
}

/// Serialize `stat` into guest memory at `ptr`
pub fn write_filestat(
    memory: &mut GuestMemory<'_>,
    ptr: u32,
    stat: &Filestat,
) -> Result<(), GuestFault> {
    memory.write_bytes(ptr, &stat.to_bytes())
}

pub fn filetype(file_type: &FileType) -> Filetype {
    if file_type.is_dir() {
        return Filetype::Directory;
    }
    if file_type.is_file() {
        return Filetype::RegularFile;
    }
    if file_type.is_symlink() {
        return Filetype::SymbolicLink;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if file_type.is_block_device() {
            return Filetype::BlockDevice;
        }
        if file_type.is_char_device() {
            return Filetype::CharacterDevice;
        }
        if file_type.is_socket() {
            return Filetype::SocketStream;
        }
    }

    Filetype::Unknown
}

fn nanos(time: Option<SystemTime>) -> u64 {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(unix)]
fn identity(meta: &Metadata) -> (u64, u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.dev(), meta.ino(), meta.nlink())
}

#[cfg(not(unix))]
fn identity(_meta: &Metadata) -> (u64, u64, u64) {
    (0, 0, 1)
}

#[cfg(unix)]
fn change_time(meta: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    let secs = u64::try_from(meta.ctime()).unwrap_or(0);
    let nsec = u64::try_from(meta.ctime_nsec()).unwrap_or(0);
    secs.saturating_mul(1_000_000_000).saturating_add(nsec)
}

#[cfg(not(unix))]
fn change_time(meta: &Metadata) -> u64 {
    nanos(meta.modified().ok())
}
