//! Open file descriptor table
//!
//! Each entry exclusively owns its host [`File`]. Releasing an entry drops
//! the handle, which closes it; the number is free for reuse immediately.

use super::error::FsError;
use capfs_abi::{Errno, Fdflags, Rights};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;

/// Default cap on simultaneously open files per instance
pub const DEFAULT_MAX_OPEN_FILES: usize = 1024;

/// An open regular file
#[derive(Debug)]
pub struct FileEntry {
    pub file: File,

    /// Resolved host path, always inside the owning capability's root
    pub host_path: PathBuf,

    /// Preopen the file was opened through
    pub capability_fd: u32,

    pub rights_base: Rights,
    pub rights_inheriting: Rights,
    pub fdflags: Fdflags,

    /// Position used by `fd_read`/`fd_write`
    pub offset: u64,
}

/// Table of open files for one instance
#[derive(Debug)]
pub struct FdTable {
    entries: BTreeMap<u32, FileEntry>,
    first_fd: u32,
    max_open: usize,
}

impl FdTable {
    pub fn new(first_fd: u32) -> Self {
        Self::with_limit(first_fd, DEFAULT_MAX_OPEN_FILES)
    }

    pub fn with_limit(first_fd: u32, max_open: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            first_fd,
            max_open,
        }
    }

    /// Insert an entry under the smallest unused descriptor
    pub fn allocate(&mut self, entry: FileEntry) -> Result<u32, FsError> {
        if self.entries.len() >= self.max_open {
            return Err(FsError::rejected(Errno::Mfile, "too many open files"));
        }

        let mut candidate = self.first_fd;
        for &fd in self.entries.keys() {
            if fd != candidate {
                break;
            }
            candidate = candidate
                .checked_add(1)
                .ok_or_else(|| FsError::rejected(Errno::Mfile, "descriptor space exhausted"))?;
        }

        self.entries.insert(candidate, entry);
        Ok(candidate)
    }

    pub fn get(&self, fd: u32) -> Result<&FileEntry, FsError> {
        self.entries.get(&fd).ok_or(FsError::BadDescriptor(fd))
    }

    pub fn get_mut(&mut self, fd: u32) -> Result<&mut FileEntry, FsError> {
        self.entries.get_mut(&fd).ok_or(FsError::BadDescriptor(fd))
    }

    /// Remove an entry and close its host handle
    pub fn release(&mut self, fd: u32) -> Result<FileEntry, FsError> {
        self.entries.remove(&fd).ok_or(FsError::BadDescriptor(fd))
    }

    /// Close every open handle, returning how many were closed
    pub fn close_all(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn contains(&self, fd: u32) -> bool {
        self.entries.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first_fd(&self) -> u32 {
        self.first_fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(dir: &tempfile::TempDir, name: &str) -> FileEntry {
        let host_path = dir.path().join(name);
        FileEntry {
            file: File::create(&host_path).unwrap(),
            host_path,
            capability_fd: 3,
            rights_base: Rights::FD_READ,
            rights_inheriting: Rights::empty(),
            fdflags: Fdflags::empty(),
            offset: 0,
        }
    }

    #[test]
    fn test_allocate_smallest_unused() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = FdTable::new(4);

        assert_eq!(table.allocate(entry(&dir, "a")).unwrap(), 4);
        assert_eq!(table.allocate(entry(&dir, "b")).unwrap(), 5);
        assert_eq!(table.allocate(entry(&dir, "c")).unwrap(), 6);

        table.release(5).unwrap();
        assert!(!table.contains(5));
        assert_eq!(table.allocate(entry(&dir, "d")).unwrap(), 5);
        assert_eq!(table.allocate(entry(&dir, "e")).unwrap(), 7);
    }

    #[test]
    fn test_released_fd_is_bad() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = FdTable::new(4);
        let fd = table.allocate(entry(&dir, "a")).unwrap();

        table.release(fd).unwrap();
        assert!(matches!(table.get(fd), Err(FsError::BadDescriptor(4))));
        assert!(matches!(table.release(fd), Err(FsError::BadDescriptor(4))));
    }

    #[test]
    fn test_limit_and_close_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = FdTable::with_limit(4, 2);
        table.allocate(entry(&dir, "a")).unwrap();
        table.allocate(entry(&dir, "b")).unwrap();

        let err = table.allocate(entry(&dir, "c")).unwrap_err();
        assert_eq!(err.errno(), Errno::Mfile);

        assert_eq!(table.close_all(), 2);
        assert!(table.is_empty());
    }
}
