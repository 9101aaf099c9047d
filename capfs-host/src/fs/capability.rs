//! Capability table
//!
//! Preopened directories are registered once while a context is built and
//! never change afterwards. Descriptors are assigned in declaration order
//! starting at [`FIRST_PREOPEN_FD`].

use super::error::{FsError, SetupError};
use super::rights;
use super::sandbox;
use capfs_abi::{Rights, FIRST_PREOPEN_FD};
use std::path::{Path, PathBuf};

/// A directory capability granted to the guest
#[derive(Debug, Clone)]
pub struct Preopen {
    /// Descriptor the guest uses as `dirfd`
    pub fd: u32,

    /// Mount path reported to the guest
    pub guest_path: String,

    /// Canonical host directory backing the mount
    pub host_root: PathBuf,

    pub writable: bool,
    pub rights_base: Rights,
    pub rights_inheriting: Rights,
}

/// Immutable map from preopen descriptors to host roots
#[derive(Debug, Default)]
pub struct CapabilityTable {
    entries: Vec<Preopen>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host directory under a guest mount path
    ///
    /// The host root must exist and be a directory; it is stored in
    /// canonical form so later containment checks compare like with like.
    pub(crate) fn register(
        &mut self,
        guest_path: &str,
        host_root: &Path,
        writable: bool,
    ) -> Result<u32, SetupError> {
        if guest_path.is_empty() {
            return Err(SetupError::invalid_guest_path(guest_path, "empty mount path"));
        }
        if guest_path.contains('\0') {
            return Err(SetupError::invalid_guest_path(guest_path, "contains NUL"));
        }
        if self.entries.iter().any(|p| p.guest_path == guest_path) {
            return Err(SetupError::DuplicateMount(guest_path.to_string()));
        }

        let host_root = sandbox::validate_root(host_root)?;
        let fd = self.next_fd();
        let (rights_base, rights_inheriting) = rights::preopen_rights(writable);

        tracing::debug!(
            fd,
            guest = guest_path,
            host = %host_root.display(),
            writable,
            "registered preopen"
        );

        self.entries.push(Preopen {
            fd,
            guest_path: guest_path.to_string(),
            host_root,
            writable,
            rights_base,
            rights_inheriting,
        });
        Ok(fd)
    }

    /// Look up the capability behind `fd`
    ///
    /// Anything that is not a preopened directory is `ENOTCAPABLE`.
    pub fn resolve(&self, fd: u32) -> Result<&Preopen, FsError> {
        self.get(fd).ok_or_else(|| {
            FsError::capability_violation(fd.to_string(), "descriptor is not a preopened directory")
        })
    }

    pub fn get(&self, fd: u32) -> Option<&Preopen> {
        let index = fd.checked_sub(FIRST_PREOPEN_FD)? as usize;
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Preopen> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First descriptor after the preopens; opened files start here
    pub fn next_fd(&self) -> u32 {
        FIRST_PREOPEN_FD + self.entries.len() as u32
    }
}
