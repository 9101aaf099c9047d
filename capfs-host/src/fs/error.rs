//! Filesystem error types
//!
//! Every failure a guest can observe is an [`FsError`], which maps onto a
//! single WASI errno through [`FsError::errno`]. Guest memory violations are
//! kept apart as [`GuestFault`]: they trap the instance instead of producing
//! an errno.

use super::errno;
use capfs_abi::{Errno, Rights};
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by filesystem operations
#[derive(Debug, Error)]
pub enum FsError {
    /// Path escapes its capability, or the descriptor is not a preopen
    #[error("Capability violation for '{path}': {reason}")]
    CapabilityViolation { path: String, reason: &'static str },

    /// Descriptor lacks a right the operation needs
    #[error("Descriptor {fd} lacks rights {missing:?}")]
    RightsViolation { fd: u32, missing: Rights },

    /// Unknown or closed descriptor
    #[error("Bad file descriptor: {0}")]
    BadDescriptor(u32),

    /// Host call failed after capability and rights checks passed
    #[error("Host {op} failed: {source}")]
    HostIo {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Request refused before reaching the host
    #[error("{reason} ({errno})")]
    Rejected { errno: Errno, reason: &'static str },

    /// Guest memory access out of bounds
    #[error(transparent)]
    Fault(#[from] GuestFault),
}

impl FsError {
    /// Create a capability violation error
    pub fn capability_violation(path: impl Into<String>, reason: &'static str) -> Self {
        Self::CapabilityViolation {
            path: path.into(),
            reason,
        }
    }

    /// Wrap a host I/O error
    pub fn host_io(op: &'static str, source: std::io::Error) -> Self {
        Self::HostIo { op, source }
    }

    /// Refuse a request with a specific errno
    pub fn rejected(errno: Errno, reason: &'static str) -> Self {
        Self::Rejected { errno, reason }
    }

    /// WASI errno reported to the guest
    ///
    /// Capability and rights violations are always `ENOTCAPABLE`.
    /// [`FsError::Fault`] has no errno; callers trap on it before asking,
    /// and `EFAULT` is returned only as a fallback.
    pub fn errno(&self) -> Errno {
        match self {
            Self::CapabilityViolation { .. } | Self::RightsViolation { .. } => Errno::Notcapable,
            Self::BadDescriptor(_) => Errno::Badf,
            Self::HostIo { source, .. } => errno::from_io_error(source),
            Self::Rejected { errno, .. } => *errno,
            Self::Fault(_) => Errno::Fault,
        }
    }

    /// Check if this is a security-related error
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::CapabilityViolation { .. } | Self::RightsViolation { .. }
        )
    }
}

/// Guest memory violations
///
/// These are unrecoverable for the calling instance and surface as traps.
#[derive(Debug, Error)]
pub enum GuestFault {
    #[error("Out of bounds guest memory access: ptr={ptr}, len={len}, memory_size={size}")]
    OutOfBounds { ptr: u32, len: u64, size: usize },

    #[error("Guest module does not export a linear memory named 'memory'")]
    MissingMemory,
}

/// Errors raised while building a filesystem context
#[derive(Debug, Error)]
pub enum SetupError {
    /// Host directory does not exist
    #[error("Preopen host path does not exist: {0}")]
    PathNotFound(PathBuf),

    /// Host path is not a directory
    #[error("Preopen host path is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Guest mount path unusable
    #[error("Invalid guest mount path '{path}': {reason}")]
    InvalidGuestPath { path: String, reason: String },

    /// Two preopens share a guest mount path
    #[error("Guest mount path '{0}' is declared twice")]
    DuplicateMount(String),

    /// Canonicalization of a host root failed
    #[error("Failed to resolve host path '{path}': {source}")]
    Canonicalize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SetupError {
    pub fn invalid_guest_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidGuestPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_errors_are_notcapable() {
        let escape = FsError::capability_violation("../x", "path ascends above its root");
        let rights = FsError::RightsViolation {
            fd: 4,
            missing: Rights::FD_WRITE,
        };

        assert_eq!(escape.errno(), Errno::Notcapable);
        assert_eq!(rights.errno(), Errno::Notcapable);
        assert!(escape.is_security_violation());
        assert!(rights.is_security_violation());
    }

    #[test]
    fn test_host_errors_keep_their_errno() {
        let err = FsError::host_io(
            "open",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.errno(), Errno::Noent);
        assert!(!err.is_security_violation());
        assert_eq!(FsError::BadDescriptor(9).errno(), Errno::Badf);
    }
}
