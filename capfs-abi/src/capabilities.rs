//! Capability declarations
//!
//! A host describes what a guest may touch with an [`FsCapabilities`] value:
//! the directories to preopen (and whether each is writable) plus which stdio
//! streams are attached. The value is plain data so it can live in a config
//! file or be built in code.
//!
//! ```text
//! { "preopens": [ { "guest_path": "/sandbox", "host_path": "/tmp/x", "writable": true } ],
//!   "stdio": { "stdout": true } }
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem capabilities granted to one guest instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsCapabilities {
    /// Directories bound to descriptors 3, 4, ... in declaration order
    #[serde(default)]
    pub preopens: Vec<PreopenSpec>,

    /// Standard stream access
    #[serde(default)]
    pub stdio: StdioCapability,
}

impl FsCapabilities {
    /// No filesystem access, no stdio
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_preopen(mut self, preopen: PreopenSpec) -> Self {
        self.preopens.push(preopen);
        self
    }

    pub fn with_stdio(mut self, stdio: StdioCapability) -> Self {
        self.stdio = stdio;
        self
    }

    pub fn has_write_access(&self) -> bool {
        self.preopens.iter().any(|p| p.writable)
    }
}

/// A single directory grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreopenSpec {
    /// Mount path the guest sees (reported by `fd_prestat_dir_name`)
    pub guest_path: String,

    /// Host directory backing the mount
    pub host_path: PathBuf,

    /// Whether files may be created, truncated and written
    #[serde(default)]
    pub writable: bool,
}

impl PreopenSpec {
    pub fn read_only(guest_path: impl Into<String>, host_path: impl Into<PathBuf>) -> Self {
        Self {
            guest_path: guest_path.into(),
            host_path: host_path.into(),
            writable: false,
        }
    }

    pub fn writable(guest_path: impl Into<String>, host_path: impl Into<PathBuf>) -> Self {
        Self {
            guest_path: guest_path.into(),
            host_path: host_path.into(),
            writable: true,
        }
    }
}

/// Standard stream access
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioCapability {
    #[serde(default)]
    pub stdin: bool,
    #[serde(default)]
    pub stdout: bool,
    #[serde(default)]
    pub stderr: bool,
}

impl StdioCapability {
    pub fn stdout_stderr() -> Self {
        Self {
            stdin: false,
            stdout: true,
            stderr: true,
        }
    }

    pub fn all() -> Self {
        Self {
            stdin: true,
            stdout: true,
            stderr: true,
        }
    }
}
