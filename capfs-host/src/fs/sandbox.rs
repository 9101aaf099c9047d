//! Path resolution and sandbox enforcement
//!
//! Guest paths are always relative to a preopened directory. This module
//! turns a `(capability, guest path)` pair into a host path and guarantees
//! the result stays inside the capability's root.
//!
//! # Resolution Flow
//!
//! ```text
//! Input: (fd 3 -> /srv/sandbox, "logs/../out.txt")
//!           │
//!           ▼
//! ┌──────────────────────────────────┐
//! │  1. Lexical checks               │
//! │     - empty       -> ENOENT      │
//! │     - NUL byte    -> EINVAL      │
//! │     - leading '/' -> ENOTCAPABLE │
//! └──────────────────────────────────┘
//!           │
//!           ▼
//! ┌──────────────────────────────────┐
//! │  2. Segment stack walk           │
//! │     "." and "" are skipped       │
//! │     ".." pops, empty stack fails │
//! │     ["out.txt"]                  │
//! └──────────────────────────────────┘
//!           │
//!           ▼
//! ┌──────────────────────────────────┐
//! │  3. Join under host root         │
//! │     no ".." may survive          │
//! └──────────────────────────────────┘
//!           │
//!           ▼
//! ┌──────────────────────────────────┐
//! │  4. Symlink recheck              │
//! │     canonicalize deepest existing│
//! │     prefix, must stay in root    │
//! └──────────────────────────────────┘
//!           │
//!           ▼
//! Output: /srv/sandbox/out.txt
//! ```
//!
//! Steps 1-3 touch nothing on the host. Step 4 only queries metadata, so an
//! escape attempt never creates or modifies a host entry.

use super::capability::Preopen;
use super::error::{FsError, SetupError};
use capfs_abi::Errno;
use std::path::{Component, Path, PathBuf};

/// A guest path resolved against its capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Absolute host path inside the capability root
    pub host_path: PathBuf,

    /// Surviving segments, joined with '/'
    pub normalized: String,
}

impl ResolvedPath {
    /// Whether the path names the capability root itself
    pub fn is_root(&self) -> bool {
        self.normalized.is_empty()
    }
}

/// Resolve `guest_path` inside `preopen`
///
/// # Errors
///
/// - `ENOTCAPABLE` for absolute paths, `..` above the root, and symlinks
///   leading out of the root
/// - `ENOENT` for an empty path, `EINVAL` for an embedded NUL
/// - host errors from the symlink recheck
pub fn resolve(preopen: &Preopen, guest_path: &str) -> Result<ResolvedPath, FsError> {
    if guest_path.is_empty() {
        return Err(FsError::rejected(Errno::Noent, "empty path"));
    }
    if guest_path.contains('\0') {
        return Err(FsError::rejected(Errno::Inval, "path contains NUL"));
    }
    if guest_path.starts_with('/') {
        return Err(FsError::capability_violation(guest_path, "absolute path"));
    }

    let segments = walk_segments(guest_path)?;

    let mut host_path = preopen.host_root.clone();
    for segment in &segments {
        host_path.push(segment);
    }

    // The walk already removed every "..", so any survivor means a segment
    // the host parses differently than we do.
    if host_path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
        || !host_path.starts_with(&preopen.host_root)
    {
        return Err(FsError::capability_violation(
            guest_path,
            "path leaves its root after joining",
        ));
    }

    check_symlinks(&preopen.host_root, &host_path, guest_path)?;

    Ok(ResolvedPath {
        host_path,
        normalized: segments.join("/"),
    })
}

/// Walk segments over an explicit stack
///
/// Iterative so that adversarial inputs with thousands of `../` segments
/// cost one pass and fail at the first segment that would leave the root.
fn walk_segments(guest_path: &str) -> Result<Vec<&str>, FsError> {
    let mut stack: Vec<&str> = Vec::new();
    for segment in guest_path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return Err(FsError::capability_violation(
                        guest_path,
                        "path ascends above its root",
                    ));
                }
            }
            name => stack.push(name),
        }
    }
    Ok(stack)
}

/// Canonicalize the deepest existing prefix and require it inside `root`
fn check_symlinks(root: &Path, path: &Path, guest_path: &str) -> Result<(), FsError> {
    let mut probe = path;
    loop {
        match std::fs::symlink_metadata(probe) {
            Ok(meta) => {
                let canonical = match probe.canonicalize() {
                    Ok(canonical) => canonical,
                    Err(_) if meta.file_type().is_symlink() => {
                        return Err(FsError::capability_violation(
                            guest_path,
                            "dangling symlink",
                        ));
                    }
                    Err(e) => return Err(FsError::host_io("canonicalize", e)),
                };
                if !canonical.starts_with(root) {
                    return Err(FsError::capability_violation(
                        guest_path,
                        "symlink points outside its root",
                    ));
                }
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => match probe.parent() {
                Some(parent) if parent.starts_with(root) => probe = parent,
                _ => return Ok(()),
            },
            Err(e) => return Err(FsError::host_io("lstat", e)),
        }
    }
}

/// Whether the final component of `path` is a symlink
pub fn is_symlink(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Validate a host directory before it becomes a preopen
///
/// Returns the canonical path.
pub fn validate_root(host_root: &Path) -> Result<PathBuf, SetupError> {
    let canonical = host_root.canonicalize().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SetupError::PathNotFound(host_root.to_path_buf())
        } else {
            SetupError::Canonicalize {
                path: host_root.to_path_buf(),
                source: e,
            }
        }
    })?;

    if !canonical.is_dir() {
        return Err(SetupError::NotADirectory(canonical));
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::rights::preopen_rights;

    fn preopen(root: &Path) -> Preopen {
        let (rights_base, rights_inheriting) = preopen_rights(true);
        Preopen {
            fd: 3,
            guest_path: "/sandbox".into(),
            host_root: root.canonicalize().unwrap(),
            writable: true,
            rights_base,
            rights_inheriting,
        }
    }

    #[test]
    fn test_walk_segments() {
        assert_eq!(walk_segments("a/./b//c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(walk_segments("a/b/../c").unwrap(), vec!["a", "c"]);
        assert_eq!(walk_segments("a/..").unwrap(), Vec::<&str>::new());
        assert_eq!(walk_segments("...").unwrap(), vec!["..."]);
        assert!(walk_segments("..").is_err());
        assert!(walk_segments("a/../../b").is_err());
    }

    #[test]
    fn test_resolve_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let pre = preopen(dir.path());

        let resolved = resolve(&pre, "sub/../output.txt").unwrap();
        assert_eq!(resolved.host_path, pre.host_root.join("output.txt"));
        assert_eq!(resolved.normalized, "output.txt");

        let root = resolve(&pre, ".").unwrap();
        assert!(root.is_root());
        assert_eq!(root.host_path, pre.host_root);
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let pre = preopen(dir.path());

        for path in ["../escape.txt", "/etc/passwd", "a/../../x", "./../x"] {
            let err = resolve(&pre, path).unwrap_err();
            assert_eq!(err.errno(), Errno::Notcapable, "path {path}");
        }
    }

    #[test]
    fn test_resolve_deep_traversal_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let pre = preopen(dir.path());

        let attack = "../".repeat(10_000) + "etc/passwd";
        let err = resolve(&pre, &attack).unwrap_err();
        assert_eq!(err.errno(), Errno::Notcapable);

        // Deep but balanced paths stay inside
        let balanced = "a/".repeat(5_000) + &"../".repeat(5_000) + "ok.txt";
        let resolved = resolve(&pre, &balanced).unwrap();
        assert_eq!(resolved.normalized, "ok.txt");
    }

    #[test]
    fn test_resolve_empty_and_nul() {
        let dir = tempfile::tempdir().unwrap();
        let pre = preopen(dir.path());

        assert_eq!(resolve(&pre, "").unwrap_err().errno(), Errno::Noent);
        assert_eq!(resolve(&pre, "a\0b").unwrap_err().errno(), Errno::Inval);
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("missing"),
            dir.path().join("dangling"),
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("inner")).unwrap();
        let pre = preopen(dir.path());

        let err = resolve(&pre, "link/secret.txt").unwrap_err();
        assert_eq!(err.errno(), Errno::Notcapable);

        let err = resolve(&pre, "dangling").unwrap_err();
        assert_eq!(err.errno(), Errno::Notcapable);

        // Symlinks that stay inside the root are fine
        assert!(resolve(&pre, "inner/new.txt").is_ok());
    }
}
