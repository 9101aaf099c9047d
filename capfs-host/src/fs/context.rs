//! Per-instance filesystem context
//!
//! [`WasiFsBuilder`] turns a capability declaration into a [`WasiFsCtx`]
//! that grants exactly the declared directories and streams.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      WasiFsBuilder Flow                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  Input: FsCapabilities                                          │
//! │  {                                                              │
//! │    preopens: [ "/data"   -> ./data   (read-only),               │
//! │                "/output" -> ./output (writable) ],              │
//! │    stdio: { stdin: false, stdout: true, stderr: true }          │
//! │  }                                                              │
//! │                           │                                     │
//! │                           ▼                                     │
//! │  WasiFsBuilder::build                                           │
//! │  1. Canonicalize and validate each host root                    │
//! │  2. Assign fds 3, 4, ... in declaration order                   │
//! │  3. Attach inherited or custom stdio streams                    │
//! │                           │                                     │
//! │                           ▼                                     │
//! │  Output: WasiFsCtx                                              │
//! │  - fd 0-2   stdio (only attached streams are live)              │
//! │  - fd 3     "/data"    base: PATH_OPEN | PATH_FILESTAT_GET ...  │
//! │  - fd 4     "/output"  base: ... | PATH_CREATE_FILE             │
//! │  - fd 5+    files opened by the guest                           │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation checks, in order: the descriptor is live (`EBADF`), the
//! descriptor holds the required rights (`ENOTCAPABLE`), and for path
//! operations that the path stays inside its capability (`ENOTCAPABLE`).
//! Only then is the host touched.

use super::capability::{CapabilityTable, Preopen};
use super::error::{FsError, SetupError};
use super::fd_table::{FdTable, FileEntry, DEFAULT_MAX_OPEN_FILES};
use super::filestat;
use super::io;
use super::memory::GuestMemory;
use super::rights;
use super::sandbox;
use crate::audit::{self, AccessMode, AuditEvent, AuditSink, NullAuditSink};
use capfs_abi::{
    Errno, Fdflags, Fdstat, Filestat, Filetype, FsCapabilities, Iovec, Lookupflags, Oflags,
    PreopenSpec, Prestat, Rights, Whence, FIRST_PREOPEN_FD,
};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::sync::Arc;

type Reader = Box<dyn Read + Send>;
type Writer = Box<dyn Write + Send>;

/// Builder for a [`WasiFsCtx`]
///
/// # Example
///
/// ```rust,no_run
/// use capfs_abi::PreopenSpec;
/// use capfs_host::WasiFsBuilder;
///
/// let ctx = WasiFsBuilder::new()
///     .preopen(PreopenSpec::writable("/sandbox", "/tmp/sandbox"))
///     .inherit_stdout()
///     .build()?;
/// assert_eq!(ctx.capabilities().len(), 1);
/// # Ok::<(), capfs_host::SetupError>(())
/// ```
pub struct WasiFsBuilder {
    instance: String,
    preopens: Vec<PreopenSpec>,
    stdin: Option<Reader>,
    stdout: Option<Writer>,
    stderr: Option<Writer>,
    audit: Option<Arc<dyn AuditSink>>,
    max_open_files: usize,
}

impl WasiFsBuilder {
    pub fn new() -> Self {
        Self {
            instance: "guest".to_string(),
            preopens: Vec::new(),
            stdin: None,
            stdout: None,
            stderr: None,
            audit: None,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
        }
    }

    /// Label used in logs and audit events
    pub fn instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance = name.into();
        self
    }

    /// Apply a declared capability set
    ///
    /// Declared stdio streams are inherited from the host process.
    pub fn with_capabilities(mut self, capabilities: &FsCapabilities) -> Self {
        self.preopens.extend(capabilities.preopens.iter().cloned());
        if capabilities.stdio.stdin {
            self = self.inherit_stdin();
        }
        if capabilities.stdio.stdout {
            self = self.inherit_stdout();
        }
        if capabilities.stdio.stderr {
            self = self.inherit_stderr();
        }
        self
    }

    pub fn preopen(mut self, spec: PreopenSpec) -> Self {
        self.preopens.push(spec);
        self
    }

    pub fn inherit_stdin(self) -> Self {
        self.stdin(std::io::stdin())
    }

    pub fn inherit_stdout(self) -> Self {
        self.stdout(std::io::stdout())
    }

    pub fn inherit_stderr(self) -> Self {
        self.stderr(std::io::stderr())
    }

    /// Attach a custom reader as fd 0
    pub fn stdin(mut self, reader: impl Read + Send + 'static) -> Self {
        self.stdin = Some(Box::new(reader));
        self
    }

    /// Attach a custom writer as fd 1
    pub fn stdout(mut self, writer: impl Write + Send + 'static) -> Self {
        self.stdout = Some(Box::new(writer));
        self
    }

    /// Attach a custom writer as fd 2
    pub fn stderr(mut self, writer: impl Write + Send + 'static) -> Self {
        self.stderr = Some(Box::new(writer));
        self
    }

    pub fn audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn max_open_files(mut self, max: usize) -> Self {
        self.max_open_files = max;
        self
    }

    /// Validate every preopen and build the context
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if a host root is missing or not a directory,
    /// or a guest mount path is empty or declared twice.
    pub fn build(self) -> Result<WasiFsCtx, SetupError> {
        let mut capabilities = CapabilityTable::new();
        for spec in &self.preopens {
            capabilities.register(&spec.guest_path, &spec.host_path, spec.writable)?;
        }

        let files = FdTable::with_limit(capabilities.next_fd(), self.max_open_files);

        tracing::debug!(
            instance = %self.instance,
            preopens = capabilities.len(),
            stdin = self.stdin.is_some(),
            stdout = self.stdout.is_some(),
            stderr = self.stderr.is_some(),
            "built filesystem context"
        );

        Ok(WasiFsCtx {
            instance: self.instance,
            capabilities,
            files,
            stdio: Stdio {
                stdin: self.stdin,
                stdout: self.stdout,
                stderr: self.stderr,
            },
            audit: self
                .audit
                .unwrap_or_else(|| Arc::new(NullAuditSink::new())),
        })
    }
}

impl Default for WasiFsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WasiFsBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasiFsBuilder")
            .field("instance", &self.instance)
            .field("preopens", &self.preopens)
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("max_open_files", &self.max_open_files)
            .finish()
    }
}

struct Stdio {
    stdin: Option<Reader>,
    stdout: Option<Writer>,
    stderr: Option<Writer>,
}

impl Stdio {
    fn is_attached(&self, fd: u32) -> bool {
        match fd {
            0 => self.stdin.is_some(),
            1 => self.stdout.is_some(),
            2 => self.stderr.is_some(),
            _ => false,
        }
    }

    fn writer(&mut self, fd: u32) -> Option<&mut Writer> {
        match fd {
            1 => self.stdout.as_mut(),
            2 => self.stderr.as_mut(),
            _ => None,
        }
    }

    fn detach(&mut self, fd: u32) -> bool {
        match fd {
            0 => self.stdin.take().is_some(),
            1 => self.stdout.take().is_some(),
            2 => self.stderr.take().is_some(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Stdio,
    Preopen,
    File,
}

/// Filesystem state owned by one guest instance
pub struct WasiFsCtx {
    instance: String,
    capabilities: CapabilityTable,
    files: FdTable,
    stdio: Stdio,
    audit: Arc<dyn AuditSink>,
}

impl WasiFsCtx {
    pub fn builder() -> WasiFsBuilder {
        WasiFsBuilder::new()
    }

    pub fn instance_name(&self) -> &str {
        &self.instance
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    pub fn open_file_count(&self) -> usize {
        self.files.len()
    }

    // =========================================================================
    // Path operations
    // =========================================================================

    /// Open a file relative to a preopened directory
    ///
    /// The new descriptor receives the requested rights narrowed to what
    /// the capability lets its files inherit.
    #[allow(clippy::too_many_arguments)]
    pub fn path_open(
        &mut self,
        dirfd: u32,
        lookup: Lookupflags,
        path: &str,
        oflags: Oflags,
        rights_base: Rights,
        rights_inheriting: Rights,
        fdflags: Fdflags,
    ) -> Result<u32, FsError> {
        let preopen = self.preopen(dirfd, path)?.clone();

        let mut required = Rights::PATH_OPEN;
        if oflags.contains(Oflags::CREAT) {
            required |= Rights::PATH_CREATE_FILE;
        }
        if oflags.contains(Oflags::TRUNC) {
            required |= Rights::PATH_FILESTAT_SET_SIZE;
        }
        self.require(dirfd, required)?;

        if oflags.contains(Oflags::CREAT | Oflags::DIRECTORY) {
            return Err(FsError::rejected(Errno::Inval, "cannot create a directory with path_open"));
        }

        let resolved = self.resolve_path(&preopen, path)?;
        let follow = lookup.contains(Lookupflags::SYMLINK_FOLLOW);

        if !follow && sandbox::is_symlink(&resolved.host_path) {
            return Err(FsError::rejected(Errno::Loop, "final component is a symlink"));
        }
        match std::fs::metadata(&resolved.host_path) {
            Ok(meta) if meta.is_dir() => {
                let errno = if oflags.contains(Oflags::DIRECTORY) {
                    Errno::Notsup
                } else {
                    Errno::Isdir
                };
                return Err(FsError::rejected(errno, "directory descriptors are not supported"));
            }
            Ok(_) if oflags.contains(Oflags::DIRECTORY) => {
                return Err(FsError::rejected(Errno::Notdir, "not a directory"));
            }
            _ => {}
        }

        let granted_base = rights_base & preopen.rights_inheriting & Rights::file_rights();
        let granted_inheriting = rights_inheriting & preopen.rights_inheriting;

        let write = granted_base.contains(Rights::FD_WRITE)
            || oflags.intersects(Oflags::CREAT | Oflags::TRUNC);
        let read = granted_base.contains(Rights::FD_READ) || !write;

        let mut options = OpenOptions::new();
        options
            .read(read)
            .write(write)
            .truncate(oflags.contains(Oflags::TRUNC));
        if oflags.contains(Oflags::CREAT | Oflags::EXCL) {
            options.create_new(true);
        } else if oflags.contains(Oflags::CREAT) {
            options.create(true);
        }
        apply_platform_flags(&mut options, follow, fdflags);

        let file = options
            .open(&resolved.host_path)
            .map_err(|e| FsError::host_io("open", e))?;

        let fd = self.files.allocate(FileEntry {
            file,
            host_path: resolved.host_path.clone(),
            capability_fd: dirfd,
            rights_base: granted_base,
            rights_inheriting: granted_inheriting,
            fdflags,
            offset: 0,
        })?;

        tracing::debug!(
            instance = %self.instance,
            dirfd,
            fd,
            path = %resolved.normalized,
            read,
            write,
            "opened file"
        );
        self.record(audit::file_opened(
            &self.instance,
            fd,
            &resolved.host_path,
            AccessMode::from_flags(read, write),
        ));
        Ok(fd)
    }

    /// Stat a path relative to a preopened directory
    pub fn path_filestat_get(
        &mut self,
        dirfd: u32,
        lookup: Lookupflags,
        path: &str,
    ) -> Result<Filestat, FsError> {
        let preopen = self.preopen(dirfd, path)?.clone();
        self.require(dirfd, Rights::PATH_FILESTAT_GET)?;
        let resolved = self.resolve_path(&preopen, path)?;

        let meta = if lookup.contains(Lookupflags::SYMLINK_FOLLOW) {
            std::fs::metadata(&resolved.host_path)
        } else {
            std::fs::symlink_metadata(&resolved.host_path)
        }
        .map_err(|e| FsError::host_io("stat", e))?;

        Ok(filestat::from_metadata(&meta))
    }

    // =========================================================================
    // Descriptor operations
    // =========================================================================

    pub fn fd_read(
        &mut self,
        fd: u32,
        memory: &mut GuestMemory<'_>,
        iovs: &[Iovec],
    ) -> Result<u32, FsError> {
        self.require(fd, Rights::FD_READ)?;
        match self.kind(fd) {
            Kind::Stdio => {
                let stream = self.stdio.stdin.as_mut().ok_or(FsError::BadDescriptor(fd))?;
                io::scatter_read(&mut **stream, memory, iovs)?.finish("read")
            }
            Kind::Preopen => Err(FsError::rejected(Errno::Isdir, "descriptor is a directory")),
            Kind::File => io::read_file(self.files.get_mut(fd)?, memory, iovs),
        }
    }

    pub fn fd_write(
        &mut self,
        fd: u32,
        memory: &GuestMemory<'_>,
        iovs: &[Iovec],
    ) -> Result<u32, FsError> {
        self.require(fd, Rights::FD_WRITE)?;
        match self.kind(fd) {
            Kind::Stdio => {
                let stream = self.stdio.writer(fd).ok_or(FsError::BadDescriptor(fd))?;
                let written = io::gather_write(&mut **stream, memory, iovs)?.finish("write")?;
                if let Err(e) = stream.flush() {
                    tracing::warn!(fd, error = %e, "failed to flush stdio stream");
                }
                Ok(written)
            }
            Kind::Preopen => Err(FsError::rejected(Errno::Isdir, "descriptor is a directory")),
            Kind::File => io::write_file(self.files.get_mut(fd)?, memory, iovs),
        }
    }

    pub fn fd_pread(
        &mut self,
        fd: u32,
        memory: &mut GuestMemory<'_>,
        iovs: &[Iovec],
        offset: u64,
    ) -> Result<u32, FsError> {
        self.require(fd, Rights::FD_READ | Rights::FD_SEEK)?;
        io::pread_file(self.files.get_mut(fd)?, memory, iovs, offset)
    }

    pub fn fd_pwrite(
        &mut self,
        fd: u32,
        memory: &GuestMemory<'_>,
        iovs: &[Iovec],
        offset: u64,
    ) -> Result<u32, FsError> {
        self.require(fd, Rights::FD_WRITE | Rights::FD_SEEK)?;
        io::pwrite_file(self.files.get_mut(fd)?, memory, iovs, offset)
    }

    /// Move the stored offset
    ///
    /// `(0, Cur)` is a position query and only needs `FD_TELL`.
    pub fn fd_seek(&mut self, fd: u32, offset: i64, whence: Whence) -> Result<u64, FsError> {
        self.reject_stdio_seek(fd)?;
        let required = if offset == 0 && whence == Whence::Cur {
            Rights::FD_TELL
        } else {
            Rights::FD_SEEK
        };
        self.require(fd, required)?;

        let entry = self.files.get_mut(fd)?;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => i128::from(entry.offset),
            Whence::End => {
                let meta = entry
                    .file
                    .metadata()
                    .map_err(|e| FsError::host_io("fstat", e))?;
                i128::from(meta.len())
            }
        };
        let target = base + i128::from(offset);
        let target = u64::try_from(target)
            .ok()
            .filter(|t| *t <= i64::MAX as u64)
            .ok_or_else(|| FsError::rejected(Errno::Inval, "seek target out of range"))?;

        entry.offset = target;
        Ok(target)
    }

    pub fn fd_tell(&mut self, fd: u32) -> Result<u64, FsError> {
        self.reject_stdio_seek(fd)?;
        self.require(fd, Rights::FD_TELL)?;
        Ok(self.files.get(fd)?.offset)
    }

    /// Release a descriptor
    ///
    /// Closing a stdio descriptor detaches the stream. Preopens stay for the
    /// lifetime of the context.
    pub fn fd_close(&mut self, fd: u32) -> Result<(), FsError> {
        match self.kind(fd) {
            Kind::Stdio => {
                if self.stdio.detach(fd) {
                    tracing::debug!(instance = %self.instance, fd, "detached stdio stream");
                    Ok(())
                } else {
                    Err(FsError::BadDescriptor(fd))
                }
            }
            Kind::Preopen => Err(FsError::rejected(Errno::Notsup, "preopened directories cannot be closed")),
            Kind::File => {
                let entry = self.files.release(fd)?;
                let mode = AccessMode::from_flags(
                    entry.rights_base.contains(Rights::FD_READ),
                    entry.rights_base.contains(Rights::FD_WRITE),
                );
                tracing::debug!(instance = %self.instance, fd, "closed file");
                self.record(audit::file_closed(&self.instance, fd, &entry.host_path, mode));
                Ok(())
            }
        }
    }

    pub fn fd_sync(&mut self, fd: u32) -> Result<(), FsError> {
        self.require(fd, Rights::FD_SYNC)?;
        self.files
            .get(fd)?
            .file
            .sync_all()
            .map_err(|e| FsError::host_io("fsync", e))
    }

    pub fn fd_datasync(&mut self, fd: u32) -> Result<(), FsError> {
        self.require(fd, Rights::FD_DATASYNC)?;
        self.files
            .get(fd)?
            .file
            .sync_data()
            .map_err(|e| FsError::host_io("fdatasync", e))
    }

    pub fn fd_filestat_get(&mut self, fd: u32) -> Result<Filestat, FsError> {
        self.require(fd, Rights::FD_FILESTAT_GET)?;
        match self.kind(fd) {
            Kind::Stdio => Ok(Filestat {
                dev: 0,
                ino: 0,
                filetype: Filetype::CharacterDevice,
                nlink: 1,
                size: 0,
                atim: 0,
                mtim: 0,
                ctim: 0,
            }),
            Kind::Preopen => {
                let preopen = self.capabilities.resolve(fd)?;
                let meta = std::fs::metadata(&preopen.host_root)
                    .map_err(|e| FsError::host_io("stat", e))?;
                Ok(filestat::from_metadata(&meta))
            }
            Kind::File => {
                let meta = self
                    .files
                    .get(fd)?
                    .file
                    .metadata()
                    .map_err(|e| FsError::host_io("fstat", e))?;
                Ok(filestat::from_metadata(&meta))
            }
        }
    }

    pub fn fd_filestat_set_size(&mut self, fd: u32, size: u64) -> Result<(), FsError> {
        self.require(fd, Rights::FD_FILESTAT_SET_SIZE)?;
        self.files
            .get(fd)?
            .file
            .set_len(size)
            .map_err(|e| FsError::host_io("ftruncate", e))
    }

    /// Descriptor type, flags, and rights; needs no rights of its own
    pub fn fd_fdstat_get(&self, fd: u32) -> Result<Fdstat, FsError> {
        let (rights_base, rights_inheriting) = self.rights_of(fd)?;
        let (filetype, flags) = match self.kind(fd) {
            Kind::Stdio => (Filetype::CharacterDevice, Fdflags::empty()),
            Kind::Preopen => (Filetype::Directory, Fdflags::empty()),
            Kind::File => (Filetype::RegularFile, self.files.get(fd)?.fdflags),
        };
        Ok(Fdstat {
            filetype,
            flags,
            rights_base,
            rights_inheriting,
        })
    }

    /// Preopen description; `EBADF` past the last preopen ends the guest's
    /// preopen scan
    pub fn fd_prestat_get(&self, fd: u32) -> Result<Prestat, FsError> {
        let preopen = self
            .capabilities
            .get(fd)
            .ok_or(FsError::BadDescriptor(fd))?;
        Ok(Prestat {
            name_len: preopen.guest_path.len() as u32,
        })
    }

    /// Guest mount path of a preopen
    pub fn prestat_dir_name(&self, fd: u32) -> Result<&str, FsError> {
        self.capabilities
            .get(fd)
            .map(|p| p.guest_path.as_str())
            .ok_or(FsError::BadDescriptor(fd))
    }

    /// Close every open file, returning how many were closed
    pub fn close_all(&mut self) -> usize {
        let closed = self.files.close_all();
        if closed > 0 {
            tracing::debug!(instance = %self.instance, closed, "closed lingering files");
            self.record(audit::teardown(&self.instance, closed));
        }
        closed
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn kind(&self, fd: u32) -> Kind {
        if fd < FIRST_PREOPEN_FD {
            Kind::Stdio
        } else if self.capabilities.get(fd).is_some() {
            Kind::Preopen
        } else {
            Kind::File
        }
    }

    /// Base and inheriting rights of a live descriptor
    fn rights_of(&self, fd: u32) -> Result<(Rights, Rights), FsError> {
        match self.kind(fd) {
            Kind::Stdio if self.stdio.is_attached(fd) => {
                Ok((rights::stdio_rights(fd == 0), Rights::empty()))
            }
            Kind::Stdio => Err(FsError::BadDescriptor(fd)),
            Kind::Preopen => {
                let preopen = self.capabilities.resolve(fd)?;
                Ok((preopen.rights_base, preopen.rights_inheriting))
            }
            Kind::File => {
                let entry = self.files.get(fd)?;
                Ok((entry.rights_base, entry.rights_inheriting))
            }
        }
    }

    fn require(&self, fd: u32, required: Rights) -> Result<(), FsError> {
        let (granted, _) = self.rights_of(fd)?;
        rights::check(fd, granted, required).map_err(|e| self.audited(fd, e))
    }

    fn reject_stdio_seek(&self, fd: u32) -> Result<(), FsError> {
        if self.kind(fd) == Kind::Stdio {
            self.rights_of(fd)?;
            return Err(FsError::rejected(Errno::Spipe, "stdio streams are not seekable"));
        }
        Ok(())
    }

    fn preopen(&self, dirfd: u32, path: &str) -> Result<&Preopen, FsError> {
        self.capabilities.resolve(dirfd).map_err(|_| {
            self.audited(
                dirfd,
                FsError::capability_violation(path, "descriptor is not a preopened directory"),
            )
        })
    }

    fn resolve_path(
        &self,
        preopen: &Preopen,
        path: &str,
    ) -> Result<sandbox::ResolvedPath, FsError> {
        sandbox::resolve(preopen, path).map_err(|e| self.audited(preopen.fd, e))
    }

    /// Log and audit security violations, passing the error through
    fn audited(&self, fd: u32, err: FsError) -> FsError {
        match &err {
            FsError::CapabilityViolation { path, reason } => {
                tracing::warn!(instance = %self.instance, fd, path = %path, reason, "sandbox escape rejected");
                self.record(audit::escape_rejected(&self.instance, fd, path, reason));
            }
            FsError::RightsViolation { fd, missing } => {
                tracing::warn!(instance = %self.instance, fd, ?missing, "rights denied");
                self.record(audit::rights_denied(&self.instance, *fd, *missing));
            }
            _ => {}
        }
        err
    }

    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(event) {
            tracing::warn!(instance = %self.instance, error = %e, "failed to record audit event");
        }
    }
}

impl fmt::Debug for WasiFsCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasiFsCtx")
            .field("instance", &self.instance)
            .field("capabilities", &self.capabilities)
            .field("files", &self.files)
            .field("stdin", &self.stdio.stdin.is_some())
            .field("stdout", &self.stdio.stdout.is_some())
            .field("stderr", &self.stdio.stderr.is_some())
            .finish()
    }
}

impl Drop for WasiFsCtx {
    fn drop(&mut self) {
        self.close_all();
        if let Err(e) = self.audit.flush() {
            tracing::warn!(instance = %self.instance, error = %e, "failed to flush audit sink");
        }
    }
}

#[cfg(unix)]
fn apply_platform_flags(options: &mut OpenOptions, follow: bool, fdflags: Fdflags) {
    use std::os::unix::fs::OpenOptionsExt;

    let mut custom = 0;
    if !follow {
        custom |= libc::O_NOFOLLOW;
    }
    if fdflags.contains(Fdflags::SYNC) {
        custom |= libc::O_SYNC;
    } else if fdflags.intersects(Fdflags::DSYNC | Fdflags::RSYNC) {
        custom |= libc::O_DSYNC;
    }
    options.custom_flags(custom);
}

#[cfg(not(unix))]
fn apply_platform_flags(_options: &mut OpenOptions, _follow: bool, _fdflags: Fdflags) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, MemoryAuditSink};
    use std::sync::Mutex;

    const RW: Rights = Rights::FD_READ
        .union(Rights::FD_WRITE)
        .union(Rights::FD_SEEK)
        .union(Rights::FD_TELL)
        .union(Rights::FD_FILESTAT_GET)
        .union(Rights::FD_FILESTAT_SET_SIZE);

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn ctx(dir: &tempfile::TempDir, writable: bool) -> WasiFsCtx {
        let spec = if writable {
            PreopenSpec::writable("/sandbox", dir.path())
        } else {
            PreopenSpec::read_only("/sandbox", dir.path())
        };
        WasiFsBuilder::new().preopen(spec).build().unwrap()
    }

    fn open(ctx: &mut WasiFsCtx, path: &str, oflags: Oflags, rights: Rights) -> Result<u32, FsError> {
        ctx.path_open(
            3,
            Lookupflags::SYMLINK_FOLLOW,
            path,
            oflags,
            rights,
            Rights::empty(),
            Fdflags::empty(),
        )
    }

    fn put(backing: &mut [u8], at: usize, data: &[u8]) -> Iovec {
        backing[at..at + data.len()].copy_from_slice(data);
        Iovec {
            buf: at as u32,
            buf_len: data.len() as u32,
        }
    }

    #[test]
    fn test_first_file_fd_follows_preopens() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(&dir, true);

        let fd = open(&mut ctx, "a.txt", Oflags::CREAT, RW).unwrap();
        assert_eq!(fd, 4);
        assert_eq!(ctx.open_file_count(), 1);
        assert!(dir.path().join("a.txt").exists());
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(&dir, true);
        let mut backing = vec![0u8; 256];

        let fd = open(&mut ctx, "hello.txt", Oflags::CREAT | Oflags::TRUNC, RW).unwrap();
        let iov = put(&mut backing, 64, b"hello");
        let written = ctx
            .fd_write(fd, &GuestMemory::new(&mut backing), &[iov])
            .unwrap();
        assert_eq!(written, 5);
        assert_eq!(ctx.fd_tell(fd).unwrap(), 5);

        assert_eq!(ctx.fd_seek(fd, 0, Whence::Set).unwrap(), 0);
        let iov = Iovec { buf: 128, buf_len: 16 };
        let mut mem = GuestMemory::new(&mut backing);
        let read = ctx.fd_read(fd, &mut mem, &[iov]).unwrap();
        assert_eq!(read, 5);
        assert_eq!(mem.read_bytes(128, 5).unwrap(), b"hello");

        ctx.fd_close(fd).unwrap();
        assert_eq!(std::fs::read(dir.path().join("hello.txt")).unwrap(), b"hello");
    }

    #[test]
    fn test_read_only_preopen_denies_create_and_write() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.txt"), b"data").unwrap();
        let mut ctx = ctx(&dir, false);

        let err = open(&mut ctx, "new.txt", Oflags::CREAT, RW).unwrap_err();
        assert_eq!(err.errno(), Errno::Notcapable);
        assert!(!dir.path().join("new.txt").exists());

        // Requested write rights are narrowed away
        let fd = open(&mut ctx, "data.txt", Oflags::empty(), RW).unwrap();
        let stat = ctx.fd_fdstat_get(fd).unwrap();
        assert!(stat.rights_base.contains(Rights::FD_READ));
        assert!(!stat.rights_base.contains(Rights::FD_WRITE));

        let mut backing = vec![0u8; 64];
        let iov = put(&mut backing, 0, b"x");
        let err = ctx
            .fd_write(fd, &GuestMemory::new(&mut backing), &[iov])
            .unwrap_err();
        assert_eq!(err.errno(), Errno::Notcapable);
        assert_eq!(std::fs::read(dir.path().join("data.txt")).unwrap(), b"data");
    }

    #[test]
    fn test_escape_is_audited() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemoryAuditSink::new());
        let mut ctx = WasiFsBuilder::new()
            .preopen(PreopenSpec::writable("/sandbox", dir.path()))
            .audit(sink.clone())
            .build()
            .unwrap();

        let err = open(&mut ctx, "../escape.txt", Oflags::CREAT, RW).unwrap_err();
        assert_eq!(err.errno(), Errno::Notcapable);
        assert_eq!(
            sink.find_by_type(AuditEventType::SandboxEscapeRejected).len(),
            1
        );

        let fd = open(&mut ctx, "ok.txt", Oflags::CREAT, RW).unwrap();
        ctx.fd_close(fd).unwrap();
        assert_eq!(sink.find_by_type(AuditEventType::FileOpened).len(), 1);
        assert_eq!(sink.find_by_type(AuditEventType::FileClosed).len(), 1);
    }

    #[test]
    fn test_dirfd_must_be_preopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(&dir, true);
        let fd = open(&mut ctx, "a.txt", Oflags::CREAT, RW).unwrap();

        for dirfd in [0, fd, 99] {
            let err = ctx
                .path_open(
                    dirfd,
                    Lookupflags::empty(),
                    "b.txt",
                    Oflags::CREAT,
                    RW,
                    Rights::empty(),
                    Fdflags::empty(),
                )
                .unwrap_err();
            assert_eq!(err.errno(), Errno::Notcapable);
        }
        assert!(!dir.path().join("b.txt").exists());
    }

    #[test]
    fn test_closed_fd_is_badf() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(&dir, true);
        let fd = open(&mut ctx, "a.txt", Oflags::CREAT, RW).unwrap();
        ctx.fd_close(fd).unwrap();

        assert_eq!(ctx.fd_close(fd).unwrap_err().errno(), Errno::Badf);
        assert_eq!(ctx.fd_tell(fd).unwrap_err().errno(), Errno::Badf);
        assert_eq!(ctx.fd_filestat_get(fd).unwrap_err().errno(), Errno::Badf);
        assert_eq!(ctx.fd_fdstat_get(fd).unwrap_err().errno(), Errno::Badf);
    }

    #[test]
    fn test_directory_targets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("file"), b"").unwrap();
        let mut ctx = ctx(&dir, true);

        assert_eq!(
            open(&mut ctx, "sub", Oflags::empty(), RW).unwrap_err().errno(),
            Errno::Isdir
        );
        assert_eq!(
            open(&mut ctx, ".", Oflags::empty(), RW).unwrap_err().errno(),
            Errno::Isdir
        );
        assert_eq!(
            open(&mut ctx, "file", Oflags::DIRECTORY, RW).unwrap_err().errno(),
            Errno::Notdir
        );
    }

    #[test]
    fn test_exclusive_create() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("taken"), b"").unwrap();
        let mut ctx = ctx(&dir, true);

        let err = open(&mut ctx, "taken", Oflags::CREAT | Oflags::EXCL, RW).unwrap_err();
        assert_eq!(err.errno(), Errno::Exist);
        assert!(open(&mut ctx, "fresh", Oflags::CREAT | Oflags::EXCL, RW).is_ok());
    }

    #[test]
    fn test_append_writes_at_end() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("log"), b"one\n").unwrap();
        let mut ctx = ctx(&dir, true);
        let fd = ctx
            .path_open(
                3,
                Lookupflags::empty(),
                "log",
                Oflags::empty(),
                RW,
                Rights::empty(),
                Fdflags::APPEND,
            )
            .unwrap();

        let mut backing = vec![0u8; 64];
        let iov = put(&mut backing, 0, b"two\n");
        ctx.fd_write(fd, &GuestMemory::new(&mut backing), &[iov])
            .unwrap();
        assert_eq!(ctx.fd_tell(fd).unwrap(), 8);
        assert_eq!(std::fs::read(dir.path().join("log")).unwrap(), b"one\ntwo\n");
    }

    #[test]
    fn test_seek_rules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"0123456789").unwrap();
        let mut ctx = ctx(&dir, true);
        let fd = open(&mut ctx, "f", Oflags::empty(), RW).unwrap();

        assert_eq!(ctx.fd_seek(fd, -3, Whence::End).unwrap(), 7);
        assert_eq!(ctx.fd_seek(fd, 1, Whence::Cur).unwrap(), 8);
        assert_eq!(
            ctx.fd_seek(fd, -1, Whence::Set).unwrap_err().errno(),
            Errno::Inval
        );

        // Position query needs only FD_TELL
        let tell_only = open(&mut ctx, "f", Oflags::empty(), Rights::FD_READ | Rights::FD_TELL)
            .unwrap();
        assert_eq!(ctx.fd_seek(tell_only, 0, Whence::Cur).unwrap(), 0);
        assert_eq!(
            ctx.fd_seek(tell_only, 1, Whence::Set).unwrap_err().errno(),
            Errno::Notcapable
        );
    }

    #[test]
    fn test_positional_io_keeps_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(&dir, true);
        let fd = open(&mut ctx, "p", Oflags::CREAT, RW).unwrap();
        let mut backing = vec![0u8; 64];

        let iov = put(&mut backing, 0, b"abc");
        ctx.fd_pwrite(fd, &GuestMemory::new(&mut backing), &[iov], 4)
            .unwrap();
        assert_eq!(ctx.fd_tell(fd).unwrap(), 0);

        let iov = Iovec { buf: 32, buf_len: 3 };
        let mut mem = GuestMemory::new(&mut backing);
        assert_eq!(ctx.fd_pread(fd, &mut mem, &[iov], 4).unwrap(), 3);
        assert_eq!(mem.read_bytes(32, 3).unwrap(), b"abc");
        assert_eq!(ctx.fd_filestat_get(fd).unwrap().size, 7);
    }

    #[test]
    fn test_set_size_and_sync() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(&dir, true);
        let fd = open(
            &mut ctx,
            "s",
            Oflags::CREAT,
            RW | Rights::FD_SYNC | Rights::FD_DATASYNC,
        )
        .unwrap();

        ctx.fd_filestat_set_size(fd, 100).unwrap();
        ctx.fd_sync(fd).unwrap();
        ctx.fd_datasync(fd).unwrap();
        assert_eq!(std::fs::metadata(dir.path().join("s")).unwrap().len(), 100);
    }

    #[test]
    fn test_path_filestat_matches_host() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sized"), vec![1u8; 321]).unwrap();
        let mut ctx = ctx(&dir, false);

        let stat = ctx
            .path_filestat_get(3, Lookupflags::SYMLINK_FOLLOW, "sized")
            .unwrap();
        assert_eq!(stat.size, 321);
        assert_eq!(stat.filetype, Filetype::RegularFile);

        let err = ctx
            .path_filestat_get(3, Lookupflags::empty(), "../sized")
            .unwrap_err();
        assert_eq!(err.errno(), Errno::Notcapable);
        let err = ctx
            .path_filestat_get(3, Lookupflags::empty(), "missing")
            .unwrap_err();
        assert_eq!(err.errno(), Errno::Noent);
    }

    #[test]
    fn test_prestat_queries() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let ctx = WasiFsBuilder::new()
            .preopen(PreopenSpec::read_only("/in", a.path()))
            .preopen(PreopenSpec::writable("/output", b.path()))
            .build()
            .unwrap();

        assert_eq!(ctx.fd_prestat_get(3).unwrap().name_len, 3);
        assert_eq!(ctx.fd_prestat_get(4).unwrap().name_len, 7);
        assert_eq!(ctx.prestat_dir_name(4).unwrap(), "/output");
        assert_eq!(ctx.fd_prestat_get(5).unwrap_err().errno(), Errno::Badf);

        let stat = ctx.fd_fdstat_get(3).unwrap();
        assert_eq!(stat.filetype, Filetype::Directory);
        assert!(!stat.rights_inheriting.contains(Rights::FD_WRITE));
    }

    #[test]
    fn test_preopen_cannot_be_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(&dir, true);
        assert_eq!(ctx.fd_close(3).unwrap_err().errno(), Errno::Notsup);
        assert!(ctx.fd_prestat_get(3).is_ok());
    }

    #[test]
    fn test_stdio_streams() {
        let out = SharedBuf::default();
        let mut ctx = WasiFsBuilder::new()
            .stdin(&b"input"[..])
            .stdout(out.clone())
            .build()
            .unwrap();
        let mut backing = vec![0u8; 64];

        let iov = put(&mut backing, 0, b"to stdout");
        assert_eq!(
            ctx.fd_write(1, &GuestMemory::new(&mut backing), &[iov])
                .unwrap(),
            9
        );
        assert_eq!(out.0.lock().unwrap().as_slice(), b"to stdout");

        // stderr was never attached
        assert_eq!(
            ctx.fd_write(2, &GuestMemory::new(&mut backing), &[iov])
                .unwrap_err()
                .errno(),
            Errno::Badf
        );

        let iov = Iovec { buf: 32, buf_len: 16 };
        let mut mem = GuestMemory::new(&mut backing);
        assert_eq!(ctx.fd_read(0, &mut mem, &[iov]).unwrap(), 5);
        assert_eq!(mem.read_bytes(32, 5).unwrap(), b"input");

        assert_eq!(ctx.fd_seek(1, 0, Whence::Cur).unwrap_err().errno(), Errno::Spipe);
        assert_eq!(
            ctx.fd_fdstat_get(1).unwrap().filetype,
            Filetype::CharacterDevice
        );

        ctx.fd_close(1).unwrap();
        assert_eq!(ctx.fd_fdstat_get(1).unwrap_err().errno(), Errno::Badf);
    }

    #[test]
    fn test_drop_closes_lingering_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemoryAuditSink::new());
        {
            let mut ctx = WasiFsBuilder::new()
                .preopen(PreopenSpec::writable("/sandbox", dir.path()))
                .audit(sink.clone())
                .build()
                .unwrap();
            open(&mut ctx, "a", Oflags::CREAT, RW).unwrap();
            open(&mut ctx, "b", Oflags::CREAT, RW).unwrap();
        }
        let teardown = sink.find_by_type(AuditEventType::Teardown);
        assert_eq!(teardown.len(), 1);
    }

    #[test]
    fn test_open_file_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = WasiFsBuilder::new()
            .preopen(PreopenSpec::writable("/sandbox", dir.path()))
            .max_open_files(1)
            .build()
            .unwrap();

        open(&mut ctx, "a", Oflags::CREAT, RW).unwrap();
        let err = open(&mut ctx, "b", Oflags::CREAT, RW).unwrap_err();
        assert_eq!(err.errno(), Errno::Mfile);
    }

    #[cfg(unix)]
    #[test]
    fn test_nofollow_rejects_final_symlink() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("target"), b"t").unwrap();
        std::os::unix::fs::symlink(dir.path().join("target"), dir.path().join("link")).unwrap();
        let mut ctx = ctx(&dir, true);

        let err = ctx
            .path_open(
                3,
                Lookupflags::empty(),
                "link",
                Oflags::empty(),
                RW,
                Rights::empty(),
                Fdflags::empty(),
            )
            .unwrap_err();
        assert_eq!(err.errno(), Errno::Loop);
        assert!(open(&mut ctx, "link", Oflags::empty(), RW).is_ok());
    }
}
