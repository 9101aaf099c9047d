//! Host error to WASI errno mapping

use capfs_abi::Errno;
use std::io;

/// Translate a host I/O error into the nearest WASI errno
///
/// The raw OS code is preferred when available; otherwise the portable
/// [`io::ErrorKind`] decides.
pub fn from_io_error(err: &io::Error) -> Errno {
    #[cfg(unix)]
    if let Some(errno) = err.raw_os_error().and_then(from_raw_os_error) {
        return errno;
    }
    from_error_kind(err.kind())
}

#[cfg(unix)]
fn from_raw_os_error(code: i32) -> Option<Errno> {
    let errno = match code {
        libc::EPERM => Errno::Perm,
        libc::ENOENT => Errno::Noent,
        libc::ESRCH => Errno::Srch,
        libc::EINTR => Errno::Intr,
        libc::EIO => Errno::Io,
        libc::ENXIO => Errno::Nxio,
        libc::E2BIG => Errno::TooBig,
        libc::ENOEXEC => Errno::Noexec,
        libc::EBADF => Errno::Badf,
        libc::ECHILD => Errno::Child,
        libc::EAGAIN => Errno::Again,
        libc::ENOMEM => Errno::Nomem,
        libc::EACCES => Errno::Acces,
        libc::EFAULT => Errno::Fault,
        libc::EBUSY => Errno::Busy,
        libc::EEXIST => Errno::Exist,
        libc::EXDEV => Errno::Xdev,
        libc::ENODEV => Errno::Nodev,
        libc::ENOTDIR => Errno::Notdir,
        libc::EISDIR => Errno::Isdir,
        libc::EINVAL => Errno::Inval,
        libc::ENFILE => Errno::Nfile,
        libc::EMFILE => Errno::Mfile,
        libc::ENOTTY => Errno::Notty,
        libc::ETXTBSY => Errno::Txtbsy,
        libc::EFBIG => Errno::Fbig,
        libc::ENOSPC => Errno::Nospc,
        libc::ESPIPE => Errno::Spipe,
        libc::EROFS => Errno::Rofs,
        libc::EMLINK => Errno::Mlink,
        libc::EPIPE => Errno::Pipe,
        libc::EDOM => Errno::Dom,
        libc::ERANGE => Errno::Range,
        libc::EDEADLK => Errno::Deadlk,
        libc::ENAMETOOLONG => Errno::Nametoolong,
        libc::ENOLCK => Errno::Nolck,
        libc::ENOSYS => Errno::Nosys,
        libc::ENOTEMPTY => Errno::Notempty,
        libc::ELOOP => Errno::Loop,
        libc::EILSEQ => Errno::Ilseq,
        libc::EOVERFLOW => Errno::Overflow,
        libc::ENOTSUP => Errno::Notsup,
        libc::EDQUOT => Errno::Dquot,
        libc::ESTALE => Errno::Stale,
        libc::ETIMEDOUT => Errno::Timedout,
        libc::ECANCELED => Errno::Canceled,
        _ => return None,
    };
    Some(errno)
}

fn from_error_kind(kind: io::ErrorKind) -> Errno {
    match kind {
        io::ErrorKind::NotFound => Errno::Noent,
        io::ErrorKind::PermissionDenied => Errno::Acces,
        io::ErrorKind::AlreadyExists => Errno::Exist,
        io::ErrorKind::WouldBlock => Errno::Again,
        io::ErrorKind::InvalidInput => Errno::Inval,
        io::ErrorKind::InvalidData => Errno::Ilseq,
        io::ErrorKind::TimedOut => Errno::Timedout,
        io::ErrorKind::Interrupted => Errno::Intr,
        io::ErrorKind::Unsupported => Errno::Notsup,
        io::ErrorKind::OutOfMemory => Errno::Nomem,
        io::ErrorKind::BrokenPipe => Errno::Pipe,
        _ => Errno::Io,
    }
}
