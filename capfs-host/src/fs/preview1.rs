//! `wasi_snapshot_preview1` ABI layer
//!
//! Each function takes the raw integer arguments a guest passes, decodes
//! them against guest memory, runs the typed operation on [`WasiFsCtx`] and
//! writes results back. The outcome is either an errno for the guest or a
//! [`GuestFault`], which the caller must turn into a trap.
//!
//! Output pointers are validated before the operation runs, so a bad
//! pointer never leaves behind an opened file or a half-finished write.

use super::context::WasiFsCtx;
use super::error::{FsError, GuestFault};
use super::filestat::write_filestat;
use super::memory::GuestMemory;
use capfs_abi::{
    Errno, Fdflags, Fdstat, Filestat, Lookupflags, Oflags, Prestat, Rights, Whence,
};

/// Outcome of one host call
pub type AbiResult = Result<i32, GuestFault>;

fn finish(op: &'static str, result: Result<(), FsError>) -> AbiResult {
    match result {
        Ok(()) => Ok(Errno::Success.raw()),
        Err(FsError::Fault(fault)) => {
            tracing::warn!(op, error = %fault, "guest memory fault");
            Err(fault)
        }
        Err(e) => {
            let errno = e.errno();
            tracing::trace!(op, %errno, error = %e, "host call failed");
            Ok(errno.raw())
        }
    }
}

fn read_path(memory: &GuestMemory<'_>, ptr: i32, len: i32) -> Result<String, FsError> {
    let bytes = memory.read_bytes(ptr as u32, len as u32)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| FsError::rejected(Errno::Ilseq, "path is not valid UTF-8"))
}

fn lookupflags(raw: i32) -> Result<Lookupflags, FsError> {
    Lookupflags::from_bits(raw as u32)
        .ok_or_else(|| FsError::rejected(Errno::Inval, "unknown lookup flags"))
}

#[allow(clippy::too_many_arguments)]
pub fn path_open(
    ctx: &mut WasiFsCtx,
    memory: &mut GuestMemory<'_>,
    dirfd: i32,
    dirflags: i32,
    path_ptr: i32,
    path_len: i32,
    oflags: i32,
    rights_base: i64,
    rights_inheriting: i64,
    fdflags: i32,
    result_fd_ptr: i32,
) -> AbiResult {
    let result = (|| -> Result<(), FsError> {
        memory.check(result_fd_ptr as u32, 4)?;
        let lookup = lookupflags(dirflags)?;
        let oflags = u16::try_from(oflags)
            .ok()
            .and_then(Oflags::from_bits)
            .ok_or_else(|| FsError::rejected(Errno::Inval, "unknown open flags"))?;
        let fdflags = u16::try_from(fdflags)
            .ok()
            .and_then(Fdflags::from_bits)
            .ok_or_else(|| FsError::rejected(Errno::Inval, "unknown descriptor flags"))?;
        let path = read_path(memory, path_ptr, path_len)?;

        let fd = ctx.path_open(
            dirfd as u32,
            lookup,
            &path,
            oflags,
            Rights::from_bits_truncate(rights_base as u64),
            Rights::from_bits_truncate(rights_inheriting as u64),
            fdflags,
        )?;
        memory.write_u32(result_fd_ptr as u32, fd)?;
        Ok(())
    })();
    finish("path_open", result)
}

pub fn path_filestat_get(
    ctx: &mut WasiFsCtx,
    memory: &mut GuestMemory<'_>,
    fd: i32,
    flags: i32,
    path_ptr: i32,
    path_len: i32,
    buf_ptr: i32,
) -> AbiResult {
    let result = (|| -> Result<(), FsError> {
        memory.check(buf_ptr as u32, Filestat::SIZE as u32)?;
        let lookup = lookupflags(flags)?;
        let path = read_path(memory, path_ptr, path_len)?;
        let stat = ctx.path_filestat_get(fd as u32, lookup, &path)?;
        write_filestat(memory, buf_ptr as u32, &stat)?;
        Ok(())
    })();
    finish("path_filestat_get", result)
}

pub fn fd_read(
    ctx: &mut WasiFsCtx,
    memory: &mut GuestMemory<'_>,
    fd: i32,
    iovs_ptr: i32,
    iovs_len: i32,
    nread_ptr: i32,
) -> AbiResult {
    let result = (|| -> Result<(), FsError> {
        memory.check(nread_ptr as u32, 4)?;
        let iovs = memory.read_iovecs(iovs_ptr as u32, iovs_len as u32)?;
        let nread = ctx.fd_read(fd as u32, memory, &iovs)?;
        memory.write_u32(nread_ptr as u32, nread)?;
        Ok(())
    })();
    finish("fd_read", result)
}

pub fn fd_write(
    ctx: &mut WasiFsCtx,
    memory: &mut GuestMemory<'_>,
    fd: i32,
    iovs_ptr: i32,
    iovs_len: i32,
    nwritten_ptr: i32,
) -> AbiResult {
    let result = (|| -> Result<(), FsError> {
        memory.check(nwritten_ptr as u32, 4)?;
        let iovs = memory.read_iovecs(iovs_ptr as u32, iovs_len as u32)?;
        let nwritten = ctx.fd_write(fd as u32, memory, &iovs)?;
        memory.write_u32(nwritten_ptr as u32, nwritten)?;
        Ok(())
    })();
    finish("fd_write", result)
}

pub fn fd_pread(
    ctx: &mut WasiFsCtx,
    memory: &mut GuestMemory<'_>,
    fd: i32,
    iovs_ptr: i32,
    iovs_len: i32,
    offset: i64,
    nread_ptr: i32,
) -> AbiResult {
    let result = (|| -> Result<(), FsError> {
        memory.check(nread_ptr as u32, 4)?;
        let iovs = memory.read_iovecs(iovs_ptr as u32, iovs_len as u32)?;
        let nread = ctx.fd_pread(fd as u32, memory, &iovs, offset as u64)?;
        memory.write_u32(nread_ptr as u32, nread)?;
        Ok(())
    })();
    finish("fd_pread", result)
}

pub fn fd_pwrite(
    ctx: &mut WasiFsCtx,
    memory: &mut GuestMemory<'_>,
    fd: i32,
    iovs_ptr: i32,
    iovs_len: i32,
    offset: i64,
    nwritten_ptr: i32,
) -> AbiResult {
    let result = (|| -> Result<(), FsError> {
        memory.check(nwritten_ptr as u32, 4)?;
        let iovs = memory.read_iovecs(iovs_ptr as u32, iovs_len as u32)?;
        let nwritten = ctx.fd_pwrite(fd as u32, memory, &iovs, offset as u64)?;
        memory.write_u32(nwritten_ptr as u32, nwritten)?;
        Ok(())
    })();
    finish("fd_pwrite", result)
}

pub fn fd_seek(
    ctx: &mut WasiFsCtx,
    memory: &mut GuestMemory<'_>,
    fd: i32,
    offset: i64,
    whence: i32,
    newoffset_ptr: i32,
) -> AbiResult {
    let result = (|| -> Result<(), FsError> {
        memory.check(newoffset_ptr as u32, 8)?;
        let whence = Whence::from_raw(whence)
            .ok_or_else(|| FsError::rejected(Errno::Inval, "unknown whence"))?;
        let position = ctx.fd_seek(fd as u32, offset, whence)?;
        memory.write_u64(newoffset_ptr as u32, position)?;
        Ok(())
    })();
    finish("fd_seek", result)
}

pub fn fd_tell(
    ctx: &mut WasiFsCtx,
    memory: &mut GuestMemory<'_>,
    fd: i32,
    offset_ptr: i32,
) -> AbiResult {
    let result = (|| -> Result<(), FsError> {
        memory.check(offset_ptr as u32, 8)?;
        let position = ctx.fd_tell(fd as u32)?;
        memory.write_u64(offset_ptr as u32, position)?;
        Ok(())
    })();
    finish("fd_tell", result)
}

pub fn fd_close(ctx: &mut WasiFsCtx, fd: i32) -> AbiResult {
    finish("fd_close", ctx.fd_close(fd as u32))
}

pub fn fd_sync(ctx: &mut WasiFsCtx, fd: i32) -> AbiResult {
    finish("fd_sync", ctx.fd_sync(fd as u32))
}

pub fn fd_datasync(ctx: &mut WasiFsCtx, fd: i32) -> AbiResult {
    finish("fd_datasync", ctx.fd_datasync(fd as u32))
}

pub fn fd_filestat_get(
    ctx: &mut WasiFsCtx,
    memory: &mut GuestMemory<'_>,
    fd: i32,
    buf_ptr: i32,
) -> AbiResult {
    let result = (|| -> Result<(), FsError> {
        memory.check(buf_ptr as u32, Filestat::SIZE as u32)?;
        let stat = ctx.fd_filestat_get(fd as u32)?;
        write_filestat(memory, buf_ptr as u32, &stat)?;
        Ok(())
    })();
    finish("fd_filestat_get", result)
}

pub fn fd_filestat_set_size(ctx: &mut WasiFsCtx, fd: i32, size: i64) -> AbiResult {
    let result = u64::try_from(size)
        .map_err(|_| FsError::rejected(Errno::Inval, "negative file size"))
        .and_then(|size| ctx.fd_filestat_set_size(fd as u32, size));
    finish("fd_filestat_set_size", result)
}

pub fn fd_fdstat_get(
    ctx: &mut WasiFsCtx,
    memory: &mut GuestMemory<'_>,
    fd: i32,
    buf_ptr: i32,
) -> AbiResult {
    let result = (|| -> Result<(), FsError> {
        memory.check(buf_ptr as u32, Fdstat::SIZE as u32)?;
        let stat = ctx.fd_fdstat_get(fd as u32)?;
        memory.write_bytes(buf_ptr as u32, &stat.to_bytes())?;
        Ok(())
    })();
    finish("fd_fdstat_get", result)
}

pub fn fd_prestat_get(
    ctx: &mut WasiFsCtx,
    memory: &mut GuestMemory<'_>,
    fd: i32,
    buf_ptr: i32,
) -> AbiResult {
    let result = (|| -> Result<(), FsError> {
        memory.check(buf_ptr as u32, Prestat::SIZE as u32)?;
        let prestat = ctx.fd_prestat_get(fd as u32)?;
        memory.write_bytes(buf_ptr as u32, &prestat.to_bytes())?;
        Ok(())
    })();
    finish("fd_prestat_get", result)
}

pub fn fd_prestat_dir_name(
    ctx: &mut WasiFsCtx,
    memory: &mut GuestMemory<'_>,
    fd: i32,
    path_ptr: i32,
    path_len: i32,
) -> AbiResult {
    let result = (|| -> Result<(), FsError> {
        let name = ctx.prestat_dir_name(fd as u32)?;
        if (path_len as u32 as usize) < name.len() {
            return Err(FsError::rejected(Errno::Nametoolong, "buffer too small for mount path"));
        }
        memory.write_bytes(path_ptr as u32, name.as_bytes())?;
        Ok(())
    })();
    finish("fd_prestat_dir_name", result)
}
