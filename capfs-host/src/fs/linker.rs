//! wasmtime glue for the preview1 filesystem imports
//!
//! Registers every filesystem function under `wasi_snapshot_preview1`.
//! Errnos are returned to the guest as `i32`; a [`GuestFault`] becomes an
//! `anyhow` error, which wasmtime raises as a trap.

use super::context::WasiFsCtx;
use super::error::GuestFault;
use super::memory::GuestMemory;
use super::preview1;
use capfs_abi::WASI_MODULE;
use wasmtime::{Caller, Extern, Linker};

/// Projection from store data to the filesystem context
pub type CtxAccessor<T> = fn(&mut T) -> &mut WasiFsCtx;

/// Run `f` with the caller's linear memory and filesystem context
fn with_memory<T, R>(
    caller: &mut Caller<'_, T>,
    get: CtxAccessor<T>,
    f: impl FnOnce(&mut WasiFsCtx, &mut GuestMemory<'_>) -> Result<R, GuestFault>,
) -> anyhow::Result<R> {
    let memory = match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => memory,
        _ => return Err(GuestFault::MissingMemory.into()),
    };
    let (bytes, state) = memory.data_and_store_mut(&mut *caller);
    let mut view = GuestMemory::new(bytes);
    Ok(f(get(state), &mut view)?)
}

/// Add the filesystem imports to `linker`
///
/// # Example
///
/// ```rust,no_run
/// use capfs_host::{add_to_linker, WasiFsCtx};
/// use wasmtime::{Engine, Linker};
///
/// struct State {
///     fs: WasiFsCtx,
/// }
///
/// let engine = Engine::default();
/// let mut linker: Linker<State> = Linker::new(&engine);
/// add_to_linker(&mut linker, |state: &mut State| &mut state.fs)?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn add_to_linker<T: 'static>(linker: &mut Linker<T>, get: CtxAccessor<T>) -> anyhow::Result<()> {
    linker.func_wrap(
        WASI_MODULE,
        "path_open",
        move |mut caller: Caller<'_, T>,
              dirfd: i32,
              dirflags: i32,
              path_ptr: i32,
              path_len: i32,
              oflags: i32,
              rights_base: i64,
              rights_inheriting: i64,
              fdflags: i32,
              result_fd_ptr: i32|
              -> anyhow::Result<i32> {
            with_memory(&mut caller, get, |ctx, mem| {
                preview1::path_open(
                    ctx,
                    mem,
                    dirfd,
                    dirflags,
                    path_ptr,
                    path_len,
                    oflags,
                    rights_base,
                    rights_inheriting,
                    fdflags,
                    result_fd_ptr,
                )
            })
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "path_filestat_get",
        move |mut caller: Caller<'_, T>,
              fd: i32,
              flags: i32,
              path_ptr: i32,
              path_len: i32,
              buf_ptr: i32|
              -> anyhow::Result<i32> {
            with_memory(&mut caller, get, |ctx, mem| {
                preview1::path_filestat_get(ctx, mem, fd, flags, path_ptr, path_len, buf_ptr)
            })
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_read",
        move |mut caller: Caller<'_, T>, fd: i32, iovs: i32, iovs_len: i32, nread: i32| {
            with_memory(&mut caller, get, |ctx, mem| {
                preview1::fd_read(ctx, mem, fd, iovs, iovs_len, nread)
            })
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_write",
        move |mut caller: Caller<'_, T>, fd: i32, iovs: i32, iovs_len: i32, nwritten: i32| {
            with_memory(&mut caller, get, |ctx, mem| {
                preview1::fd_write(ctx, mem, fd, iovs, iovs_len, nwritten)
            })
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_pread",
        move |mut caller: Caller<'_, T>,
              fd: i32,
              iovs: i32,
              iovs_len: i32,
              offset: i64,
              nread: i32| {
            with_memory(&mut caller, get, |ctx, mem| {
                preview1::fd_pread(ctx, mem, fd, iovs, iovs_len, offset, nread)
            })
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_pwrite",
        move |mut caller: Caller<'_, T>,
              fd: i32,
              iovs: i32,
              iovs_len: i32,
              offset: i64,
              nwritten: i32| {
            with_memory(&mut caller, get, |ctx, mem| {
                preview1::fd_pwrite(ctx, mem, fd, iovs, iovs_len, offset, nwritten)
            })
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_seek",
        move |mut caller: Caller<'_, T>, fd: i32, offset: i64, whence: i32, newoffset: i32| {
            with_memory(&mut caller, get, |ctx, mem| {
                preview1::fd_seek(ctx, mem, fd, offset, whence, newoffset)
            })
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_tell",
        move |mut caller: Caller<'_, T>, fd: i32, offset: i32| {
            with_memory(&mut caller, get, |ctx, mem| {
                preview1::fd_tell(ctx, mem, fd, offset)
            })
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_filestat_get",
        move |mut caller: Caller<'_, T>, fd: i32, buf: i32| {
            with_memory(&mut caller, get, |ctx, mem| {
                preview1::fd_filestat_get(ctx, mem, fd, buf)
            })
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_fdstat_get",
        move |mut caller: Caller<'_, T>, fd: i32, buf: i32| {
            with_memory(&mut caller, get, |ctx, mem| {
                preview1::fd_fdstat_get(ctx, mem, fd, buf)
            })
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_prestat_get",
        move |mut caller: Caller<'_, T>, fd: i32, buf: i32| {
            with_memory(&mut caller, get, |ctx, mem| {
                preview1::fd_prestat_get(ctx, mem, fd, buf)
            })
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_prestat_dir_name",
        move |mut caller: Caller<'_, T>, fd: i32, path: i32, path_len: i32| {
            with_memory(&mut caller, get, |ctx, mem| {
                preview1::fd_prestat_dir_name(ctx, mem, fd, path, path_len)
            })
        },
    )?;

    // Descriptor-only calls never touch linear memory
    linker.func_wrap(
        WASI_MODULE,
        "fd_close",
        move |mut caller: Caller<'_, T>, fd: i32| -> anyhow::Result<i32> {
            Ok(preview1::fd_close(get(caller.data_mut()), fd)?)
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_sync",
        move |mut caller: Caller<'_, T>, fd: i32| -> anyhow::Result<i32> {
            Ok(preview1::fd_sync(get(caller.data_mut()), fd)?)
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_datasync",
        move |mut caller: Caller<'_, T>, fd: i32| -> anyhow::Result<i32> {
            Ok(preview1::fd_datasync(get(caller.data_mut()), fd)?)
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_filestat_set_size",
        move |mut caller: Caller<'_, T>, fd: i32, size: i64| -> anyhow::Result<i32> {
            Ok(preview1::fd_filestat_set_size(get(caller.data_mut()), fd, size)?)
        },
    )?;

    tracing::debug!(module = WASI_MODULE, "registered filesystem imports");
    Ok(())
}
