//! Capability-secured preview1 filesystem
//!
//! A guest sees only the directories it was granted. Every path it names is
//! resolved relative to one of those directories and must stay inside it;
//! every descriptor carries a rights mask checked before the host is touched.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Guest import call                                │
//! │            path_open / fd_read / fd_write / fd_close / ...              │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  linker + preview1                                                      │
//! │  - borrow linear memory as GuestMemory (bounds-checked)                 │
//! │  - decode flags, paths, iovecs; validate output pointers                │
//! │  - GuestFault -> trap, FsError -> errno                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  WasiFsCtx (one per instance)                                           │
//! │                                                                         │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐      │
//! │  │ CapabilityTable  │  │     FdTable      │  │      rights      │      │
//! │  │ fd 3.. -> roots  │  │ fd -> FileEntry  │  │ granted ⊇ needed │      │
//! │  └──────────────────┘  └──────────────────┘  └──────────────────┘      │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐      │
//! │  │     sandbox      │  │        io        │  │ errno / filestat │      │
//! │  │ path stack walk  │  │ chunked scatter/ │  │ host -> preview1 │      │
//! │  │ + symlink check  │  │ gather transfers │  │                  │      │
//! │  └──────────────────┘  └──────────────────┘  └──────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Security Model
//!
//! | Check | Failure |
//! |-------|---------|
//! | `dirfd` is a preopen | `ENOTCAPABLE` |
//! | Path is relative and never ascends above its root | `ENOTCAPABLE` |
//! | Symlinks along the path stay inside the root | `ENOTCAPABLE` |
//! | Descriptor holds the required rights | `ENOTCAPABLE` |
//! | Descriptor is open | `EBADF` |
//! | Guest pointers lie inside linear memory | trap |
//!
//! Violations never reach a host syscall, so they cannot surface as a host
//! `ENOENT` or `EACCES`.
//!
//! # Module Structure
//!
//! - [`context`]: builder and per-instance state with typed operations
//! - [`preview1`]: raw ABI decoding over guest memory
//! - [`linker`]: wasmtime registration
//! - [`sandbox`]: path resolution
//! - [`capability`], [`fd_table`], [`rights`]: descriptor bookkeeping
//! - [`io`], [`filestat`], [`errno`]: host transfers and record encoding
//! - [`memory`]: bounds-checked guest memory view
//! - [`error`]: error types

pub mod capability;
pub mod context;
pub mod errno;
pub mod error;
pub mod fd_table;
pub mod filestat;
pub mod io;
pub mod linker;
pub mod memory;
pub mod preview1;
pub mod rights;
pub mod sandbox;

pub use capability::{CapabilityTable, Preopen};
pub use context::{WasiFsBuilder, WasiFsCtx};
pub use error::{FsError, GuestFault, SetupError};
pub use fd_table::{FdTable, FileEntry};
pub use linker::add_to_linker;
pub use memory::GuestMemory;
pub use sandbox::ResolvedPath;
