//! capfs-host: Capability-secured WASI filesystem host
//!
//! This crate implements the filesystem subset of `wasi_snapshot_preview1`
//! for wasmtime guests. A guest can only reach the host directories it was
//! granted, only with the rights each descriptor carries.
//!
//! - [`fs`]: capability table, path sandbox, descriptor table, I/O
//! - [`loader`]: wasmtime engine, fuel, and instance lifecycle
//! - [`audit`]: pluggable sinks for security-relevant events

pub mod audit;
pub mod fs;
pub mod loader;

pub use audit::{AuditEvent, AuditEventType, AuditSink, FileAuditSink, MemoryAuditSink};
pub use fs::{add_to_linker, FsError, GuestFault, GuestMemory, SetupError, WasiFsBuilder, WasiFsCtx};
pub use loader::{GuestInstance, GuestLoader, GuestState, LoaderConfig, LoaderError};

pub use capfs_abi::{Errno, FsCapabilities, PreopenSpec, Rights, StdioCapability};
