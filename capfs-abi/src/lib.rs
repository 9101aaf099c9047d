//! capfs-abi: Shared wire types for the capfs WASI filesystem host
//!
//! This crate defines the byte-level protocol between host and guest for the
//! filesystem subset of `wasi_snapshot_preview1`. Every record is
//! little-endian and laid out exactly as the preview1 witx describes it.
//!
//! It also carries the serde-friendly capability declarations a host uses to
//! describe which directories a guest may see (see [`capabilities`]).

pub mod capabilities;

pub use capabilities::{FsCapabilities, PreopenSpec, StdioCapability};

use bitflags::bitflags;

/// Import module name used by preview1 guests
pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// First descriptor number handed out to preopened directories
pub const FIRST_PREOPEN_FD: u32 = 3;

// =============================================================================
// Errno
// =============================================================================

/// WASI preview1 error codes
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Errno {
    Success = 0,
    TooBig = 1,
    Acces = 2,
    Addrinuse = 3,
    Addrnotavail = 4,
    Afnosupport = 5,
    Again = 6,
    Already = 7,
    Badf = 8,
    Badmsg = 9,
    Busy = 10,
    Canceled = 11,
    Child = 12,
    Connaborted = 13,
    Connrefused = 14,
    Connreset = 15,
    Deadlk = 16,
    Destaddrreq = 17,
    Dom = 18,
    Dquot = 19,
    Exist = 20,
    Fault = 21,
    Fbig = 22,
    Hostunreach = 23,
    Idrm = 24,
    Ilseq = 25,
    Inprogress = 26,
    Intr = 27,
    Inval = 28,
    Io = 29,
    Isconn = 30,
    Isdir = 31,
    Loop = 32,
    Mfile = 33,
    Mlink = 34,
    Msgsize = 35,
    Multihop = 36,
    Nametoolong = 37,
    Netdown = 38,
    Netreset = 39,
    Netunreach = 40,
    Nfile = 41,
    Nobufs = 42,
    Nodev = 43,
    Noent = 44,
    Noexec = 45,
    Nolck = 46,
    Nolink = 47,
    Nomem = 48,
    Nomsg = 49,
    Noprotoopt = 50,
    Nospc = 51,
    Nosys = 52,
    Notconn = 53,
    Notdir = 54,
    Notempty = 55,
    Notrecoverable = 56,
    Notsock = 57,
    Notsup = 58,
    Notty = 59,
    Nxio = 60,
    Overflow = 61,
    Ownerdead = 62,
    Perm = 63,
    Pipe = 64,
    Proto = 65,
    Protonosupport = 66,
    Prototype = 67,
    Range = 68,
    Rofs = 69,
    Spipe = 70,
    Srch = 71,
    Stale = 72,
    Timedout = 73,
    Txtbsy = 74,
    Xdev = 75,
    /// Capabilities insufficient: sandbox escapes and missing rights
    Notcapable = 76,
}

impl Errno {
    /// Raw value as returned across the host-function boundary
    pub fn raw(self) -> i32 {
        self as u16 as i32
    }

    /// Decode a raw errno returned by a host function
    pub fn from_raw(raw: i32) -> Option<Self> {
        use Errno::*;
        const TABLE: [Errno; 77] = [
            Success, TooBig, Acces, Addrinuse, Addrnotavail, Afnosupport, Again, Already, Badf,
            Badmsg, Busy, Canceled, Child, Connaborted, Connrefused, Connreset, Deadlk,
            Destaddrreq, Dom, Dquot, Exist, Fault, Fbig, Hostunreach, Idrm, Ilseq, Inprogress,
            Intr, Inval, Io, Isconn, Isdir, Loop, Mfile, Mlink, Msgsize, Multihop, Nametoolong,
            Netdown, Netreset, Netunreach, Nfile, Nobufs, Nodev, Noent, Noexec, Nolck, Nolink,
            Nomem, Nomsg, Noprotoopt, Nospc, Nosys, Notconn, Notdir, Notempty, Notrecoverable,
            Notsock, Notsup, Notty, Nxio, Overflow, Ownerdead, Perm, Pipe, Proto, Protonosupport,
            Prototype, Range, Rofs, Spipe, Srch, Stale, Timedout, Txtbsy, Xdev, Notcapable,
        ];
        usize::try_from(raw).ok().and_then(|i| TABLE.get(i).copied())
    }

    pub fn is_success(self) -> bool {
        self == Errno::Success
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.raw())
    }
}

// =============================================================================
// Rights and flags
// =============================================================================

bitflags! {
    /// Per-descriptor rights
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Rights: u64 {
        const FD_DATASYNC = 1 << 0;
        const FD_READ = 1 << 1;
        const FD_SEEK = 1 << 2;
        const FD_FDSTAT_SET_FLAGS = 1 << 3;
        const FD_SYNC = 1 << 4;
        const FD_TELL = 1 << 5;
        const FD_WRITE = 1 << 6;
        const FD_ADVISE = 1 << 7;
        const FD_ALLOCATE = 1 << 8;
        const PATH_CREATE_DIRECTORY = 1 << 9;
        const PATH_CREATE_FILE = 1 << 10;
        const PATH_LINK_SOURCE = 1 << 11;
        const PATH_LINK_TARGET = 1 << 12;
        const PATH_OPEN = 1 << 13;
        const FD_READDIR = 1 << 14;
        const PATH_READLINK = 1 << 15;
        const PATH_RENAME_SOURCE = 1 << 16;
        const PATH_RENAME_TARGET = 1 << 17;
        const PATH_FILESTAT_GET = 1 << 18;
        const PATH_FILESTAT_SET_SIZE = 1 << 19;
        const PATH_FILESTAT_SET_TIMES = 1 << 20;
        const FD_FILESTAT_GET = 1 << 21;
        const FD_FILESTAT_SET_SIZE = 1 << 22;
        const FD_FILESTAT_SET_TIMES = 1 << 23;
        const PATH_SYMLINK = 1 << 24;
        const PATH_REMOVE_DIRECTORY = 1 << 25;
        const PATH_UNLINK_FILE = 1 << 26;
        const POLL_FD_READWRITE = 1 << 27;
        const SOCK_SHUTDOWN = 1 << 28;
        const SOCK_ACCEPT = 1 << 29;
    }
}

impl Rights {
    /// Rights that only make sense on a regular file descriptor
    pub fn file_rights() -> Self {
        Self::FD_DATASYNC
            | Self::FD_READ
            | Self::FD_SEEK
            | Self::FD_FDSTAT_SET_FLAGS
            | Self::FD_SYNC
            | Self::FD_TELL
            | Self::FD_WRITE
            | Self::FD_ADVISE
            | Self::FD_ALLOCATE
            | Self::FD_FILESTAT_GET
            | Self::FD_FILESTAT_SET_SIZE
            | Self::FD_FILESTAT_SET_TIMES
            | Self::POLL_FD_READWRITE
    }
}

bitflags! {
    /// `path_open` open flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Oflags: u16 {
        const CREAT = 1 << 0;
        const DIRECTORY = 1 << 1;
        const EXCL = 1 << 2;
        const TRUNC = 1 << 3;
    }
}

bitflags! {
    /// Descriptor flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Fdflags: u16 {
        const APPEND = 1 << 0;
        const DSYNC = 1 << 1;
        const NONBLOCK = 1 << 2;
        const RSYNC = 1 << 3;
        const SYNC = 1 << 4;
    }
}

bitflags! {
    /// Path lookup flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Lookupflags: u32 {
        const SYMLINK_FOLLOW = 1 << 0;
    }
}

// =============================================================================
// Records
// =============================================================================

/// File type stored in filestat and fdstat records
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filetype {
    Unknown = 0,
    BlockDevice = 1,
    CharacterDevice = 2,
    Directory = 3,
    RegularFile = 4,
    SocketDgram = 5,
    SocketStream = 6,
    SymbolicLink = 7,
}

impl Filetype {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::BlockDevice,
            2 => Self::CharacterDevice,
            3 => Self::Directory,
            4 => Self::RegularFile,
            5 => Self::SocketDgram,
            6 => Self::SocketStream,
            7 => Self::SymbolicLink,
            _ => Self::Unknown,
        }
    }
}

/// Seek origin for `fd_seek`
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
}

impl Whence {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Set),
            1 => Some(Self::Cur),
            2 => Some(Self::End),
            _ => None,
        }
    }
}

/// File metadata record (64 bytes)
///
/// ```text
/// offset  field     type
///      0  dev       u64
///      8  ino       u64
///     16  filetype  u8   (+7 padding)
///     24  nlink     u64
///     32  size      u64
///     40  atim      u64  (ns since epoch)
///     48  mtim      u64
///     56  ctim      u64
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filestat {
    pub dev: u64,
    pub ino: u64,
    pub filetype: Filetype,
    pub nlink: u64,
    pub size: u64,
    pub atim: u64,
    pub mtim: u64,
    pub ctim: u64,
}

impl Filestat {
    pub const SIZE: usize = 64;
    pub const SIZE_OFFSET: usize = 32;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.dev.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.ino.to_le_bytes());
        bytes[16] = self.filetype as u8;
        bytes[24..32].copy_from_slice(&self.nlink.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.size.to_le_bytes());
        bytes[40..48].copy_from_slice(&self.atim.to_le_bytes());
        bytes[48..56].copy_from_slice(&self.mtim.to_le_bytes());
        bytes[56..64].copy_from_slice(&self.ctim.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            dev: le_u64(&bytes[0..8]),
            ino: le_u64(&bytes[8..16]),
            filetype: Filetype::from_raw(bytes[16]),
            nlink: le_u64(&bytes[24..32]),
            size: le_u64(&bytes[32..40]),
            atim: le_u64(&bytes[40..48]),
            mtim: le_u64(&bytes[48..56]),
            ctim: le_u64(&bytes[56..64]),
        }
    }
}

/// Descriptor status record (24 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fdstat {
    pub filetype: Filetype,
    pub flags: Fdflags,
    pub rights_base: Rights,
    pub rights_inheriting: Rights,
}

impl Fdstat {
    pub const SIZE: usize = 24;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.filetype as u8;
        bytes[2..4].copy_from_slice(&self.flags.bits().to_le_bytes());
        bytes[8..16].copy_from_slice(&self.rights_base.bits().to_le_bytes());
        bytes[16..24].copy_from_slice(&self.rights_inheriting.bits().to_le_bytes());
        bytes
    }
}

/// Preopen description returned by `fd_prestat_get` (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prestat {
    pub name_len: u32,
}

impl Prestat {
    pub const SIZE: usize = 8;
    /// Only directories can be preopened in preview1
    pub const TAG_DIR: u8 = 0;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = Self::TAG_DIR;
        bytes[4..8].copy_from_slice(&self.name_len.to_le_bytes());
        bytes
    }
}

/// Scatter/gather buffer descriptor (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iovec {
    pub buf: u32,
    pub buf_len: u32,
}

impl Iovec {
    pub const SIZE: usize = 8;

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            buf: le_u32(&bytes[0..4]),
            buf_len: le_u32(&bytes[4..8]),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.buf.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.buf_len.to_le_bytes());
        bytes
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_values() {
        assert_eq!(Errno::Success.raw(), 0);
        assert_eq!(Errno::Badf.raw(), 8);
        assert_eq!(Errno::Noent.raw(), 44);
        assert_eq!(Errno::Notcapable.raw(), 76);
    }

    #[test]
    fn test_errno_from_raw() {
        for raw in 0..=76 {
            let errno = Errno::from_raw(raw).unwrap();
            assert_eq!(errno.raw(), raw);
        }
        assert_eq!(Errno::from_raw(77), None);
        assert_eq!(Errno::from_raw(-1), None);
    }

    #[test]
    fn test_rights_contains() {
        let granted = Rights::FD_READ | Rights::FD_SEEK;
        assert!(granted.contains(Rights::FD_READ));
        assert!(!granted.contains(Rights::FD_READ | Rights::FD_WRITE));
        assert_eq!(Rights::FD_WRITE.bits(), 0x40);
        assert_eq!(Rights::SOCK_ACCEPT.bits(), 1 << 29);
    }

    #[test]
    fn test_oflags_bits() {
        assert_eq!(Oflags::CREAT.bits(), 0x0001);
        assert_eq!(Oflags::TRUNC.bits(), 0x0008);
        let flags = Oflags::from_bits_truncate(0x0009);
        assert!(flags.contains(Oflags::CREAT | Oflags::TRUNC));
    }

    #[test]
    fn test_filestat_layout() {
        let stat = Filestat {
            dev: 1,
            ino: 2,
            filetype: Filetype::RegularFile,
            nlink: 3,
            size: 0x0102_0304_0506_0708,
            atim: 5,
            mtim: 6,
            ctim: 7,
        };
        let bytes = stat.to_bytes();
        assert_eq!(bytes[16], 4);
        assert_eq!(
            &bytes[Filestat::SIZE_OFFSET..Filestat::SIZE_OFFSET + 8],
            &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(Filestat::from_bytes(&bytes), stat);
    }

    #[test]
    fn test_fdstat_layout() {
        let stat = Fdstat {
            filetype: Filetype::RegularFile,
            flags: Fdflags::APPEND,
            rights_base: Rights::FD_READ,
            rights_inheriting: Rights::empty(),
        };
        let bytes = stat.to_bytes();
        assert_eq!(bytes[0], 4);
        assert_eq!(&bytes[2..4], &[1, 0]);
        assert_eq!(bytes[8], 0x02);
        assert!(bytes[16..24].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_prestat_layout() {
        let bytes = Prestat { name_len: 8 }.to_bytes();
        assert_eq!(bytes, [0, 0, 0, 0, 8, 0, 0, 0]);
    }

    #[test]
    fn test_iovec_decode() {
        let bytes = [0x10, 0, 0, 0, 0x05, 0, 0, 0];
        let iov = Iovec::from_bytes(&bytes);
        assert_eq!(iov, Iovec { buf: 16, buf_len: 5 });
        assert_eq!(iov.to_bytes(), bytes);
    }
}
