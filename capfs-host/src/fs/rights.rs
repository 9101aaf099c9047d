//! Rights enforcement
//!
//! | Preopen | Base rights | Inherited by opened files |
//! |---------|-------------|---------------------------|
//! | read-only | `PATH_OPEN`, `PATH_FILESTAT_GET`, `FD_READDIR`, `FD_FILESTAT_GET` | read, seek, tell, advise, stat |
//! | writable | + `PATH_CREATE_FILE`, `PATH_FILESTAT_SET_SIZE` | + write, sync, datasync, allocate, set size |

use super::error::FsError;
use capfs_abi::Rights;

/// Fail with `ENOTCAPABLE` unless `granted` holds every bit of `required`
pub fn check(fd: u32, granted: Rights, required: Rights) -> Result<(), FsError> {
    if granted.contains(required) {
        return Ok(());
    }
    let missing = required.difference(granted);
    tracing::debug!(fd, ?missing, "rights check failed");
    Err(FsError::RightsViolation { fd, missing })
}

/// Base and inheriting rights for a preopened directory
pub fn preopen_rights(writable: bool) -> (Rights, Rights) {
    let mut base = Rights::PATH_OPEN
        | Rights::PATH_FILESTAT_GET
        | Rights::FD_READDIR
        | Rights::FD_FILESTAT_GET;
    let mut inheriting = Rights::FD_READ
        | Rights::FD_SEEK
        | Rights::FD_TELL
        | Rights::FD_ADVISE
        | Rights::FD_FDSTAT_SET_FLAGS
        | Rights::FD_FILESTAT_GET;

    if writable {
        base |= Rights::PATH_CREATE_FILE | Rights::PATH_FILESTAT_SET_SIZE;
        inheriting |= Rights::FD_WRITE
            | Rights::FD_SYNC
            | Rights::FD_DATASYNC
            | Rights::FD_ALLOCATE
            | Rights::FD_FILESTAT_SET_SIZE;
    }
    (base, inheriting)
}

/// Rights attached to an inherited stdio stream
pub fn stdio_rights(readable: bool) -> Rights {
    let io = if readable {
        Rights::FD_READ
    } else {
        Rights::FD_WRITE
    };
    io | Rights::FD_FILESTAT_GET | Rights::POLL_FD_READWRITE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_reports_missing_bits() {
        let granted = Rights::FD_READ | Rights::FD_SEEK;
        assert!(check(4, granted, Rights::FD_READ).is_ok());
        assert!(check(4, granted, Rights::empty()).is_ok());

        match check(4, granted, Rights::FD_READ | Rights::FD_WRITE) {
            Err(FsError::RightsViolation { fd, missing }) => {
                assert_eq!(fd, 4);
                assert_eq!(missing, Rights::FD_WRITE);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_read_only_preopen_cannot_grant_write() {
        let (base, inheriting) = preopen_rights(false);
        assert!(base.contains(Rights::PATH_OPEN));
        assert!(!base.contains(Rights::PATH_CREATE_FILE));
        assert!(!inheriting.contains(Rights::FD_WRITE));

        let (base, inheriting) = preopen_rights(true);
        assert!(base.contains(Rights::PATH_CREATE_FILE | Rights::PATH_FILESTAT_SET_SIZE));
        assert!(inheriting.contains(Rights::FD_WRITE | Rights::FD_READ));
    }
}
