//! Bounds-checked view of guest linear memory
//!
//! Host functions never index guest memory directly. Every access goes
//! through [`GuestMemory`], which validates `ptr + len <= size` with checked
//! arithmetic and reports a [`GuestFault`] otherwise.

use super::error::GuestFault;
use capfs_abi::Iovec;
use std::ops::Range;

/// Borrowed guest linear memory
#[derive(Debug)]
pub struct GuestMemory<'a> {
    bytes: &'a mut [u8],
}

impl<'a> GuestMemory<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    /// Current memory size in bytes
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    fn range(&self, ptr: u32, len: u64) -> Result<Range<usize>, GuestFault> {
        let fault = || GuestFault::OutOfBounds {
            ptr,
            len,
            size: self.bytes.len(),
        };
        let start = ptr as usize;
        let len = usize::try_from(len).map_err(|_| fault())?;
        let end = start.checked_add(len).ok_or_else(fault)?;
        if end > self.bytes.len() {
            return Err(fault());
        }
        Ok(start..end)
    }

    /// Verify a region without touching it
    pub fn check(&self, ptr: u32, len: u32) -> Result<(), GuestFault> {
        self.range(ptr, u64::from(len)).map(|_| ())
    }

    pub fn read_bytes(&self, ptr: u32, len: u32) -> Result<&[u8], GuestFault> {
        let range = self.range(ptr, u64::from(len))?;
        Ok(&self.bytes[range])
    }

    pub fn slice_mut(&mut self, ptr: u32, len: u32) -> Result<&mut [u8], GuestFault> {
        let range = self.range(ptr, u64::from(len))?;
        Ok(&mut self.bytes[range])
    }

    pub fn write_bytes(&mut self, ptr: u32, data: &[u8]) -> Result<(), GuestFault> {
        let range = self.range(ptr, data.len() as u64)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u32(&self, ptr: u32) -> Result<u32, GuestFault> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.read_bytes(ptr, 4)?);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&mut self, ptr: u32, value: u32) -> Result<(), GuestFault> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, ptr: u32, value: u64) -> Result<(), GuestFault> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    /// Decode an iovec array and validate every buffer it names
    ///
    /// All buffers are checked before any is used, so a bad entry late in
    /// the list faults before earlier entries cause host I/O.
    pub fn read_iovecs(&self, ptr: u32, count: u32) -> Result<Vec<Iovec>, GuestFault> {
        let table = self.range(ptr, u64::from(count) * Iovec::SIZE as u64)?;
        let iovs: Vec<Iovec> = self.bytes[table]
            .chunks_exact(Iovec::SIZE)
            .map(|chunk| {
                let mut raw = [0u8; Iovec::SIZE];
                raw.copy_from_slice(chunk);
                Iovec::from_bytes(&raw)
            })
            .collect();

        for iov in &iovs {
            self.check(iov.buf, iov.buf_len)?;
        }
        Ok(iovs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        let mut backing = vec![0u8; 16];
        let mut mem = GuestMemory::new(&mut backing);

        assert!(mem.check(0, 16).is_ok());
        assert!(mem.check(16, 0).is_ok());
        assert!(mem.check(8, 9).is_err());
        assert!(mem.check(u32::MAX, 2).is_err());
        assert!(mem.write_u64(12, 1).is_err());
        assert!(mem.write_u32(12, 7).is_ok());
        assert_eq!(mem.read_u32(12).unwrap(), 7);
    }

    #[test]
    fn test_read_iovecs_validates_buffers() {
        let mut backing = vec![0u8; 64];
        backing[0..8].copy_from_slice(&Iovec { buf: 32, buf_len: 8 }.to_bytes());
        backing[8..16].copy_from_slice(&Iovec { buf: 60, buf_len: 8 }.to_bytes());
        let mem = GuestMemory::new(&mut backing);

        let iovs = mem.read_iovecs(0, 1).unwrap();
        assert_eq!(iovs, vec![Iovec { buf: 32, buf_len: 8 }]);

        // Second buffer runs past the end of memory
        assert!(matches!(
            mem.read_iovecs(0, 2),
            Err(GuestFault::OutOfBounds { ptr: 60, .. })
        ));

        // Table itself out of bounds
        assert!(mem.read_iovecs(60, 1).is_err());
    }
}
