// Copyright 2021 Oxide Computer Company
use std::sync::Mutex;

use crate::block_io::BlockIO;
use shadowdisk_common::ShadowError;

/// Implement BlockIO for a byte vector held in memory.
///
/// Used by tests and tooling that want a stack without touching disk.
pub struct InMemoryBlockIO {
    bytes: Mutex<Vec<u8>>,
}

impl InMemoryBlockIO {
    pub fn new(total_size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; total_size]),
        }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }
}

impl BlockIO for InMemoryBlockIO {
    fn read_at(
        &self,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, ShadowError> {
        let bytes = self.bytes.lock().unwrap();
        if buf.is_empty() || offset >= bytes.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let len = buf.len().min(bytes.len() - start);
        buf[..len].copy_from_slice(&bytes[start..start + len]);
        Ok(len)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, ShadowError> {
        let mut bytes = self.bytes.lock().unwrap();
        if buf.is_empty() || offset >= bytes.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let len = buf.len().min(bytes.len() - start);
        bytes[start..start + len].copy_from_slice(&buf[..len]);
        Ok(len)
    }

    fn size(&self) -> Result<u64, ShadowError> {
        Ok(self.bytes.lock().unwrap().len() as u64)
    }

    fn flush(&self) -> Result<(), ShadowError> {
        Ok(())
    }

    fn close(&self) -> Result<(), ShadowError> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let b = InMemoryBlockIO::new(1024);
        assert_eq!(b.size().unwrap(), 1024);

        assert_eq!(b.write_at(b"shadow", 100).unwrap(), 6);
        let mut buf = [0u8; 6];
        assert_eq!(b.read_at(&mut buf, 100).unwrap(), 6);
        assert_eq!(&buf, b"shadow");
    }

    #[test]
    fn clamps_like_a_real_device() {
        let b = InMemoryBlockIO::new(100);

        let mut buf = [0u8; 10];
        assert_eq!(b.read_at(&mut buf, 95).unwrap(), 5);
        assert_eq!(b.read_at(&mut buf, 100).unwrap(), 0);
        assert_eq!(b.write_at(&buf, 95).unwrap(), 5);
        assert_eq!(b.write_at(&buf, 200).unwrap(), 0);
    }
}
