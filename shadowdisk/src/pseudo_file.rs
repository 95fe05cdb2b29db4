// Copyright 2023 Oxide Computer Company
use std::io::Result as IOResult;
use std::io::{Error, ErrorKind, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::block_io::BlockIO;
use shadowdisk_common::ShadowError;

/*
 * The NBD transmission loop drives a Read + Write + Seek object; this
 * adapter turns those stream calls into positioned calls on the head of
 * the storage stack.  Each client connection gets its own PseudoFile
 * (and so its own offset) over the shared stack.
 */
pub struct PseudoFile {
    backend: Arc<dyn BlockIO>,
    size: u64,
    offset: u64,
}

impl PseudoFile {
    pub fn new(backend: Arc<dyn BlockIO>) -> Result<Self, ShadowError> {
        let size = backend.size()?;
        Ok(Self {
            backend,
            size,
            offset: 0,
        })
    }

    /// Export size advertised to clients during the NBD handshake.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for PseudoFile {
    fn read(&mut self, buf: &mut [u8]) -> IOResult<usize> {
        let n = self.backend.read_at(buf, self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl Write for PseudoFile {
    fn write(&mut self, buf: &[u8]) -> IOResult<usize> {
        let n = self.backend.write_at(buf, self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> IOResult<()> {
        self.backend.flush()?;
        Ok(())
    }
}

impl Seek for PseudoFile {
    fn seek(&mut self, pos: SeekFrom) -> IOResult<u64> {
        let offset: i64 = match pos {
            SeekFrom::Start(v) => v as i64,
            SeekFrom::Current(v) => self.offset as i64 + v,
            SeekFrom::End(v) => self.size as i64 + v,
        };

        if offset < 0 {
            Err(Error::new(
                ErrorKind::InvalidInput,
                "cannot seek to a negative offset",
            ))
        } else {
            self.offset = offset as u64;
            Ok(self.offset)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::in_memory::InMemoryBlockIO;

    fn pf() -> PseudoFile {
        PseudoFile::new(Arc::new(InMemoryBlockIO::new(4096))).unwrap()
    }

    #[test]
    fn stream_reads_and_writes_advance_the_offset() {
        let mut f = pf();
        assert_eq!(f.size(), 4096);

        f.seek(SeekFrom::Start(100)).unwrap();
        assert_eq!(f.write(b"abc").unwrap(), 3);

        f.seek(SeekFrom::Start(100)).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(f.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");

        // The offset moved with the read.
        assert_eq!(f.seek(SeekFrom::Current(0)).unwrap(), 103);
    }

    #[test]
    fn seek_variants() {
        let mut f = pf();
        assert_eq!(f.seek(SeekFrom::End(-96)).unwrap(), 4000);
        assert_eq!(f.seek(SeekFrom::Current(8)).unwrap(), 4008);
        assert!(f.seek(SeekFrom::Current(-9000)).is_err());
    }

    #[test]
    fn read_at_end_is_empty() {
        let mut f = pf();
        f.seek(SeekFrom::End(0)).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(f.read(&mut buf).unwrap(), 0);
    }
}
