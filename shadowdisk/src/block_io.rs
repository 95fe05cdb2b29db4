// Copyright 2023 Oxide Computer Company
use std::fs::{File, OpenOptions};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use shadowdisk_common::ShadowError;

/// The one capability every layer of the storage stack implements.
///
/// Offsets are absolute byte positions into the virtual disk.  A read
/// that comes back shorter than the buffer has hit end-of-stream; that
/// is not an error.  Writes are clamped at the device size.
///
/// Implementations must be safe for concurrent calls: the protocol
/// layer serves every client connection on its own thread.
pub trait BlockIO: Send + Sync {
    /// Read up to `buf.len()` bytes starting at byte `offset`, returning
    /// the number of bytes placed in `buf`.
    fn read_at(
        &self,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, ShadowError>;

    /// Write up to `buf.len()` bytes starting at byte `offset`,
    /// returning the number of bytes accepted.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, ShadowError>;

    /// Total size of the virtual disk in bytes.
    fn size(&self) -> Result<u64, ShadowError>;

    /// Force outstanding writes down to durable storage.
    fn flush(&self) -> Result<(), ShadowError>;

    /// Final flush before shutdown.  The underlying descriptor (if any)
    /// is released when the backend is dropped.
    fn close(&self) -> Result<(), ShadowError>;
}

impl<B: BlockIO + ?Sized> BlockIO for Box<B> {
    fn read_at(
        &self,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, ShadowError> {
        (**self).read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, ShadowError> {
        (**self).write_at(buf, offset)
    }

    fn size(&self) -> Result<u64, ShadowError> {
        (**self).size()
    }

    fn flush(&self) -> Result<(), ShadowError> {
        (**self).flush()
    }

    fn close(&self) -> Result<(), ShadowError> {
        (**self).close()
    }
}

/// Call `pread` repeatedly until the buffer is full.
///
/// `pread` may return short for interrupted calls, so loop until we have
/// everything.  Running out of file before the buffer is full is an
/// error here; callers clamp their reads to the region they know exists.
pub(crate) fn pread_all<F: AsFd + Copy>(
    fd: F,
    mut buf: &mut [u8],
    mut offset: i64,
) -> Result<(), ShadowError> {
    while !buf.is_empty() {
        let n = nix::sys::uio::pread(fd, buf, offset)
            .map_err(|e| ShadowError::IoError(format!("pread: {e}")))?;
        if n == 0 {
            return Err(ShadowError::IoError(
                "pread: unexpected end of file".to_string(),
            ));
        }
        offset += n as i64;
        buf = &mut buf[n..];
    }
    Ok(())
}

/// Call `pwrite` repeatedly until the whole buffer is written.
///
/// See details for why this is necessary in [`pread_all`].
pub(crate) fn pwrite_all<F: AsFd + Copy>(
    fd: F,
    mut buf: &[u8],
    mut offset: i64,
) -> Result<(), ShadowError> {
    while !buf.is_empty() {
        let n = nix::sys::uio::pwrite(fd, buf, offset)
            .map_err(|e| ShadowError::IoError(format!("pwrite: {e}")))?;
        offset += n as i64;
        buf = &buf[n..];
    }
    Ok(())
}

/// Implement BlockIO for an ordinary file.
///
/// The size is the file's current length; reads and writes are clamped
/// to it.  Positioned I/O means no seek state and no lock around the
/// descriptor.
pub struct FileBlockIO {
    file: File,
}

impl FileBlockIO {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ShadowError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                ShadowError::IoError(format!("open {path:?}: {e}"))
            })?;
        Ok(Self { file })
    }
}

impl BlockIO for FileBlockIO {
    fn read_at(
        &self,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, ShadowError> {
        let size = self.size()?;
        if buf.is_empty() || offset >= size {
            return Ok(0);
        }
        let len = buf.len().min((size - offset) as usize);
        pread_all(self.file.as_fd(), &mut buf[..len], offset as i64)?;
        Ok(len)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, ShadowError> {
        let size = self.size()?;
        if buf.is_empty() || offset >= size {
            return Ok(0);
        }
        let len = buf.len().min((size - offset) as usize);
        pwrite_all(self.file.as_fd(), &buf[..len], offset as i64)?;
        Ok(len)
    }

    fn size(&self) -> Result<u64, ShadowError> {
        Ok(self.file.metadata()?.len())
    }

    fn flush(&self) -> Result<(), ShadowError> {
        Ok(self.file.sync_all()?)
    }

    fn close(&self) -> Result<(), ShadowError> {
        self.flush()
    }
}

// BLKGETSIZE64: size in bytes of a block device, as a u64.
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Implement BlockIO for a raw block device.
///
/// The device is opened with `O_DIRECT` so the host page cache does not
/// end up double-caching data the layers above already cache.  The size
/// comes from the `BLKGETSIZE64` ioctl once at open.
pub struct DeviceBlockIO {
    file: File,
    size: u64,
}

impl DeviceBlockIO {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ShadowError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)
            .map_err(|e| {
                ShadowError::IoError(format!("open device {path:?}: {e}"))
            })?;

        let mut size: u64 = 0;
        unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }.map_err(|e| {
            ShadowError::IoError(format!("BLKGETSIZE64 on {path:?}: {e}"))
        })?;

        Ok(Self { file, size })
    }
}

impl BlockIO for DeviceBlockIO {
    fn read_at(
        &self,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, ShadowError> {
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }
        let len = buf.len().min((self.size - offset) as usize);
        pread_all(self.file.as_fd(), &mut buf[..len], offset as i64)?;
        Ok(len)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, ShadowError> {
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }
        let len = buf.len().min((self.size - offset) as usize);
        pwrite_all(self.file.as_fd(), &buf[..len], offset as i64)?;
        Ok(len)
    }

    fn size(&self) -> Result<u64, ShadowError> {
        Ok(self.size)
    }

    fn flush(&self) -> Result<(), ShadowError> {
        Ok(self.file.sync_all()?)
    }

    fn close(&self) -> Result<(), ShadowError> {
        self.flush()
    }
}
