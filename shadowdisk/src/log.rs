// Copyright 2023 Oxide Computer Company
use std::time::Instant;

use slog::{error, info, Logger};

use crate::block_io::BlockIO;
use shadowdisk_common::ShadowError;

/// Implement BlockIO as a transparent tracing wrapper.
///
/// Every operation is recorded with its offset (decimal and hex),
/// length, outcome, and elapsed time.  Semantics are untouched.
pub struct LogBlockIO<B> {
    inner: B,
    log: Logger,
}

impl<B: BlockIO> LogBlockIO<B> {
    pub fn new(inner: B, log: Logger) -> Self {
        Self { inner, log }
    }
}

impl<B: BlockIO> BlockIO for LogBlockIO<B> {
    fn read_at(
        &self,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, ShadowError> {
        let start = Instant::now();
        let result = self.inner.read_at(buf, offset);
        let elapsed_us = start.elapsed().as_micros() as u64;
        match &result {
            Ok(n) => info!(self.log, "ReadAt";
                "offset" => offset,
                "offset_hex" => format!("{offset:#x}"),
                "len" => buf.len(),
                "result" => *n,
                "elapsed_us" => elapsed_us),
            Err(e) => error!(self.log, "ReadAt";
                "offset" => offset,
                "offset_hex" => format!("{offset:#x}"),
                "len" => buf.len(),
                "error" => %e,
                "elapsed_us" => elapsed_us),
        }
        result
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, ShadowError> {
        let start = Instant::now();
        let result = self.inner.write_at(buf, offset);
        let elapsed_us = start.elapsed().as_micros() as u64;
        match &result {
            Ok(n) => info!(self.log, "WriteAt";
                "offset" => offset,
                "offset_hex" => format!("{offset:#x}"),
                "len" => buf.len(),
                "result" => *n,
                "elapsed_us" => elapsed_us),
            Err(e) => error!(self.log, "WriteAt";
                "offset" => offset,
                "offset_hex" => format!("{offset:#x}"),
                "len" => buf.len(),
                "error" => %e,
                "elapsed_us" => elapsed_us),
        }
        result
    }

    fn size(&self) -> Result<u64, ShadowError> {
        let start = Instant::now();
        let result = self.inner.size();
        let elapsed_us = start.elapsed().as_micros() as u64;
        match &result {
            Ok(size) => info!(self.log, "Size";
                "result" => *size,
                "result_hex" => format!("{size:#x}"),
                "elapsed_us" => elapsed_us),
            Err(e) => error!(self.log, "Size";
                "error" => %e,
                "elapsed_us" => elapsed_us),
        }
        result
    }

    fn flush(&self) -> Result<(), ShadowError> {
        let start = Instant::now();
        let result = self.inner.flush();
        let elapsed_us = start.elapsed().as_micros() as u64;
        match &result {
            Ok(()) => info!(self.log, "Flush"; "elapsed_us" => elapsed_us),
            Err(e) => error!(self.log, "Flush";
                "error" => %e,
                "elapsed_us" => elapsed_us),
        }
        result
    }

    fn close(&self) -> Result<(), ShadowError> {
        let start = Instant::now();
        let result = self.inner.close();
        let elapsed_us = start.elapsed().as_micros() as u64;
        match &result {
            Ok(()) => info!(self.log, "Close"; "elapsed_us" => elapsed_us),
            Err(e) => error!(self.log, "Close";
                "error" => %e,
                "elapsed_us" => elapsed_us),
        }
        result
    }
}
