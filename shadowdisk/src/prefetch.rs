// Copyright 2023 Oxide Computer Company
use std::sync::Mutex;

use crate::block_io::BlockIO;
use shadowdisk_common::ShadowError;

/// Streak threshold used when the caller passes zero.
pub const DEFAULT_MAX_STREAK: usize = 2;

#[derive(Default)]
struct PrefetchState {
    /// Offset and length of the previous read, for sequential
    /// detection.
    last_offset: u64,
    last_length: usize,
    /// Consecutive sequential reads, capped at `max_streak`.
    streak: usize,

    /// The single prefetch buffer and its valid window
    /// `[buf_start, buf_end)`.
    buf: Vec<u8>,
    buf_start: u64,
    buf_end: u64,
    buf_valid: bool,
}

/// Implement BlockIO as a read-ahead wrapper over any inner backend.
///
/// A read is sequential when it starts exactly where the previous read
/// ended.  Once `max_streak` sequential reads have been seen, the next
/// read that misses the buffer pulls `sector_size * prefetch_multiplier`
/// bytes from the inner backend in one call and serves subsequent reads
/// from that buffer.  Any write that overlaps the buffer invalidates it
/// and resets the streak.
pub struct PrefetchBlockIO<B> {
    inner: B,
    sector_size: u64,
    prefetch_multiplier: usize,
    max_streak: usize,
    state: Mutex<PrefetchState>,
}

impl<B: BlockIO> PrefetchBlockIO<B> {
    /// `max_streak == 0` selects [`DEFAULT_MAX_STREAK`].
    pub fn new(
        inner: B,
        sector_size: u64,
        prefetch_multiplier: usize,
        max_streak: usize,
    ) -> Self {
        let max_streak = if max_streak == 0 {
            DEFAULT_MAX_STREAK
        } else {
            max_streak
        };
        Self {
            inner,
            sector_size,
            prefetch_multiplier,
            max_streak,
            state: Mutex::new(PrefetchState::default()),
        }
    }
}

impl<B: BlockIO> BlockIO for PrefetchBlockIO<B> {
    fn read_at(
        &self,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, ShadowError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len() as u64;
        let end = offset + len;

        let mut state = self.state.lock().unwrap();

        let sequential = state.last_offset + state.last_length as u64 != 0
            && offset == state.last_offset + state.last_length as u64;
        if sequential {
            if state.streak < self.max_streak {
                state.streak += 1;
            }
        } else {
            state.streak = 0;
        }
        let should_prefetch = state.streak >= self.max_streak;
        state.last_offset = offset;
        state.last_length = buf.len();

        // Full hit: the request lies inside the valid window.
        if state.buf_valid && offset >= state.buf_start && end <= state.buf_end
        {
            let start = (offset - state.buf_start) as usize;
            buf.copy_from_slice(&state.buf[start..start + buf.len()]);
            return Ok(buf.len());
        }

        // Partial hit: some overlap with the valid window.  Copy the
        // overlap out under the lock, then fill whatever is missing on
        // either side from the inner backend.
        if state.buf_valid {
            let hit_start = offset.max(state.buf_start);
            let hit_end = end.min(state.buf_end);
            if hit_start < hit_end {
                let src = (hit_start - state.buf_start) as usize;
                let dst = (hit_start - offset) as usize;
                let n = (hit_end - hit_start) as usize;
                buf[dst..dst + n].copy_from_slice(&state.buf[src..src + n]);
                drop(state);

                if dst > 0 {
                    self.inner.read_at(&mut buf[..dst], offset)?;
                }
                let tail = dst + n;
                if tail < buf.len() {
                    self.inner
                        .read_at(&mut buf[tail..], offset + tail as u64)?;
                }
                return Ok(buf.len());
            }
        }

        // Full miss with the streak at threshold: prefetch, then serve
        // the caller from the new buffer.
        if should_prefetch {
            let prefetch_len =
                self.sector_size as usize * self.prefetch_multiplier;
            if state.buf.len() < prefetch_len {
                state.buf = vec![0u8; prefetch_len];
            }
            let state = &mut *state;
            let n = self.inner.read_at(&mut state.buf[..prefetch_len], offset)?;
            state.buf_start = offset;
            state.buf_end = offset + n as u64;
            state.buf_valid = true;

            let served = buf.len().min(n);
            buf[..served].copy_from_slice(&state.buf[..served]);
            return Ok(served);
        }

        // Full miss, no prefetch: straight through.
        drop(state);
        self.inner.read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, ShadowError> {
        {
            let mut state = self.state.lock().unwrap();
            let end = offset + buf.len() as u64;
            if state.buf_valid && offset < state.buf_end && end > state.buf_start
            {
                state.buf = Vec::new();
                state.buf_valid = false;
            }
            // A write breaks any sequential read pattern.
            state.streak = 0;
        }
        self.inner.write_at(buf, offset)
    }

    fn size(&self) -> Result<u64, ShadowError> {
        self.inner.size()
    }

    fn flush(&self) -> Result<(), ShadowError> {
        self.inner.flush()
    }

    fn close(&self) -> Result<(), ShadowError> {
        self.inner.close()
    }
}
