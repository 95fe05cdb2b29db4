// Copyright 2023 Oxide Computer Company
use std::fs::File;
use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use fastbloom::BloomFilter;
use lru::LruCache;
use slog::{info, Logger};
use walkdir::WalkDir;

use crate::block_io::{pread_all, BlockIO};
use shadowdisk_common::{mkdir_for_file, shadow_bail, ShadowError};

/// Number of shard directory levels between the overlay root and a
/// sector file.
const SHARD_LEVELS: u64 = 4;

/// Produce the file name for a sector: the sector index as sixteen hex
/// digits, an underscore, and the sector size as eight hex digits.
pub fn sector_file_name(sector: u64, sector_size: u64) -> String {
    format!("{sector:016x}_{sector_size:08x}.sector")
}

/// Produce the shard directory for `sector`, anchored under `dir`.  One
/// level per byte of the sector index, low byte outermost, so adjacent
/// sectors land in the same leaf directory and fanout stays bounded.
pub fn sector_dir<P: AsRef<Path>>(dir: P, sector: u64) -> PathBuf {
    let mut out = dir.as_ref().to_path_buf();
    for level in 0..SHARD_LEVELS {
        out.push(format!("{:02x}", (sector >> (level * 8)) & 0xff));
    }
    out
}

/// Produce the full path of the overlay file for `sector`.
pub fn sector_path<P: AsRef<Path>>(
    dir: P,
    sector: u64,
    sector_size: u64,
) -> PathBuf {
    let mut out = sector_dir(dir, sector);
    out.push(sector_file_name(sector, sector_size));
    out
}

/// Parse a sector file name back into (sector index, sector size).
/// Returns None for anything that does not match the exact
/// `<16 hex>_<8 hex>.sector` shape.
pub fn parse_sector_file_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(".sector")?;
    let (sector, size) = stem.split_once('_')?;
    if sector.len() != 16 || size.len() != 8 {
        return None;
    }
    let sector = u64::from_str_radix(sector, 16).ok()?;
    let size = u64::from_str_radix(size, 16).ok()?;
    Some((sector, size))
}

/// A bounded cache of full sector contents, keyed by sector index.
///
/// Strict LRU: inserting into a full cache evicts the least recently
/// used sector.  The lock is internal so callers never hold it across
/// an I/O operation.
struct SectorCache {
    cache: Mutex<LruCache<u64, Arc<Vec<u8>>>>,
}

impl SectorCache {
    fn new(capacity: usize) -> Result<Self, ShadowError> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            ShadowError::GenericError(
                "sector cache capacity must be nonzero".to_string(),
            )
        })?;
        Ok(Self {
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    fn get(&self, sector: u64) -> Option<Arc<Vec<u8>>> {
        self.cache.lock().unwrap().get(&sector).cloned()
    }

    fn insert(&self, sector: u64, data: Arc<Vec<u8>>) {
        self.cache.lock().unwrap().put(sector, data);
    }
}

/// Implement BlockIO as a copy-on-write overlay over a read-only base.
///
/// Reads come from the base, patched with the contents of any overlay
/// sector files that cover the range.  Writes never touch the base:
/// each dirtied sector becomes one file of exactly `sector_size` bytes
/// under the overlay directory, holding that sector's authoritative
/// contents.
///
/// A bloom filter over dirtied sector indexes lets reads skip the
/// overlay entirely for clean sectors; it may report false positives
/// (which cost a failed file open) but never false negatives.  The
/// filter is rebuilt from a directory walk at construction.
pub struct CowBlockIO {
    base: Box<dyn BlockIO>,
    dir: PathBuf,
    sector_size: u64,
    filter: RwLock<BloomFilter>,
    cache: SectorCache,
    log: Logger,
}

impl CowBlockIO {
    pub fn new(
        base: Box<dyn BlockIO>,
        dir: PathBuf,
        sector_size: u64,
        filter_size: usize,
        filter_fpr: f64,
        cache_size: usize,
        log: Logger,
    ) -> Result<Self, ShadowError> {
        if sector_size < 512 || !sector_size.is_power_of_two() {
            return Err(ShadowError::InvalidSectorSize(sector_size));
        }
        if !(filter_fpr > 0.0 && filter_fpr < 1.0) {
            shadow_bail!(
                GenericError,
                "filter false positive rate must be in (0, 1), got {}",
                filter_fpr
            );
        }
        if filter_size == 0 {
            shadow_bail!(GenericError, "filter size must be nonzero");
        }

        let filter = BloomFilter::with_false_pos(filter_fpr)
            .expected_items(filter_size);

        let cow = Self {
            base,
            dir,
            sector_size,
            filter: RwLock::new(filter),
            cache: SectorCache::new(cache_size)?,
            log,
        };
        cow.scan_existing_sectors()?;
        Ok(cow)
    }

    /// Walk the overlay tree and add every sector that already has a
    /// file to the filter.  Symlinked subdirectories are followed.
    fn scan_existing_sectors(&self) -> Result<(), ShadowError> {
        if !self.dir.exists() {
            info!(self.log, "overlay directory does not exist yet";
                "dir" => ?self.dir);
            return Ok(());
        }

        let start = Instant::now();
        let mut count: u64 = 0;
        for entry in WalkDir::new(&self.dir).follow_links(true) {
            let entry = entry.map_err(|e| {
                ShadowError::IoError(format!("overlay scan: {e}"))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if let Some((sector, _)) = parse_sector_file_name(&name) {
                self.filter.write().unwrap().insert(&sector);
                count += 1;
            }
        }

        info!(self.log, "overlay scan complete";
            "dir" => ?self.dir,
            "sectors" => count,
            "elapsed_ms" => start.elapsed().as_millis() as u64);
        Ok(())
    }

    fn filter_contains(&self, sector: u64) -> bool {
        self.filter.read().unwrap().contains(&sector)
    }

    /// Patch `out` (a sub-range of a read, already holding base bytes)
    /// with the overlay contents of `sector`, starting `sector_offset`
    /// bytes into the sector.
    ///
    /// Cache first, then the overlay file.  A file that cannot be
    /// opened means the filter gave a false positive: the base bytes
    /// stand.  A file that opens but cannot be read is a real error.
    fn patch_from_overlay(
        &self,
        sector: u64,
        out: &mut [u8],
        sector_offset: usize,
    ) -> Result<(), ShadowError> {
        if let Some(data) = self.cache.get(sector) {
            out.copy_from_slice(&data[sector_offset..sector_offset + out.len()]);
            return Ok(());
        }

        let path = sector_path(&self.dir, sector, self.sector_size);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(_) => return Ok(()),
        };

        let mut data = vec![0u8; self.sector_size as usize];
        pread_all(file.as_fd(), &mut data, 0).map_err(|e| {
            ShadowError::IoError(format!("overlay read {path:?}: {e}"))
        })?;
        out.copy_from_slice(&data[sector_offset..sector_offset + out.len()]);
        self.cache.insert(sector, Arc::new(data));
        Ok(())
    }

    /// Copy-out one sector: read-modify-write of the full sector file.
    ///
    /// `data` must lie entirely within `sector`; `offset` is the
    /// absolute byte position of `data[0]`.
    fn write_sector(
        &self,
        data: &[u8],
        offset: u64,
        sector: u64,
    ) -> Result<usize, ShadowError> {
        let path = sector_path(&self.dir, sector, self.sector_size);
        mkdir_for_file(&path)?;

        // Into the filter before the file exists, so a concurrent
        // reader can never see the file without a filter hit.
        self.filter.write().unwrap().insert(&sector);

        let in_sector_offset = (offset % self.sector_size) as usize;
        let mut sector_data = vec![0u8; self.sector_size as usize];

        match File::open(&path) {
            Ok(f) => {
                pread_all(f.as_fd(), &mut sector_data, 0).map_err(|e| {
                    ShadowError::IoError(format!(
                        "overlay read {path:?}: {e}"
                    ))
                })?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if let Some(cached) = self.cache.get(sector) {
                    sector_data.copy_from_slice(&cached);
                } else {
                    // A short read near the end of the base leaves the
                    // tail of the sector zeroed.
                    self.base
                        .read_at(&mut sector_data, sector * self.sector_size)?;
                }
            }
            Err(e) => return Err(e.into()),
        }

        sector_data[in_sector_offset..in_sector_offset + data.len()]
            .copy_from_slice(data);

        let sector_data = Arc::new(sector_data);
        self.cache.insert(sector, Arc::clone(&sector_data));
        std::fs::write(&path, sector_data.as_slice()).map_err(|e| {
            ShadowError::IoError(format!("overlay write {path:?}: {e}"))
        })?;

        Ok(data.len())
    }
}

impl BlockIO for CowBlockIO {
    /// Two passes: one read against the base for the whole range, then
    /// an overlay patch for each dirtied sector the range intersects.
    ///
    /// The returned count comes from the base pass, so overlay-only
    /// sectors past the end of the base read back as end-of-stream even
    /// though their files exist.
    fn read_at(
        &self,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, ShadowError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let n = self.base.read_at(buf, offset)?;

        let end = offset + buf.len() as u64;
        let start_sector = offset / self.sector_size;
        let end_sector = (end - 1) / self.sector_size;

        for sector in start_sector..=end_sector {
            if !self.filter_contains(sector) {
                continue;
            }

            let sector_start = sector * self.sector_size;
            let patch_start = sector_start.max(offset);
            let patch_end = (sector_start + self.sector_size).min(end);
            if patch_start >= patch_end {
                continue;
            }

            let sector_offset = (patch_start - sector_start) as usize;
            let buf_offset = (patch_start - offset) as usize;
            let len = (patch_end - patch_start) as usize;
            self.patch_from_overlay(
                sector,
                &mut buf[buf_offset..buf_offset + len],
                sector_offset,
            )?;
        }

        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, ShadowError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        let mut current = offset;
        while written < buf.len() {
            let sector = current / self.sector_size;
            let in_sector = (current % self.sector_size) as usize;
            let chunk =
                (self.sector_size as usize - in_sector).min(buf.len() - written);
            let n =
                self.write_sector(&buf[written..written + chunk], current, sector)?;
            written += n;
            current += n as u64;
        }

        Ok(written)
    }

    fn size(&self) -> Result<u64, ShadowError> {
        self.base.size()
    }

    fn flush(&self) -> Result<(), ShadowError> {
        self.base.flush()
    }

    fn close(&self) -> Result<(), ShadowError> {
        self.base.close()
    }
}
