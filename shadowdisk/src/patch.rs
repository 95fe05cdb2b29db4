// Copyright 2023 Oxide Computer Company
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Seek, SeekFrom, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use slog::{info, warn, Logger};
use walkdir::WalkDir;

use crate::block_io::{pread_all, pwrite_all};
use crate::cow::parse_sector_file_name;
use shadowdisk_common::ShadowError;

#[derive(Debug, Clone)]
pub struct PatchOptions {
    pub sector_dir: PathBuf,
    pub device: PathBuf,
    pub device_offset: u64,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectorFile {
    pub path: PathBuf,
    pub sector: u64,
    pub size: u64,
}

impl SectorFile {
    /// Absolute byte position of this sector on the target, or None if
    /// the arithmetic overflows (a hostile or corrupt file name).
    fn target_offset(&self, device_offset: u64) -> Option<u64> {
        self.sector
            .checked_mul(self.size)?
            .checked_add(device_offset)
    }
}

/// Walk the overlay tree (following symlinks) and collect every file
/// that parses as a sector file.  Files with a `.sector` extension but
/// a malformed name are logged and skipped.
pub fn walk_sector_files(dir: &Path, log: &Logger) -> Result<Vec<SectorFile>> {
    let mut sectors = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.with_context(|| format!("walk {dir:?}"))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.ends_with(".sector") {
            continue;
        }
        match parse_sector_file_name(&name) {
            Some((sector, size)) => sectors.push(SectorFile {
                path: entry.into_path(),
                sector,
                size,
            }),
            None => {
                warn!(log, "invalid sector file name, skipping";
                    "file" => %entry.path().display());
            }
        }
    }
    Ok(sectors)
}

fn apply_one(
    dev: &File,
    sector: &SectorFile,
    target_offset: u64,
) -> Result<(), ShadowError> {
    let f = File::open(&sector.path)?;
    let mut data = vec![0u8; sector.size as usize];
    pread_all(f.as_fd(), &mut data, 0)?;
    pwrite_all(dev.as_fd(), &data, target_offset as i64)?;
    Ok(())
}

/// Copy each collected sector onto the open target.  Per-sector
/// failures are logged and skipped; the count of applied sectors is
/// returned.  The caller is responsible for the final sync.
pub fn apply_sectors(
    dev: &File,
    sectors: &[SectorFile],
    device_offset: u64,
    log: &Logger,
) -> usize {
    let mut applied = 0;
    for s in sectors {
        let target_offset = match s.target_offset(device_offset) {
            Some(off) => off,
            None => {
                warn!(log, "sector position overflows the target, skipping";
                    "file" => %s.path.display());
                continue;
            }
        };

        match apply_one(dev, s, target_offset) {
            Ok(()) => {
                info!(log, "applied sector";
                    "file" => %s.path.display(),
                    "target_offset" => target_offset,
                    "len" => s.size);
                applied += 1;
            }
            Err(e) => {
                warn!(log, "failed to apply sector, skipping";
                    "file" => %s.path.display(),
                    "error" => %e);
            }
        }
    }
    applied
}

fn confirm(device: &Path, offset: u64) -> Result<bool> {
    println!();
    println!("{}", "!".repeat(80));
    println!("WARNING: this will write overlay data directly onto the target device.");
    println!("         Target: {} (offset {offset:#x})", device.display());
    println!("         Make sure you have a backup and have double-checked the target.");
    println!("{}", "!".repeat(80));
    print!("\nTo proceed, type 'YES' (case sensitive): ");
    io::stdout().flush()?;

    let mut response = String::new();
    io::stdin().lock().read_line(&mut response)?;
    Ok(response.trim() == "YES")
}

/// Replay an overlay directory onto a target device or image.
///
/// Dry-run opens the target read-only, validates every seek, and
/// reports what would be written.  A real run requires an exact `YES`
/// on stdin first; declining is a successful no-op.
pub fn run_patch(opts: PatchOptions, log: Logger) -> Result<()> {
    println!("Scanning sector files in {}...", opts.sector_dir.display());
    let sectors = walk_sector_files(&opts.sector_dir, &log)?;
    let total_bytes: u64 = sectors.iter().map(|s| s.size).sum();

    println!(
        "Found {} sector files, {} bytes ({:.2} MiB) total",
        sectors.len(),
        total_bytes,
        total_bytes as f64 / 1024.0 / 1024.0
    );
    println!(
        "Target: {} (offset {:#x})",
        opts.device.display(),
        opts.device_offset
    );

    if opts.dry_run {
        println!("\nDRY RUN: no data will be written");

        let mut dev = File::open(&opts.device)
            .with_context(|| format!("open {:?} read-only", opts.device))?;
        for s in &sectors {
            let target_offset =
                s.target_offset(opts.device_offset).with_context(|| {
                    format!("sector position overflow for {:?}", s.path)
                })?;
            dev.seek(SeekFrom::Start(target_offset)).with_context(|| {
                format!("seek to {target_offset:#x} on {:?}", opts.device)
            })?;
            println!(
                "Would apply {} at offset {:#x} ({} bytes)",
                s.path.display(),
                target_offset,
                s.size
            );
        }
        println!("\nDry run completed, no data was written");
        return Ok(());
    }

    if !confirm(&opts.device, opts.device_offset)? {
        println!("Operation cancelled");
        return Ok(());
    }

    let dev = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&opts.device)
        .with_context(|| format!("open {:?} read-write", opts.device))?;

    println!("\nApplying sectors...");
    let applied = apply_sectors(&dev, &sectors, opts.device_offset, &log);

    dev.sync_all()
        .with_context(|| format!("sync {:?}", opts.device))?;
    println!("Applied {applied} of {} sectors", sectors.len());

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cow::{sector_file_name, sector_path};
    use shadowdisk_common::mkdir_for_file;
    use slog::o;
    use tempfile::tempdir;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn put_sector(dir: &Path, sector: u64, size: u64, fill: u8) -> PathBuf {
        let path = sector_path(dir, sector, size);
        mkdir_for_file(&path).unwrap();
        std::fs::write(&path, vec![fill; size as usize]).unwrap();
        path
    }

    #[test]
    fn walk_collects_and_skips() -> Result<()> {
        let dir = tempdir()?;
        let overlay = dir.path();

        put_sector(overlay, 0, 512, 1);
        put_sector(overlay, 77, 512, 2);
        // Malformed names are skipped, as are non-sector files.
        std::fs::write(overlay.join("junk.sector"), b"not a sector")?;
        std::fs::write(overlay.join("README"), b"hi")?;

        let mut found = walk_sector_files(overlay, &test_logger())?;
        found.sort_by_key(|s| s.sector);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].sector, 0);
        assert_eq!(found[1].sector, 77);
        assert!(found.iter().all(|s| s.size == 512));
        Ok(())
    }

    #[test]
    fn walk_parses_generated_names() {
        let name = sector_file_name(0xabcd, 4096);
        assert_eq!(parse_sector_file_name(&name), Some((0xabcd, 4096)));
    }

    #[test]
    fn apply_places_sectors_with_offset() -> Result<()> {
        let dir = tempdir()?;
        let overlay = dir.path().join("overlay");
        std::fs::create_dir(&overlay)?;
        put_sector(&overlay, 1, 512, 0xaa);
        put_sector(&overlay, 3, 512, 0xbb);

        let target = dir.path().join("target.img");
        std::fs::write(&target, vec![0u8; 4096])?;
        let dev = OpenOptions::new().read(true).write(true).open(&target)?;

        let sectors = walk_sector_files(&overlay, &test_logger())?;
        let applied = apply_sectors(&dev, &sectors, 256, &test_logger());
        assert_eq!(applied, 2);
        dev.sync_all()?;

        let out = std::fs::read(&target)?;
        // Sector 1 lands at 512 + 256, sector 3 at 1536 + 256.
        assert!(out[..768].iter().all(|&c| c == 0));
        assert!(out[768..1280].iter().all(|&c| c == 0xaa));
        assert!(out[1280..1792].iter().all(|&c| c == 0));
        assert!(out[1792..2304].iter().all(|&c| c == 0xbb));
        assert!(out[2304..].iter().all(|&c| c == 0));
        Ok(())
    }

    #[test]
    fn unreadable_sector_is_skipped() -> Result<()> {
        let dir = tempdir()?;
        let overlay = dir.path().join("overlay");
        std::fs::create_dir(&overlay)?;
        put_sector(&overlay, 0, 512, 0xcc);
        put_sector(&overlay, 1, 512, 0xdd);

        let target = dir.path().join("target.img");
        std::fs::write(&target, vec![0u8; 2048])?;
        let dev = OpenOptions::new().read(true).write(true).open(&target)?;

        let mut sectors = walk_sector_files(&overlay, &test_logger())?;
        sectors.sort_by_key(|s| s.sector);
        // Remove sector 0's file after collection: the apply pass logs
        // the failure and carries on.
        std::fs::remove_file(&sectors[0].path)?;

        let applied = apply_sectors(&dev, &sectors, 0, &test_logger());
        assert_eq!(applied, 1);

        let out = std::fs::read(&target)?;
        assert!(out[..512].iter().all(|&c| c == 0));
        assert!(out[512..1024].iter().all(|&c| c == 0xdd));
        Ok(())
    }

    #[test]
    fn dry_run_writes_nothing() -> Result<()> {
        let dir = tempdir()?;
        let overlay = dir.path().join("overlay");
        std::fs::create_dir(&overlay)?;
        put_sector(&overlay, 0, 512, 0xee);

        let target = dir.path().join("target.img");
        std::fs::write(&target, vec![0u8; 1024])?;

        run_patch(
            PatchOptions {
                sector_dir: overlay,
                device: target.clone(),
                device_offset: 0,
                dry_run: true,
            },
            test_logger(),
        )?;

        assert!(std::fs::read(&target)?.iter().all(|&c| c == 0));
        Ok(())
    }
}
