// Copyright 2023 Oxide Computer Company

//! End-to-end check that replaying an overlay produces the same image
//! the live COW stack serves.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::Result;
use rand::RngCore;
use slog::{o, Logger};
use tempfile::tempdir;

use shadowdisk::block_io::{BlockIO, FileBlockIO};
use shadowdisk::cow::CowBlockIO;
use shadowdisk::patch::{apply_sectors, walk_sector_files};

const SECTOR_SIZE: u64 = 4096;
const DISK_SIZE: usize = 1024 * 1024;

fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn blank_image(path: &Path) -> Result<()> {
    let mut f = File::create(path)?;
    f.write_all(&vec![0u8; DISK_SIZE])?;
    Ok(())
}

fn new_cow(base: &Path, overlay: &Path) -> Result<CowBlockIO> {
    Ok(CowBlockIO::new(
        Box::new(FileBlockIO::open(base)?),
        overlay.to_path_buf(),
        SECTOR_SIZE,
        10_000,
        0.01,
        64,
        test_logger(),
    )?)
}

fn read_all(b: &dyn BlockIO) -> Result<Vec<u8>> {
    let size = b.size()? as usize;
    let mut out = vec![0u8; size];
    assert_eq!(b.read_at(&mut out, 0)?, size);
    Ok(out)
}

#[test]
fn patch_reproduces_the_live_view() -> Result<()> {
    let dir = tempdir()?;
    let base = dir.path().join("base.img");
    let target = dir.path().join("target.img");
    let overlay = dir.path().join("overlay");
    blank_image(&base)?;
    blank_image(&target)?;

    // Scatter writes through the overlay: sub-sector, sector-aligned,
    // cross-sector, and repeated over the same range.
    let cow = new_cow(&base, &overlay)?;
    let mut rng = rand::thread_rng();
    let writes: &[(u64, usize)] = &[
        (50, 100),
        (4096, 4096),
        (8190, 10),
        (100_000, 25_000),
        (50, 40),
        (1_048_000, 576),
    ];
    for &(offset, len) in writes {
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        assert_eq!(cow.write_at(&data, offset)?, len);
    }

    let live = read_all(&cow)?;

    // Replay the overlay onto the blank target.
    let sectors = walk_sector_files(&overlay, &test_logger())?;
    assert!(!sectors.is_empty());
    let dev = OpenOptions::new().read(true).write(true).open(&target)?;
    let applied = apply_sectors(&dev, &sectors, 0, &test_logger());
    assert_eq!(applied, sectors.len());
    dev.sync_all()?;

    assert_eq!(std::fs::read(&target)?, live);
    Ok(())
}

#[test]
fn restarted_stack_serves_the_same_view() -> Result<()> {
    let dir = tempdir()?;
    let base = dir.path().join("base.img");
    let overlay = dir.path().join("overlay");
    blank_image(&base)?;

    let mut data = vec![0u8; 30_000];
    rand::thread_rng().fill_bytes(&mut data);

    let first_view = {
        let cow = new_cow(&base, &overlay)?;
        cow.write_at(&data, 12_345)?;
        read_all(&cow)?
    };

    // A new stack over the same overlay rebuilds the filter by walking
    // the tree; the cold cache changes nothing observable.
    let cow = new_cow(&base, &overlay)?;
    assert_eq!(read_all(&cow)?, first_view);
    Ok(())
}

#[test]
fn patch_respects_the_device_offset() -> Result<()> {
    let dir = tempdir()?;
    let base = dir.path().join("base.img");
    let target = dir.path().join("target.img");
    let overlay = dir.path().join("overlay");
    blank_image(&base)?;

    // Target is one sector larger to hold the shifted data.
    let mut f = File::create(&target)?;
    f.write_all(&vec![0u8; DISK_SIZE + SECTOR_SIZE as usize])?;
    drop(f);

    let cow = new_cow(&base, &overlay)?;
    cow.write_at(&[0x5a; 512], 0)?;

    let sectors = walk_sector_files(&overlay, &test_logger())?;
    let dev = OpenOptions::new().read(true).write(true).open(&target)?;
    assert_eq!(
        apply_sectors(&dev, &sectors, SECTOR_SIZE, &test_logger()),
        sectors.len()
    );
    dev.sync_all()?;

    let out = std::fs::read(&target)?;
    let shift = SECTOR_SIZE as usize;
    assert!(out[..shift].iter().all(|&c| c == 0));
    assert!(out[shift..shift + 512].iter().all(|&c| c == 0x5a));
    assert!(out[shift + 512..shift * 2].iter().all(|&c| c == 0));
    Ok(())
}
