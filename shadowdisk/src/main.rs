// Copyright 2023 Oxide Computer Company
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use shadowdisk::{run_patch, run_server, PatchOptions, ServerOptions};
use shadowdisk_common::{build_file_logger, build_logger};

#[derive(Debug, Parser)]
#[clap(name = "shadowdisk")]
#[clap(about = "copy-on-write NBD server and overlay patch tool")]
enum Args {
    /// Serve a read/write NBD export over a read-only base, capturing
    /// writes in a sector overlay directory.
    Server {
        /// Block device or image file path
        #[clap(long)]
        device: PathBuf,

        /// Directory for copy-on-write sector files
        #[clap(long)]
        sector_dir: PathBuf,

        /// TCP listen address
        #[clap(long, default_value = "0.0.0.0:10809")]
        listen: SocketAddr,

        /// Sector size in bytes (power of two, multiple of 512)
        #[clap(long, default_value_t = 4096)]
        sector_size: u64,

        /// Trace log file path (stderr when absent)
        #[clap(long)]
        log: Option<PathBuf>,

        /// Bloom filter estimated element count
        #[clap(long, default_value_t = 100_000)]
        filter_size: usize,

        /// Bloom filter target false positive rate (0-1)
        #[clap(long, default_value_t = 0.01)]
        filter_fpr: f64,

        /// LRU cache capacity, in sectors
        #[clap(long, default_value_t = 5000)]
        cache_size: usize,

        /// Enable the sequential-read prefetcher
        #[clap(long)]
        enable_prefetch: bool,

        /// Prefetch length as a multiple of the sector size
        #[clap(long, default_value_t = 16)]
        prefetch_multiplier: usize,

        /// Consecutive sequential reads that trigger a prefetch
        #[clap(long, default_value_t = 4)]
        max_consecutive_reads: usize,
    },

    /// Replay an overlay directory onto a target device or image.
    Patch {
        /// Directory holding the sector files to apply
        #[clap(long)]
        sector_dir: PathBuf,

        /// Target block device or image file
        #[clap(long)]
        device: PathBuf,

        /// Byte offset added to every sector's position on the target
        #[clap(long, default_value_t = 0)]
        device_offset: u64,

        /// Walk and report without writing anything
        #[clap(long)]
        dry_run: bool,
    },
}

fn main() -> Result<()> {
    match Args::parse() {
        Args::Server {
            device,
            sector_dir,
            listen,
            sector_size,
            log,
            filter_size,
            filter_fpr,
            cache_size,
            enable_prefetch,
            prefetch_multiplier,
            max_consecutive_reads,
        } => {
            let logger = match &log {
                Some(path) => build_file_logger(path)?,
                None => build_logger(),
            };
            run_server(
                ServerOptions {
                    device,
                    sector_dir,
                    listen,
                    sector_size,
                    filter_size,
                    filter_fpr,
                    cache_size,
                    enable_prefetch,
                    prefetch_multiplier,
                    max_consecutive_reads,
                },
                logger,
            )
        }
        Args::Patch {
            sector_dir,
            device,
            device_offset,
            dry_run,
        } => run_patch(
            PatchOptions {
                sector_dir,
                device,
                device_offset,
                dry_run,
            },
            build_logger(),
        ),
    }
}
