// Copyright 2023 Oxide Computer Company
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use nbd::server::{handshake, transmission, Export};
use slog::{info, o, warn, Logger};

use crate::block_io::{BlockIO, DeviceBlockIO, FileBlockIO};
use crate::cow::CowBlockIO;
use crate::log::LogBlockIO;
use crate::prefetch::PrefetchBlockIO;
use crate::pseudo_file::PseudoFile;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub device: PathBuf,
    pub sector_dir: PathBuf,
    pub listen: SocketAddr,
    pub sector_size: u64,
    pub filter_size: usize,
    pub filter_fpr: f64,
    pub cache_size: usize,
    pub enable_prefetch: bool,
    pub prefetch_multiplier: usize,
    pub max_consecutive_reads: usize,
}

/// Assemble the storage stack:
///
/// ```text
/// log -> [prefetch] -> cow -> device | file
/// ```
///
/// The base variant is picked by the device path's file type.
pub fn build_stack(
    opts: &ServerOptions,
    log: &Logger,
) -> Result<Arc<dyn BlockIO>> {
    let meta = std::fs::metadata(&opts.device)
        .with_context(|| format!("device or file {:?}", opts.device))?;

    let base: Box<dyn BlockIO> = if meta.file_type().is_block_device() {
        info!(log, "opening base block device"; "device" => ?opts.device);
        Box::new(DeviceBlockIO::open(&opts.device)?)
    } else {
        info!(log, "opening base image file"; "device" => ?opts.device);
        Box::new(FileBlockIO::open(&opts.device)?)
    };

    let cow = CowBlockIO::new(
        base,
        opts.sector_dir.clone(),
        opts.sector_size,
        opts.filter_size,
        opts.filter_fpr,
        opts.cache_size,
        log.new(o!("backend" => "cow")),
    )?;

    let head: Box<dyn BlockIO> = if opts.enable_prefetch {
        Box::new(PrefetchBlockIO::new(
            cow,
            opts.sector_size,
            opts.prefetch_multiplier,
            opts.max_consecutive_reads,
        ))
    } else {
        Box::new(cow)
    };

    Ok(Arc::new(LogBlockIO::new(head, log.new(o!("backend" => "trace")))))
}

fn serve_client(
    stack: Arc<dyn BlockIO>,
    mut stream: TcpStream,
) -> Result<()> {
    let mut pf = PseudoFile::new(stack)?;
    let e = Export {
        size: pf.size(),
        readonly: false,
        send_flush: true,
        ..Default::default()
    };
    handshake(&mut stream, &e)?;
    transmission(&mut stream, &mut pf)?;
    Ok(())
}

/// Bind the listen address and serve NBD clients until the listener
/// fails.  Each connection runs on its own thread over the shared
/// stack.
pub fn run_server(opts: ServerOptions, log: Logger) -> Result<()> {
    let stack = build_stack(&opts, &log)?;
    let size = stack.size()?;

    let listener = TcpListener::bind(opts.listen)
        .with_context(|| format!("listen on {}", opts.listen))?;
    info!(log, "NBD server started";
        "listen" => opts.listen.to_string(),
        "export_size" => size);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                let conn_log = log.new(o!("peer" => peer));
                info!(conn_log, "client connected");

                let stack = Arc::clone(&stack);
                thread::spawn(move || {
                    match serve_client(stack, stream) {
                        Ok(()) => info!(conn_log, "client disconnected"),
                        Err(e) => {
                            warn!(conn_log, "client session failed";
                                "error" => %e);
                        }
                    }
                });
            }
            Err(e) => {
                warn!(log, "accept failed"; "error" => %e);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn build_stack_over_image_file() -> Result<()> {
        let dir = tempdir()?;
        let image = dir.path().join("base.img");
        let mut f = std::fs::File::create(&image)?;
        f.write_all(&[0u8; 32768])?;

        let opts = ServerOptions {
            device: image,
            sector_dir: dir.path().join("overlay"),
            listen: "127.0.0.1:10809".parse().unwrap(),
            sector_size: 4096,
            filter_size: 1000,
            filter_fpr: 0.01,
            cache_size: 16,
            enable_prefetch: true,
            prefetch_multiplier: 4,
            max_consecutive_reads: 2,
        };
        let log = Logger::root(slog::Discard, o!());
        let stack = build_stack(&opts, &log)?;
        assert_eq!(stack.size()?, 32768);

        // Writes land in the overlay, and the full stack round-trips.
        assert_eq!(stack.write_at(b"stacked", 1000)?, 7);
        let mut buf = [0u8; 7];
        assert_eq!(stack.read_at(&mut buf, 1000)?, 7);
        assert_eq!(&buf, b"stacked");
        stack.flush()?;
        Ok(())
    }

    #[test]
    fn build_stack_requires_existing_device() {
        let opts = ServerOptions {
            device: PathBuf::from("/nonexistent/base.img"),
            sector_dir: PathBuf::from("/nonexistent/overlay"),
            listen: "127.0.0.1:10809".parse().unwrap(),
            sector_size: 4096,
            filter_size: 1000,
            filter_fpr: 0.01,
            cache_size: 16,
            enable_prefetch: false,
            prefetch_multiplier: 16,
            max_consecutive_reads: 4,
        };
        let log = Logger::root(slog::Discard, o!());
        assert!(build_stack(&opts, &log).is_err());
    }
}
