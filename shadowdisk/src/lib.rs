// Copyright 2023 Oxide Computer Company

//! A copy-on-write block device served over NBD.
//!
//! The storage stack is a linear composition of backends sharing one
//! capability ([`BlockIO`]):
//!
//! ```text
//!     log -> [prefetch] -> cow -> device | file
//! ```
//!
//! The base (a raw block device or an image file) is never written;
//! every mutation is captured as a per-sector file under an overlay
//! directory, from where the `patch` subcommand can later replay it
//! onto another device.

pub mod block_io;
pub mod cow;
pub mod in_memory;
pub mod log;
pub mod patch;
pub mod prefetch;
pub mod pseudo_file;
pub mod server;

pub use block_io::{BlockIO, DeviceBlockIO, FileBlockIO};
pub use cow::CowBlockIO;
pub use in_memory::InMemoryBlockIO;
pub use log::LogBlockIO;
pub use patch::{run_patch, PatchOptions};
pub use prefetch::PrefetchBlockIO;
pub use pseudo_file::PseudoFile;
pub use server::{build_stack, run_server, ServerOptions};

pub use shadowdisk_common::ShadowError;
