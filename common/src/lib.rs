// Copyright 2021 Oxide Computer Company
use std::fs::OpenOptions;
use std::path::Path;

use slog::{o, Drain, Logger};

#[derive(thiserror::Error, Debug)]
pub enum ShadowError {
    #[error("Error: {0}")]
    GenericError(String),

    #[error("IO Error: {0}")]
    IoError(String),

    #[error("sector size must be a power of two and a multiple of 512, got {0}")]
    InvalidSectorSize(u64),
}

impl From<std::io::Error> for ShadowError {
    fn from(e: std::io::Error) -> Self {
        ShadowError::IoError(format!("{e:?}"))
    }
}

impl From<anyhow::Error> for ShadowError {
    fn from(e: anyhow::Error) -> Self {
        ShadowError::GenericError(format!("{e:?}"))
    }
}

impl From<ShadowError> for std::io::Error {
    fn from(e: ShadowError) -> Self {
        std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
    }
}

#[macro_export]
macro_rules! shadow_bail {
    ($i:ident) => { return Err($crate::ShadowError::$i) };
    ($i:ident, $str:expr) => {
        return Err($crate::ShadowError::$i($str.to_string()))
    };
    ($i:ident, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::ShadowError::$i(format!($fmt, $($arg)*)))
    };
}

/// Build a logger that terminates at stderr.
pub fn build_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

/// Build a logger that appends plain-format records to the given file,
/// creating it if needed.
pub fn build_file_logger<P: AsRef<Path>>(
    path: P,
) -> Result<Logger, ShadowError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_ref())?;
    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Ok(Logger::root(drain, o!()))
}

/// Create the containing directory for `file`, and all of its parents.
pub fn mkdir_for_file(file: &Path) -> Result<(), ShadowError> {
    let parent = file.parent().ok_or_else(|| {
        ShadowError::GenericError(format!("{file:?} has no parent directory"))
    })?;
    Ok(std::fs::create_dir_all(parent)?)
}
