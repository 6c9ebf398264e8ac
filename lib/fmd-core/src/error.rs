//! Top-level error taxonomy.
//!
//! Composed the way `disk_v2::mod`'s `BufferError<T>` aggregates the
//! variant-specific `BuildError`/`LedgerLoadCreateError`/`ReaderError`
//! enums: each subsystem owns its own `snafu`-derived error type, and this
//! module wires them together with `#[snafu(context(false))]` conversions
//! so `?` works across module boundaries without manual `.map_err`.

use snafu::Snafu;
use std::path::PathBuf;

use crate::boot::BootError;
use crate::header::HeaderError;
use crate::record::ValidationError;
use crate::trim::TrimError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FmdError {
    #[snafu(display("i/o error on {}: {source}", path.display()))]
    Io { path: PathBuf, source: std::io::Error },

    #[snafu(display("change-log header invalid: {source}"))]
    Header {
        #[snafu(context(false))]
        source: HeaderError,
    },

    #[snafu(display("change-log record invalid: {source}"))]
    Record {
        #[snafu(context(false))]
        source: ValidationError,
    },

    #[snafu(display("boot scan failed: {source}"))]
    Boot {
        #[snafu(context(false))]
        source: BootError,
    },

    #[snafu(display("trim failed: {source}"))]
    Trim {
        #[snafu(context(false))]
        source: TrimError,
    },

    #[snafu(display("no filesystem id {filesystem_id} is attached"))]
    FilesystemNotAttached { filesystem_id: u32 },

    #[snafu(display("file id {file_id} not found on filesystem {filesystem_id}"))]
    NotFound { filesystem_id: u32, file_id: u64 },

    #[snafu(display("change-log directory {} contains no log file for filesystem {filesystem_id}", directory.display()))]
    NoLogFileFound { directory: PathBuf, filesystem_id: u32 },
}

pub type Result<T, E = FmdError> = std::result::Result<T, E>;
