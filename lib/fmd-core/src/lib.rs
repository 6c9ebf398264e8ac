//! File Metadata change-log core: record codec, log file, in-memory index,
//! quota accumulators, the single-mutex handler, the boot scanner, online
//! trim compaction, the text transport codec, and the fsck reconciliation
//! engine.
//!
//! This crate is the durable ground truth a storage-server process
//! consults on every file open/close/delete and the source of truth it
//! reconciles against local disk and the central namespace during fsck.

#![deny(clippy::all)]
#![allow(clippy::too_many_arguments)]

#[macro_use]
extern crate tracing;

pub mod boot;
pub mod config;
pub mod error;
pub mod fsck;
pub mod handler;
pub mod header;
pub mod index;
pub mod log_file;
pub mod naming;
pub mod quota;
pub mod record;
pub mod transport;
pub mod trim;

pub use config::{MdLogConfig, MdLogConfigBuilder};
pub use error::{FmdError, Result};
pub use handler::Handler;
pub use record::Fmd;
