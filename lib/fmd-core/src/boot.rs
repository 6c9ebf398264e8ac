//! Boot-time / attach-time log scan: memory-map the file, walk every
//! record, validate it, and rebuild the [`Index`] and
//! [`QuotaAccumulators`] (`spec.md` §4.6).
//!
//! Grounded on `XrdCommonFmd::ReadChangeLogHash`'s mmap-and-walk loop, with
//! the same tolerance for intra-file corruption: a bad record is logged and
//! skipped rather than aborting the scan, so the surviving records stay
//! usable.

use memmap2::Mmap;
use snafu::Snafu;
use tracing::{instrument, warn};

use crate::header::{Header, HeaderError, HEADER_LEN};
use crate::index::Index;
use crate::quota::QuotaAccumulators;
use crate::record::{self, new_hasher, Magic, RECORD_LEN};

/// A single record's failure during boot scan, reported but not fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFailure {
    pub offset: u64,
    pub reason: String,
}

/// Outcome of a boot scan.
#[derive(Debug)]
pub struct BootReport {
    pub header: Header,
    /// Highest sequence number observed; the handler resumes numbering
    /// from `highest_sequence + 1`.
    pub highest_sequence: u32,
    pub records_scanned: u64,
    pub failures: Vec<ScanFailure>,
}

impl BootReport {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Snafu)]
pub enum BootError {
    #[snafu(display("failed to read log header: {source}"))]
    Header {
        #[snafu(context(false))]
        source: HeaderError,
    },

    #[snafu(display("failed to stat log file: {source}"))]
    Stat { source: std::io::Error },

    #[snafu(display(
        "log file is {len} bytes, exceeding the {cap} byte memory-map cap; trim required before attach"
    ))]
    SizeLimitExceeded { len: u64, cap: u64 },

    #[snafu(display("failed to mmap log file: {source}"))]
    Mmap { source: std::io::Error },
}

/// Scans `file` (already positioned irrelevant -- this reads by `fd`
/// directly) for `filesystem_id`, repopulating `index` and `quota` with the
/// live state the log encodes.
///
/// `boot_scan_chunk_bytes` is the memory-map cap from `spec.md` §9's
/// "expose it" instruction: a log larger than this is rejected rather than
/// mapped, so an operator must trim first.
///
/// `force` tolerates a header format-version mismatch instead of rejecting
/// it outright, the way `fmd-fsck -f` asks to read a log even if its
/// declared version doesn't match this build (`spec.md` §6); it has no
/// effect on per-record CRC validation, which stays strict regardless.
#[instrument(skip(file, index, quota), fields(filesystem_id))]
pub fn scan(
    file: &std::fs::File,
    filesystem_id: u32,
    boot_scan_chunk_bytes: u64,
    index: &mut Index,
    quota: &mut QuotaAccumulators,
    force: bool,
) -> Result<BootReport, BootError> {
    let metadata = file.metadata().context(StatSnafu)?;
    let len = metadata.len();

    let mut header_buf = [0u8; HEADER_LEN];
    {
        use std::io::Read;
        let mut reader = file.try_clone().context(StatSnafu)?;
        reader.read_exact(&mut header_buf).map_err(|source| {
            // A short read on the header is itself a header-shaped failure;
            // surface it through the same HeaderError path decode() would
            // take on a truncated buffer.
            let _ = source;
            BootError::Header {
                source: HeaderError::Truncated { len: len as usize },
            }
        })?;
    }
    let header = Header::decode(&header_buf, force)?;

    index.clear_filesystem(filesystem_id);
    quota.clear_filesystem(filesystem_id);
    quota.init_root_entries(filesystem_id);

    if len <= HEADER_LEN as u64 {
        return Ok(BootReport {
            header,
            highest_sequence: 0,
            records_scanned: 0,
            failures: Vec::new(),
        });
    }

    if len > boot_scan_chunk_bytes {
        return Err(BootError::SizeLimitExceeded {
            len,
            cap: boot_scan_chunk_bytes,
        });
    }

    // Safety: the file is owned by the handler for the scan's duration and
    // is not truncated concurrently (the handler mutex is held by the only
    // caller, `SetChangeLogFile`).
    let mmap = unsafe { Mmap::map(file) }.context(MmapSnafu)?;

    let hasher = new_hasher();
    let mut expected_sequence = 0u32;
    let mut failures = Vec::new();
    let mut records_scanned = 0u64;
    let mut highest_sequence = 0u32;

    let mut offset = HEADER_LEN as u64;
    while offset + RECORD_LEN as u64 <= len {
        let buf = &mmap[offset as usize..offset as usize + RECORD_LEN];
        records_scanned += 1;

        // `validate` mutates `expected_sequence` only on success; on
        // failure we keep walking using the previous `expected_sequence`,
        // matching the source's tolerance for intra-file corruption.
        let mut probe_sequence = expected_sequence;
        match record::validate(buf, &hasher, &mut probe_sequence) {
            Ok(file_id) => {
                expected_sequence = probe_sequence;
                highest_sequence = highest_sequence.max(expected_sequence);
                let fmd = record::decode(buf);
                apply_record(index, quota, filesystem_id, file_id, &fmd);
            }
            Err(err) => {
                warn!(offset, %err, "boot scan: record failed validation");
                failures.push(ScanFailure {
                    offset,
                    reason: err.to_string(),
                });
            }
        }

        offset += RECORD_LEN as u64;
    }

    Ok(BootReport {
        header,
        highest_sequence,
        records_scanned,
        failures,
    })
}

fn apply_record(
    index: &mut Index,
    quota: &mut QuotaAccumulators,
    filesystem_id: u32,
    file_id: u64,
    fmd: &record::Fmd,
) {
    let key = (filesystem_id, file_id);
    match fmd.magic {
        Magic::Create => {
            if let Some(previous_size) = index.get_size(key) {
                // A later overwrite of the same fid: undo the previously
                // counted size before applying the new one, so a log with
                // multiple overwrites of one file still nets to the
                // correct final counters.
                quota.on_delete(filesystem_id, fmd.uid, fmd.gid, previous_size);
            }
            quota.on_create(filesystem_id, fmd.uid, fmd.gid, fmd.size);
            index.insert(key, 0, fmd.size);
        }
        Magic::Delete => {
            if let Some(last_size) = index.get_size(key) {
                quota.on_delete(filesystem_id, fmd.uid, fmd.gid, last_size);
            }
            index.remove(key);
        }
    }
}

use snafu::ResultExt;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_file::LogFile;
    use tempfile::tempdir;

    #[test]
    fn empty_log_scans_to_empty_index_and_zero_quota() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fmd.1.0007.mdlog");
        let log = LogFile::open_or_create(&path, 7, 1).unwrap();
        let file = std::fs::File::open(log.path()).unwrap();

        let mut index = Index::new();
        let mut quota = QuotaAccumulators::new();
        let report = scan(&file, 7, 1 << 30, &mut index, &mut quota, false).unwrap();

        assert!(report.succeeded());
        assert_eq!(report.highest_sequence, 0);
        assert!(index.is_empty());
        assert_eq!(quota.user_counters(7, 0), crate::quota::QuotaCounters::default());
    }

    #[test]
    fn scan_rebuilds_index_and_quota_after_create_overwrite_delete() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fmd.1.0007.mdlog");
        let mut log = LogFile::open_or_create(&path, 7, 1).unwrap();

        let mut created = crate::record::Fmd::new_create(0x100, 7, 1000, 1000, 0x41);
        created.size = 0;
        log.append(&mut created).unwrap();

        let mut committed = created.clone();
        committed.size = 1024;
        log.append(&mut committed).unwrap();

        let mut deleted = committed.clone();
        crate::log_file::mark_deleted(&mut deleted);
        log.append(&mut deleted).unwrap();

        let file = std::fs::File::open(log.path()).unwrap();
        let mut index = Index::new();
        let mut quota = QuotaAccumulators::new();
        let report = scan(&file, 7, 1 << 30, &mut index, &mut quota, false).unwrap();

        assert!(report.succeeded());
        assert_eq!(report.highest_sequence, 3);
        assert!(!index.contains((7, 0x100)));
        assert_eq!(quota.user_counters(7, 1000), crate::quota::QuotaCounters::default());
    }

    #[test]
    fn scan_reports_a_single_corrupted_record_but_still_indexes_the_rest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fmd.1.0007.mdlog");
        let mut log = LogFile::open_or_create(&path, 7, 1).unwrap();

        let mut a = crate::record::Fmd::new_create(1, 7, 1000, 1000, 0);
        a.size = 10;
        log.append(&mut a).unwrap();
        let mut b = crate::record::Fmd::new_create(2, 7, 1000, 1000, 0);
        b.size = 20;
        log.append(&mut b).unwrap();

        // Flip a byte inside record `a`'s CRC span (well within the header
        // + first record).
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = std::fs::OpenOptions::new().write(true).open(log.path()).unwrap();
            f.seek(SeekFrom::Start(HEADER_LEN as u64 + 40)).unwrap();
            f.write_all(&[0xFF]).unwrap();
        }

        let file = std::fs::File::open(log.path()).unwrap();
        let mut index = Index::new();
        let mut quota = QuotaAccumulators::new();
        let report = scan(&file, 7, 1 << 30, &mut index, &mut quota, false).unwrap();

        assert!(!report.succeeded());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].offset, HEADER_LEN as u64);
        assert!(index.contains((7, 2)));
    }

    #[test]
    fn scan_rejects_a_log_over_the_configured_cap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fmd.1.0007.mdlog");
        let mut log = LogFile::open_or_create(&path, 7, 1).unwrap();
        let mut a = crate::record::Fmd::new_create(1, 7, 1000, 1000, 0);
        log.append(&mut a).unwrap();

        let file = std::fs::File::open(log.path()).unwrap();
        let mut index = Index::new();
        let mut quota = QuotaAccumulators::new();
        let err = scan(&file, 7, 1, &mut index, &mut quota, false).unwrap_err();
        assert!(matches!(err, BootError::SizeLimitExceeded { .. }));
    }
}
