//! The process-wide Handler: the single entry point serializing all
//! mutations behind one coarse mutex (`spec.md` §4.5, §5).
//!
//! Grounded on the teacher's `Ledger<FS>` in spirit (one struct owning the
//! durable state plus the bookkeeping needed to mutate it safely) but
//! deliberately NOT on its async/`tokio` machinery: `spec.md` §5 specifies a
//! synchronous, single-mutex model, so this uses `parking_lot::Mutex`
//! around a plain blocking-I/O `HandlerState` instead of an async lock
//! around non-blocking I/O.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

use crate::boot::{self, BootReport};
use crate::error::FmdError;
use crate::index::Index;
use crate::log_file::{mark_deleted, LogFile};
use crate::naming::{find_latest_log_file, log_file_name};
use crate::quota::{QuotaAccumulators, QuotaCounters};
use crate::record::Fmd;

/// Per-filesystem open state: the log file descriptors plus the next
/// sequence number to assign, threaded through from the boot scan.
struct AttachedFilesystem {
    log: LogFile,
}

/// The mutable state behind the handler's mutex.
#[derive(Default)]
struct HandlerState {
    filesystems: HashMap<u32, AttachedFilesystem>,
    index: Index,
    quota: QuotaAccumulators,
}

/// The process-wide FMD handler.
///
/// A real process constructs exactly one [`Handler`] and shares it (e.g.
/// behind an `Arc`) across the threads that call `GetFmd`/`Commit`/
/// `DeleteFmd`; nothing here enforces singleton-ness structurally, the way
/// the source's handler was a bare global -- that enforcement is a
/// deployment convention, not a type-level one.
pub struct Handler {
    state: Mutex<HandlerState>,
    boot_scan_chunk_bytes: u64,
}

impl Handler {
    #[must_use]
    pub fn new(boot_scan_chunk_bytes: u64) -> Self {
        Handler {
            state: Mutex::new(HandlerState::default()),
            boot_scan_chunk_bytes,
        }
    }

    /// Clears all in-memory state. Used in tests (`spec.md` §4.5).
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.filesystems.clear();
        state.index.clear();
        state.quota.clear();
    }

    /// Scans `directory` for the most recently modified change-log file
    /// belonging to `filesystem_id`; if none exists, creates a fresh one.
    /// Always finishes by calling [`Handler::set_change_log_file`].
    #[instrument(skip(self, directory), fields(filesystem_id))]
    pub fn attach_latest_change_log_file(
        &self,
        directory: &Path,
        filesystem_id: u32,
        now: u64,
    ) -> Result<BootReport, FmdError> {
        self.attach_latest_change_log_file_forcing(directory, filesystem_id, now, false)
    }

    /// As [`Handler::attach_latest_change_log_file`], but tolerating a
    /// format-version mismatch in the discovered/created log's header
    /// (`fmd-fsck -f`, `spec.md` §6).
    #[instrument(skip(self, directory), fields(filesystem_id))]
    pub fn attach_latest_change_log_file_forcing(
        &self,
        directory: &Path,
        filesystem_id: u32,
        now: u64,
        force: bool,
    ) -> Result<BootReport, FmdError> {
        let path = find_latest_log_file(directory, filesystem_id).map_err(|source| FmdError::Io {
            path: directory.to_path_buf(),
            source,
        })?;

        let path = match path {
            Some(path) => path,
            None => directory.join(log_file_name(now, filesystem_id)),
        };

        self.set_change_log_file_forcing(&path, filesystem_id, now, force)
    }

    /// Closes any previously open descriptors for `filesystem_id`, opens a
    /// fresh pair at `path`, verifies or stamps the header, runs the boot
    /// scanner, and publishes the new state atomically under the mutex.
    #[instrument(skip(self, path), fields(filesystem_id, path = %path.display()))]
    pub fn set_change_log_file(
        &self,
        path: &Path,
        filesystem_id: u32,
        now: u64,
    ) -> Result<BootReport, FmdError> {
        self.set_change_log_file_forcing(path, filesystem_id, now, false)
    }

    /// As [`Handler::set_change_log_file`], but tolerating a format-version
    /// mismatch in the header instead of rejecting attach outright
    /// (`fmd-fsck -f`, `spec.md` §6). Per-record CRC validation in the boot
    /// scan is unaffected by `force`.
    #[instrument(skip(self, path), fields(filesystem_id, path = %path.display()))]
    pub fn set_change_log_file_forcing(
        &self,
        path: &Path,
        filesystem_id: u32,
        now: u64,
        force: bool,
    ) -> Result<BootReport, FmdError> {
        let mut log = LogFile::open_or_create_forcing(path, filesystem_id, now, force).map_err(|source| match source {
            crate::log_file::OpenError::Io { path, source } => FmdError::Io { path, source },
            crate::log_file::OpenError::Header { path: _, source } => FmdError::Header { source },
        })?;

        // Attach is not a hot path (it happens once per filesystem at
        // startup, or on an explicit re-attach), so the scan runs with the
        // handler mutex held for its whole duration: simpler than
        // stitching together a temporary index/quota pair and merging them
        // in afterwards, and `spec.md` does not require attach to avoid
        // blocking concurrent lookups.
        let mut state = self.state.lock();
        let report = {
            let file = std::fs::File::open(log.path()).map_err(|source| FmdError::Io {
                path: log.path().to_path_buf(),
                source,
            })?;
            boot::scan(
                &file,
                filesystem_id,
                self.boot_scan_chunk_bytes,
                &mut state.index,
                &mut state.quota,
                force,
            )?
        };

        log.set_next_sequence(report.highest_sequence + 1);
        if !report.succeeded() {
            for failure in &report.failures {
                warn!(offset = failure.offset, reason = %failure.reason, "corrupt record found during attach");
            }
        }

        state.filesystems.insert(filesystem_id, AttachedFilesystem { log });
        info!(records = report.records_scanned, failures = report.failures.len(), "attached change log");
        Ok(report)
    }

    /// `GetFmd(fid, fsid, uid, gid, layoutid, writeMode)` (`spec.md` §4.5).
    #[instrument(skip(self))]
    pub fn get_fmd(
        &self,
        file_id: u64,
        filesystem_id: u32,
        uid: u32,
        gid: u32,
        layout_id: u32,
        write_mode: bool,
        now: u64,
    ) -> Result<Option<Fmd>, FmdError> {
        let mut state = self.state.lock();
        if !state.filesystems.contains_key(&filesystem_id) {
            return Err(FmdError::FilesystemNotAttached { filesystem_id });
        }

        if let Some(offset) = state.index.get_offset((filesystem_id, file_id)) {
            let fs = state.filesystems.get_mut(&filesystem_id).unwrap();
            let buf = fs.log.read_at(offset).map_err(|source| FmdError::Io {
                path: fs.log.path().to_path_buf(),
                source,
            })?;
            let fmd = crate::record::decode(&buf);
            debug_assert_eq!(fmd.file_id, file_id);
            debug_assert_eq!(fmd.filesystem_id, filesystem_id);
            return Ok(Some(fmd));
        }

        if !write_mode {
            return Ok(None);
        }

        let mut fmd = Fmd::new_create(file_id, filesystem_id, uid, gid, layout_id);
        fmd.ctime = now as u32;
        fmd.mtime = now as u32;

        let fs = state.filesystems.get_mut(&filesystem_id).unwrap();
        let offset = fs.log.append(&mut fmd).map_err(|source| FmdError::Io {
            path: fs.log.path().to_path_buf(),
            source,
        })?;

        state.index.insert((filesystem_id, file_id), offset, 0);
        state.quota.on_create(filesystem_id, uid, gid, 0);
        Ok(Some(fmd))
    }

    /// `Commit(record)` (`spec.md` §4.5).
    #[instrument(skip(self, fmd))]
    pub fn commit(&self, mut fmd: Fmd, now: u64) -> Result<Fmd, FmdError> {
        let filesystem_id = fmd.filesystem_id;
        let mut state = self.state.lock();
        if !state.filesystems.contains_key(&filesystem_id) {
            return Err(FmdError::FilesystemNotAttached { filesystem_id });
        }

        fmd.mtime = now as u32;
        let key = (filesystem_id, fmd.file_id);
        let old_size = state.index.get_size(key);

        let fs = state.filesystems.get_mut(&filesystem_id).unwrap();
        let offset = fs.log.append(&mut fmd).map_err(|source| FmdError::Io {
            path: fs.log.path().to_path_buf(),
            source,
        })?;

        state.index.insert(key, offset, fmd.size);
        match old_size {
            Some(old_size) => state.quota.on_overwrite(filesystem_id, fmd.uid, fmd.gid, old_size, fmd.size),
            None => state.quota.on_create(filesystem_id, fmd.uid, fmd.gid, fmd.size),
        }
        Ok(fmd)
    }

    /// `DeleteFmd(fid, fsid)` (`spec.md` §4.5). Idempotent: deleting an
    /// absent fid is a successful no-op (`spec.md` §9's Open Question
    /// resolution).
    #[instrument(skip(self))]
    pub fn delete_fmd(&self, file_id: u64, filesystem_id: u32, now: u64) -> Result<(), FmdError> {
        let mut state = self.state.lock();
        if !state.filesystems.contains_key(&filesystem_id) {
            return Err(FmdError::FilesystemNotAttached { filesystem_id });
        }

        let key = (filesystem_id, file_id);
        let Some(offset) = state.index.get_offset(key) else {
            return Ok(());
        };

        let fs = state.filesystems.get_mut(&filesystem_id).unwrap();
        let buf = fs.log.read_at(offset).map_err(|source| FmdError::Io {
            path: fs.log.path().to_path_buf(),
            source,
        })?;
        let mut fmd = crate::record::decode(&buf);
        mark_deleted(&mut fmd);
        fmd.mtime = now as u32;

        fs.log.append(&mut fmd).map_err(|source| FmdError::Io {
            path: fs.log.path().to_path_buf(),
            source,
        })?;

        let last_size = state.index.remove(key).unwrap_or(0);
        state.quota.on_delete(filesystem_id, fmd.uid, fmd.gid, last_size);
        Ok(())
    }

    #[must_use]
    pub fn user_quota(&self, filesystem_id: u32, uid: u32) -> QuotaCounters {
        self.state.lock().quota.user_counters(filesystem_id, uid)
    }

    #[must_use]
    pub fn group_quota(&self, filesystem_id: u32, gid: u32) -> QuotaCounters {
        self.state.lock().quota.group_counters(filesystem_id, gid)
    }

    #[must_use]
    pub fn index_len(&self, filesystem_id: u32) -> usize {
        self.state.lock().index.entries_for_filesystem(filesystem_id).count()
    }

    /// Lists every file id currently indexed for `filesystem_id`, used by
    /// the fsck engine's disk/catalog reconciliation passes. Not on the
    /// hot path, so a `Vec` copy under the lock is fine.
    #[must_use]
    pub fn indexed_file_ids(&self, filesystem_id: u32) -> Vec<u64> {
        self.state
            .lock()
            .index
            .entries_for_filesystem(filesystem_id)
            .map(|(fid, _offset)| fid)
            .collect()
    }

    /// Runs [`crate::trim`]'s full five-phase compaction for `filesystem_id`
    /// and swaps the new descriptors in. The live record copy (Phase 1)
    /// happens without the mutex held; only the snapshot and the tail
    /// capture/swap require it.
    #[instrument(skip(self, directory))]
    pub fn trim(&self, directory: &Path, filesystem_id: u32, now: u64) -> Result<PathBuf, FmdError> {
        use crate::trim::{allocate_new_log, copy_live_records, copy_tail, highest_sequence_in, rebind_index, snapshot};

        let (old_read_fd, snap) = {
            let mut state = self.state.lock();
            let fs = state
                .filesystems
                .get_mut(&filesystem_id)
                .ok_or(FmdError::FilesystemNotAttached { filesystem_id })?;
            let old_len = fs.log.len().map_err(|source| FmdError::Io {
                path: fs.log.path().to_path_buf(),
                source,
            })?;
            let snap = snapshot(&state.index, filesystem_id, old_len);
            let fs = state.filesystems.get(&filesystem_id).unwrap();
            let old_read_fd = fs.log.duplicate_read_handle().map_err(|source| FmdError::Io {
                path: fs.log.path().to_path_buf(),
                source,
            })?;
            (old_read_fd, snap)
        };

        let (new_path, mut new_file) =
            allocate_new_log(directory, filesystem_id, now).map_err(|source| trim_to_fmd_error(source, directory))?;

        let mut old_read_fd = old_read_fd;
        let offset_map = copy_live_records(&mut old_read_fd, &mut new_file, &snap)
            .map_err(|source| trim_to_fmd_error(source, directory))?;

        let old_path = {
            let mut state = self.state.lock();
            let fs = state
                .filesystems
                .get(&filesystem_id)
                .ok_or(FmdError::FilesystemNotAttached { filesystem_id })?;
            let current_len = fs.log.len().map_err(|source| FmdError::Io {
                path: fs.log.path().to_path_buf(),
                source,
            })?;
            let old_path = fs.log.path().to_path_buf();
            let tail = copy_tail(&mut old_read_fd, &mut new_file, &snap, current_len)
                .map_err(|source| trim_to_fmd_error(source, directory))?;
            rebind_index(&mut state.index, filesystem_id, &offset_map, &tail, snap.fence)
                .map_err(|source| trim_to_fmd_error(source, directory))?;

            let highest_sequence = highest_sequence_in(&mut new_file).map_err(|source| trim_to_fmd_error(source, directory))?;
            drop(new_file);

            let mut new_log = LogFile::open_or_create(&new_path, filesystem_id, now).map_err(|source| match source {
                crate::log_file::OpenError::Io { path, source } => FmdError::Io { path, source },
                crate::log_file::OpenError::Header { path: _, source } => FmdError::Header { source },
            })?;
            new_log.set_next_sequence(highest_sequence + 1);
            state.filesystems.insert(filesystem_id, AttachedFilesystem { log: new_log });
            old_path
        };

        info!(old = %old_path.display(), new = %new_path.display(), "trim swapped log descriptors");
        Ok(new_path)
    }
}

fn trim_to_fmd_error(source: crate::trim::TrimError, directory: &Path) -> FmdError {
    match source {
        crate::trim::TrimError::Io { source } => FmdError::Io {
            path: directory.to_path_buf(),
            source,
        },
        other @ crate::trim::TrimError::MissingOffsetMapping { .. } => {
            FmdError::Io {
                path: directory.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_commit_read_scenario() {
        let dir = tempdir().unwrap();
        let handler = Handler::new(1 << 30);
        handler.attach_latest_change_log_file(dir.path(), 7, 1).unwrap();

        let fmd = handler
            .get_fmd(0x100, 7, 1000, 1000, 0x41, true, 2)
            .unwrap()
            .expect("write-mode creates a record");
        assert_eq!(fmd.size, 0);

        let mut to_commit = fmd.clone();
        to_commit.size = 4096;
        handler.commit(to_commit, 3).unwrap();

        let read_back = handler.get_fmd(0x100, 7, 1000, 1000, 0x41, false, 4).unwrap().unwrap();
        assert_eq!(read_back.size, 4096);

        assert_eq!(handler.user_quota(7, 1000).bytes, 4096);
        assert_eq!(handler.user_quota(7, 1000).files, 1);
    }

    #[test]
    fn overwrite_adjusts_bytes_not_counts() {
        let dir = tempdir().unwrap();
        let handler = Handler::new(1 << 30);
        handler.attach_latest_change_log_file(dir.path(), 7, 1).unwrap();
        let fmd = handler.get_fmd(0x100, 7, 1000, 1000, 0x41, true, 2).unwrap().unwrap();

        let mut first = fmd.clone();
        first.size = 4096;
        handler.commit(first, 3).unwrap();

        let mut second = handler.get_fmd(0x100, 7, 1000, 1000, 0x41, false, 4).unwrap().unwrap();
        second.size = 1024;
        handler.commit(second, 5).unwrap();

        assert_eq!(handler.user_quota(7, 1000).bytes, 1024);
        assert_eq!(handler.user_quota(7, 1000).files, 1);
    }

    #[test]
    fn delete_is_tombstoned_and_counted() {
        let dir = tempdir().unwrap();
        let handler = Handler::new(1 << 30);
        handler.attach_latest_change_log_file(dir.path(), 7, 1).unwrap();
        let fmd = handler.get_fmd(0x100, 7, 1000, 1000, 0x41, true, 2).unwrap().unwrap();
        let mut committed = fmd;
        committed.size = 1024;
        handler.commit(committed, 3).unwrap();

        handler.delete_fmd(0x100, 7, 4).unwrap();

        assert!(handler.get_fmd(0x100, 7, 1000, 1000, 0x41, false, 5).unwrap().is_none());
        assert_eq!(handler.user_quota(7, 1000).bytes, 0);
        assert_eq!(handler.user_quota(7, 1000).files, 0);
    }

    #[test]
    fn delete_of_missing_fid_is_a_no_op_success() {
        let dir = tempdir().unwrap();
        let handler = Handler::new(1 << 30);
        handler.attach_latest_change_log_file(dir.path(), 7, 1).unwrap();
        handler.delete_fmd(0xdead, 7, 2).unwrap();
        assert_eq!(handler.index_len(7), 0);
    }

    #[test]
    fn get_fmd_write_mode_on_existing_fid_does_not_rewrite() {
        let dir = tempdir().unwrap();
        let handler = Handler::new(1 << 30);
        handler.attach_latest_change_log_file(dir.path(), 7, 1).unwrap();
        handler.get_fmd(0x100, 7, 1000, 1000, 0x41, true, 2).unwrap();
        let before = handler.index_len(7);
        let again = handler.get_fmd(0x100, 7, 1000, 1000, 0x41, true, 3).unwrap().unwrap();
        assert_eq!(again.size, 0);
        assert_eq!(handler.index_len(7), before);
    }

    #[test]
    fn boot_after_overwrite_and_delete_rebuilds_empty_index() {
        let dir = tempdir().unwrap();
        let handler = Handler::new(1 << 30);
        handler.attach_latest_change_log_file(dir.path(), 7, 1).unwrap();
        let fmd = handler.get_fmd(0x100, 7, 1000, 1000, 0x41, true, 2).unwrap().unwrap();
        let mut committed = fmd;
        committed.size = 1024;
        handler.commit(committed, 3).unwrap();
        handler.delete_fmd(0x100, 7, 4).unwrap();

        handler.reset();
        handler.attach_latest_change_log_file(dir.path(), 7, 5).unwrap();
        assert_eq!(handler.index_len(7), 0);
        assert_eq!(handler.user_quota(7, 1000).bytes, 0);
    }

    #[test]
    fn trim_swaps_log_without_resetting_the_sequence_counter() {
        let dir = tempdir().unwrap();
        let handler = Handler::new(1 << 30);
        handler.attach_latest_change_log_file(dir.path(), 7, 1).unwrap();

        let fmd = handler.get_fmd(0x100, 7, 1000, 1000, 0x41, true, 2).unwrap().unwrap();
        let mut first = fmd.clone();
        first.size = 10;
        handler.commit(first, 3).unwrap();
        let mut second = handler.get_fmd(0x100, 7, 1000, 1000, 0x41, false, 4).unwrap().unwrap();
        second.size = 20;
        handler.commit(second, 5).unwrap();

        // Three records on disk so far (create, overwrite, overwrite); trim
        // keeps only the live one but must not forget the sequence it
        // carries. A post-trim commit should still land on a reopened log
        // whose next sequence number strictly exceeds what was on disk.
        handler.trim(dir.path(), 7, 6).unwrap();

        let mut third = handler.get_fmd(0x100, 7, 1000, 1000, 0x41, false, 7).unwrap().unwrap();
        third.size = 30;
        handler.commit(third, 8).unwrap();

        // A fresh attach re-scans the post-trim-and-commit log from disk; if
        // the swapped-in log had wrongly resumed at sequence 1, the new
        // commit's sequence header would not exceed the trimmed copy's and
        // this boot would surface a `CORRUPTION-SEQ-ORDER` failure.
        handler.reset();
        let report = handler.attach_latest_change_log_file(dir.path(), 7, 9).unwrap();
        assert!(report.succeeded(), "post-trim commit must carry an advancing sequence: {:?}", report.failures);
        assert_eq!(handler.user_quota(7, 1000).bytes, 30);
        assert_eq!(handler.user_quota(7, 1000).files, 1);
    }
}
