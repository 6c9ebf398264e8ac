//! The per-filesystem append-only change-log file.
//!
//! Grounded on `XrdCommonFmdHandler::SetChangeLogFile`/`XrdCommonFmd::Write`:
//! a 0600 file carrying one [`Header`] followed by packed
//! [`Fmd`](crate::record::Fmd) records, opened as a read/write descriptor
//! pair the way the source keeps a separate `fileno`/`fileread` pair so a
//! concurrent trim copy doesn't fight the foreground position.

use snafu::ResultExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::header::{Header, HeaderError, HEADER_LEN};
use crate::record::{encode, new_hasher, stamp_crc, Fmd, Magic, RECORD_LEN};

/// File mode the log file is created with: owner read/write only, matching
/// `XrdCommonFmdHandler::SetChangeLogFile`'s `chmod(fd,S_IRUSR|S_IWUSR)`.
const CREATE_MODE: u32 = 0o600;

/// An open change-log file: a write descriptor positioned at end-of-file
/// and a duplicate read descriptor used for positional reads so the write
/// cursor is never disturbed by lookups.
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    write_fd: File,
    read_fd: File,
    pub header: Header,
    next_sequence: u32,
}

#[derive(Debug, snafu::Snafu)]
pub enum OpenError {
    #[snafu(display("failed to open {}: {source}", path.display()))]
    Io { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to read header of {}: {source}", path.display()))]
    Header { path: PathBuf, source: HeaderError },
}

impl LogFile {
    /// Opens `path` if it exists and verifies its header, or creates it with
    /// mode 0600 and writes a fresh header stamped with `filesystem_id`.
    ///
    /// `now` is injected rather than read from the clock so boot/trim/test
    /// code can supply a deterministic value -- the handler is the only
    /// caller that reaches for the wall clock.
    pub fn open_or_create(path: impl AsRef<Path>, filesystem_id: u32, now: u64) -> Result<Self, OpenError> {
        Self::open_or_create_forcing(path, filesystem_id, now, false)
    }

    /// As [`LogFile::open_or_create`], but when `force` is `true` a
    /// format-version mismatch in an existing file's header is tolerated
    /// instead of rejected (`fmd-fsck -f`, `spec.md` §6).
    pub fn open_or_create_forcing(
        path: impl AsRef<Path>,
        filesystem_id: u32,
        now: u64,
        force: bool,
    ) -> Result<Self, OpenError> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();

        let write_fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(CREATE_MODE)
            .open(&path)
            .with_context(|_| IoSnafu { path: path.clone() })?;

        let mut read_fd = OpenOptions::new()
            .read(true)
            .open(&path)
            .with_context(|_| IoSnafu { path: path.clone() })?;

        let header = if existed {
            let mut buf = vec![0u8; HEADER_LEN];
            read_fd
                .read_exact(&mut buf)
                .with_context(|_| IoSnafu { path: path.clone() })?;
            Header::decode(&buf, force).with_context(|_| HeaderSnafu { path: path.clone() })?
        } else {
            let header = Header::new(filesystem_id, now);
            let mut write_fd = &write_fd;
            write_fd
                .write_all(&header.encode())
                .with_context(|_| IoSnafu { path: path.clone() })?;
            header
        };

        let mut write_fd = write_fd;
        write_fd
            .seek(SeekFrom::End(0))
            .with_context(|_| IoSnafu { path: path.clone() })?;

        Ok(LogFile {
            path,
            write_fd,
            read_fd,
            header,
            next_sequence: 1,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sets the sequence number the next [`LogFile::append`] will stamp,
    /// used by the boot scanner to resume after the highest sequence it saw.
    pub fn set_next_sequence(&mut self, next_sequence: u32) {
        self.next_sequence = next_sequence;
    }

    #[must_use]
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    /// Current size of the underlying file, header included.
    pub fn len(&self) -> std::io::Result<u64> {
        Ok(self.write_fd.metadata()?.len())
    }

    #[must_use]
    pub fn is_empty_of_records(&self) -> bool {
        self.len().map(|len| len <= HEADER_LEN as u64).unwrap_or(false)
    }

    /// Stamps sequence numbers and CRC, appends `fmd` as a single block, and
    /// returns the pre-write byte offset -- the value stored in the index.
    ///
    /// A short write is treated as fatal for the filesystem, per `spec.md`
    /// §4.2; the caller (the handler) is responsible for marking the
    /// filesystem unavailable when this returns `Err`.
    pub fn append(&mut self, fmd: &mut Fmd) -> std::io::Result<u64> {
        let offset = self.write_fd.stream_position()?;
        fmd.sequence_header = self.next_sequence;
        fmd.sequence_trailer = self.next_sequence;
        let hasher = new_hasher();
        stamp_crc(&hasher, fmd);

        let buf = encode(fmd);
        self.write_fd.write_all(&buf)?;
        self.write_fd.flush()?;
        self.next_sequence += 1;
        Ok(offset)
    }

    /// Positional read of exactly one record at `offset`.
    ///
    /// A short read here is fatal corruption (`spec.md` §4.2): the caller
    /// asked for a record the index claims exists.
    pub fn read_at(&mut self, offset: u64) -> std::io::Result<[u8; RECORD_LEN]> {
        self.read_fd.seek(SeekFrom::Start(offset))?;
        let mut buf = [0u8; RECORD_LEN];
        self.read_fd.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Duplicates the read descriptor at its own independent cursor, used by
    /// the trimmer's sequential copy so it never races the foreground
    /// lookup path's `read_at` seeks.
    pub fn duplicate_read_handle(&self) -> std::io::Result<File> {
        self.read_fd.try_clone()
    }
}

/// Tags `fmd` as a DELETE record in place, the way `DeleteFmd` flips the
/// magic before handing the record to `Commit`.
pub fn mark_deleted(fmd: &mut Fmd) {
    fmd.magic = Magic::Delete;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_or_create_makes_a_fresh_file_with_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fmd.1.0007.mdlog");
        let log = LogFile::open_or_create(&path, 7, 1_700_000_000).unwrap();
        assert_eq!(log.header.filesystem_id, 7);
        assert!(log.is_empty_of_records());
        assert_eq!(log.len().unwrap(), HEADER_LEN as u64);
    }

    #[test]
    fn reopening_an_existing_file_verifies_the_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fmd.1.0007.mdlog");
        drop(LogFile::open_or_create(&path, 7, 1_700_000_000).unwrap());
        let log = LogFile::open_or_create(&path, 7, 9_999_999).unwrap();
        // Re-opening must not clobber the original creation time.
        assert_eq!(log.header.created_at, 1_700_000_000);
    }

    #[test]
    fn append_returns_increasing_offsets_and_stamps_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fmd.1.0007.mdlog");
        let mut log = LogFile::open_or_create(&path, 7, 1).unwrap();

        let mut a = Fmd::new_create(1, 7, 1000, 1000, 0);
        let off_a = log.append(&mut a).unwrap();
        let mut b = Fmd::new_create(2, 7, 1000, 1000, 0);
        let off_b = log.append(&mut b).unwrap();

        assert_eq!(off_a, HEADER_LEN as u64);
        assert!(off_b > off_a);
        assert_eq!(a.sequence_header, 1);
        assert_eq!(b.sequence_header, 2);
    }

    #[test]
    fn read_at_recovers_the_appended_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fmd.1.0007.mdlog");
        let mut log = LogFile::open_or_create(&path, 7, 1).unwrap();
        let mut a = Fmd::new_create(1, 7, 1000, 1000, 0);
        let offset = log.append(&mut a).unwrap();

        let buf = log.read_at(offset).unwrap();
        let roundtrip = crate::record::decode(&buf);
        assert_eq!(roundtrip.file_id, 1);
        assert_eq!(roundtrip.sequence_header, 1);
    }
}
