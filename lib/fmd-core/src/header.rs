//! The change-log file header: the fixed block written once, at file
//! creation, before the first record.
//!
//! Grounded on `XrdCommonFmd::Write`/`Read`'s own header dance: a magic
//! value, a version tag, the file's creation time, and the owning
//! filesystem id -- normalized to explicit little-endian widths per
//! `spec.md` §9 instead of the source's packed native-endian struct.

use snafu::Snafu;

/// Tag identifying this as an FMD change-log file (as opposed to any other
/// file that might share its directory).
const HEADER_MAGIC: u64 = 0x464d_445f_4c4f_4721; // "FMD_LOG!" in ASCII, packed.

/// Version of the on-disk format this binary writes and expects to read.
/// Bumped only if [`RECORD_LEN`](crate::record::RECORD_LEN) or the header
/// layout changes.
const FORMAT_VERSION: u32 = 1;

/// Encoded size of [`Header`], in bytes.
pub const HEADER_LEN: usize = 8 // magic
    + 4 // format_version
    + 8 // created_at (unix seconds)
    + 4; // filesystem_id

/// The header block at offset 0 of every change-log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub format_version: u32,
    pub created_at: u64,
    pub filesystem_id: u32,
}

impl Header {
    #[must_use]
    pub fn new(filesystem_id: u32, created_at: u64) -> Self {
        Header {
            format_version: FORMAT_VERSION,
            created_at,
            filesystem_id,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..8].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&self.format_version.to_le_bytes());
        buf[12..20].copy_from_slice(&self.created_at.to_le_bytes());
        buf[20..24].copy_from_slice(&self.filesystem_id.to_le_bytes());
        buf
    }

    /// Decodes the header block. A magic mismatch or a truncated buffer is
    /// always a hard error; a format-version mismatch is only a hard error
    /// when `force` is `false` -- `fmd-fsck -f` asks to read a log even if
    /// its declared version doesn't match this build (`spec.md` §6).
    pub fn decode(buf: &[u8], force: bool) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_LEN {
            return Err(HeaderError::Truncated { len: buf.len() });
        }
        let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        if magic != HEADER_MAGIC {
            return Err(HeaderError::BadMagic { magic });
        }
        let format_version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if format_version != FORMAT_VERSION && !force {
            return Err(HeaderError::UnsupportedVersion { version: format_version });
        }
        let created_at = u64::from_le_bytes(buf[12..20].try_into().unwrap());
        let filesystem_id = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        Ok(Header {
            format_version,
            created_at,
            filesystem_id,
        })
    }
}

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum HeaderError {
    #[snafu(display("file is {len} bytes, too short to hold a {HEADER_LEN}-byte header"))]
    Truncated { len: usize },

    #[snafu(display("header magic {magic:#x} does not match an FMD change-log file"))]
    BadMagic { magic: u64 },

    #[snafu(display("header declares format version {version}, this build supports {FORMAT_VERSION}"))]
    UnsupportedVersion { version: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_of_encode_is_identity() {
        let header = Header::new(7, 1_700_000_000);
        let buf = header.encode();
        assert_eq!(Header::decode(&buf, false).unwrap(), header);
    }

    #[test]
    fn decode_rejects_wrong_magic() {
        let mut buf = Header::new(7, 1).encode();
        buf[0] ^= 0xFF;
        let err = Header::decode(&buf, false).unwrap_err();
        assert!(matches!(err, HeaderError::BadMagic { .. }));
    }

    #[test]
    fn decode_rejects_wrong_magic_even_with_force() {
        let mut buf = Header::new(7, 1).encode();
        buf[0] ^= 0xFF;
        let err = Header::decode(&buf, true).unwrap_err();
        assert!(matches!(err, HeaderError::BadMagic { .. }));
    }

    #[test]
    fn decode_rejects_truncated_buffer() {
        let err = Header::decode(&[0u8; 4], false).unwrap_err();
        assert!(matches!(err, HeaderError::Truncated { len: 4 }));
    }

    #[test]
    fn decode_rejects_future_format_version() {
        let mut buf = Header::new(7, 1).encode();
        buf[8..12].copy_from_slice(&99u32.to_le_bytes());
        let err = Header::decode(&buf, false).unwrap_err();
        assert!(matches!(err, HeaderError::UnsupportedVersion { version: 99 }));
    }

    #[test]
    fn decode_tolerates_future_format_version_when_forced() {
        let mut buf = Header::new(7, 1).encode();
        buf[8..12].copy_from_slice(&99u32.to_le_bytes());
        let header = Header::decode(&buf, true).unwrap();
        assert_eq!(header.format_version, 99);
    }
}
