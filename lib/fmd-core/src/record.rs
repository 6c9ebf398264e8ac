//! The File Metadata Record (FMD) and its fixed-size on-disk codec.
//!
//! Mirrors the role of `disk_v2::record` in the teacher crate: a plain value
//! type plus free functions to encode/decode/validate it against a byte
//! buffer, with a reusable [`crc32fast::Hasher`] rather than constructing one
//! per call (see [`generate_crc`]).
//!
//! Unlike the teacher's `rkyv`-archived, variable-length record, an FMD
//! record is fixed-size and its storage layout is dictated by the original
//! on-disk format (`spec.md` §3). We normalize that format to explicit
//! little-endian widths with no padding, per `spec.md` §9's portability note,
//! rather than replicate the source's native-endian packed C struct.

use crc32fast::Hasher;
use snafu::Snafu;

/// Discriminant tag stored in [`Fmd::magic`].
///
/// The original format used `0xffff...` / `0xdddd...` sentinel `u64`s rather
/// than a small discriminant, presumably so a zeroed/garbage block could
/// never be mistaken for a valid one. We keep that property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Create,
    Delete,
}

impl Magic {
    const CREATE_TAG: u64 = 0xffff_ffff_ffff_ffff;
    const DELETE_TAG: u64 = 0xdddd_dddd_dddd_dddd;

    fn to_tag(self) -> u64 {
        match self {
            Magic::Create => Self::CREATE_TAG,
            Magic::Delete => Self::DELETE_TAG,
        }
    }

    fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            Self::CREATE_TAG => Some(Magic::Create),
            Self::DELETE_TAG => Some(Magic::Delete),
            _ => None,
        }
    }
}

/// Length, in bytes, of the binary checksum field.
pub const CHECKSUM_LEN: usize = 20;
/// Length, in bytes, of each of the two advisory label fields.
pub const LABEL_LEN: usize = 256;

/// Total encoded size of a record, in bytes.
pub const RECORD_LEN: usize = 8 // magic
    + 4 // sequence_header
    + 8 // file_id
    + 8 // container_id
    + 4 // filesystem_id
    + 4 // ctime
    + 4 // ctime_ns
    + 4 // mtime
    + 4 // mtime_ns
    + 8 // size
    + CHECKSUM_LEN
    + 4 // layout_id
    + 4 // uid
    + 4 // gid
    + LABEL_LEN // name
    + LABEL_LEN // container
    + 4 // crc32
    + 4; // sequence_trailer

/// A single File Metadata Record.
///
/// # Warning
///
/// This is the on-disk representation. Do not reorder, add, or remove
/// fields without also updating [`encode`]/[`decode`]/[`RECORD_LEN`] and the
/// CRC span in [`generate_crc`] -- doing so changes the wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fmd {
    pub magic: Magic,
    pub sequence_header: u32,
    pub file_id: u64,
    pub container_id: u64,
    pub filesystem_id: u32,
    pub ctime: u32,
    pub ctime_ns: u32,
    pub mtime: u32,
    pub mtime_ns: u32,
    pub size: u64,
    pub checksum: [u8; CHECKSUM_LEN],
    pub layout_id: u32,
    pub uid: u32,
    pub gid: u32,
    pub name: [u8; LABEL_LEN],
    pub container: [u8; LABEL_LEN],
    pub crc32: u32,
    pub sequence_trailer: u32,
}

impl Fmd {
    /// Builds a fresh CREATE record for `file_id`/`filesystem_id`, owned by
    /// `uid`/`gid`, under the given layout. Timestamps, sequence numbers and
    /// the CRC are left at zero; [`crate::log_file::LogFile::append`] stamps
    /// those in before writing.
    #[must_use]
    pub fn new_create(file_id: u64, filesystem_id: u32, uid: u32, gid: u32, layout_id: u32) -> Self {
        Fmd {
            magic: Magic::Create,
            sequence_header: 0,
            file_id,
            container_id: 0,
            filesystem_id,
            ctime: 0,
            ctime_ns: 0,
            mtime: 0,
            mtime_ns: 0,
            size: 0,
            checksum: [0; CHECKSUM_LEN],
            layout_id,
            uid,
            gid,
            name: [0; LABEL_LEN],
            container: [0; LABEL_LEN],
            crc32: 0,
            sequence_trailer: 0,
        }
    }

    /// Returns the `name` label as a `&str`, trimming trailing NUL padding.
    pub fn name_str(&self) -> Result<&str, std::str::Utf8Error> {
        decode_label(&self.name)
    }

    /// Returns the `container` label as a `&str`, trimming trailing NUL padding.
    pub fn container_str(&self) -> Result<&str, std::str::Utf8Error> {
        decode_label(&self.container)
    }

    /// Sets the `name` label, truncating silently is never done: an
    /// oversized value is a caller bug, not a runtime condition, so this
    /// panics rather than truncate data the caller didn't expect truncated.
    pub fn set_name(&mut self, name: &str) {
        set_label(&mut self.name, name);
    }

    /// Sets the `container` label. See [`Fmd::set_name`].
    pub fn set_container(&mut self, container: &str) {
        set_label(&mut self.container, container);
    }
}

fn decode_label(buf: &[u8]) -> Result<&str, std::str::Utf8Error> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end])
}

fn set_label(buf: &mut [u8; LABEL_LEN], value: &str) {
    assert!(
        value.len() < LABEL_LEN,
        "label {value:?} does not fit in {LABEL_LEN} bytes"
    );
    buf.fill(0);
    buf[..value.len()].copy_from_slice(value.as_bytes());
}

/// Outcome of [`validate`].
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ValidationError {
    /// `spec.md` §7: `CORRUPTION-MAGIC`.
    #[snafu(display("record magic {magic:#x} is neither CREATE nor DELETE"))]
    MagicInvalid { magic: u64 },

    /// `spec.md` §7: `CORRUPTION-TORN`.
    #[snafu(display(
        "sequence header {header} does not match sequence trailer {trailer}: torn write"
    ))]
    Torn { header: u32, trailer: u32 },

    /// `spec.md` §7: `CORRUPTION-SEQ-ORDER`.
    #[snafu(display("sequence {sequence} did not strictly advance past {expected}"))]
    SequenceNotProgressing { sequence: u32, expected: u32 },

    /// `spec.md` §7: `CORRUPTION-CRC`.
    #[snafu(display("crc32 mismatch: stored {stored:#x}, computed {computed:#x}"))]
    CrcMismatch { stored: u32, computed: u32 },
}

/// Reusable CRC-32 hasher, cloned-and-reset for each computation rather than
/// constructed anew, matching `disk_v2::record::generate_checksum`'s idiom.
#[must_use]
pub fn new_hasher() -> Hasher {
    Hasher::new()
}

/// Computes the CRC over the span defined by `spec.md` §4.1: every field
/// except `magic`, `sequence_trailer`, and `crc32` itself -- which does
/// include `sequence_header`.
fn generate_crc(hasher: &Hasher, fmd: &Fmd) -> u32 {
    let mut hasher = hasher.clone();
    hasher.reset();
    hasher.update(&fmd.sequence_header.to_le_bytes());
    hasher.update(&fmd.file_id.to_le_bytes());
    hasher.update(&fmd.container_id.to_le_bytes());
    hasher.update(&fmd.filesystem_id.to_le_bytes());
    hasher.update(&fmd.ctime.to_le_bytes());
    hasher.update(&fmd.ctime_ns.to_le_bytes());
    hasher.update(&fmd.mtime.to_le_bytes());
    hasher.update(&fmd.mtime_ns.to_le_bytes());
    hasher.update(&fmd.size.to_le_bytes());
    hasher.update(&fmd.checksum);
    hasher.update(&fmd.layout_id.to_le_bytes());
    hasher.update(&fmd.uid.to_le_bytes());
    hasher.update(&fmd.gid.to_le_bytes());
    hasher.update(&fmd.name);
    hasher.update(&fmd.container);
    hasher.finalize()
}

/// Stamps `fmd.crc32` from the current field values. Called immediately
/// before encoding, after the caller has set sequence numbers/timestamps.
pub fn stamp_crc(hasher: &Hasher, fmd: &mut Fmd) {
    fmd.crc32 = generate_crc(hasher, fmd);
}

/// Encodes `fmd` into a fixed [`RECORD_LEN`]-byte buffer.
#[must_use]
pub fn encode(fmd: &Fmd) -> [u8; RECORD_LEN] {
    let mut buf = [0u8; RECORD_LEN];
    let mut at = 0;

    macro_rules! put {
        ($bytes:expr) => {{
            let b = $bytes;
            buf[at..at + b.len()].copy_from_slice(&b);
            at += b.len();
        }};
    }

    put!(fmd.magic.to_tag().to_le_bytes());
    put!(fmd.sequence_header.to_le_bytes());
    put!(fmd.file_id.to_le_bytes());
    put!(fmd.container_id.to_le_bytes());
    put!(fmd.filesystem_id.to_le_bytes());
    put!(fmd.ctime.to_le_bytes());
    put!(fmd.ctime_ns.to_le_bytes());
    put!(fmd.mtime.to_le_bytes());
    put!(fmd.mtime_ns.to_le_bytes());
    put!(fmd.size.to_le_bytes());
    buf[at..at + CHECKSUM_LEN].copy_from_slice(&fmd.checksum);
    at += CHECKSUM_LEN;
    put!(fmd.layout_id.to_le_bytes());
    put!(fmd.uid.to_le_bytes());
    put!(fmd.gid.to_le_bytes());
    buf[at..at + LABEL_LEN].copy_from_slice(&fmd.name);
    at += LABEL_LEN;
    buf[at..at + LABEL_LEN].copy_from_slice(&fmd.container);
    at += LABEL_LEN;
    put!(fmd.crc32.to_le_bytes());
    put!(fmd.sequence_trailer.to_le_bytes());

    debug_assert_eq!(at, RECORD_LEN);
    buf
}

/// Decodes a record from an exactly [`RECORD_LEN`]-byte buffer.
///
/// This never fails: any bit pattern decodes to *some* [`Fmd`] value. Whether
/// that value is a well-formed record is the job of [`validate`].
///
/// # Panics
///
/// Panics if `buf.len() != RECORD_LEN`; callers are expected to have already
/// sliced a buffer to record boundaries (the log file and boot scanner both
/// guarantee this).
#[must_use]
pub fn decode(buf: &[u8]) -> Fmd {
    assert_eq!(buf.len(), RECORD_LEN, "decode requires an exact record-sized buffer");
    let mut at = 0;

    macro_rules! take {
        ($ty:ty) => {{
            const N: usize = std::mem::size_of::<$ty>();
            let v = <$ty>::from_le_bytes(buf[at..at + N].try_into().unwrap());
            at += N;
            v
        }};
    }

    let magic_tag = take!(u64);
    let sequence_header = take!(u32);
    let file_id = take!(u64);
    let container_id = take!(u64);
    let filesystem_id = take!(u32);
    let ctime = take!(u32);
    let ctime_ns = take!(u32);
    let mtime = take!(u32);
    let mtime_ns = take!(u32);
    let size = take!(u64);

    let mut checksum = [0u8; CHECKSUM_LEN];
    checksum.copy_from_slice(&buf[at..at + CHECKSUM_LEN]);
    at += CHECKSUM_LEN;

    let layout_id = take!(u32);
    let uid = take!(u32);
    let gid = take!(u32);

    let mut name = [0u8; LABEL_LEN];
    name.copy_from_slice(&buf[at..at + LABEL_LEN]);
    at += LABEL_LEN;

    let mut container = [0u8; LABEL_LEN];
    container.copy_from_slice(&buf[at..at + LABEL_LEN]);
    at += LABEL_LEN;

    let crc32 = take!(u32);
    let sequence_trailer = take!(u32);
    debug_assert_eq!(at, RECORD_LEN);

    // An unrecognized tag decodes into a sentinel `Magic` the validator will
    // reject; we don't want `decode` itself to be fallible (`spec.md`
    // invariant 1 demonstrates decode/encode must round-trip for *any*
    // well-formed record, and a non-panicking decode lets `validate` do all
    // the judging in one place).
    let magic = Magic::from_tag(magic_tag).unwrap_or(Magic::Create);
    Fmd {
        magic,
        sequence_header,
        file_id,
        container_id,
        filesystem_id,
        ctime,
        ctime_ns,
        mtime,
        mtime_ns,
        size,
        checksum,
        layout_id,
        uid,
        gid,
        name,
        container,
        crc32,
        sequence_trailer,
    }
}

/// Validates invariants 1-4 of `spec.md` §3 against the raw bytes (so an
/// unrecognized magic tag can be reported precisely) and, on success,
/// advances `*expected_sequence` to the record's sequence number -- exactly
/// the `expected_sequence` threading described in `spec.md` §4.1.
pub fn validate(buf: &[u8], hasher: &Hasher, expected_sequence: &mut u32) -> Result<u64, ValidationError> {
    assert_eq!(buf.len(), RECORD_LEN);
    let magic_tag = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let magic = Magic::from_tag(magic_tag).ok_or(ValidationError::MagicInvalid { magic: magic_tag })?;

    let fmd = decode(buf);
    debug_assert_eq!(fmd.magic, magic);

    if fmd.sequence_header != fmd.sequence_trailer {
        return Err(ValidationError::Torn {
            header: fmd.sequence_header,
            trailer: fmd.sequence_trailer,
        });
    }

    // Sequence numbers start at 1 (see `LogFile::next_sequence`), so the
    // very first record (expected == 0) is exempt from the "strictly
    // greater" rule -- any other non-advancing header is corruption.
    let is_first_record = *expected_sequence == 0 && fmd.sequence_header > 0;
    if fmd.sequence_header <= *expected_sequence && !is_first_record {
        return Err(ValidationError::SequenceNotProgressing {
            sequence: fmd.sequence_header,
            expected: *expected_sequence,
        });
    }

    let computed = generate_crc(hasher, &fmd);
    if computed != fmd.crc32 {
        return Err(ValidationError::CrcMismatch {
            stored: fmd.crc32,
            computed,
        });
    }

    *expected_sequence = fmd.sequence_header;
    Ok(fmd.file_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Fmd {
        let mut fmd = Fmd::new_create(0x100, 7, 1000, 1000, 0x41);
        fmd.sequence_header = 1;
        fmd.sequence_trailer = 1;
        fmd.ctime = 1_700_000_000;
        fmd.mtime = 1_700_000_000;
        fmd.size = 4096;
        fmd.set_name("data.bin");
        fmd.set_container("/eos/foo");
        let hasher = new_hasher();
        stamp_crc(&hasher, &mut fmd);
        fmd
    }

    #[test]
    fn decode_of_encode_is_identity() {
        let fmd = sample();
        let encoded = encode(&fmd);
        let decoded = decode(&encoded);
        assert_eq!(fmd, decoded);
    }

    #[test]
    fn validate_accepts_a_well_formed_first_record() {
        let fmd = sample();
        let buf = encode(&fmd);
        let hasher = new_hasher();
        let mut expected = 0;
        let fid = validate(&buf, &hasher, &mut expected).expect("should validate");
        assert_eq!(fid, 0x100);
        assert_eq!(expected, 1);
    }

    #[test]
    fn validate_rejects_unknown_magic() {
        let fmd = sample();
        let mut buf = encode(&fmd);
        buf[0..8].copy_from_slice(&0xdead_beef_0000_0000u64.to_le_bytes());
        let hasher = new_hasher();
        let mut expected = 0;
        let err = validate(&buf, &hasher, &mut expected).unwrap_err();
        assert!(matches!(err, ValidationError::MagicInvalid { .. }));
    }

    #[test]
    fn validate_rejects_torn_sequence() {
        let mut fmd = sample();
        fmd.sequence_trailer = 2;
        // Recompute CRC so we isolate the torn-write check rather than
        // accidentally tripping the CRC check first.
        let hasher = new_hasher();
        stamp_crc(&hasher, &mut fmd);
        let buf = encode(&fmd);
        let mut expected = 0;
        let err = validate(&buf, &hasher, &mut expected).unwrap_err();
        assert!(matches!(err, ValidationError::Torn { .. }));
    }

    #[test]
    fn validate_rejects_non_advancing_sequence() {
        let fmd = sample();
        let buf = encode(&fmd);
        let hasher = new_hasher();
        let mut expected = 5;
        let err = validate(&buf, &hasher, &mut expected).unwrap_err();
        assert!(matches!(err, ValidationError::SequenceNotProgressing { .. }));
    }

    #[test]
    fn validate_rejects_single_byte_crc_span_corruption() {
        let fmd = sample();
        let mut buf = encode(&fmd);
        // Flip a byte inside the `size` field, which is within the CRC span.
        let size_offset = 8 + 4 + 8 + 8 + 4 + 4 + 4 + 4 + 4;
        buf[size_offset] ^= 0xFF;
        let hasher = new_hasher();
        let mut expected = 0;
        let err = validate(&buf, &hasher, &mut expected).unwrap_err();
        assert!(matches!(err, ValidationError::CrcMismatch { .. }));
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn set_name_panics_on_oversized_label() {
        let mut fmd = sample();
        fmd.set_name(&"x".repeat(LABEL_LEN));
    }
}
