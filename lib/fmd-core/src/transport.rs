//! Text transport form for a single FMD record (`spec.md` §6): a
//! URL-query-string-style key/value encoding used to carry a record over
//! text protocols (the fsck tool's catalog dump, boot/quota messages).
//!
//! The original `FmdToEnv`/`EnvToFmd` joined fields with bare `&` and wrote
//! `name`/`container` unescaped, so a label containing `&` or `=` silently
//! corrupted the message. `spec.md` §9 calls this out as fragile and asks a
//! reimplementer to URL-escape values and reject non-UTF-8/oversized
//! strings; both fixes live here.

use base64::Engine;
use fmd_common::{parse_required, FieldParseError};
use snafu::Snafu;
use std::collections::HashMap;

use crate::record::{Fmd, Magic, CHECKSUM_LEN, LABEL_LEN};

const KEY_MAGIC: &str = "mgm.fmd.magic";
const KEY_SEQUENCE_HEADER: &str = "mgm.fmd.sequenceheader";
const KEY_FID: &str = "mgm.fmd.fid";
const KEY_CID: &str = "mgm.fmd.cid";
const KEY_FSID: &str = "mgm.fmd.fsid";
const KEY_CTIME: &str = "mgm.fmd.ctime";
const KEY_CTIME_NS: &str = "mgm.fmd.ctime_ns";
const KEY_MTIME: &str = "mgm.fmd.mtime";
const KEY_MTIME_NS: &str = "mgm.fmd.mtime_ns";
const KEY_SIZE: &str = "mgm.fmd.size";
const KEY_CHECKSUM64: &str = "mgm.fmd.checksum64";
const KEY_LID: &str = "mgm.fmd.lid";
const KEY_UID: &str = "mgm.fmd.uid";
const KEY_GID: &str = "mgm.fmd.gid";
const KEY_NAME: &str = "mgm.fmd.name";
const KEY_CONTAINER: &str = "mgm.fmd.container";
const KEY_CRC32: &str = "mgm.fmd.crc32";
const KEY_SEQUENCE_TRAILER: &str = "mgm.fmd.sequencetrailer";

#[derive(Debug, Snafu)]
pub enum DecodeError {
    #[snafu(display("{source}"))]
    Field {
        #[snafu(context(false))]
        source: FieldParseError,
    },

    #[snafu(display("mgm.fmd.magic value {value} is neither CREATE nor DELETE"))]
    UnknownMagic { value: u64 },

    #[snafu(display("mgm.fmd.checksum64 is not valid base64: {source}"))]
    BadChecksumEncoding { source: base64::DecodeError },

    #[snafu(display("mgm.fmd.checksum64 decodes to {len} bytes, expected {CHECKSUM_LEN}"))]
    ChecksumWrongLength { len: usize },
}

/// Serializes `fmd` into the `key=value&key=value&...` transport form,
/// percent-escaping `name`/`container` so a label containing `&`, `=`, or
/// non-ASCII bytes cannot corrupt the surrounding message.
#[must_use]
pub fn fmd_to_env(fmd: &Fmd) -> String {
    let magic_tag: u64 = match fmd.magic {
        Magic::Create => 0,
        Magic::Delete => 1,
    };
    let name = fmd.name_str().unwrap_or_default();
    let container = fmd.container_str().unwrap_or_default();
    let checksum64 = base64::engine::general_purpose::STANDARD.encode(fmd.checksum);

    let pairs = [
        (KEY_MAGIC, magic_tag.to_string()),
        (KEY_SEQUENCE_HEADER, fmd.sequence_header.to_string()),
        (KEY_FID, fmd.file_id.to_string()),
        (KEY_CID, fmd.container_id.to_string()),
        (KEY_FSID, fmd.filesystem_id.to_string()),
        (KEY_CTIME, fmd.ctime.to_string()),
        (KEY_CTIME_NS, fmd.ctime_ns.to_string()),
        (KEY_MTIME, fmd.mtime.to_string()),
        (KEY_MTIME_NS, fmd.mtime_ns.to_string()),
        (KEY_SIZE, fmd.size.to_string()),
        (KEY_CHECKSUM64, checksum64),
        (KEY_LID, fmd.layout_id.to_string()),
        (KEY_UID, fmd.uid.to_string()),
        (KEY_GID, fmd.gid.to_string()),
        (KEY_NAME, percent_encode(name)),
        (KEY_CONTAINER, percent_encode(container)),
        (KEY_CRC32, fmd.crc32.to_string()),
        (KEY_SEQUENCE_TRAILER, fmd.sequence_trailer.to_string()),
    ];

    pairs
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Parses the transport form produced by [`fmd_to_env`] back into an
/// [`Fmd`]. Every key is required; a missing key, an unparseable value, a
/// non-UTF-8 or oversized label, or malformed base64 is a decode failure
/// (`spec.md` §7: `DECODE-FAILED`).
pub fn env_to_fmd(env: &str) -> Result<Fmd, DecodeError> {
    let map = parse_query_string(env);

    let magic_tag: u64 = parse_required(&map, KEY_MAGIC)?;
    let magic = match magic_tag {
        0 => Magic::Create,
        1 => Magic::Delete,
        other => return Err(DecodeError::UnknownMagic { value: other }),
    };

    let checksum64: String = parse_required(&map, KEY_CHECKSUM64)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(checksum64.as_bytes())
        .map_err(|source| DecodeError::BadChecksumEncoding { source })?;
    if decoded.len() != CHECKSUM_LEN {
        return Err(DecodeError::ChecksumWrongLength { len: decoded.len() });
    }
    let mut checksum = [0u8; CHECKSUM_LEN];
    checksum.copy_from_slice(&decoded);

    let name_raw: String = parse_required(&map, KEY_NAME)?;
    let container_raw: String = parse_required(&map, KEY_CONTAINER)?;
    let name = percent_decode(&name_raw).map_err(|_| FieldParseError::NotUtf8 { key: KEY_NAME })?;
    let container =
        percent_decode(&container_raw).map_err(|_| FieldParseError::NotUtf8 { key: KEY_CONTAINER })?;
    if name.len() >= LABEL_LEN {
        return Err(FieldParseError::StringTooLong {
            key: KEY_NAME,
            len: name.len(),
            max: LABEL_LEN - 1,
        }
        .into());
    }
    if container.len() >= LABEL_LEN {
        return Err(FieldParseError::StringTooLong {
            key: KEY_CONTAINER,
            len: container.len(),
            max: LABEL_LEN - 1,
        }
        .into());
    }

    let mut fmd = Fmd {
        magic,
        sequence_header: parse_required(&map, KEY_SEQUENCE_HEADER)?,
        file_id: parse_required(&map, KEY_FID)?,
        container_id: parse_required(&map, KEY_CID)?,
        filesystem_id: parse_required(&map, KEY_FSID)?,
        ctime: parse_required(&map, KEY_CTIME)?,
        ctime_ns: parse_required(&map, KEY_CTIME_NS)?,
        mtime: parse_required(&map, KEY_MTIME)?,
        mtime_ns: parse_required(&map, KEY_MTIME_NS)?,
        size: parse_required(&map, KEY_SIZE)?,
        checksum,
        layout_id: parse_required(&map, KEY_LID)?,
        uid: parse_required(&map, KEY_UID)?,
        gid: parse_required(&map, KEY_GID)?,
        name: [0; LABEL_LEN],
        container: [0; LABEL_LEN],
        crc32: parse_required(&map, KEY_CRC32)?,
        sequence_trailer: parse_required(&map, KEY_SEQUENCE_TRAILER)?,
    };
    fmd.set_name(&name);
    fmd.set_container(&container);
    Ok(fmd)
}

fn parse_query_string(s: &str) -> HashMap<String, String> {
    s.split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Minimal percent-encoding: escapes everything outside an unreserved ASCII
/// set, so `&`, `=`, and raw non-ASCII bytes can never appear literally.
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn percent_decode(s: &str) -> Result<String, std::string::FromUtf8Error> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Fmd {
        let mut fmd = Fmd::new_create(0x100, 7, 1000, 1000, 0x41);
        fmd.sequence_header = 3;
        fmd.sequence_trailer = 3;
        fmd.ctime = 1_700_000_000;
        fmd.size = 4096;
        fmd.checksum = [7u8; CHECKSUM_LEN];
        fmd.crc32 = 0xdead_beef;
        fmd.set_name("data.bin");
        fmd.set_container("/eos/foo");
        fmd
    }

    #[test]
    fn round_trips_through_env_form() {
        let fmd = sample();
        let env = fmd_to_env(&fmd);
        let parsed = env_to_fmd(&env).unwrap();
        assert_eq!(fmd, parsed);
    }

    #[test]
    fn labels_containing_ampersand_and_equals_survive_round_trip() {
        let mut fmd = sample();
        fmd.set_name("weird&name=value");
        let env = fmd_to_env(&fmd);
        let parsed = env_to_fmd(&env).unwrap();
        assert_eq!(parsed.name_str().unwrap(), "weird&name=value");
    }

    #[test]
    fn missing_key_is_a_decode_error() {
        let fmd = sample();
        let env = fmd_to_env(&fmd);
        let truncated = env.replace(&format!("{KEY_CRC32}={}", fmd.crc32), "");
        let err = env_to_fmd(&truncated).unwrap_err();
        assert!(matches!(err, DecodeError::Field { .. }));
    }

    #[test]
    fn malformed_base64_checksum_is_a_decode_error() {
        let fmd = sample();
        let env = fmd_to_env(&fmd).replace(
            &format!("{KEY_CHECKSUM64}={}", base64::engine::general_purpose::STANDARD.encode(fmd.checksum)),
            &format!("{KEY_CHECKSUM64}=not-valid-base64!!"),
        );
        let err = env_to_fmd(&env).unwrap_err();
        assert!(matches!(err, DecodeError::BadChecksumEncoding { .. }));
    }

    #[test]
    fn oversized_label_is_rejected_on_decode() {
        let fmd = sample();
        let env = fmd_to_env(&fmd);
        let oversized = format!("{KEY_NAME}={}", percent_encode(&"a".repeat(LABEL_LEN)));
        let env = env.replace(&format!("{KEY_NAME}={}", percent_encode("data.bin")), &oversized);
        let err = env_to_fmd(&env).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Field {
                source: FieldParseError::StringTooLong { .. }
            }
        ));
    }
}
