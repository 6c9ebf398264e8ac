//! Small helpers shared between `fmd-core` and the `fsck` binary.
//!
//! Kept as a separate crate, the way `vector_common` sits underneath
//! `vector_buffers`, so that the quota-key arithmetic has exactly one
//! implementation shared by the handler, the boot scanner and the fsck tool.

#![deny(clippy::all)]

use snafu::Snafu;

/// Composes the 64-bit quota accumulator key for a filesystem/principal pair.
///
/// The source mixed two ways of building this key, and in two of its four
/// call sites shifted a 32-bit `fsid` without first widening it to 64 bits,
/// silently truncating the shift at higher filesystem ids. The only correct
/// form is `(u64::from(fsid) << 32) | principal_id`; every accumulator
/// lookup in this workspace goes through this function so that bug cannot
/// resurface at a second call site.
#[must_use]
pub fn quota_key(fsid: u32, principal_id: u32) -> u64 {
    (u64::from(fsid) << 32) | u64::from(principal_id)
}

/// Error parsing a single field out of the text transport form.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum FieldParseError {
    /// A required key was absent from the query string.
    #[snafu(display("missing required key '{key}'"))]
    MissingKey { key: &'static str },

    /// A key was present but its value could not be parsed as the expected type.
    #[snafu(display("key '{key}' has invalid value '{value}': {reason}"))]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// A string field exceeded the maximum length the on-disk format allows.
    #[snafu(display("key '{key}' value is {len} bytes, exceeding the {max} byte limit"))]
    StringTooLong { key: &'static str, len: usize, max: usize },

    /// A string field was not valid UTF-8 once decoded.
    #[snafu(display("key '{key}' did not decode as UTF-8"))]
    NotUtf8 { key: &'static str },
}

/// Parses a required, present value out of a key/value map, with a typed error naming the key.
pub fn parse_required<T>(
    map: &std::collections::HashMap<String, String>,
    key: &'static str,
) -> Result<T, FieldParseError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = map.get(key).ok_or(FieldParseError::MissingKey { key })?;
    raw.parse::<T>().map_err(|e| FieldParseError::InvalidValue {
        key,
        value: raw.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn quota_key_matches_the_unambiguous_form() {
        assert_eq!(quota_key(0, 0), 0);
        assert_eq!(quota_key(1, 0), 1u64 << 32);
        assert_eq!(quota_key(7, 1000), (7u64 << 32) | 1000);
    }

    proptest! {
        #[test]
        fn quota_key_is_injective_over_fsid(fsid in 0u32..=u32::MAX, principal in 0u32..=u32::MAX) {
            let key = quota_key(fsid, principal);
            prop_assert_eq!(key >> 32, u64::from(fsid));
            prop_assert_eq!(key & 0xFFFF_FFFF, u64::from(principal));
        }
    }

    #[test]
    fn parse_required_reports_missing_key() {
        let map = std::collections::HashMap::new();
        let err = parse_required::<u64>(&map, "mgm.fmd.fid").unwrap_err();
        assert_eq!(err, FieldParseError::MissingKey { key: "mgm.fmd.fid" });
    }

    #[test]
    fn parse_required_reports_invalid_value() {
        let mut map = std::collections::HashMap::new();
        map.insert("mgm.fmd.fid".to_string(), "not-a-number".to_string());
        let err = parse_required::<u64>(&map, "mgm.fmd.fid").unwrap_err();
        assert!(matches!(err, FieldParseError::InvalidValue { .. }));
    }
}
