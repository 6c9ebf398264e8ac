//! Change-log file naming and local-replica path conventions (`spec.md` §6).

use std::path::{Path, PathBuf};

/// Builds the canonical change-log filename for a filesystem created "now".
#[must_use]
pub fn log_file_name(created_at_unix_seconds: u64, filesystem_id: u32) -> String {
    format!("fmd.{created_at_unix_seconds}.{filesystem_id:04}.mdlog")
}

/// Parsed components of a change-log filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFileName {
    pub created_at_unix_seconds: u64,
    pub filesystem_id: u32,
}

/// Parses `fmd.<seconds>.<fsid:04d>.mdlog`, returning `None` for anything else
/// found in the meta-log directory (e.g. a `.mdlog.trim-tmp` scratch file).
#[must_use]
pub fn parse_log_file_name(name: &str) -> Option<LogFileName> {
    let rest = name.strip_prefix("fmd.")?;
    let rest = rest.strip_suffix(".mdlog")?;
    let (seconds, fsid) = rest.split_once('.')?;
    let created_at_unix_seconds = seconds.parse().ok()?;
    let filesystem_id = fsid.parse().ok()?;
    Some(LogFileName {
        created_at_unix_seconds,
        filesystem_id,
    })
}

/// Finds the change-log filename for `filesystem_id` in `directory` with the
/// most recent modification time, per `AttachLatestChangeLogFile`.
pub fn find_latest_log_file(directory: &Path, filesystem_id: u32) -> std::io::Result<Option<PathBuf>> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(parsed) = parse_log_file_name(name) else {
            continue;
        };
        if parsed.filesystem_id != filesystem_id {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        candidates.push((modified, entry.path()));
    }
    candidates.sort_by_key(|(modified, _)| *modified);
    Ok(candidates.into_iter().next_back().map(|(_, path)| path))
}

/// Number of replica leaf files bucketed per directory (`spec.md` §6).
pub const BUCKET_SIZE: u64 = 10_000;

/// Computes the local replica path for `file_id` under `local_prefix`, per
/// `spec.md` §6: `<prefix>/<fid/10000 as 8 zero-padded hex>/<fid as 16 hex>`.
#[must_use]
pub fn local_replica_path(local_prefix: &Path, file_id: u64) -> PathBuf {
    let bucket = file_id / BUCKET_SIZE;
    local_prefix.join(format!("{bucket:08x}")).join(format!("{file_id:016x}"))
}

/// Parses a replica leaf filename (the 16-hex-digit basename, optionally
/// followed by `.<subindex>`) back into a file id, for the fsck
/// directory-walk's disk-side discovery.
#[must_use]
pub fn parse_replica_leaf(leaf: &str) -> Option<u64> {
    let hex = leaf.split('.').next()?;
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_name_round_trips_through_parse() {
        let name = log_file_name(1_700_000_000, 7);
        assert_eq!(name, "fmd.1700000000.0007.mdlog");
        let parsed = parse_log_file_name(&name).unwrap();
        assert_eq!(parsed.created_at_unix_seconds, 1_700_000_000);
        assert_eq!(parsed.filesystem_id, 7);
    }

    #[test]
    fn parse_rejects_unrelated_files() {
        assert!(parse_log_file_name("fmd.1700000000.0007.mdlog.trim-tmp").is_none());
        assert!(parse_log_file_name("notes.txt").is_none());
    }

    #[test]
    fn replica_path_buckets_by_ten_thousand() {
        let path = local_replica_path(Path::new("/data"), 25_000);
        assert_eq!(path, Path::new("/data/00000002/0000000000006190"));
    }

    #[test]
    fn replica_leaf_parses_hex_and_ignores_subindex() {
        assert_eq!(parse_replica_leaf("0000000000006190"), Some(25_000));
        assert_eq!(parse_replica_leaf("0000000000006190.1"), Some(25_000));
        assert_eq!(parse_replica_leaf("not-hex"), None);
    }
}
