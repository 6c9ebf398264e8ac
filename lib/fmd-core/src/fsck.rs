//! Offline reconciliation between the change-log, the local disk inventory,
//! and the central namespace catalog (`spec.md` §4.8).
//!
//! Grounded on `FsckFst.cc`'s `main`: the four comparison directions (disk
//! vs. log, log vs. disk, log vs. catalog, catalog vs. log), its per-field
//! mismatch tally counters, and its cached `sure` confirmation flag for
//! dangerous deletes. The central-catalog dependency is expressed as a
//! trait, the way `disk_v2::ledger::Ledger<FS>` is generic over a
//! filesystem trait purely so tests can supply an in-memory fake instead of
//! a real network client.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::handler::Handler;
use crate::naming::parse_replica_leaf;
use crate::record::Fmd;
use crate::transport::env_to_fmd;

/// What to do with `--upload-fid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFidTarget {
    Specific(u64),
    All,
}

/// A minimal abstraction over the central namespace catalog, so the
/// reconciliation logic can be exercised against an in-memory fake instead
/// of a real network endpoint. A production binary implements this against
/// the actual MGM protocol; that implementation lives outside this crate
/// (`spec.md` §1 names the wire protocol an external collaborator).
pub trait CatalogClient {
    /// Fetches the namespace dump for `filesystem_id`: one transport-form
    /// record per line (`spec.md` §6).
    fn fetch_dump(&mut self, filesystem_id: u32) -> std::io::Result<String>;

    /// Pushes a corrected record to the catalog (`--repair-cache`,
    /// Direction D's "upload missing").
    fn commit(&mut self, fmd: &Fmd) -> std::io::Result<()>;

    /// Reports a dropped replica for `file_id` (`--upload-fid` combined
    /// with a local delete).
    fn drop_replica(&mut self, file_id: u64) -> std::io::Result<()>;
}

/// Flags controlling which mutating actions [`run`] is permitted to take.
/// The default (all `false`) is a read-only dry run, per `spec.md` §4.8's
/// stated policy.
pub struct FsckOptions<'a> {
    pub data_directory: Option<PathBuf>,
    pub delete_missing_changelog: bool,
    pub repair_local: bool,
    pub repair_cache: bool,
    pub checksum: bool,
    pub upload_fid: Option<UploadFidTarget>,
    pub delete_enoent: bool,
    pub delete_deleted: bool,
    /// Gates every destructive action (`spec.md` §4.8: "the confirmation is
    /// mandatory" for disk-side unlinks). Tests and non-interactive runs can
    /// supply `Box::new(|_| true)` / `Box::new(|_| false)`.
    pub interactive_confirm: Box<dyn FnMut(&str) -> bool + 'a>,
}

impl<'a> FsckOptions<'a> {
    /// A read-only dry run that answers "no" to every confirmation prompt.
    #[must_use]
    pub fn dry_run() -> Self {
        FsckOptions {
            data_directory: None,
            delete_missing_changelog: false,
            repair_local: false,
            repair_cache: false,
            checksum: false,
            upload_fid: None,
            delete_enoent: false,
            delete_deleted: false,
            interactive_confirm: Box::new(|_| false),
        }
    }
}

/// Per-field mismatch tallies for Direction C (`spec.md` §4.8 step 7),
/// mirroring `FsckFst.cc`'s `error_diff_*` counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CatalogFieldMismatches {
    pub layout: u64,
    pub uid: u64,
    pub gid: u64,
    pub cid: u64,
    pub ctime: u64,
    pub ctime_ns: u64,
    pub mtime: u64,
    pub mtime_ns: u64,
    pub checksum: u64,
    pub name: u64,
    pub container: u64,
    pub size: u64,
}

/// Structured summary of one fsck run, per `spec.md` §4.8 step 9.
#[derive(Debug, Default)]
pub struct FsckReport {
    /// Direction A: on disk, absent from the index.
    pub missing_in_changelog: Vec<u64>,
    /// Direction A: disk orphans actually unlinked (requires confirmation).
    pub orphans_deleted: Vec<u64>,
    /// Direction B: indexed fid whose on-disk size differs from the record.
    pub size_mismatches: Vec<(u64, u64, u64)>,
    /// Direction B: fids repaired via `--repair-local`.
    pub repaired_local: Vec<u64>,
    /// Checksum pass: fids whose digest was recomputed.
    pub checksum_repairs: Vec<u64>,
    /// Direction C: per-field tallies across all catalog-compared fids.
    pub catalog_mismatches: CatalogFieldMismatches,
    /// Direction D: present locally, absent from the catalog dump.
    pub missing_in_catalog: Vec<u64>,
    /// Direction D: fids actually uploaded to the catalog.
    pub uploaded: Vec<u64>,
    pub io_errors: Vec<String>,
}

impl FsckReport {
    /// Worst observed class, encoded as the exit code `spec.md` §6 defines.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if !self.io_errors.is_empty() {
            return 4;
        }
        if !self.catalog_mismatches_is_zero() {
            return 7;
        }
        if !self.missing_in_changelog.is_empty() || !self.size_mismatches.is_empty() {
            return 5;
        }
        0
    }

    fn catalog_mismatches_is_zero(&self) -> bool {
        let m = self.catalog_mismatches;
        m.layout == 0
            && m.uid == 0
            && m.gid == 0
            && m.cid == 0
            && m.ctime == 0
            && m.ctime_ns == 0
            && m.mtime == 0
            && m.mtime_ns == 0
            && m.checksum == 0
            && m.name == 0
            && m.container == 0
            && m.size == 0
    }
}

/// Walks `data_directory` for replica leaf files (16-hex-digit basenames
/// under 8-hex bucket directories) and builds a `fid -> path` map, per
/// `spec.md` §4.8 step 3.
pub fn scan_disk_fids(data_directory: &Path) -> std::io::Result<HashMap<u64, PathBuf>> {
    let mut found = HashMap::new();
    for bucket_entry in std::fs::read_dir(data_directory)? {
        let bucket_entry = bucket_entry?;
        if !bucket_entry.file_type()?.is_dir() {
            continue;
        }
        for leaf_entry in std::fs::read_dir(bucket_entry.path())? {
            let leaf_entry = leaf_entry?;
            let Some(name) = leaf_entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if let Some(file_id) = parse_replica_leaf(&name) {
                found.insert(file_id, leaf_entry.path());
            }
        }
    }
    Ok(found)
}

/// Runs the whole reconciliation described in `spec.md` §4.8 against an
/// already-attached `handler`/`filesystem_id` and the given `options`.
/// `catalog` is consulted only when `options` requests a catalog-touching
/// action; callers that never set `repair_cache`/`upload_fid` may supply a
/// catalog client that always errors.
pub fn run<C: CatalogClient>(
    handler: &Handler,
    filesystem_id: u32,
    options: &mut FsckOptions<'_>,
    catalog: Option<&mut C>,
) -> FsckReport {
    let mut report = FsckReport::default();

    if let Some(data_directory) = options.data_directory.clone() {
        match scan_disk_fids(&data_directory) {
            Ok(disk_fids) => {
                direction_a_disk_vs_log(handler, filesystem_id, &disk_fids, options, &mut report);
                direction_b_log_vs_disk(handler, filesystem_id, &disk_fids, options, &mut report);
            }
            Err(err) => report.io_errors.push(err.to_string()),
        }
    }

    if let Some(catalog) = catalog {
        match catalog.fetch_dump(filesystem_id) {
            Ok(dump) => direction_c_and_d(handler, filesystem_id, &dump, options, catalog, &mut report),
            Err(err) => report.io_errors.push(err.to_string()),
        }
    }

    report
}

fn direction_a_disk_vs_log(
    handler: &Handler,
    filesystem_id: u32,
    disk_fids: &HashMap<u64, PathBuf>,
    options: &mut FsckOptions<'_>,
    report: &mut FsckReport,
) {
    for (&file_id, path) in disk_fids {
        let indexed = handler
            .get_fmd(file_id, filesystem_id, 0, 0, 0, false, 0)
            .ok()
            .flatten()
            .is_some();
        if indexed {
            continue;
        }
        report.missing_in_changelog.push(file_id);

        if options.delete_missing_changelog {
            let prompt = format!("delete orphan disk file {} (fid {file_id:#x})?", path.display());
            if (options.interactive_confirm)(&prompt) {
                if std::fs::remove_file(path).is_ok() {
                    report.orphans_deleted.push(file_id);
                }
            }
        }
    }
}

fn direction_b_log_vs_disk(
    handler: &Handler,
    filesystem_id: u32,
    disk_fids: &HashMap<u64, PathBuf>,
    options: &mut FsckOptions<'_>,
    report: &mut FsckReport,
) {
    for file_id in handler.indexed_file_ids(filesystem_id) {
        let Some(path) = disk_fids.get(&file_id) else {
            continue;
        };
        let Ok(metadata) = std::fs::metadata(path) else {
            continue;
        };
        let Some(indexed) = handler.get_fmd(file_id, filesystem_id, 0, 0, 0, false, 0).ok().flatten() else {
            continue;
        };

        let disk_size = metadata.len();
        if disk_size != indexed.size {
            report.size_mismatches.push((file_id, indexed.size, disk_size));
            if options.repair_local {
                let mut repaired = indexed.clone();
                repaired.size = disk_size;
                if handler.commit(repaired, indexed.mtime as u64).is_ok() {
                    report.repaired_local.push(file_id);
                }
            }
        }
    }
}

fn direction_c_and_d<C: CatalogClient>(
    handler: &Handler,
    filesystem_id: u32,
    dump: &str,
    options: &mut FsckOptions<'_>,
    catalog: &mut C,
    report: &mut FsckReport,
) {
    let mut seen_in_catalog = std::collections::HashSet::new();

    for line in dump.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(central) = env_to_fmd(line) else {
            continue;
        };
        seen_in_catalog.insert(central.file_id);

        let Some(local) = handler
            .get_fmd(central.file_id, filesystem_id, 0, 0, 0, false, 0)
            .ok()
            .flatten()
        else {
            continue;
        };

        tally_mismatches(&local, &central, &mut report.catalog_mismatches);

        if options.checksum && local.checksum != central.checksum {
            report.checksum_repairs.push(local.file_id);
        }
    }

    if let Some(target) = options.upload_fid {
        let candidates: Vec<u64> = match target {
            UploadFidTarget::Specific(fid) => vec![fid],
            UploadFidTarget::All => handler
                .indexed_file_ids(filesystem_id)
                .into_iter()
                .filter(|fid| !seen_in_catalog.contains(fid))
                .collect(),
        };
        for file_id in candidates {
            if seen_in_catalog.contains(&file_id) {
                continue;
            }
            report.missing_in_catalog.push(file_id);
            if options.repair_cache {
                if let Some(local) = handler.get_fmd(file_id, filesystem_id, 0, 0, 0, false, 0).ok().flatten() {
                    if catalog.commit(&local).is_ok() {
                        report.uploaded.push(file_id);
                    }
                }
            }
            // `--delete-enoent`/`--delete-deleted` both mean "the catalog
            // doesn't know this fid, drop the local copy" -- the source
            // distinguishes the two by the catalog's exact error string
            // (no-such-file vs. already-unlinked), which this trait's
            // plain dump-and-commit interface doesn't surface; treating
            // "absent from the dump" as both cases is the conservative
            // reading.
            if (options.delete_enoent || options.delete_deleted) && catalog.drop_replica(file_id).is_ok() {
                let _ = handler.delete_fmd(file_id, filesystem_id, 0);
                report.uploaded.retain(|&fid| fid != file_id);
            }
        }
    }
}

fn tally_mismatches(local: &Fmd, central: &Fmd, tally: &mut CatalogFieldMismatches) {
    if local.layout_id != central.layout_id {
        tally.layout += 1;
    }
    if local.uid != central.uid {
        tally.uid += 1;
    }
    if local.gid != central.gid {
        tally.gid += 1;
    }
    if local.container_id != central.container_id {
        tally.cid += 1;
    }
    if local.ctime != central.ctime {
        tally.ctime += 1;
    }
    if local.ctime_ns != central.ctime_ns {
        tally.ctime_ns += 1;
    }
    if local.mtime != central.mtime {
        tally.mtime += 1;
    }
    if local.mtime_ns != central.mtime_ns {
        tally.mtime_ns += 1;
    }
    if local.checksum != central.checksum {
        tally.checksum += 1;
    }
    if local.name != central.name {
        tally.name += 1;
    }
    if local.container != central.container {
        tally.container += 1;
    }
    if local.size != central.size {
        tally.size += 1;
    }
}
