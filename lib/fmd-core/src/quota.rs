//! The four quota accumulators (`spec.md` §4.4): user-bytes, group-bytes,
//! user-files, group-files, each keyed by [`fmd_common::quota_key`].

use std::collections::HashMap;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCounters {
    pub bytes: u64,
    pub files: u64,
}

#[derive(Debug, Default)]
pub struct QuotaAccumulators {
    user: HashMap<u64, QuotaCounters>,
    group: HashMap<u64, QuotaCounters>,
}

impl QuotaAccumulators {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-initializes the `(fsid, 0)` root entries to zero on both maps, so
    /// a filesystem summary always has an aggregate slot even before any
    /// file is created, per `spec.md` §4.4.
    pub fn init_root_entries(&mut self, filesystem_id: u32) {
        let root = fmd_common::quota_key(filesystem_id, 0);
        self.user.entry(root).or_default();
        self.group.entry(root).or_default();
    }

    #[must_use]
    pub fn user_counters(&self, filesystem_id: u32, uid: u32) -> QuotaCounters {
        self.user
            .get(&fmd_common::quota_key(filesystem_id, uid))
            .copied()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn group_counters(&self, filesystem_id: u32, gid: u32) -> QuotaCounters {
        self.group
            .get(&fmd_common::quota_key(filesystem_id, gid))
            .copied()
            .unwrap_or_default()
    }

    /// Applies the effect of a newly-created file: increments counts and
    /// adds its size to both the owning user's and owning group's totals.
    pub fn on_create(&mut self, filesystem_id: u32, uid: u32, gid: u32, size: u64) {
        let user = self.user.entry(fmd_common::quota_key(filesystem_id, uid)).or_default();
        user.bytes += size;
        user.files += 1;
        let group = self.group.entry(fmd_common::quota_key(filesystem_id, gid)).or_default();
        group.bytes += size;
        group.files += 1;
    }

    /// Applies a logical overwrite: file counts are unchanged, byte totals
    /// move by `new_size - old_size`.
    pub fn on_overwrite(&mut self, filesystem_id: u32, uid: u32, gid: u32, old_size: u64, new_size: u64) {
        let user = self.user.entry(fmd_common::quota_key(filesystem_id, uid)).or_default();
        apply_byte_delta(&mut user.bytes, old_size, new_size);
        let group = self.group.entry(fmd_common::quota_key(filesystem_id, gid)).or_default();
        apply_byte_delta(&mut group.bytes, old_size, new_size);
    }

    /// Applies a deletion: decrements counts and subtracts `last_size` from
    /// both totals.
    pub fn on_delete(&mut self, filesystem_id: u32, uid: u32, gid: u32, last_size: u64) {
        let user = self.user.entry(fmd_common::quota_key(filesystem_id, uid)).or_default();
        user.bytes = user.bytes.saturating_sub(last_size);
        user.files = user.files.saturating_sub(1);
        let group = self.group.entry(fmd_common::quota_key(filesystem_id, gid)).or_default();
        group.bytes = group.bytes.saturating_sub(last_size);
        group.files = group.files.saturating_sub(1);
    }

    /// Drops every entry keyed under `filesystem_id`, used before a fresh
    /// boot scan rebuilds the counters from scratch.
    pub fn clear_filesystem(&mut self, filesystem_id: u32) {
        self.user.retain(|key, _| (key >> 32) as u32 != filesystem_id);
        self.group.retain(|key, _| (key >> 32) as u32 != filesystem_id);
    }

    pub fn clear(&mut self) {
        self.user.clear();
        self.group.clear();
    }
}

fn apply_byte_delta(total: &mut u64, old_size: u64, new_size: u64) {
    if new_size >= old_size {
        *total += new_size - old_size;
    } else {
        *total = total.saturating_sub(old_size - new_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_overwrite_then_delete_nets_to_zero() {
        let mut q = QuotaAccumulators::new();
        q.init_root_entries(7);
        q.on_create(7, 1000, 1000, 4096);
        assert_eq!(q.user_counters(7, 1000), QuotaCounters { bytes: 4096, files: 1 });

        q.on_overwrite(7, 1000, 1000, 4096, 1024);
        assert_eq!(q.user_counters(7, 1000), QuotaCounters { bytes: 1024, files: 1 });

        q.on_delete(7, 1000, 1000, 1024);
        assert_eq!(q.user_counters(7, 1000), QuotaCounters { bytes: 0, files: 0 });
    }

    #[test]
    fn root_entry_is_zero_but_present_after_init() {
        let mut q = QuotaAccumulators::new();
        q.init_root_entries(7);
        assert_eq!(q.user_counters(7, 0), QuotaCounters::default());
        assert_eq!(q.group_counters(7, 0), QuotaCounters::default());
    }

    #[test]
    fn clear_filesystem_does_not_affect_other_filesystems() {
        let mut q = QuotaAccumulators::new();
        q.on_create(7, 1000, 1000, 10);
        q.on_create(8, 1000, 1000, 20);
        q.clear_filesystem(7);
        assert_eq!(q.user_counters(7, 1000), QuotaCounters::default());
        assert_eq!(q.user_counters(8, 1000), QuotaCounters { bytes: 20, files: 1 });
    }
}
