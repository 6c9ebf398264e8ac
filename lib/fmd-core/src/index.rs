//! In-memory `(filesystem-id, file-id) -> offset` index plus the per-file
//! size cache used to compute quota deltas without re-reading the
//! superseded record (`spec.md` §4.3).

use std::collections::HashMap;

/// Key into the index: a filesystem id paired with a file id.
pub type IndexKey = (u32, u64);

#[derive(Debug, Default)]
pub struct Index {
    offsets: HashMap<IndexKey, u64>,
    /// Cached size of the live record at each key, so `Commit`/`DeleteFmd`
    /// can compute quota deltas without a disk read.
    sizes: HashMap<IndexKey, u64>,
}

impl Index {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get_offset(&self, key: IndexKey) -> Option<u64> {
        self.offsets.get(&key).copied()
    }

    #[must_use]
    pub fn get_size(&self, key: IndexKey) -> Option<u64> {
        self.sizes.get(&key).copied()
    }

    /// Inserts or overwrites the index entry for `key`, returning the
    /// previously-cached size if one existed (the caller needs this to
    /// compute the quota byte delta on overwrite).
    pub fn insert(&mut self, key: IndexKey, offset: u64, size: u64) -> Option<u64> {
        self.offsets.insert(key, offset);
        self.sizes.insert(key, size)
    }

    /// Removes the index and size-cache entries for `key`, returning the
    /// last-known size (needed to subtract from the quota byte counter).
    pub fn remove(&mut self, key: IndexKey) -> Option<u64> {
        self.offsets.remove(&key);
        self.sizes.remove(&key)
    }

    #[must_use]
    pub fn contains(&self, key: IndexKey) -> bool {
        self.offsets.contains_key(&key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Iterates all entries belonging to `filesystem_id`, used by the
    /// trimmer to snapshot offsets and by fsck to enumerate the index side
    /// of its reconciliation.
    pub fn entries_for_filesystem(&self, filesystem_id: u32) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.offsets
            .iter()
            .filter(move |((fsid, _), _)| *fsid == filesystem_id)
            .map(|((_, fid), offset)| (*fid, *offset))
    }

    /// Drops every entry for `filesystem_id`, used when detaching or before
    /// a fresh boot scan repopulates it.
    pub fn clear_filesystem(&mut self, filesystem_id: u32) {
        self.offsets.retain(|(fsid, _), _| *fsid != filesystem_id);
        self.sizes.retain(|(fsid, _), _| *fsid != filesystem_id);
    }

    pub fn clear(&mut self) {
        self.offsets.clear();
        self.sizes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_returns_previous_size_on_overwrite() {
        let mut index = Index::new();
        assert_eq!(index.insert((7, 1), 100, 10), None);
        assert_eq!(index.insert((7, 1), 200, 20), Some(10));
        assert_eq!(index.get_offset((7, 1)), Some(200));
        assert_eq!(index.get_size((7, 1)), Some(20));
    }

    #[test]
    fn remove_returns_last_size_and_clears_entry() {
        let mut index = Index::new();
        index.insert((7, 1), 100, 10);
        assert_eq!(index.remove((7, 1)), Some(10));
        assert!(!index.contains((7, 1)));
        assert_eq!(index.remove((7, 1)), None);
    }

    #[test]
    fn entries_for_filesystem_is_scoped() {
        let mut index = Index::new();
        index.insert((7, 1), 10, 1);
        index.insert((8, 1), 20, 2);
        let entries: Vec<_> = index.entries_for_filesystem(7).collect();
        assert_eq!(entries, vec![(1, 10)]);
    }

    #[test]
    fn clear_filesystem_only_touches_that_filesystem() {
        let mut index = Index::new();
        index.insert((7, 1), 10, 1);
        index.insert((8, 1), 20, 2);
        index.clear_filesystem(7);
        assert!(!index.contains((7, 1)));
        assert!(index.contains((8, 1)));
    }
}
