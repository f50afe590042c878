//! Commit changesets.
//!
//! A changeset summarizes the mutations of one committed read-write
//! transaction. Sibling connections consume it exactly once to invalidate
//! their caches and update their extension state; it is also the payload of
//! the database's commit notification.

use crate::types::{RowKey, Snapshot};
use std::collections::{HashMap, HashSet};
use stratadb_codec::Value;

/// The summary of mutations produced by one committed transaction.
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    /// Snapshot number assigned to the commit.
    pub snapshot: Snapshot,
    /// Rows whose object (and metadata) were written.
    pub object_changes: HashSet<RowKey>,
    /// Rows whose metadata alone was written.
    pub metadata_changes: HashSet<RowKey>,
    /// Rows that were removed.
    pub removed_keys: HashSet<RowKey>,
    /// Collections removed wholesale.
    pub removed_collections: HashSet<String>,
    /// True if every row in the database was removed.
    pub all_keys_removed: bool,
    /// Per-extension internal changeset fragments, keyed by registered name.
    pub extensions: HashMap<String, Value>,
}

impl Changeset {
    /// Creates an empty changeset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the changeset records no mutations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.object_changes.is_empty()
            && self.metadata_changes.is_empty()
            && self.removed_keys.is_empty()
            && self.removed_collections.is_empty()
            && !self.all_keys_removed
    }

    /// Returns true if the commit may have changed the row at
    /// `(collection, key)`.
    #[must_use]
    pub fn affects_row(&self, collection: &str, key: &str) -> bool {
        if self.all_keys_removed || self.removed_collections.contains(collection) {
            return true;
        }
        let row = RowKey::new(collection, key);
        self.object_changes.contains(&row)
            || self.metadata_changes.contains(&row)
            || self.removed_keys.contains(&row)
    }

    /// Returns true if the commit may have changed any row of `collection`.
    #[must_use]
    pub fn affects_collection(&self, collection: &str) -> bool {
        if self.all_keys_removed || self.removed_collections.contains(collection) {
            return true;
        }
        self.object_changes
            .iter()
            .chain(&self.metadata_changes)
            .chain(&self.removed_keys)
            .any(|row| row.collection == collection)
    }

    /// Records an object (and metadata) write.
    pub fn record_object_change(&mut self, collection: &str, key: &str) {
        let row = RowKey::new(collection, key);
        self.metadata_changes.remove(&row);
        self.removed_keys.remove(&row);
        self.object_changes.insert(row);
    }

    /// Records a metadata-only write.
    pub fn record_metadata_change(&mut self, collection: &str, key: &str) {
        let row = RowKey::new(collection, key);
        if !self.object_changes.contains(&row) {
            self.metadata_changes.insert(row);
        }
    }

    /// Records a row removal.
    pub fn record_removal(&mut self, collection: &str, key: &str) {
        let row = RowKey::new(collection, key);
        self.object_changes.remove(&row);
        self.metadata_changes.remove(&row);
        self.removed_keys.insert(row);
    }

    /// Records the removal of a whole collection.
    pub fn record_collection_removal(&mut self, collection: &str) {
        self.object_changes.retain(|row| row.collection != collection);
        self.metadata_changes
            .retain(|row| row.collection != collection);
        self.removed_keys.retain(|row| row.collection != collection);
        self.removed_collections.insert(collection.to_string());
    }

    /// Records the removal of every row in the database.
    pub fn record_remove_everything(&mut self) {
        self.object_changes.clear();
        self.metadata_changes.clear();
        self.removed_keys.clear();
        self.removed_collections.clear();
        self.all_keys_removed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_changeset() {
        let cs = Changeset::new();
        assert!(cs.is_empty());
        assert!(!cs.affects_row("c", "k"));
    }

    #[test]
    fn object_change_affects_row() {
        let mut cs = Changeset::new();
        cs.record_object_change("books", "k1");
        assert!(cs.affects_row("books", "k1"));
        assert!(!cs.affects_row("books", "k2"));
        assert!(cs.affects_collection("books"));
        assert!(!cs.affects_collection("posts"));
    }

    #[test]
    fn removal_supersedes_change() {
        let mut cs = Changeset::new();
        cs.record_object_change("c", "k");
        cs.record_removal("c", "k");
        assert!(!cs.object_changes.contains(&RowKey::new("c", "k")));
        assert!(cs.removed_keys.contains(&RowKey::new("c", "k")));
    }

    #[test]
    fn collection_removal_affects_all_its_rows() {
        let mut cs = Changeset::new();
        cs.record_object_change("c", "k");
        cs.record_collection_removal("c");
        assert!(cs.object_changes.is_empty());
        assert!(cs.affects_row("c", "anything"));
    }

    #[test]
    fn remove_everything_affects_everything() {
        let mut cs = Changeset::new();
        cs.record_remove_everything();
        assert!(cs.affects_row("any", "thing"));
        assert!(!cs.is_empty());
    }

    #[test]
    fn metadata_change_does_not_shadow_object_change() {
        let mut cs = Changeset::new();
        cs.record_object_change("c", "k");
        cs.record_metadata_change("c", "k");
        assert!(cs.object_changes.contains(&RowKey::new("c", "k")));
        assert!(!cs.metadata_changes.contains(&RowKey::new("c", "k")));
    }
}
