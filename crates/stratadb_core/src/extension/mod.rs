//! The extension framework.
//!
//! Extensions are auxiliary indexing structures (ordered views, secondary
//! indexes, geometric indexes, sync queues) that observe every primary-table
//! mutation inside the same transaction and stay consistent with it.
//!
//! Each extension implements three paired objects mirroring the
//! database/connection/transaction triad:
//!
//! - [`Extension`]: schema and registration (tables, version, class name)
//! - [`ExtensionConnection`]: per-connection cached state, plus changeset
//!   production and consumption
//! - [`ExtensionTransaction`]: hooked into the host transaction's write
//!   path; applies speculative in-memory state that is merged on commit and
//!   discarded on rollback
//!
//! Hooks receive an [`ExtensionHost`] wrapping the host's store transaction,
//! so extension table writes land inside the same physical transaction as
//! the primary mutation that triggered them.

use crate::changeset::Changeset;
use crate::error::DbResult;
use crate::rows;
use crate::types::Snapshot;
use std::any::Any;
use stratadb_codec::{ObjectDeserializer, Value};
use stratadb_store::{Rowid, StoreWriteTxn};

/// The cheapest row representation a strategy needs to do its work.
///
/// Declared once at registration; the host then skips fetching and
/// deserializing anything above the requested level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    /// Collection and key only.
    Key,
    /// Collection, key, and metadata.
    Metadata,
    /// Collection, key, and object.
    Object,
    /// The full row: collection, key, object, and metadata.
    Row,
}

impl AccessLevel {
    /// Returns true if this level includes the row's object.
    #[must_use]
    pub fn needs_object(self) -> bool {
        matches!(self, Self::Object | Self::Row)
    }

    /// Returns true if this level includes the row's metadata.
    #[must_use]
    pub fn needs_metadata(self) -> bool {
        matches!(self, Self::Metadata | Self::Row)
    }

    /// Combines two levels into the cheapest level satisfying both.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        match (self.needs_object() || other.needs_object(), self.needs_metadata() || other.needs_metadata()) {
            (true, true) => Self::Row,
            (true, false) => Self::Object,
            (false, true) => Self::Metadata,
            (false, false) => Self::Key,
        }
    }
}

/// A primary row as loaded on behalf of an extension, with only the
/// representations its declared [`AccessLevel`] requires populated.
#[derive(Debug, Clone)]
pub struct StoredRow {
    /// The row's collection.
    pub collection: String,
    /// The row's key.
    pub key: String,
    /// The row's engine-assigned identity.
    pub rowid: Rowid,
    /// The row's object, if requested.
    pub object: Option<Value>,
    /// The row's metadata, if requested and present.
    pub metadata: Option<Value>,
}

/// One primary-table mutation as seen by extension hooks.
#[derive(Debug, Clone, Copy)]
pub struct RowChange<'a> {
    /// The row's collection.
    pub collection: &'a str,
    /// The row's key.
    pub key: &'a str,
    /// The row's object. `None` when no registered extension requested
    /// object access for this mutation kind.
    pub object: Option<&'a Value>,
    /// The row's metadata, if any.
    pub metadata: Option<&'a Value>,
    /// The row's engine-assigned identity.
    pub rowid: Rowid,
    /// True if the row existed before this mutation.
    pub update: bool,
}

/// The host transaction as seen by extension hooks: the store transaction
/// plus row loading with the database's deserializers.
pub struct ExtensionHost<'h, 'a> {
    /// The physical transaction every extension table write goes through.
    pub store: &'h mut StoreWriteTxn<'a>,
    object_deserializer: &'h dyn ObjectDeserializer,
    metadata_deserializer: &'h dyn ObjectDeserializer,
}

impl<'h, 'a> ExtensionHost<'h, 'a> {
    pub(crate) fn new(
        store: &'h mut StoreWriteTxn<'a>,
        object_deserializer: &'h dyn ObjectDeserializer,
        metadata_deserializer: &'h dyn ObjectDeserializer,
    ) -> Self {
        Self {
            store,
            object_deserializer,
            metadata_deserializer,
        }
    }

    /// Loads the primary row a rowid refers to, observing the transaction's
    /// own writes. Returns `None` for dead rowids.
    pub fn row_for_rowid(
        &mut self,
        rowid: Rowid,
        access: AccessLevel,
    ) -> DbResult<Option<StoredRow>> {
        rows::load_row_by_rowid(
            self.store,
            self.object_deserializer,
            self.metadata_deserializer,
            rowid,
            access,
        )
    }

    /// Loads a primary row by collection and key, observing the
    /// transaction's own writes.
    pub fn row(
        &mut self,
        collection: &str,
        key: &str,
        access: AccessLevel,
    ) -> DbResult<Option<StoredRow>> {
        rows::load_row(
            self.store,
            self.object_deserializer,
            self.metadata_deserializer,
            collection,
            key,
            access,
        )
    }

    /// Returns the names of all non-empty collections, observing the
    /// transaction's own writes.
    pub fn collection_names(&mut self) -> DbResult<Vec<String>> {
        use stratadb_store::TableRead;
        Ok(self
            .store
            .table_names()?
            .into_iter()
            .filter_map(|name| {
                name.strip_prefix(crate::database::COLLECTION_PREFIX)
                    .map(ToString::to_string)
            })
            .collect())
    }

    /// Returns every `(key, rowid)` pair of a collection, in ascending key
    /// order, observing the transaction's own writes.
    pub fn collection_keys(&mut self, collection: &str) -> DbResult<Vec<(String, Rowid)>> {
        use stratadb_store::TableRead;
        self.store
            .scan(&crate::database::collection_table(collection))?
            .into_iter()
            .map(|(key, record)| Ok((rows::key_from_bytes(key)?, record.rowid)))
            .collect()
    }
}

impl std::fmt::Debug for ExtensionHost<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHost").finish_non_exhaustive()
    }
}

/// A registered plugin: schema, version, and connection factory.
pub trait Extension: Send + Sync + 'static {
    /// A stable class identifier, persisted alongside the registered name
    /// so tables can be dropped even when the class is not instantiated.
    fn class_name(&self) -> &'static str;

    /// Schema version. Bumping it drops, recreates, and repopulates the
    /// extension's tables on the next registration.
    fn version(&self) -> u32;

    /// An identity tag for the extension's injected strategies (grouping,
    /// sorting, extraction). A changed tag triggers the same drop and
    /// repopulate as a version bump, since any strategy change may affect
    /// every row.
    fn version_tag(&self) -> Option<String> {
        None
    }

    /// The store tables this extension owns under a registered name.
    fn table_names(&self, registered_name: &str) -> Vec<String>;

    /// The cheapest row representation this extension's hooks need.
    fn required_access(&self) -> AccessLevel {
        AccessLevel::Row
    }

    /// Creates the per-connection state object.
    fn connect(&self, registered_name: &str) -> Box<dyn ExtensionConnection>;
}

/// Per-connection extension state.
pub trait ExtensionConnection: Send {
    /// The name this extension was registered under.
    fn registered_name(&self) -> &str;

    /// Begins a transaction-scoped hook object for a read-write block.
    fn begin(&mut self) -> Box<dyn ExtensionTransaction>;

    /// Returns a snapshot of this connection's session-local dirty state,
    /// if the extension tracks any (the fragment of the most recent commit
    /// performed through this connection).
    fn changeset(&mut self) -> Option<Value> {
        None
    }

    /// Merges a sibling connection's committed changeset into this
    /// connection's view of extension state.
    fn process_changeset(&mut self, changeset: &Changeset);

    /// Discards all cached state. Called when the connection fell too far
    /// behind the notification history to replay changesets individually.
    fn reset(&mut self);

    /// Downcast support for typed extension accessors.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Transaction-scoped extension hooks.
///
/// For every corresponding primary mutation the host calls the matching
/// hook synchronously, in extension registration order, before commit. A
/// hook returning an error aborts the entire host transaction; the
/// extension must then discard its speculative in-memory state in
/// [`ExtensionTransaction::rollback`].
pub trait ExtensionTransaction: Send {
    /// Lazily materializes per-transaction working state. May be called
    /// multiple times; subsequent calls must be cheap no-ops.
    fn prepare(&mut self, host: &mut ExtensionHost<'_, '_>) -> DbResult<()>;

    /// A row was inserted or its object replaced.
    fn handle_insert_or_update(
        &mut self,
        host: &mut ExtensionHost<'_, '_>,
        change: &RowChange<'_>,
    ) -> DbResult<()>;

    /// A row's metadata was replaced (object unchanged).
    fn handle_metadata_update(
        &mut self,
        host: &mut ExtensionHost<'_, '_>,
        change: &RowChange<'_>,
    ) -> DbResult<()>;

    /// A row was removed.
    fn handle_remove(
        &mut self,
        host: &mut ExtensionHost<'_, '_>,
        collection: &str,
        key: &str,
        rowid: Rowid,
    ) -> DbResult<()>;

    /// Several rows of one collection were removed.
    fn handle_remove_rows(
        &mut self,
        host: &mut ExtensionHost<'_, '_>,
        collection: &str,
        rows: &[(String, Rowid)],
    ) -> DbResult<()> {
        for (key, rowid) in rows {
            self.handle_remove(host, collection, key, *rowid)?;
        }
        Ok(())
    }

    /// Every row of a collection was removed. Called before the physical
    /// clear, so the primary rows are still readable.
    fn handle_remove_all_in_collection(
        &mut self,
        host: &mut ExtensionHost<'_, '_>,
        collection: &str,
    ) -> DbResult<()>;

    /// Every row in the database was removed. Called before the physical
    /// clear.
    fn handle_remove_everything(&mut self, host: &mut ExtensionHost<'_, '_>) -> DbResult<()>;

    /// Last chance to write durable state before the physical commit.
    fn flush(&mut self, host: &mut ExtensionHost<'_, '_>) -> DbResult<()> {
        let _ = host;
        Ok(())
    }

    /// This transaction's contribution to the commit changeset, consumed by
    /// sibling connections' [`ExtensionConnection::process_changeset`].
    fn changeset_fragment(&mut self) -> Option<Value> {
        None
    }

    /// The host transaction committed at `snapshot`; merge speculative
    /// state into the owning connection.
    fn did_commit(&mut self, snapshot: Snapshot);

    /// The host transaction rolled back; discard all speculative state.
    fn rollback(&mut self);

    /// Downcast support for typed extension accessors.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_level_ordering() {
        assert!(AccessLevel::Key < AccessLevel::Metadata);
        assert!(AccessLevel::Metadata < AccessLevel::Object);
        assert!(AccessLevel::Object < AccessLevel::Row);
    }

    #[test]
    fn access_level_needs() {
        assert!(!AccessLevel::Key.needs_object());
        assert!(!AccessLevel::Key.needs_metadata());
        assert!(AccessLevel::Metadata.needs_metadata());
        assert!(!AccessLevel::Metadata.needs_object());
        assert!(AccessLevel::Object.needs_object());
        assert!(AccessLevel::Row.needs_object());
        assert!(AccessLevel::Row.needs_metadata());
    }

    #[test]
    fn access_level_union() {
        assert_eq!(
            AccessLevel::Object.union(AccessLevel::Metadata),
            AccessLevel::Row
        );
        assert_eq!(AccessLevel::Key.union(AccessLevel::Key), AccessLevel::Key);
        assert_eq!(
            AccessLevel::Metadata.union(AccessLevel::Key),
            AccessLevel::Metadata
        );
    }
}
