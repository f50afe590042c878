//! The geometric index extension.
//!
//! An injected [`RectSource`] maps each row to an optional axis-aligned
//! bounding rectangle. The extension maintains a persistent rowid → rect
//! table kept consistent by the transaction hooks, plus a per-connection
//! in-memory R-tree (bulk-loaded with sort-tile-recursive packing) rebuilt
//! lazily after a change.

mod rtree;

pub use rtree::Rect;

use crate::changeset::Changeset;
use crate::database::COLLECTION_PREFIX;
use crate::error::{DbError, DbResult};
use crate::extension::{
    AccessLevel, Extension, ExtensionConnection, ExtensionHost, ExtensionTransaction, RowChange,
};
use crate::geo::rtree::RTree;
use crate::transaction::{ReadTransaction, ReadWriteTransaction};
use crate::types::Snapshot;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use stratadb_codec::Value;
use stratadb_store::{Rowid, TableRead};

pub(crate) fn geo_rects_table(name: &str) -> String {
    format!("x:{name}:rects")
}

/// Maps a row to its bounding rectangle.
///
/// Must be pure; returning `None` leaves the row out of the index.
pub trait RectSource: Send + Sync {
    /// The cheapest row representation the source needs.
    fn access(&self) -> AccessLevel {
        AccessLevel::Row
    }

    /// Returns the row's bounding rectangle.
    fn rect(
        &self,
        collection: &str,
        key: &str,
        object: Option<&Value>,
        metadata: Option<&Value>,
    ) -> Option<Rect>;
}

/// Options for a geometric index extension.
#[derive(Debug, Clone, Default)]
pub struct GeoOptions {
    /// Identity tag for the rect source; a changed tag triggers a full
    /// repopulate at the next registration.
    pub version_tag: String,
}

impl GeoOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the rect source version tag.
    #[must_use]
    pub fn version_tag(mut self, tag: impl Into<String>) -> Self {
        self.version_tag = tag.into();
        self
    }
}

/// The geometric index extension. Register with
/// [`crate::Database::register_extension`].
pub struct GeoIndexExtension {
    source: Arc<dyn RectSource>,
    options: GeoOptions,
}

impl GeoIndexExtension {
    /// Creates a geometric index over the given rect source.
    pub fn new(source: Arc<dyn RectSource>, options: GeoOptions) -> Self {
        Self { source, options }
    }
}

impl Extension for GeoIndexExtension {
    fn class_name(&self) -> &'static str {
        "geo_index"
    }

    fn version(&self) -> u32 {
        1
    }

    fn version_tag(&self) -> Option<String> {
        Some(self.options.version_tag.clone())
    }

    fn table_names(&self, registered_name: &str) -> Vec<String> {
        vec![geo_rects_table(registered_name)]
    }

    fn required_access(&self) -> AccessLevel {
        self.source.access()
    }

    fn connect(&self, registered_name: &str) -> Box<dyn ExtensionConnection> {
        Box::new(GeoConnection {
            name: registered_name.to_string(),
            source: Arc::clone(&self.source),
            tree: Arc::new(Mutex::new(None)),
        })
    }
}

impl std::fmt::Debug for GeoIndexExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoIndexExtension")
            .field("version_tag", &self.options.version_tag)
            .finish_non_exhaustive()
    }
}

/// The geometric index's per-connection state object: a lazily rebuilt
/// in-memory R-tree.
pub struct GeoConnection {
    name: String,
    source: Arc<dyn RectSource>,
    tree: Arc<Mutex<Option<Arc<RTree>>>>,
}

impl ExtensionConnection for GeoConnection {
    fn registered_name(&self) -> &str {
        &self.name
    }

    fn begin(&mut self) -> Box<dyn ExtensionTransaction> {
        Box::new(GeoTransaction {
            name: self.name.clone(),
            source: Arc::clone(&self.source),
            tree: Arc::clone(&self.tree),
            changed: false,
        })
    }

    fn process_changeset(&mut self, changeset: &Changeset) {
        if changeset.extensions.contains_key(&self.name) || changeset.all_keys_removed {
            *self.tree.lock() = None;
        }
    }

    fn reset(&mut self) {
        *self.tree.lock() = None;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// The geometric index's transaction hooks: write-through maintenance of
/// the rects table.
pub struct GeoTransaction {
    name: String,
    source: Arc<dyn RectSource>,
    tree: Arc<Mutex<Option<Arc<RTree>>>>,
    changed: bool,
}

impl ExtensionTransaction for GeoTransaction {
    fn prepare(&mut self, _host: &mut ExtensionHost<'_, '_>) -> DbResult<()> {
        Ok(())
    }

    fn handle_insert_or_update(
        &mut self,
        host: &mut ExtensionHost<'_, '_>,
        change: &RowChange<'_>,
    ) -> DbResult<()> {
        let table = geo_rects_table(&self.name);
        match self.source.rect(
            change.collection,
            change.key,
            change.object,
            change.metadata,
        ) {
            Some(rect) => {
                host.store
                    .put(&table, &change.rowid.to_be_bytes(), rect.encode().to_vec())?;
                self.changed = true;
            }
            None => {
                if host.store.delete(&table, &change.rowid.to_be_bytes())? {
                    self.changed = true;
                }
            }
        }
        Ok(())
    }

    fn handle_metadata_update(
        &mut self,
        host: &mut ExtensionHost<'_, '_>,
        change: &RowChange<'_>,
    ) -> DbResult<()> {
        if !self.source.access().needs_metadata() {
            return Ok(());
        }
        self.handle_insert_or_update(host, change)
    }

    fn handle_remove(
        &mut self,
        host: &mut ExtensionHost<'_, '_>,
        _collection: &str,
        _key: &str,
        rowid: Rowid,
    ) -> DbResult<()> {
        if host
            .store
            .delete(&geo_rects_table(&self.name), &rowid.to_be_bytes())?
        {
            self.changed = true;
        }
        Ok(())
    }

    fn handle_remove_all_in_collection(
        &mut self,
        host: &mut ExtensionHost<'_, '_>,
        collection: &str,
    ) -> DbResult<()> {
        let owner = format!("{COLLECTION_PREFIX}{collection}");
        let table = geo_rects_table(&self.name);
        let mut members = Vec::new();
        for (key, _) in host.store.scan(&table)? {
            let rowid = Rowid::from_be_bytes(&key)?;
            if let Some((t, _)) = host.store.rowid_entry(rowid)? {
                if t == owner {
                    members.push(rowid);
                }
            }
        }
        for rowid in members {
            host.store.delete(&table, &rowid.to_be_bytes())?;
            self.changed = true;
        }
        Ok(())
    }

    fn handle_remove_everything(&mut self, host: &mut ExtensionHost<'_, '_>) -> DbResult<()> {
        host.store.clear_table(&geo_rects_table(&self.name))?;
        self.changed = true;
        Ok(())
    }

    fn changeset_fragment(&mut self) -> Option<Value> {
        self.changed
            .then(|| Value::record(vec![("changed", Value::Bool(true))]))
    }

    fn did_commit(&mut self, _snapshot: Snapshot) {
        if self.changed {
            *self.tree.lock() = None;
        }
    }

    fn rollback(&mut self) {
        self.changed = false;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn build_tree<R: TableRead>(reader: &R, name: &str) -> DbResult<RTree> {
    let mut entries = Vec::new();
    for (key, record) in reader.scan(&geo_rects_table(name))? {
        let rowid = Rowid::from_be_bytes(&key)?;
        entries.push((Rect::decode(&record.value)?, rowid));
    }
    Ok(RTree::bulk_load(entries))
}

fn resolve<R: TableRead>(reader: &R, rowids: Vec<Rowid>) -> DbResult<Vec<(String, String)>> {
    let mut out = Vec::new();
    for rowid in rowids {
        if let Some((table, key)) = reader.rowid_entry(rowid)? {
            if let Some(collection) = table.strip_prefix(COLLECTION_PREFIX) {
                out.push((collection.to_string(), crate::rows::key_from_bytes(key)?));
            }
        }
    }
    Ok(out)
}

/// A query handle over a geometric index.
pub struct GeoHandle<R> {
    reader: R,
    tree: Arc<RTree>,
}

impl<R: TableRead> GeoHandle<R> {
    /// Returns the rows whose rectangle intersects `query`.
    pub fn intersecting(&self, query: &Rect) -> DbResult<Vec<(String, String)>> {
        resolve(&self.reader, self.tree.intersecting(query))
    }

    /// Returns the rows whose rectangle lies fully within `query`.
    pub fn within(&self, query: &Rect) -> DbResult<Vec<(String, String)>> {
        resolve(&self.reader, self.tree.within(query))
    }

    /// Returns the number of indexed rectangles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Returns true if the index has no rectangles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.len() == 0
    }
}

impl<'a> ReadTransaction<'a> {
    /// Returns a query handle for a registered geometric index.
    pub fn geo<'t>(
        &'t mut self,
        name: &str,
    ) -> DbResult<GeoHandle<stratadb_store::SnapshotReader<'t>>> {
        let (db, state, snapshot) = self.parts();
        let conn = state
            .ext_connections
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| DbError::NotRegistered {
                name: name.to_string(),
            })?;
        let geo = conn
            .1
            .as_any_mut()
            .downcast_mut::<GeoConnection>()
            .ok_or_else(|| DbError::NotRegistered {
                name: name.to_string(),
            })?;

        let reader = db.store().reader_at(snapshot.as_u64());
        let mut cached = geo.tree.lock();
        let tree = match &*cached {
            Some(tree) => Arc::clone(tree),
            None => {
                let tree = Arc::new(build_tree(&reader, name)?);
                *cached = Some(Arc::clone(&tree));
                tree
            }
        };
        Ok(GeoHandle { reader, tree })
    }
}

impl<'a> ReadWriteTransaction<'a> {
    /// Returns a query handle for a registered geometric index, observing
    /// this transaction's own writes. The tree is rebuilt from the
    /// transaction's view of the rects table.
    pub fn geo<'t>(
        &'t self,
        name: &str,
    ) -> DbResult<GeoHandle<&'t stratadb_store::StoreWriteTxn<'a>>> {
        if !self.has_extension_txn(name) {
            return Err(DbError::NotRegistered {
                name: name.to_string(),
            });
        }
        let reader = self.store_ref();
        let tree = Arc::new(build_tree(&reader, name)?);
        Ok(GeoHandle { reader, tree })
    }
}
