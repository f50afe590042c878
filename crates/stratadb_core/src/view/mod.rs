//! The view extension: a persistent, grouped, explicitly ordered index
//! over a subset of rows.
//!
//! A view groups rows via an injected [`ViewGrouper`] and orders each group
//! via an injected [`ViewSorter`]. Each group's ordered rowid list is split
//! into fixed-size pages (default 50 entries) so a single insert or delete
//! rewrites one page, not the whole group.
//!
//! ```rust,ignore
//! db.register_extension("by-author", Arc::new(ViewExtension::new(
//!     grouper, sorter, ViewOptions::default().version_tag("v1"),
//! )))?;
//!
//! conn.read(|txn| {
//!     let mut view = txn.view("by-author")?;
//!     view.item_count_in_group("melville")
//! })??;
//! ```

mod page;
mod query;
mod strategy;
mod txn;

pub use query::{SnapshotViewSource, TxnViewSource, ViewHandle, ViewReader, ViewWriter};
pub use strategy::{ViewFind, ViewGrouper, ViewSorter};
pub use txn::ViewTransaction;

use crate::changeset::Changeset;
use crate::error::{DbError, DbResult};
use crate::extension::{
    AccessLevel, Extension, ExtensionConnection, ExtensionHost, ExtensionTransaction,
};
use crate::transaction::{ReadTransaction, ReadWriteTransaction};
use crate::view::page::{GroupIndex, Page};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use stratadb_codec::Value;

/// Default number of entries per view page.
pub const DEFAULT_PAGE_SIZE: usize = 50;

pub(crate) const NEXT_PAGE_KEY: &[u8] = b"next_page_key";

pub(crate) fn view_map_table(name: &str) -> String {
    format!("x:{name}:map")
}

pub(crate) fn view_pages_table(name: &str) -> String {
    format!("x:{name}:pages")
}

pub(crate) fn view_meta_table(name: &str) -> String {
    format!("x:{name}:meta")
}

pub(crate) fn view_cfg_table(name: &str) -> String {
    format!("x:{name}:cfg")
}

/// Options for a view extension.
#[derive(Debug, Clone)]
pub struct ViewOptions {
    /// Entries per page. Bounds the cost of one insert or delete.
    pub page_size: usize,
    /// Identity tag for the grouping/sorting strategies. Changing the tag
    /// triggers a full repopulate at the next registration, since any
    /// strategy change may alter group membership for any row.
    pub version_tag: String,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            version_tag: String::new(),
        }
    }
}

impl ViewOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the page size.
    #[must_use]
    pub const fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Sets the strategy version tag.
    #[must_use]
    pub fn version_tag(mut self, tag: impl Into<String>) -> Self {
        self.version_tag = tag.into();
        self
    }
}

/// The injected strategies plus view configuration, shared by every
/// connection and transaction object of one view.
pub(crate) struct ViewStrategies {
    pub(crate) grouper: Arc<dyn ViewGrouper>,
    pub(crate) sorter: Arc<dyn ViewSorter>,
    pub(crate) page_size: usize,
    pub(crate) version_tag: String,
    pub(crate) access: AccessLevel,
}

/// The view extension. Register with
/// [`crate::Database::register_extension`].
pub struct ViewExtension {
    strategies: Arc<ViewStrategies>,
}

impl ViewExtension {
    /// Creates a view over the given grouping and sorting strategies.
    pub fn new(
        grouper: Arc<dyn ViewGrouper>,
        sorter: Arc<dyn ViewSorter>,
        options: ViewOptions,
    ) -> Self {
        let access = grouper.access().union(sorter.access());
        Self {
            strategies: Arc::new(ViewStrategies {
                grouper,
                sorter,
                page_size: options.page_size.max(1),
                version_tag: options.version_tag,
                access,
            }),
        }
    }
}

impl Extension for ViewExtension {
    fn class_name(&self) -> &'static str {
        "view"
    }

    fn version(&self) -> u32 {
        1
    }

    fn version_tag(&self) -> Option<String> {
        Some(self.strategies.version_tag.clone())
    }

    fn table_names(&self, registered_name: &str) -> Vec<String> {
        vec![
            view_map_table(registered_name),
            view_pages_table(registered_name),
            view_meta_table(registered_name),
            view_cfg_table(registered_name),
        ]
    }

    fn required_access(&self) -> AccessLevel {
        self.strategies.access
    }

    fn connect(&self, registered_name: &str) -> Box<dyn ExtensionConnection> {
        Box::new(ViewConnection {
            name: registered_name.to_string(),
            strategies: Arc::clone(&self.strategies),
            shared: Arc::new(Mutex::new(ViewShared::default())),
        })
    }
}

impl std::fmt::Debug for ViewExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewExtension")
            .field("page_size", &self.strategies.page_size)
            .field("version_tag", &self.strategies.version_tag)
            .finish_non_exhaustive()
    }
}

/// Connection-local cached view state: the small group → page-chain index
/// and a cache of recently loaded pages.
#[derive(Default)]
pub(crate) struct ViewShared {
    pub(crate) group_index: Option<GroupIndex>,
    pub(crate) page_cache: HashMap<u64, Arc<Page>>,
    pub(crate) last_fragment: Option<Value>,
}

/// The view's per-connection state object.
pub struct ViewConnection {
    pub(crate) name: String,
    pub(crate) strategies: Arc<ViewStrategies>,
    pub(crate) shared: Arc<Mutex<ViewShared>>,
}

impl ExtensionConnection for ViewConnection {
    fn registered_name(&self) -> &str {
        &self.name
    }

    fn begin(&mut self) -> Box<dyn ExtensionTransaction> {
        Box::new(ViewTransaction::new(
            self.name.clone(),
            Arc::clone(&self.strategies),
            Arc::clone(&self.shared),
        ))
    }

    fn changeset(&mut self) -> Option<Value> {
        self.shared.lock().last_fragment.clone()
    }

    fn process_changeset(&mut self, changeset: &Changeset) {
        let Some(fragment) = changeset.extensions.get(&self.name) else {
            if changeset.all_keys_removed {
                self.reset();
            }
            return;
        };
        let mut shared = self.shared.lock();
        let cleared = fragment
            .get("cleared")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if cleared {
            shared.page_cache.clear();
            shared.group_index = None;
            return;
        }
        if let Some(pages) = fragment.get("pages").and_then(Value::as_array) {
            for page in pages {
                if let Some(page_key) = page.as_integer() {
                    shared.page_cache.remove(&(page_key as u64));
                }
            }
        }
        let structure = fragment
            .get("structure")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if structure {
            // Chain shape or counts changed; rebuild lazily on next query.
            shared.group_index = None;
        }
    }

    fn reset(&mut self) {
        let mut shared = self.shared.lock();
        shared.group_index = None;
        shared.page_cache.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Enumeration direction over a view group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDirection {
    /// Ascending index order.
    Forward,
    /// Descending index order.
    Reverse,
}

impl<'a> ReadTransaction<'a> {
    /// Returns a query handle for a registered view.
    pub fn view<'t>(&'t mut self, name: &str) -> DbResult<ViewReader<'t>> {
        let (db, state, snapshot) = self.parts();
        let conn = state
            .ext_connections
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| DbError::NotRegistered {
                name: name.to_string(),
            })?;
        let view = conn
            .1
            .as_any_mut()
            .downcast_mut::<ViewConnection>()
            .ok_or_else(|| DbError::NotRegistered {
                name: name.to_string(),
            })?;
        Ok(query::snapshot_handle(db, view, snapshot))
    }
}

impl<'a> ReadWriteTransaction<'a> {
    /// Returns a query handle for a registered view, observing this
    /// transaction's own (uncommitted) mutations.
    pub fn view_mut<'t>(&'t mut self, name: &str) -> DbResult<ViewWriter<'t, 'a>> {
        let (db, store, ext_txns) = self.ext_parts();
        let entry = ext_txns
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| DbError::NotRegistered {
                name: name.to_string(),
            })?;
        let view = entry
            .1
            .as_any_mut()
            .downcast_mut::<ViewTransaction>()
            .ok_or_else(|| DbError::NotRegistered {
                name: name.to_string(),
            })?;
        {
            let mut host = ExtensionHost::new(
                store,
                db.object_deserializer(),
                db.metadata_deserializer(),
            );
            view.prepare(&mut host)?;
        }
        Ok(query::write_handle(db, view, store))
    }
}
