//! View queries, shared between read transactions (committed snapshot) and
//! read-write transactions (their own uncommitted mutations).

use crate::database::{collection_table, Database};
use crate::error::DbResult;
use crate::extension::{AccessLevel, ExtensionHost, StoredRow};
use crate::rows;
use crate::types::Snapshot;
use crate::view::page::{GroupIndex, Page, PageMeta};
use crate::view::txn::{self, ViewTransaction};
use crate::view::{
    view_map_table, view_meta_table, view_pages_table, ViewConnection, ViewDirection, ViewFind,
    ViewShared,
};
use parking_lot::MutexGuard;
use std::cmp::Ordering;
use std::ops::Range;
use std::sync::Arc;
use stratadb_store::{Rowid, StoreError, StoreWriteTxn, TableRead};

use crate::transaction::Flow;

/// Where a view query reads its pages and rows from.
pub(crate) trait ViewSource {
    fn groups(&mut self) -> DbResult<Vec<String>>;
    fn group_metas(&mut self, group: &str) -> DbResult<Vec<PageMeta>>;
    fn total_count(&mut self) -> DbResult<usize>;
    fn page(&mut self, page_key: u64) -> DbResult<Arc<Page>>;
    fn row(&mut self, rowid: Rowid, access: AccessLevel) -> DbResult<Option<StoredRow>>;
    fn page_of(&mut self, rowid: Rowid) -> DbResult<Option<u64>>;
    fn primary_rowid(&mut self, collection: &str, key: &str) -> DbResult<Option<Rowid>>;
}

/// View queries over the committed snapshot of a read transaction.
pub struct SnapshotViewSource<'t> {
    db: &'t Database,
    name: String,
    shared: MutexGuard<'t, ViewShared>,
    snapshot: Snapshot,
}

impl SnapshotViewSource<'_> {
    fn ensure_index(&mut self) -> DbResult<&GroupIndex> {
        if self.shared.group_index.is_none() {
            let reader = self.db.store().reader_at(self.snapshot.as_u64());
            let mut metas = Vec::new();
            for (key, record) in reader.scan(&view_meta_table(&self.name))? {
                let page_key = u64::from_be_bytes(
                    key.as_slice()
                        .try_into()
                        .map_err(|_| StoreError::corruption("view meta key malformed"))?,
                );
                metas.push(PageMeta::decode(page_key, &record.value)?);
            }
            self.shared.group_index = Some(GroupIndex::from_metas(metas)?);
        }
        self.shared
            .group_index
            .as_ref()
            .ok_or_else(|| crate::error::DbError::invalid_operation("view index unavailable"))
    }
}

impl ViewSource for SnapshotViewSource<'_> {
    fn groups(&mut self) -> DbResult<Vec<String>> {
        Ok(self.ensure_index()?.group_names_sorted())
    }

    fn group_metas(&mut self, group: &str) -> DbResult<Vec<PageMeta>> {
        Ok(self
            .ensure_index()?
            .groups
            .get(group)
            .cloned()
            .unwrap_or_default())
    }

    fn total_count(&mut self) -> DbResult<usize> {
        Ok(self.ensure_index()?.total_count())
    }

    fn page(&mut self, page_key: u64) -> DbResult<Arc<Page>> {
        if let Some(page) = self.shared.page_cache.get(&page_key) {
            return Ok(Arc::clone(page));
        }
        let reader = self.db.store().reader_at(self.snapshot.as_u64());
        let record = reader
            .get(&view_pages_table(&self.name), &page_key.to_be_bytes())?
            .ok_or_else(|| StoreError::corruption("view page missing"))?;
        let page = Arc::new(Page::decode(&record.value)?);
        self.shared.page_cache.insert(page_key, Arc::clone(&page));
        Ok(page)
    }

    fn row(&mut self, rowid: Rowid, access: AccessLevel) -> DbResult<Option<StoredRow>> {
        let reader = self.db.store().reader_at(self.snapshot.as_u64());
        rows::load_row_by_rowid(
            &reader,
            self.db.object_deserializer(),
            self.db.metadata_deserializer(),
            rowid,
            access,
        )
    }

    fn page_of(&mut self, rowid: Rowid) -> DbResult<Option<u64>> {
        let reader = self.db.store().reader_at(self.snapshot.as_u64());
        match reader.get(&view_map_table(&self.name), &rowid.to_be_bytes())? {
            None => Ok(None),
            Some(record) => Ok(Some(u64::from_le_bytes(
                record.value[..]
                    .try_into()
                    .map_err(|_| StoreError::corruption("view map entry malformed"))?,
            ))),
        }
    }

    fn primary_rowid(&mut self, collection: &str, key: &str) -> DbResult<Option<Rowid>> {
        let reader = self.db.store().reader_at(self.snapshot.as_u64());
        Ok(reader
            .get(&collection_table(collection), key.as_bytes())?
            .map(|record| record.rowid))
    }
}

/// View queries inside a read-write transaction, observing its uncommitted
/// view mutations.
pub struct TxnViewSource<'t, 'a> {
    db: &'t Database,
    view: &'t mut ViewTransaction,
    store: &'t mut StoreWriteTxn<'a>,
}

impl<'t, 'a> TxnViewSource<'t, 'a> {
    fn host(&mut self) -> (&mut ViewTransaction, ExtensionHost<'_, 'a>) {
        (
            &mut *self.view,
            ExtensionHost::new(
                &mut *self.store,
                self.db.object_deserializer(),
                self.db.metadata_deserializer(),
            ),
        )
    }
}

impl ViewSource for TxnViewSource<'_, '_> {
    fn groups(&mut self) -> DbResult<Vec<String>> {
        let work = require_work(self.view)?;
        Ok(work.index.group_names_sorted())
    }

    fn group_metas(&mut self, group: &str) -> DbResult<Vec<PageMeta>> {
        let work = require_work(self.view)?;
        Ok(work.index.groups.get(group).cloned().unwrap_or_default())
    }

    fn total_count(&mut self) -> DbResult<usize> {
        let work = require_work(self.view)?;
        Ok(work.index.total_count())
    }

    fn page(&mut self, page_key: u64) -> DbResult<Arc<Page>> {
        let name = self.view.name().to_string();
        let (view, mut host) = self.host();
        let work = require_work_mut(view)?;
        let page = txn::load_page(work, &mut host, &name, page_key)?;
        Ok(Arc::new(page.clone()))
    }

    fn row(&mut self, rowid: Rowid, access: AccessLevel) -> DbResult<Option<StoredRow>> {
        let (_, mut host) = self.host();
        host.row_for_rowid(rowid, access)
    }

    fn page_of(&mut self, rowid: Rowid) -> DbResult<Option<u64>> {
        let name = self.view.name().to_string();
        let (view, mut host) = self.host();
        let work = require_work_mut(view)?;
        txn::locate(work, &mut host, &name, rowid)
    }

    fn primary_rowid(&mut self, collection: &str, key: &str) -> DbResult<Option<Rowid>> {
        Ok(self
            .store
            .get(&collection_table(collection), key.as_bytes())?
            .map(|record| record.rowid))
    }
}

fn require_work(view: &ViewTransaction) -> DbResult<&txn::ViewWork> {
    view.work
        .as_ref()
        .ok_or_else(|| crate::error::DbError::invalid_operation("view transaction not prepared"))
}

fn require_work_mut(view: &mut ViewTransaction) -> DbResult<&mut txn::ViewWork> {
    view.work
        .as_mut()
        .ok_or_else(|| crate::error::DbError::invalid_operation("view transaction not prepared"))
}

/// A query handle over a view. See [`crate::ReadTransaction::view`] and
/// [`crate::ReadWriteTransaction::view_mut`].
pub struct ViewHandle<S> {
    source: S,
}

/// View queries over a read transaction's snapshot.
pub type ViewReader<'t> = ViewHandle<SnapshotViewSource<'t>>;

/// View queries inside a read-write transaction.
pub type ViewWriter<'t, 'a> = ViewHandle<TxnViewSource<'t, 'a>>;

pub(crate) fn snapshot_handle<'t>(
    db: &'t Database,
    conn: &'t mut ViewConnection,
    snapshot: Snapshot,
) -> ViewReader<'t> {
    ViewHandle {
        source: SnapshotViewSource {
            db,
            name: conn.name.clone(),
            shared: conn.shared.lock(),
            snapshot,
        },
    }
}

pub(crate) fn write_handle<'t, 'a>(
    db: &'t Database,
    view: &'t mut ViewTransaction,
    store: &'t mut StoreWriteTxn<'a>,
) -> ViewWriter<'t, 'a> {
    ViewHandle {
        source: TxnViewSource { db, view, store },
    }
}

impl<S: ViewSource> ViewHandle<S> {
    /// Returns the number of groups the view manages.
    pub fn group_count(&mut self) -> DbResult<usize> {
        Ok(self.source.groups()?.len())
    }

    /// Returns the names of all groups, sorted.
    pub fn all_groups(&mut self) -> DbResult<Vec<String>> {
        self.source.groups()
    }

    /// Returns true if the group has at least one row.
    pub fn has_group(&mut self, group: &str) -> DbResult<bool> {
        Ok(self.item_count_in_group(group)? > 0)
    }

    /// Returns the number of rows in a group.
    pub fn item_count_in_group(&mut self, group: &str) -> DbResult<usize> {
        Ok(self
            .source
            .group_metas(group)?
            .iter()
            .map(|m| m.count as usize)
            .sum())
    }

    /// Returns the number of rows in every group combined.
    pub fn item_count_total(&mut self) -> DbResult<usize> {
        self.source.total_count()
    }

    /// Returns true if the group has no rows.
    pub fn is_empty_group(&mut self, group: &str) -> DbResult<bool> {
        Ok(self.item_count_in_group(group)? == 0)
    }

    fn rowid_at(&mut self, group: &str, index: usize) -> DbResult<Option<Rowid>> {
        let metas = self.source.group_metas(group)?;
        let mut cum = 0usize;
        for meta in metas {
            let count = meta.count as usize;
            if index < cum + count {
                let page = self.source.page(meta.page_key)?;
                return Ok(page.rowids.get(index - cum).copied());
            }
            cum += count;
        }
        Ok(None)
    }

    /// Returns the `(collection, key)` at an index within a group.
    pub fn key_at_index(
        &mut self,
        group: &str,
        index: usize,
    ) -> DbResult<Option<(String, String)>> {
        match self.rowid_at(group, index)? {
            None => Ok(None),
            Some(rowid) => Ok(self
                .source
                .row(rowid, AccessLevel::Key)?
                .map(|row| (row.collection, row.key))),
        }
    }

    /// Returns the full row at an index within a group.
    pub fn row_at_index(&mut self, group: &str, index: usize) -> DbResult<Option<StoredRow>> {
        match self.rowid_at(group, index)? {
            None => Ok(None),
            Some(rowid) => self.source.row(rowid, AccessLevel::Row),
        }
    }

    /// Returns the group and index of a row, or `None` if the row is not in
    /// the view.
    pub fn index_of_key(
        &mut self,
        collection: &str,
        key: &str,
    ) -> DbResult<Option<(String, usize)>> {
        let Some(rowid) = self.source.primary_rowid(collection, key)? else {
            return Ok(None);
        };
        let Some(page_key) = self.source.page_of(rowid)? else {
            return Ok(None);
        };

        // Find the page in its group's chain and accumulate preceding
        // counts; only the one page body is loaded.
        for group in self.source.groups()? {
            let metas = self.source.group_metas(&group)?;
            let mut cum = 0usize;
            for meta in &metas {
                if meta.page_key == page_key {
                    let page = self.source.page(page_key)?;
                    let Some(local) = page.position_of(rowid) else {
                        return Err(StoreError::corruption(
                            "view map points at wrong page",
                        )
                        .into());
                    };
                    return Ok(Some((group, cum + local)));
                }
                cum += meta.count as usize;
            }
        }
        Ok(None)
    }

    /// Enumerates a group in the given direction.
    pub fn enumerate_group(
        &mut self,
        group: &str,
        direction: ViewDirection,
        f: impl FnMut(usize, &str, &str) -> Flow,
    ) -> DbResult<()> {
        let total = self.item_count_in_group(group)?;
        self.enumerate_range(group, 0..total, direction, f)
    }

    /// Enumerates an index range of a group in the given direction.
    pub fn enumerate_range(
        &mut self,
        group: &str,
        range: Range<usize>,
        direction: ViewDirection,
        mut f: impl FnMut(usize, &str, &str) -> Flow,
    ) -> DbResult<()> {
        let total = self.item_count_in_group(group)?;
        let start = range.start.min(total);
        let end = range.end.min(total);
        if start >= end {
            return Ok(());
        }

        let indices: Vec<usize> = match direction {
            ViewDirection::Forward => (start..end).collect(),
            ViewDirection::Reverse => (start..end).rev().collect(),
        };
        for index in indices {
            let Some(rowid) = self.rowid_at(group, index)? else {
                break;
            };
            let Some(row) = self.source.row(rowid, AccessLevel::Key)? else {
                return Err(StoreError::corruption("view references a dead rowid").into());
            };
            if f(index, &row.collection, &row.key) == Flow::Break {
                break;
            }
        }
        Ok(())
    }

    /// Binary-searches a group for the contiguous index range matching a
    /// monotonic predicate.
    ///
    /// The predicate's ordering must be consistent with the view's sort
    /// comparator; this precondition is not validated (see [`ViewFind`]).
    pub fn find_range(
        &mut self,
        group: &str,
        find: &dyn ViewFind,
    ) -> DbResult<Option<Range<usize>>> {
        let total = self.item_count_in_group(group)?;
        if total == 0 {
            return Ok(None);
        }
        let access = find.access();

        let mut classify = |this: &mut Self, index: usize| -> DbResult<Ordering> {
            let Some(rowid) = this.rowid_at(group, index)? else {
                return Err(StoreError::corruption("view index out of bounds").into());
            };
            let Some(row) = this.source.row(rowid, access)? else {
                return Err(StoreError::corruption("view references a dead rowid").into());
            };
            Ok(find.compare(&row))
        };

        // Locate any matching index.
        let mut lo = 0usize;
        let mut hi = total;
        let mut hit = None;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match classify(self, mid)? {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => {
                    hit = Some(mid);
                    break;
                }
            }
        }
        let Some(hit) = hit else {
            return Ok(None);
        };

        // Lower bound: first matching index in [lo, hit].
        let mut llo = lo;
        let mut lhi = hit;
        while llo < lhi {
            let mid = llo + (lhi - llo) / 2;
            if classify(self, mid)? == Ordering::Less {
                llo = mid + 1;
            } else {
                lhi = mid;
            }
        }

        // Upper bound: first non-matching index in (hit, hi).
        let mut ulo = hit + 1;
        let mut uhi = hi;
        while ulo < uhi {
            let mid = ulo + (uhi - ulo) / 2;
            if classify(self, mid)? == Ordering::Greater {
                uhi = mid;
            } else {
                ulo = mid + 1;
            }
        }

        Ok(Some(llo..ulo))
    }
}
