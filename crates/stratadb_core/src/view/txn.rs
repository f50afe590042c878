//! The view's transaction-scoped hook object.
//!
//! All mutations are speculative: the working index and modified pages live
//! in memory until `flush` writes them through the host's store transaction,
//! and the owning connection only adopts them in `did_commit`.

use crate::error::{DbError, DbResult};
use crate::extension::{ExtensionHost, ExtensionTransaction, RowChange, StoredRow};
use crate::types::Snapshot;
use crate::view::page::{GroupIndex, Page, PageMeta};
use crate::view::{
    view_cfg_table, view_map_table, view_meta_table, view_pages_table, ViewShared, ViewStrategies,
    NEXT_PAGE_KEY,
};
use parking_lot::Mutex;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use stratadb_codec::Value;
use stratadb_store::{Rowid, StoreError, TableRead};

pub(crate) struct ViewWork {
    pub(crate) index: GroupIndex,
    pub(crate) pages: HashMap<u64, Page>,
    pub(crate) deleted_pages: HashSet<u64>,
    pub(crate) dirty_pages: HashSet<u64>,
    pub(crate) dirty_metas: HashSet<u64>,
    pub(crate) map_overlay: HashMap<Rowid, Option<u64>>,
    pub(crate) next_page_key: u64,
    pub(crate) structure_changed: bool,
    pub(crate) cleared: bool,
}

/// The view's [`ExtensionTransaction`] implementation.
pub struct ViewTransaction {
    name: String,
    strategies: Arc<ViewStrategies>,
    shared: Arc<Mutex<ViewShared>>,
    pub(crate) work: Option<ViewWork>,
    fragment: Option<Value>,
}

impl ViewTransaction {
    pub(crate) fn new(
        name: String,
        strategies: Arc<ViewStrategies>,
        shared: Arc<Mutex<ViewShared>>,
    ) -> Self {
        Self {
            name,
            strategies,
            shared,
            work: None,
            fragment: None,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn apply(&mut self, host: &mut ExtensionHost<'_, '_>, change: &RowChange<'_>) -> DbResult<()> {
        self.prepare(host)?;
        let name = self.name.clone();
        let strategies = Arc::clone(&self.strategies);
        let work = work_mut(&mut self.work)?;

        let group = strategies.grouper.group(
            change.collection,
            change.key,
            change.object,
            change.metadata,
        );
        let existing = locate(work, host, &name, change.rowid)?;
        let new_row = StoredRow {
            collection: change.collection.to_string(),
            key: change.key.to_string(),
            rowid: change.rowid,
            object: change.object.cloned(),
            metadata: change.metadata.cloned(),
        };

        match (group, existing) {
            (None, None) => Ok(()),
            (None, Some(page_key)) => remove_rowid(work, host, &name, change.rowid, page_key),
            (Some(group), None) => {
                insert_rowid(work, host, &strategies, &name, &group, &new_row)
            }
            (Some(group), Some(page_key)) => {
                if in_place_ok(work, host, &strategies, &name, &group, page_key, &new_row)? {
                    return Ok(());
                }
                remove_rowid(work, host, &name, change.rowid, page_key)?;
                insert_rowid(work, host, &strategies, &name, &group, &new_row)
            }
        }
    }
}

impl ExtensionTransaction for ViewTransaction {
    fn prepare(&mut self, host: &mut ExtensionHost<'_, '_>) -> DbResult<()> {
        if self.work.is_some() {
            return Ok(());
        }
        let cached = self.shared.lock().group_index.clone();
        let index = match cached {
            Some(index) => index,
            None => {
                let mut metas = Vec::new();
                for (key, record) in host.store.scan(&view_meta_table(&self.name))? {
                    let page_key = u64::from_be_bytes(
                        key.as_slice()
                            .try_into()
                            .map_err(|_| StoreError::corruption("view meta key malformed"))?,
                    );
                    metas.push(PageMeta::decode(page_key, &record.value)?);
                }
                GroupIndex::from_metas(metas)?
            }
        };
        let next_page_key = match host
            .store
            .get(&view_cfg_table(&self.name), NEXT_PAGE_KEY)?
        {
            Some(record) => u64::from_le_bytes(
                record.value[..]
                    .try_into()
                    .map_err(|_| StoreError::corruption("view page counter malformed"))?,
            ),
            None => 1,
        };
        self.work = Some(ViewWork {
            index,
            pages: HashMap::new(),
            deleted_pages: HashSet::new(),
            dirty_pages: HashSet::new(),
            dirty_metas: HashSet::new(),
            map_overlay: HashMap::new(),
            next_page_key,
            structure_changed: false,
            cleared: false,
        });
        Ok(())
    }

    fn handle_insert_or_update(
        &mut self,
        host: &mut ExtensionHost<'_, '_>,
        change: &RowChange<'_>,
    ) -> DbResult<()> {
        self.apply(host, change)
    }

    fn handle_metadata_update(
        &mut self,
        host: &mut ExtensionHost<'_, '_>,
        change: &RowChange<'_>,
    ) -> DbResult<()> {
        // Grouping and sorting that never look at metadata cannot be
        // affected by a metadata-only write.
        if !self.strategies.access.needs_metadata() {
            return Ok(());
        }
        self.apply(host, change)
    }

    fn handle_remove(
        &mut self,
        host: &mut ExtensionHost<'_, '_>,
        _collection: &str,
        _key: &str,
        rowid: Rowid,
    ) -> DbResult<()> {
        self.prepare(host)?;
        let name = self.name.clone();
        let work = work_mut(&mut self.work)?;
        if let Some(page_key) = locate(work, host, &name, rowid)? {
            remove_rowid(work, host, &name, rowid, page_key)?;
        }
        Ok(())
    }

    fn handle_remove_all_in_collection(
        &mut self,
        host: &mut ExtensionHost<'_, '_>,
        collection: &str,
    ) -> DbResult<()> {
        self.prepare(host)?;
        let name = self.name.clone();
        let table = crate::database::collection_table(collection);
        let work = work_mut(&mut self.work)?;

        // Gather every member rowid belonging to the collection, then
        // remove them one by one (rowids never migrate between pages).
        let mut members: Vec<Rowid> = Vec::new();
        let page_keys: Vec<u64> = work
            .index
            .groups
            .values()
            .flat_map(|metas| metas.iter().map(|m| m.page_key))
            .collect();
        for page_key in page_keys {
            let rowids = load_page(work, host, &name, page_key)?.rowids.clone();
            for rowid in rowids {
                if let Some((owner, _)) = host.store.rowid_entry(rowid)? {
                    if owner == table {
                        members.push(rowid);
                    }
                }
            }
        }
        for rowid in members {
            if let Some(page_key) = locate(work, host, &name, rowid)? {
                remove_rowid(work, host, &name, rowid, page_key)?;
            }
        }
        Ok(())
    }

    fn handle_remove_everything(&mut self, host: &mut ExtensionHost<'_, '_>) -> DbResult<()> {
        self.prepare(host)?;
        let work = work_mut(&mut self.work)?;
        work.index = GroupIndex::default();
        work.pages.clear();
        work.deleted_pages.clear();
        work.dirty_pages.clear();
        work.dirty_metas.clear();
        work.map_overlay.clear();
        work.structure_changed = true;
        work.cleared = true;
        Ok(())
    }

    fn flush(&mut self, host: &mut ExtensionHost<'_, '_>) -> DbResult<()> {
        let Some(work) = &self.work else {
            return Ok(());
        };
        let changed = work.cleared
            || work.structure_changed
            || !work.dirty_pages.is_empty()
            || !work.map_overlay.is_empty();
        if !changed {
            return Ok(());
        }
        let name = &self.name;

        if work.cleared {
            host.store.clear_table(&view_map_table(name))?;
            host.store.clear_table(&view_pages_table(name))?;
            host.store.clear_table(&view_meta_table(name))?;
        }
        for page_key in &work.deleted_pages {
            host.store
                .delete(&view_pages_table(name), &page_key.to_be_bytes())?;
            host.store
                .delete(&view_meta_table(name), &page_key.to_be_bytes())?;
        }

        let metas = work.index.metas_by_key();
        for page_key in work.dirty_pages.iter().chain(&work.dirty_metas) {
            if work.deleted_pages.contains(page_key) {
                continue;
            }
            let meta = metas.get(page_key).ok_or_else(|| {
                StoreError::corruption("dirty view page missing from index")
            })?;
            if let Some(page) = work.pages.get(page_key) {
                host.store.put(
                    &view_pages_table(name),
                    &page_key.to_be_bytes(),
                    page.encode(),
                )?;
            }
            host.store.put(
                &view_meta_table(name),
                &page_key.to_be_bytes(),
                meta.encode(),
            )?;
        }

        for (rowid, target) in &work.map_overlay {
            match target {
                Some(page_key) => {
                    host.store.put(
                        &view_map_table(name),
                        &rowid.to_be_bytes(),
                        page_key.to_le_bytes().to_vec(),
                    )?;
                }
                None => {
                    host.store
                        .delete(&view_map_table(name), &rowid.to_be_bytes())?;
                }
            }
        }
        host.store.put(
            &view_cfg_table(name),
            NEXT_PAGE_KEY,
            work.next_page_key.to_le_bytes().to_vec(),
        )?;
        Ok(())
    }

    fn changeset_fragment(&mut self) -> Option<Value> {
        let work = self.work.as_ref()?;
        let changed = work.cleared || work.structure_changed || !work.dirty_pages.is_empty();
        if !changed {
            return None;
        }
        let pages: Vec<Value> = work
            .dirty_pages
            .iter()
            .chain(&work.deleted_pages)
            .map(|&page_key| Value::Integer(page_key as i64))
            .collect();
        let fragment = Value::record(vec![
            ("pages", Value::Array(pages)),
            ("structure", Value::Bool(work.structure_changed)),
            ("cleared", Value::Bool(work.cleared)),
        ]);
        self.fragment = Some(fragment.clone());
        Some(fragment)
    }

    fn did_commit(&mut self, _snapshot: Snapshot) {
        let Some(work) = self.work.take() else {
            return;
        };
        let mut shared = self.shared.lock();
        if work.cleared {
            shared.page_cache.clear();
        }
        for page_key in &work.deleted_pages {
            shared.page_cache.remove(page_key);
        }
        for page_key in &work.dirty_pages {
            if let Some(page) = work.pages.get(page_key) {
                shared
                    .page_cache
                    .insert(*page_key, Arc::new(page.clone()));
            }
        }
        shared.group_index = Some(work.index);
        shared.last_fragment = self.fragment.take();
    }

    fn rollback(&mut self) {
        self.work = None;
        self.fragment = None;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn work_mut(work: &mut Option<ViewWork>) -> DbResult<&mut ViewWork> {
    work.as_mut()
        .ok_or_else(|| DbError::invalid_operation("view transaction not prepared"))
}

pub(crate) fn locate(
    work: &ViewWork,
    host: &mut ExtensionHost<'_, '_>,
    name: &str,
    rowid: Rowid,
) -> DbResult<Option<u64>> {
    if let Some(entry) = work.map_overlay.get(&rowid) {
        return Ok(*entry);
    }
    if work.cleared {
        return Ok(None);
    }
    match host.store.get(&view_map_table(name), &rowid.to_be_bytes())? {
        None => Ok(None),
        Some(record) => Ok(Some(u64::from_le_bytes(
            record.value[..]
                .try_into()
                .map_err(|_| StoreError::corruption("view map entry malformed"))?,
        ))),
    }
}

pub(crate) fn load_page<'w>(
    work: &'w mut ViewWork,
    host: &mut ExtensionHost<'_, '_>,
    name: &str,
    page_key: u64,
) -> DbResult<&'w mut Page> {
    if !work.pages.contains_key(&page_key) {
        let record = host
            .store
            .get(&view_pages_table(name), &page_key.to_be_bytes())?
            .ok_or_else(|| StoreError::corruption("view page missing"))?;
        let page = Page::decode(&record.value)?;
        work.pages.insert(page_key, page);
    }
    work.pages
        .get_mut(&page_key)
        .ok_or_else(|| StoreError::corruption("view page vanished").into())
}

fn group_of_page(index: &GroupIndex, page_key: u64) -> Option<(String, usize)> {
    for (group, metas) in &index.groups {
        if let Some(pos) = metas.iter().position(|m| m.page_key == page_key) {
            return Some((group.clone(), pos));
        }
    }
    None
}

fn load_sort_row(
    host: &mut ExtensionHost<'_, '_>,
    strategies: &ViewStrategies,
    rowid: Rowid,
) -> DbResult<StoredRow> {
    host.row_for_rowid(rowid, strategies.access)?
        .ok_or_else(|| StoreError::corruption("view references a dead rowid").into())
}

fn rowid_at(
    work: &mut ViewWork,
    host: &mut ExtensionHost<'_, '_>,
    name: &str,
    group: &str,
    index: usize,
) -> DbResult<Option<Rowid>> {
    let Some(metas) = work.index.groups.get(group) else {
        return Ok(None);
    };
    let mut cum = 0usize;
    let mut target = None;
    for meta in metas {
        let count = meta.count as usize;
        if index < cum + count {
            target = Some((meta.page_key, index - cum));
            break;
        }
        cum += count;
    }
    let Some((page_key, local)) = target else {
        return Ok(None);
    };
    let page = load_page(work, host, name, page_key)?;
    Ok(page.rowids.get(local).copied())
}

/// Checks whether an updated row can stay at its current position: compares
/// only against its immediate left and right neighbors before any binary
/// search is attempted.
fn in_place_ok(
    work: &mut ViewWork,
    host: &mut ExtensionHost<'_, '_>,
    strategies: &ViewStrategies,
    name: &str,
    group: &str,
    page_key: u64,
    new_row: &StoredRow,
) -> DbResult<bool> {
    let Some((current_group, meta_pos)) = group_of_page(&work.index, page_key) else {
        return Ok(false);
    };
    if current_group != group {
        return Ok(false);
    }
    let cum: usize = work.index.groups[group][..meta_pos]
        .iter()
        .map(|m| m.count as usize)
        .sum();
    let local = {
        let page = load_page(work, host, name, page_key)?;
        match page.position_of(new_row.rowid) {
            Some(local) => local,
            None => return Ok(false),
        }
    };
    let position = cum + local;
    let total = work.index.count_in_group(group);

    if position > 0 {
        let Some(left) = rowid_at(work, host, name, group, position - 1)? else {
            return Ok(false);
        };
        let left_row = load_sort_row(host, strategies, left)?;
        if strategies.sorter.compare(group, &left_row, new_row) == Ordering::Greater {
            return Ok(false);
        }
    }
    if position + 1 < total {
        let Some(right) = rowid_at(work, host, name, group, position + 1)? else {
            return Ok(false);
        };
        let right_row = load_sort_row(host, strategies, right)?;
        if strategies.sorter.compare(group, new_row, &right_row) == Ordering::Greater {
            return Ok(false);
        }
    }
    Ok(true)
}

fn insert_rowid(
    work: &mut ViewWork,
    host: &mut ExtensionHost<'_, '_>,
    strategies: &ViewStrategies,
    name: &str,
    group: &str,
    new_row: &StoredRow,
) -> DbResult<()> {
    work.structure_changed = true;
    let rowid = new_row.rowid;
    let total = work.index.count_in_group(group);

    if total == 0 {
        let page_key = alloc_page_key(work);
        work.pages.insert(
            page_key,
            Page {
                rowids: vec![rowid],
            },
        );
        work.index.groups.entry(group.to_string()).or_default().push(PageMeta {
            page_key,
            group: group.to_string(),
            next: None,
            count: 1,
        });
        work.dirty_pages.insert(page_key);
        work.map_overlay.insert(rowid, Some(page_key));
        return Ok(());
    }

    // Fast paths: the common append and prepend cases compare against the
    // very last and very first rows before falling back to binary search.
    let position = {
        let compare_at = |work: &mut ViewWork,
                          host: &mut ExtensionHost<'_, '_>,
                          index: usize|
         -> DbResult<Ordering> {
            let at = rowid_at(work, host, name, group, index)?
                .ok_or_else(|| StoreError::corruption("view index out of bounds"))?;
            let row = load_sort_row(host, strategies, at)?;
            Ok(strategies.sorter.compare(group, new_row, &row))
        };

        if compare_at(work, host, total - 1)? != Ordering::Less {
            total
        } else if total == 1 || compare_at(work, host, 0)? == Ordering::Less {
            0
        } else {
            // Invariant here: row(0) <= new < row(total - 1).
            let mut lo = 1usize;
            let mut hi = total - 1;
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                if compare_at(work, host, mid)? == Ordering::Less {
                    hi = mid;
                } else {
                    lo = mid + 1;
                }
            }
            lo
        }
    };

    insert_at(work, host, strategies, name, group, position, rowid)
}

fn insert_at(
    work: &mut ViewWork,
    host: &mut ExtensionHost<'_, '_>,
    strategies: &ViewStrategies,
    name: &str,
    group: &str,
    position: usize,
    rowid: Rowid,
) -> DbResult<()> {
    let (page_key, local) = {
        let metas = work
            .index
            .groups
            .get(group)
            .ok_or_else(|| StoreError::corruption("view group vanished"))?;
        let mut cum = 0usize;
        let mut found = None;
        for meta in metas {
            let count = meta.count as usize;
            if position <= cum + count {
                found = Some((meta.page_key, position - cum));
                break;
            }
            cum += count;
        }
        found.ok_or_else(|| StoreError::corruption("view insert position out of bounds"))?
    };

    {
        let page = load_page(work, host, name, page_key)?;
        page.rowids.insert(local, rowid);
    }
    work.dirty_pages.insert(page_key);
    work.map_overlay.insert(rowid, Some(page_key));

    let metas = work
        .index
        .groups
        .get_mut(group)
        .ok_or_else(|| StoreError::corruption("view group vanished"))?;
    let meta_pos = metas
        .iter()
        .position(|m| m.page_key == page_key)
        .ok_or_else(|| StoreError::corruption("view page missing from chain"))?;
    metas[meta_pos].count += 1;

    // Split an oversized page in two; no chain-wide rebalance is needed.
    let len = metas[meta_pos].count as usize;
    if len > strategies.page_size {
        let split_at = len / 2;
        let tail = {
            let page = load_page(work, host, name, page_key)?;
            page.rowids.split_off(split_at)
        };
        let new_page_key = alloc_page_key(work);
        for &moved in &tail {
            work.map_overlay.insert(moved, Some(new_page_key));
        }
        let metas = work
            .index
            .groups
            .get_mut(group)
            .ok_or_else(|| StoreError::corruption("view group vanished"))?;
        let next = metas[meta_pos].next;
        metas[meta_pos].count = split_at as u32;
        metas[meta_pos].next = Some(new_page_key);
        metas.insert(
            meta_pos + 1,
            PageMeta {
                page_key: new_page_key,
                group: group.to_string(),
                next,
                count: tail.len() as u32,
            },
        );
        work.pages.insert(new_page_key, Page { rowids: tail });
        work.dirty_pages.insert(page_key);
        work.dirty_pages.insert(new_page_key);
    }
    Ok(())
}

fn remove_rowid(
    work: &mut ViewWork,
    host: &mut ExtensionHost<'_, '_>,
    name: &str,
    rowid: Rowid,
    page_key: u64,
) -> DbResult<()> {
    work.structure_changed = true;
    let now_empty = {
        let page = load_page(work, host, name, page_key)?;
        let local = page
            .position_of(rowid)
            .ok_or_else(|| StoreError::corruption("view map points at wrong page"))?;
        page.rowids.remove(local);
        page.rowids.is_empty()
    };
    work.map_overlay.insert(rowid, None);

    let (group, meta_pos) = group_of_page(&work.index, page_key)
        .ok_or_else(|| StoreError::corruption("view page missing from index"))?;
    let metas = work
        .index
        .groups
        .get_mut(&group)
        .ok_or_else(|| StoreError::corruption("view group vanished"))?;

    if now_empty {
        let removed = metas.remove(meta_pos);
        if meta_pos > 0 {
            metas[meta_pos - 1].next = removed.next;
            work.dirty_metas.insert(metas[meta_pos - 1].page_key);
        }
        if metas.is_empty() {
            work.index.groups.remove(&group);
        }
        work.deleted_pages.insert(page_key);
        work.dirty_pages.remove(&page_key);
        work.pages.remove(&page_key);
    } else {
        metas[meta_pos].count -= 1;
        work.dirty_pages.insert(page_key);
    }
    Ok(())
}

fn alloc_page_key(work: &mut ViewWork) -> u64 {
    let key = work.next_page_key;
    work.next_page_key += 1;
    key
}
