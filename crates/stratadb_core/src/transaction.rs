//! Read and read-write transactions.
//!
//! Transactions are the only access path to data. They are scoped to the
//! enclosing connection block; the borrow checker prevents use after the
//! block returns. Read transactions observe a consistent snapshot;
//! read-write transactions are globally serialized, forward every mutation
//! to all registered extensions synchronously, and commit atomically.

use crate::cache::CacheEntry;
use crate::changeset::Changeset;
use crate::connection::ConnectionState;
use crate::database::{collection_table, Database, COLLECTION_PREFIX};
use crate::error::{DbError, DbResult};
use crate::extension::{Extension, ExtensionHost, ExtensionTransaction, RowChange};
use crate::rows::{decode_row_value, encode_row_value, key_from_bytes};
use crate::types::{RowKey, Snapshot};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use stratadb_codec::{from_value, to_value, Value};
use stratadb_store::{StoreWriteTxn, TableRead};

/// Whether an enumeration continues or stops early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep enumerating.
    Continue,
    /// Stop after this row.
    Break,
}

/// A filter that runs against lightweight metadata before the (potentially
/// expensive) object deserialization is performed.
pub type MetadataFilter<'f> = &'f dyn Fn(&str, Option<&Value>) -> bool;

fn enumerate_rows_impl<R: TableRead>(
    db: &Database,
    reader: &R,
    collection: &str,
    filter: Option<MetadataFilter<'_>>,
    mut f: impl FnMut(&str, &Value, Option<&Value>) -> Flow,
) -> DbResult<()> {
    for (key_bytes, record) in reader.scan(&collection_table(collection))? {
        let key = key_from_bytes(key_bytes)?;
        let (object_bytes, metadata_bytes) = decode_row_value(&record.value)?;
        let metadata = metadata_bytes
            .map(|bytes| db.metadata_deserializer().deserialize(collection, &key, bytes))
            .transpose()?;
        if let Some(filter) = filter {
            if !filter(&key, metadata.as_ref()) {
                continue;
            }
        }
        let object = db
            .object_deserializer()
            .deserialize(collection, &key, object_bytes)?;
        if f(&key, &object, metadata.as_ref()) == Flow::Break {
            break;
        }
    }
    Ok(())
}

fn collection_names_impl<R: TableRead>(reader: &R) -> DbResult<Vec<String>> {
    Ok(reader
        .table_names()?
        .into_iter()
        .filter_map(|name| {
            name.strip_prefix(COLLECTION_PREFIX)
                .map(ToString::to_string)
        })
        .collect())
}

fn keys_impl<R: TableRead>(reader: &R, collection: &str) -> DbResult<Vec<String>> {
    reader
        .scan(&collection_table(collection))?
        .into_iter()
        .map(|(key_bytes, _)| key_from_bytes(key_bytes))
        .collect()
}

/// A read-only transaction, valid for the lifetime of its connection block.
pub struct ReadTransaction<'a> {
    db: &'a Database,
    state: &'a mut ConnectionState,
    snapshot: Snapshot,
}

impl<'a> ReadTransaction<'a> {
    pub(crate) fn new(
        db: &'a Database,
        state: &'a mut ConnectionState,
        snapshot: Snapshot,
    ) -> Self {
        Self {
            db,
            state,
            snapshot,
        }
    }

    pub(crate) fn parts(&mut self) -> (&'a Database, &mut ConnectionState, Snapshot) {
        (self.db, self.state, self.snapshot)
    }

    /// Returns the snapshot this transaction observes.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    /// Read access to the underlying store at this transaction's snapshot.
    ///
    /// Intended for extension implementations reading their own tables.
    #[must_use]
    pub fn store_reader(&self) -> stratadb_store::SnapshotReader<'a> {
        self.db.store().reader_at(self.snapshot.as_u64())
    }

    /// Returns the row's object, or `None` if the row is absent.
    pub fn object(&mut self, collection: &str, key: &str) -> DbResult<Option<Arc<Value>>> {
        let row_key = RowKey::new(collection, key);
        if let Some((entry, _)) = self.state.object_cache.get(&row_key) {
            return Ok(entry_value(entry));
        }
        if let Some(entry) = self.db.shared_object_cache().get(&row_key, self.snapshot) {
            self.state
                .object_cache
                .insert(row_key, entry.clone(), self.snapshot);
            return Ok(entry_value(entry));
        }

        let reader = self.db.store().reader_at(self.snapshot.as_u64());
        let result = match reader.get(&collection_table(collection), key.as_bytes())? {
            None => None,
            Some(record) => {
                let (object_bytes, _) = decode_row_value(&record.value)?;
                Some(Arc::new(self.db.object_deserializer().deserialize(
                    collection,
                    key,
                    object_bytes,
                )?))
            }
        };
        let entry = match &result {
            Some(object) => CacheEntry::Present(Arc::clone(object)),
            None => CacheEntry::Absent,
        };
        self.db
            .shared_object_cache()
            .insert(row_key.clone(), entry.clone(), self.snapshot);
        self.state.object_cache.insert(row_key, entry, self.snapshot);
        Ok(result)
    }

    /// Returns the row's metadata, or `None` if the row is absent or has no
    /// metadata.
    pub fn metadata(&mut self, collection: &str, key: &str) -> DbResult<Option<Arc<Value>>> {
        let row_key = RowKey::new(collection, key);
        if let Some((entry, _)) = self.state.metadata_cache.get(&row_key) {
            return Ok(entry_value(entry));
        }
        if let Some(entry) = self
            .db
            .shared_metadata_cache()
            .get(&row_key, self.snapshot)
        {
            self.state
                .metadata_cache
                .insert(row_key, entry.clone(), self.snapshot);
            return Ok(entry_value(entry));
        }

        let reader = self.db.store().reader_at(self.snapshot.as_u64());
        let result = match reader.get(&collection_table(collection), key.as_bytes())? {
            None => None,
            Some(record) => {
                let (_, metadata_bytes) = decode_row_value(&record.value)?;
                match metadata_bytes {
                    None => None,
                    Some(bytes) => Some(Arc::new(
                        self.db
                            .metadata_deserializer()
                            .deserialize(collection, key, bytes)?,
                    )),
                }
            }
        };
        let entry = match &result {
            Some(metadata) => CacheEntry::Present(Arc::clone(metadata)),
            None => CacheEntry::Absent,
        };
        self.db
            .shared_metadata_cache()
            .insert(row_key.clone(), entry.clone(), self.snapshot);
        self.state
            .metadata_cache
            .insert(row_key, entry, self.snapshot);
        Ok(result)
    }

    /// Returns the row's object and metadata together.
    pub fn row(
        &mut self,
        collection: &str,
        key: &str,
    ) -> DbResult<Option<(Arc<Value>, Option<Arc<Value>>)>> {
        match self.object(collection, key)? {
            None => Ok(None),
            Some(object) => {
                let metadata = self.metadata(collection, key)?;
                Ok(Some((object, metadata)))
            }
        }
    }

    /// Returns the row's object transcoded into a typed value.
    pub fn object_as<T: DeserializeOwned>(
        &mut self,
        collection: &str,
        key: &str,
    ) -> DbResult<Option<T>> {
        match self.object(collection, key)? {
            None => Ok(None),
            Some(object) => Ok(Some(from_value(&object)?)),
        }
    }

    /// Returns true if the row exists.
    pub fn exists(&mut self, collection: &str, key: &str) -> DbResult<bool> {
        let row_key = RowKey::new(collection, key);
        if let Some((entry, _)) = self.state.object_cache.get(&row_key) {
            return Ok(matches!(entry, CacheEntry::Present(_)));
        }
        let reader = self.db.store().reader_at(self.snapshot.as_u64());
        Ok(reader.contains(&collection_table(collection), key.as_bytes())?)
    }

    /// Returns the number of rows in a collection.
    pub fn key_count(&self, collection: &str) -> DbResult<usize> {
        let reader = self.db.store().reader_at(self.snapshot.as_u64());
        Ok(reader.row_count(&collection_table(collection))?)
    }

    /// Returns the names of all non-empty collections.
    pub fn collection_names(&self) -> DbResult<Vec<String>> {
        collection_names_impl(&self.db.store().reader_at(self.snapshot.as_u64()))
    }

    /// Returns every key in a collection, in ascending order.
    pub fn keys(&self, collection: &str) -> DbResult<Vec<String>> {
        keys_impl(&self.db.store().reader_at(self.snapshot.as_u64()), collection)
    }

    /// Enumerates the keys of a collection without touching row values.
    pub fn enumerate_keys(
        &self,
        collection: &str,
        mut f: impl FnMut(&str) -> Flow,
    ) -> DbResult<()> {
        for key in self.keys(collection)? {
            if f(&key) == Flow::Break {
                break;
            }
        }
        Ok(())
    }

    /// Enumerates the rows of a collection.
    ///
    /// The optional `filter` runs against metadata before the object is
    /// deserialized, letting callers skip deserialization for rows they
    /// will discard.
    pub fn enumerate_rows(
        &mut self,
        collection: &str,
        filter: Option<MetadataFilter<'_>>,
        f: impl FnMut(&str, &Value, Option<&Value>) -> Flow,
    ) -> DbResult<()> {
        let reader = self.db.store().reader_at(self.snapshot.as_u64());
        enumerate_rows_impl(self.db, &reader, collection, filter, f)
    }
}

impl std::fmt::Debug for ReadTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTransaction")
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

fn entry_value(entry: CacheEntry) -> Option<Arc<Value>> {
    match entry {
        CacheEntry::Present(value) => Some(value),
        CacheEntry::Absent => None,
    }
}

/// A read-write transaction.
///
/// Every write first runs the optional sanitizer, then forwards the
/// mutation to every registered extension synchronously in registration
/// order, then performs the physical write. If an extension signals a
/// fatal inconsistency the whole transaction aborts and rolls back.
pub struct ReadWriteTransaction<'a> {
    db: &'a Database,
    store_txn: StoreWriteTxn<'a>,
    ext_txns: Vec<(String, Box<dyn ExtensionTransaction>)>,
    prepared: bool,
    changeset: Changeset,
    staged_objects: HashMap<RowKey, Option<Arc<Value>>>,
    staged_metadata: HashMap<RowKey, Option<Arc<Value>>>,
    failure: Option<DbError>,
}

impl<'a> ReadWriteTransaction<'a> {
    pub(crate) fn new(
        db: &'a Database,
        store_txn: StoreWriteTxn<'a>,
        ext_txns: Vec<(String, Box<dyn ExtensionTransaction>)>,
    ) -> Self {
        Self {
            db,
            store_txn,
            ext_txns,
            prepared: false,
            changeset: Changeset::new(),
            staged_objects: HashMap::new(),
            staged_metadata: HashMap::new(),
            failure: None,
        }
    }

    pub(crate) fn ext_parts(
        &mut self,
    ) -> (
        &'a Database,
        &mut StoreWriteTxn<'a>,
        &mut Vec<(String, Box<dyn ExtensionTransaction>)>,
    ) {
        (self.db, &mut self.store_txn, &mut self.ext_txns)
    }

    /// Direct access to the underlying store transaction.
    ///
    /// Intended for extension implementations performing maintenance writes
    /// on their own tables; application data should go through
    /// [`ReadWriteTransaction::set`] and friends so extensions observe it.
    pub fn store_mut(&mut self) -> &mut StoreWriteTxn<'a> {
        &mut self.store_txn
    }

    pub(crate) fn store_ref(&self) -> &StoreWriteTxn<'a> {
        &self.store_txn
    }

    pub(crate) fn has_extension_txn(&self, name: &str) -> bool {
        self.ext_txns.iter().any(|(n, _)| n == name)
    }

    fn guard(&self) -> DbResult<()> {
        if self.failure.is_some() {
            return Err(DbError::invalid_operation(
                "transaction already failed and will roll back",
            ));
        }
        Ok(())
    }

    pub(crate) fn take_failure(&mut self) -> Option<DbError> {
        self.failure.take()
    }

    fn prepare_extensions(&mut self) -> DbResult<()> {
        if self.prepared {
            return Ok(());
        }
        let mut host = ExtensionHost::new(
            &mut self.store_txn,
            self.db.object_deserializer(),
            self.db.metadata_deserializer(),
        );
        for (name, ext) in &mut self.ext_txns {
            ext.prepare(&mut host)
                .map_err(|err| DbError::extension_inconsistency(name.clone(), err.to_string()))?;
        }
        self.prepared = true;
        Ok(())
    }

    fn dispatch(
        &mut self,
        mut f: impl FnMut(
            &mut dyn ExtensionTransaction,
            &mut ExtensionHost<'_, 'a>,
        ) -> DbResult<()>,
    ) -> DbResult<()> {
        let mut host = ExtensionHost::new(
            &mut self.store_txn,
            self.db.object_deserializer(),
            self.db.metadata_deserializer(),
        );
        for (name, ext) in &mut self.ext_txns {
            if let Err(err) = f(ext.as_mut(), &mut host) {
                tracing::debug!(extension = %name, error = %err, "extension aborted transaction");
                self.failure = Some(DbError::extension_inconsistency(
                    name.clone(),
                    err.to_string(),
                ));
                return Err(DbError::extension_inconsistency(
                    name.clone(),
                    err.to_string(),
                ));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Inserts or replaces a row's object and metadata.
    ///
    /// `metadata: None` stores the row without metadata (replacing any
    /// existing metadata).
    pub fn set(
        &mut self,
        collection: &str,
        key: &str,
        object: Value,
        metadata: Option<Value>,
    ) -> DbResult<()> {
        self.guard()?;
        let sanitizer = self.db.sanitizer().cloned();
        let object = match &sanitizer {
            Some(s) => s.sanitize_object(collection, key, object),
            None => object,
        };
        let metadata = match (&sanitizer, metadata) {
            (Some(s), Some(m)) => Some(s.sanitize_metadata(collection, key, m)),
            (_, m) => m,
        };

        let object_bytes = self
            .db
            .object_serializer()
            .serialize(collection, key, &object)?;
        let metadata_bytes = metadata
            .as_ref()
            .map(|m| self.db.metadata_serializer().serialize(collection, key, m))
            .transpose()?;

        let table = collection_table(collection);
        let update = self.store_txn.contains(&table, key.as_bytes())?;
        let rowid = self.store_txn.put(
            &table,
            key.as_bytes(),
            encode_row_value(&object_bytes, metadata_bytes.as_deref()),
        )?;

        self.prepare_extensions()?;
        let object = Arc::new(object);
        let metadata = metadata.map(Arc::new);
        {
            let change = RowChange {
                collection,
                key,
                object: Some(&object),
                metadata: metadata.as_deref(),
                rowid,
                update,
            };
            self.dispatch(|ext, host| ext.handle_insert_or_update(host, &change))?;
        }

        self.changeset.record_object_change(collection, key);
        let row_key = RowKey::new(collection, key);
        self.staged_objects
            .insert(row_key.clone(), Some(Arc::clone(&object)));
        self.staged_metadata.insert(row_key, metadata);

        if let Some(s) = &sanitizer {
            s.did_store(collection, key, &object);
        }
        Ok(())
    }

    /// Inserts or replaces a row from a typed value.
    pub fn set_as<T: Serialize>(
        &mut self,
        collection: &str,
        key: &str,
        object: &T,
        metadata: Option<Value>,
    ) -> DbResult<()> {
        self.set(collection, key, to_value(object)?, metadata)
    }

    /// Replaces a row's metadata, leaving its object unchanged.
    ///
    /// No-op if the row is absent.
    pub fn set_metadata(
        &mut self,
        collection: &str,
        key: &str,
        metadata: Option<Value>,
    ) -> DbResult<()> {
        self.guard()?;
        let table = collection_table(collection);
        let Some(record) = self.store_txn.get(&table, key.as_bytes())? else {
            return Ok(());
        };

        let sanitizer = self.db.sanitizer().cloned();
        let metadata = match (&sanitizer, metadata) {
            (Some(s), Some(m)) => Some(s.sanitize_metadata(collection, key, m)),
            (_, m) => m,
        };

        let (object_bytes, _) = decode_row_value(&record.value)?;
        let object_bytes = object_bytes.to_vec();
        let metadata_bytes = metadata
            .as_ref()
            .map(|m| self.db.metadata_serializer().serialize(collection, key, m))
            .transpose()?;
        let rowid = self.store_txn.put(
            &table,
            key.as_bytes(),
            encode_row_value(&object_bytes, metadata_bytes.as_deref()),
        )?;

        // Deserialize the object for the hooks only if some extension
        // actually requested object access.
        let object = match self.db.max_extension_access() {
            Some(access) if access.needs_object() => Some(Arc::new(
                self.db
                    .object_deserializer()
                    .deserialize(collection, key, &object_bytes)?,
            )),
            _ => None,
        };

        self.prepare_extensions()?;
        let metadata = metadata.map(Arc::new);
        {
            let change = RowChange {
                collection,
                key,
                object: object.as_deref(),
                metadata: metadata.as_deref(),
                rowid,
                update: true,
            };
            self.dispatch(|ext, host| ext.handle_metadata_update(host, &change))?;
        }

        self.changeset.record_metadata_change(collection, key);
        self.staged_metadata
            .insert(RowKey::new(collection, key), metadata);
        Ok(())
    }

    /// Removes a row. No-op if the row is absent.
    pub fn remove(&mut self, collection: &str, key: &str) -> DbResult<()> {
        self.guard()?;
        let table = collection_table(collection);
        let Some(record) = self.store_txn.get(&table, key.as_bytes())? else {
            return Ok(());
        };

        self.prepare_extensions()?;
        let rowid = record.rowid;
        self.dispatch(|ext, host| ext.handle_remove(host, collection, key, rowid))?;

        self.store_txn.delete(&table, key.as_bytes())?;
        self.changeset.record_removal(collection, key);
        let row_key = RowKey::new(collection, key);
        self.staged_objects.insert(row_key.clone(), None);
        self.staged_metadata.insert(row_key, None);
        Ok(())
    }

    /// Removes several rows of one collection. Absent keys are skipped.
    pub fn remove_rows(&mut self, collection: &str, keys: &[&str]) -> DbResult<()> {
        self.guard()?;
        let table = collection_table(collection);
        let mut present: Vec<(String, stratadb_store::Rowid)> = Vec::new();
        for key in keys {
            if let Some(record) = self.store_txn.get(&table, key.as_bytes())? {
                present.push(((*key).to_string(), record.rowid));
            }
        }
        if present.is_empty() {
            return Ok(());
        }

        self.prepare_extensions()?;
        {
            let rows = &present;
            self.dispatch(|ext, host| ext.handle_remove_rows(host, collection, rows))?;
        }

        for (key, _) in &present {
            self.store_txn.delete(&table, key.as_bytes())?;
            self.changeset.record_removal(collection, key);
            let row_key = RowKey::new(collection, key);
            self.staged_objects.insert(row_key.clone(), None);
            self.staged_metadata.insert(row_key, None);
        }
        Ok(())
    }

    /// Removes every row of a collection.
    pub fn remove_all_in_collection(&mut self, collection: &str) -> DbResult<()> {
        self.guard()?;
        self.prepare_extensions()?;
        self.dispatch(|ext, host| ext.handle_remove_all_in_collection(host, collection))?;

        self.store_txn.clear_table(&collection_table(collection))?;
        self.changeset.record_collection_removal(collection);
        self.staged_objects
            .retain(|key, _| key.collection != collection);
        self.staged_metadata
            .retain(|key, _| key.collection != collection);
        Ok(())
    }

    /// Removes every row in the database.
    pub fn remove_everything(&mut self) -> DbResult<()> {
        self.guard()?;
        self.prepare_extensions()?;
        self.dispatch(|ext, host| ext.handle_remove_everything(host))?;

        for table in self.store_txn.table_names()? {
            if table.starts_with(COLLECTION_PREFIX) {
                self.store_txn.clear_table(&table)?;
            }
        }
        self.changeset.record_remove_everything();
        self.staged_objects.clear();
        self.staged_metadata.clear();
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Returns the snapshot the transaction started from.
    #[must_use]
    pub fn base_snapshot(&self) -> Snapshot {
        Snapshot::new(self.store_txn.base_seq())
    }

    /// Returns the row's object, observing this transaction's own writes.
    pub fn object(&mut self, collection: &str, key: &str) -> DbResult<Option<Arc<Value>>> {
        let row_key = RowKey::new(collection, key);
        if let Some(staged) = self.staged_objects.get(&row_key) {
            return Ok(staged.clone());
        }
        match self
            .store_txn
            .get(&collection_table(collection), key.as_bytes())?
        {
            None => Ok(None),
            Some(record) => {
                let (object_bytes, _) = decode_row_value(&record.value)?;
                Ok(Some(Arc::new(self.db.object_deserializer().deserialize(
                    collection,
                    key,
                    object_bytes,
                )?)))
            }
        }
    }

    /// Returns the row's metadata, observing this transaction's own writes.
    pub fn metadata(&mut self, collection: &str, key: &str) -> DbResult<Option<Arc<Value>>> {
        let row_key = RowKey::new(collection, key);
        if let Some(staged) = self.staged_metadata.get(&row_key) {
            return Ok(staged.clone());
        }
        match self
            .store_txn
            .get(&collection_table(collection), key.as_bytes())?
        {
            None => Ok(None),
            Some(record) => {
                let (_, metadata_bytes) = decode_row_value(&record.value)?;
                metadata_bytes
                    .map(|bytes| {
                        Ok(Arc::new(
                            self.db
                                .metadata_deserializer()
                                .deserialize(collection, key, bytes)?,
                        ))
                    })
                    .transpose()
            }
        }
    }

    /// Returns the row's object transcoded into a typed value.
    pub fn object_as<T: DeserializeOwned>(
        &mut self,
        collection: &str,
        key: &str,
    ) -> DbResult<Option<T>> {
        match self.object(collection, key)? {
            None => Ok(None),
            Some(object) => Ok(Some(from_value(&object)?)),
        }
    }

    /// Returns true if the row exists.
    pub fn exists(&mut self, collection: &str, key: &str) -> DbResult<bool> {
        Ok(self
            .store_txn
            .contains(&collection_table(collection), key.as_bytes())?)
    }

    /// Returns the number of rows in a collection.
    pub fn key_count(&self, collection: &str) -> DbResult<usize> {
        Ok(self.store_txn.row_count(&collection_table(collection))?)
    }

    /// Returns the names of all non-empty collections.
    pub fn collection_names(&self) -> DbResult<Vec<String>> {
        collection_names_impl(&self.store_txn)
    }

    /// Returns every key in a collection, in ascending order.
    pub fn keys(&self, collection: &str) -> DbResult<Vec<String>> {
        keys_impl(&self.store_txn, collection)
    }

    /// Enumerates the rows of a collection, observing this transaction's
    /// own writes. See [`ReadTransaction::enumerate_rows`].
    pub fn enumerate_rows(
        &mut self,
        collection: &str,
        filter: Option<MetadataFilter<'_>>,
        f: impl FnMut(&str, &Value, Option<&Value>) -> Flow,
    ) -> DbResult<()> {
        enumerate_rows_impl(self.db, &self.store_txn, collection, filter, f)
    }

    // ========================================================================
    // Registration support
    // ========================================================================

    /// Populates a newly registered extension by replaying every existing
    /// row through its insert hook. The extension's in-memory state is
    /// discarded afterwards; its durable writes commit with this
    /// transaction.
    pub(crate) fn populate_extension(
        &mut self,
        name: &str,
        extension: &dyn Extension,
    ) -> DbResult<()> {
        let mut ext_conn = extension.connect(name);
        let mut ext_txn = ext_conn.begin();
        let access = extension.required_access();
        let collections = self.collection_names()?;

        let mut host = ExtensionHost::new(
            &mut self.store_txn,
            self.db.object_deserializer(),
            self.db.metadata_deserializer(),
        );
        ext_txn.prepare(&mut host)?;
        for collection in collections {
            let table = collection_table(&collection);
            for (key_bytes, record) in host.store.scan(&table)? {
                let key = key_from_bytes(key_bytes)?;
                let (object_bytes, metadata_bytes) = decode_row_value(&record.value)?;
                let object = if access.needs_object() {
                    Some(self.db.object_deserializer().deserialize(
                        &collection,
                        &key,
                        object_bytes,
                    )?)
                } else {
                    None
                };
                let metadata = if access.needs_metadata() {
                    metadata_bytes
                        .map(|bytes| {
                            self.db
                                .metadata_deserializer()
                                .deserialize(&collection, &key, bytes)
                        })
                        .transpose()?
                } else {
                    None
                };
                let change = RowChange {
                    collection: &collection,
                    key: &key,
                    object: object.as_ref(),
                    metadata: metadata.as_ref(),
                    rowid: record.rowid,
                    update: false,
                };
                ext_txn.handle_insert_or_update(&mut host, &change)?;
            }
        }
        ext_txn.flush(&mut host)?;
        Ok(())
    }

    // ========================================================================
    // Commit / rollback
    // ========================================================================

    pub(crate) fn commit(self) -> DbResult<CommitOutcome> {
        let Self {
            db,
            store_txn,
            mut ext_txns,
            mut changeset,
            staged_objects,
            staged_metadata,
            ..
        } = self;
        let mut store_txn = store_txn;

        {
            let mut host = ExtensionHost::new(
                &mut store_txn,
                db.object_deserializer(),
                db.metadata_deserializer(),
            );
            for (name, ext) in &mut ext_txns {
                if let Err(err) = ext.flush(&mut host) {
                    let wrapped =
                        DbError::extension_inconsistency(name.clone(), err.to_string());
                    for (_, ext) in &mut ext_txns {
                        ext.rollback();
                    }
                    return Err(wrapped);
                }
            }
        }
        for (name, ext) in &mut ext_txns {
            if let Some(fragment) = ext.changeset_fragment() {
                changeset.extensions.insert(name.clone(), fragment);
            }
        }

        let seq = match store_txn.commit() {
            Ok(seq) => seq,
            Err(err) => {
                for (_, ext) in &mut ext_txns {
                    ext.rollback();
                }
                return Err(err.into());
            }
        };
        let snapshot = Snapshot::new(seq);
        changeset.snapshot = snapshot;
        for (_, ext) in &mut ext_txns {
            ext.did_commit(snapshot);
        }
        tracing::trace!(%snapshot, "transaction committed");

        Ok(CommitOutcome {
            changeset,
            staged_objects,
            staged_metadata,
        })
    }

    pub(crate) fn rollback(self) {
        let Self {
            store_txn,
            mut ext_txns,
            ..
        } = self;
        for (_, ext) in &mut ext_txns {
            ext.rollback();
        }
        store_txn.rollback();
    }
}

impl std::fmt::Debug for ReadWriteTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadWriteTransaction")
            .field("base_snapshot", &self.base_snapshot())
            .field("failed", &self.failure.is_some())
            .finish_non_exhaustive()
    }
}

/// Everything a successful commit hands back to the connection.
pub(crate) struct CommitOutcome {
    pub(crate) changeset: Changeset,
    staged_objects: HashMap<RowKey, Option<Arc<Value>>>,
    staged_metadata: HashMap<RowKey, Option<Arc<Value>>>,
}

impl CommitOutcome {
    /// Folds the transaction's writes into the committing connection's
    /// caches and the shared caches, tagged with the new snapshot.
    pub(crate) fn fold_into_caches(&self, db: &Database, state: &mut ConnectionState) {
        let snapshot = self.changeset.snapshot;
        if self.changeset.all_keys_removed {
            state.object_cache.clear();
            state.metadata_cache.clear();
        } else if !self.changeset.removed_collections.is_empty() {
            let removed = &self.changeset.removed_collections;
            state
                .object_cache
                .retain(|key| !removed.contains(&key.collection));
            state
                .metadata_cache
                .retain(|key| !removed.contains(&key.collection));
        }

        for (row_key, object) in &self.staged_objects {
            let entry = match object {
                Some(object) => CacheEntry::Present(Arc::clone(object)),
                None => CacheEntry::Absent,
            };
            state
                .object_cache
                .insert(row_key.clone(), entry.clone(), snapshot);
            db.shared_object_cache()
                .insert(row_key.clone(), entry, snapshot);
        }
        for (row_key, metadata) in &self.staged_metadata {
            let entry = match metadata {
                Some(metadata) => CacheEntry::Present(Arc::clone(metadata)),
                None => CacheEntry::Absent,
            };
            state
                .metadata_cache
                .insert(row_key.clone(), entry.clone(), snapshot);
            db.shared_metadata_cache()
                .insert(row_key.clone(), entry, snapshot);
        }
    }
}
