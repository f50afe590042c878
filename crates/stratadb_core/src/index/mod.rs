//! The secondary index extension.
//!
//! An injected [`IndexKeyExtractor`] maps each row to zero or more typed
//! column values; the extension maintains a persistent table of
//! order-preserving encoded keys so equality and range queries run as store
//! range scans, translating rowids back to `(collection, key)` through the
//! primary table.

use crate::changeset::Changeset;
use crate::database::COLLECTION_PREFIX;
use crate::error::{DbError, DbResult};
use crate::extension::{
    AccessLevel, Extension, ExtensionConnection, ExtensionHost, ExtensionTransaction, RowChange,
};
use crate::transaction::{ReadTransaction, ReadWriteTransaction};
use crate::types::Snapshot;
use std::any::Any;
use std::sync::Arc;
use stratadb_codec::Value;
use stratadb_store::{Rowid, StoreError, TableRead};

pub(crate) fn index_keys_table(name: &str) -> String {
    format!("x:{name}:keys")
}

pub(crate) fn index_map_table(name: &str) -> String {
    format!("x:{name}:map")
}

/// A typed column value produced by an [`IndexKeyExtractor`].
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    /// Absent value; sorts before everything else.
    Null,
    /// Signed integer.
    Integer(i64),
    /// Floating point number.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl IndexValue {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Null => buf.push(0x00),
            Self::Integer(i) => {
                buf.push(0x01);
                // Offset-binary keeps the byte order matching the numeric
                // order across the sign boundary.
                buf.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
            }
            Self::Real(f) => {
                buf.push(0x02);
                let bits = f.to_bits();
                let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
                buf.extend_from_slice(&ordered.to_be_bytes());
            }
            Self::Text(s) => {
                buf.push(0x03);
                escape_into(s.as_bytes(), buf);
            }
            Self::Blob(b) => {
                buf.push(0x04);
                escape_into(b, buf);
            }
        }
    }
}

// 0x00 bytes are escaped as 0x00 0xFF so the 0x00 0x00 terminator keeps the
// encoding prefix-free and order-preserving.
fn escape_into(data: &[u8], buf: &mut Vec<u8>) {
    for &byte in data {
        if byte == 0x00 {
            buf.extend_from_slice(&[0x00, 0xFF]);
        } else {
            buf.push(byte);
        }
    }
    buf.extend_from_slice(&[0x00, 0x00]);
}

/// Encodes a composite key with an order-preserving byte layout.
#[must_use]
pub fn encode_index_values(values: &[IndexValue]) -> Vec<u8> {
    let mut buf = Vec::new();
    for value in values {
        value.encode_into(&mut buf);
    }
    buf
}

fn prefix_successor(mut prefix: Vec<u8>) -> Option<Vec<u8>> {
    while let Some(last) = prefix.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(prefix);
        }
        prefix.pop();
    }
    None
}

/// Maps a row to its index column values.
///
/// Must be pure; returning `None` leaves the row out of the index.
pub trait IndexKeyExtractor: Send + Sync {
    /// The cheapest row representation the extractor needs.
    fn access(&self) -> AccessLevel {
        AccessLevel::Row
    }

    /// Extracts the column values for a row.
    fn extract(
        &self,
        collection: &str,
        key: &str,
        object: Option<&Value>,
        metadata: Option<&Value>,
    ) -> Option<Vec<IndexValue>>;
}

/// Options for a secondary index extension.
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Identity tag for the extractor; a changed tag triggers a full
    /// repopulate at the next registration.
    pub version_tag: String,
}

impl IndexOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the extractor version tag.
    #[must_use]
    pub fn version_tag(mut self, tag: impl Into<String>) -> Self {
        self.version_tag = tag.into();
        self
    }
}

/// The secondary index extension. Register with
/// [`crate::Database::register_extension`].
pub struct SecondaryIndexExtension {
    extractor: Arc<dyn IndexKeyExtractor>,
    options: IndexOptions,
}

impl SecondaryIndexExtension {
    /// Creates a secondary index over the given extractor.
    pub fn new(extractor: Arc<dyn IndexKeyExtractor>, options: IndexOptions) -> Self {
        Self { extractor, options }
    }
}

impl Extension for SecondaryIndexExtension {
    fn class_name(&self) -> &'static str {
        "secondary_index"
    }

    fn version(&self) -> u32 {
        1
    }

    fn version_tag(&self) -> Option<String> {
        Some(self.options.version_tag.clone())
    }

    fn table_names(&self, registered_name: &str) -> Vec<String> {
        vec![
            index_keys_table(registered_name),
            index_map_table(registered_name),
        ]
    }

    fn required_access(&self) -> AccessLevel {
        self.extractor.access()
    }

    fn connect(&self, registered_name: &str) -> Box<dyn ExtensionConnection> {
        Box::new(IndexConnection {
            name: registered_name.to_string(),
            extractor: Arc::clone(&self.extractor),
        })
    }
}

impl std::fmt::Debug for SecondaryIndexExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryIndexExtension")
            .field("version_tag", &self.options.version_tag)
            .finish_non_exhaustive()
    }
}

/// The secondary index's per-connection state object.
///
/// The index keeps no connection-local cache; queries are store range
/// scans, so changeset processing has nothing to invalidate.
pub struct IndexConnection {
    name: String,
    extractor: Arc<dyn IndexKeyExtractor>,
}

impl ExtensionConnection for IndexConnection {
    fn registered_name(&self) -> &str {
        &self.name
    }

    fn begin(&mut self) -> Box<dyn ExtensionTransaction> {
        Box::new(IndexTransaction {
            name: self.name.clone(),
            extractor: Arc::clone(&self.extractor),
        })
    }

    fn process_changeset(&mut self, _changeset: &Changeset) {}

    fn reset(&mut self) {}

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// The secondary index's transaction hooks: write-through maintenance of
/// the keys and map tables.
pub struct IndexTransaction {
    name: String,
    extractor: Arc<dyn IndexKeyExtractor>,
}

impl IndexTransaction {
    fn remove_entry(
        &self,
        host: &mut ExtensionHost<'_, '_>,
        rowid: Rowid,
    ) -> DbResult<()> {
        let map_table = index_map_table(&self.name);
        if let Some(record) = host.store.get(&map_table, &rowid.to_be_bytes())? {
            let mut key = record.value.to_vec();
            key.extend_from_slice(&rowid.to_be_bytes());
            host.store.delete(&index_keys_table(&self.name), &key)?;
            host.store.delete(&map_table, &rowid.to_be_bytes())?;
        }
        Ok(())
    }

    fn apply(&self, host: &mut ExtensionHost<'_, '_>, change: &RowChange<'_>) -> DbResult<()> {
        self.remove_entry(host, change.rowid)?;
        let Some(values) = self.extractor.extract(
            change.collection,
            change.key,
            change.object,
            change.metadata,
        ) else {
            return Ok(());
        };
        let encoded = encode_index_values(&values);
        let mut key = encoded.clone();
        key.extend_from_slice(&change.rowid.to_be_bytes());
        host.store
            .put(&index_keys_table(&self.name), &key, Vec::new())?;
        host.store
            .put(&index_map_table(&self.name), &change.rowid.to_be_bytes(), encoded)?;
        Ok(())
    }
}

impl ExtensionTransaction for IndexTransaction {
    fn prepare(&mut self, _host: &mut ExtensionHost<'_, '_>) -> DbResult<()> {
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
        if !self.extractor.access().needs_metadata() {
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
        self.remove_entry(host, rowid)
    }

    fn handle_remove_all_in_collection(
        &mut self,
        host: &mut ExtensionHost<'_, '_>,
        collection: &str,
    ) -> DbResult<()> {
        let table = format!("{COLLECTION_PREFIX}{collection}");
        let mut members = Vec::new();
        for (key, _) in host.store.scan(&index_map_table(&self.name))? {
            let rowid = Rowid::from_be_bytes(&key)?;
            if let Some((owner, _)) = host.store.rowid_entry(rowid)? {
                if owner == table {
                    members.push(rowid);
                }
            }
        }
        for rowid in members {
            self.remove_entry(host, rowid)?;
        }
        Ok(())
    }

    fn handle_remove_everything(&mut self, host: &mut ExtensionHost<'_, '_>) -> DbResult<()> {
        host.store.clear_table(&index_keys_table(&self.name))?;
        host.store.clear_table(&index_map_table(&self.name))?;
        Ok(())
    }

    fn did_commit(&mut self, _snapshot: Snapshot) {}

    fn rollback(&mut self) {}

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A query handle over a secondary index.
pub struct IndexHandle<R> {
    reader: R,
    name: String,
}

impl<R: TableRead> IndexHandle<R> {
    /// Returns the rows whose index key starts with the given values, in
    /// index order.
    pub fn lookup(&self, values: &[IndexValue]) -> DbResult<Vec<(String, String)>> {
        let prefix = encode_index_values(values);
        let upper = prefix_successor(prefix.clone());
        self.scan(&prefix, upper.as_deref())
    }

    /// Returns the rows whose index key is in `[lower, upper)`, in index
    /// order.
    pub fn between(
        &self,
        lower: &[IndexValue],
        upper: &[IndexValue],
    ) -> DbResult<Vec<(String, String)>> {
        let lower = encode_index_values(lower);
        let upper = encode_index_values(upper);
        self.scan(&lower, Some(&upper))
    }

    /// Returns the number of indexed entries.
    pub fn len(&self) -> DbResult<usize> {
        Ok(self.reader.row_count(&index_keys_table(&self.name))?)
    }

    /// Returns true if the index has no entries.
    pub fn is_empty(&self) -> DbResult<bool> {
        Ok(self.len()? == 0)
    }

    fn scan(&self, lower: &[u8], upper: Option<&[u8]>) -> DbResult<Vec<(String, String)>> {
        let mut out = Vec::new();
        for (key, _) in self
            .reader
            .scan_between(&index_keys_table(&self.name), lower, upper)?
        {
            if key.len() < 8 {
                return Err(StoreError::corruption("index key too short").into());
            }
            let rowid = Rowid::from_be_bytes(&key[key.len() - 8..])?;
            if let Some((table, primary_key)) = self.reader.rowid_entry(rowid)? {
                if let Some(collection) = table.strip_prefix(COLLECTION_PREFIX) {
                    out.push((
                        collection.to_string(),
                        crate::rows::key_from_bytes(primary_key)?,
                    ));
                }
            }
        }
        Ok(out)
    }
}

impl<'a> ReadTransaction<'a> {
    /// Returns a query handle for a registered secondary index.
    pub fn index<'t>(
        &'t mut self,
        name: &str,
    ) -> DbResult<IndexHandle<stratadb_store::SnapshotReader<'t>>> {
        let (db, state, snapshot) = self.parts();
        if !state.ext_connections.iter().any(|(n, _)| n == name) {
            return Err(DbError::NotRegistered {
                name: name.to_string(),
            });
        }
        Ok(IndexHandle {
            reader: db.store().reader_at(snapshot.as_u64()),
            name: name.to_string(),
        })
    }
}

impl<'a> ReadWriteTransaction<'a> {
    /// Returns a query handle for a registered secondary index, observing
    /// this transaction's own writes.
    pub fn index<'t>(
        &'t self,
        name: &str,
    ) -> DbResult<IndexHandle<&'t stratadb_store::StoreWriteTxn<'a>>> {
        if !self.has_extension_txn(name) {
            return Err(DbError::NotRegistered {
                name: name.to_string(),
            });
        }
        Ok(IndexHandle {
            reader: self.store_ref(),
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_encoding_preserves_order() {
        let values = [-5i64, -1, 0, 1, 42, i64::MAX];
        let mut encoded: Vec<Vec<u8>> = values
            .iter()
            .map(|&i| encode_index_values(&[IndexValue::Integer(i)]))
            .collect();
        let sorted = encoded.clone();
        encoded.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn real_encoding_preserves_order() {
        let values = [-1000.5f64, -1.0, -0.25, 0.0, 0.25, 1.0, 1000.5];
        let mut encoded: Vec<Vec<u8>> = values
            .iter()
            .map(|&f| encode_index_values(&[IndexValue::Real(f)]))
            .collect();
        let sorted = encoded.clone();
        encoded.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn text_encoding_preserves_order_and_terminates() {
        let a = encode_index_values(&[IndexValue::Text("abc".into()), IndexValue::Integer(1)]);
        let b = encode_index_values(&[IndexValue::Text("abd".into()), IndexValue::Integer(0)]);
        assert!(a < b);

        // A shorter text must sort before its extensions regardless of the
        // following column.
        let short = encode_index_values(&[IndexValue::Text("ab".into()), IndexValue::Integer(9)]);
        assert!(short < a);
    }

    #[test]
    fn nul_bytes_are_escaped() {
        let with_nul = encode_index_values(&[IndexValue::Blob(vec![1, 0, 2])]);
        let without = encode_index_values(&[IndexValue::Blob(vec![1])]);
        assert!(without < with_nul);
    }

    #[test]
    fn prefix_successor_carries() {
        assert_eq!(prefix_successor(vec![1, 2, 3]), Some(vec![1, 2, 4]));
        assert_eq!(prefix_successor(vec![1, 0xFF]), Some(vec![2]));
        assert_eq!(prefix_successor(vec![0xFF, 0xFF]), None);
    }
}
