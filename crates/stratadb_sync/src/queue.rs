//! The cloud queue: an extension that turns committed local changes into
//! durably queued operation graphs.
//!
//! The queue builds each commit's operations inside the committing
//! transaction and persists them to its own table through the same physical
//! transaction, so a local commit and its outbound operations are durably
//! atomic: a crash can never produce a committed change without its queued
//! operation, nor a queued operation without its change.

use crate::error::SyncError;
use crate::graph::OperationGraph;
use crate::merge::MergeResolver;
use crate::operation::{Attach, CloudOperation, OpStatus};
use crate::pipeline::{Pipeline, QueueObserver};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use stratadb_codec::{CborCodec, ObjectDeserializer, ObjectSerializer, Value};
use stratadb_core::{
    AccessLevel, Changeset, Database, DbError, DbResult, Extension, ExtensionConnection,
    ExtensionHost, ExtensionTransaction, RowChange, Rowid, Snapshot,
};
use stratadb_store::TableRead;
use uuid::Uuid;

pub(crate) fn ops_table(name: &str) -> String {
    format!("q:{name}:ops")
}

/// The outbound record a [`RecordHandler`] builds for a changed row.
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    /// Operation kind, e.g. `"upload"` or `"delete"`.
    pub kind: String,
    /// Remote target path.
    pub path: String,
    /// Record payload to transmit.
    pub payload: Value,
    /// The local field names this change touched.
    pub changed_fields: Vec<String>,
    /// Dispatch priority.
    pub priority: i32,
    /// Dependencies on other operations.
    pub dependencies: Vec<Uuid>,
    /// Attach policy for fresh inserts.
    pub attach: Attach,
}

impl OutboundRecord {
    /// Creates a record with default priority, no dependencies, and the
    /// pipeline's default attach policy.
    pub fn new(kind: impl Into<String>, path: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            path: path.into(),
            payload,
            changed_fields: Vec::new(),
            priority: 0,
            dependencies: Vec::new(),
            attach: Attach::UseDefault,
        }
    }
}

/// Converts a changed local row into zero-or-one outbound record.
pub trait RecordHandler: Send + Sync {
    /// The cheapest row representation the handler needs.
    fn access(&self) -> AccessLevel {
        AccessLevel::Row
    }

    /// Builds the record for an inserted or updated row, or `None` if the
    /// row does not sync.
    fn record_for_row(&self, change: &RowChange<'_>) -> Option<OutboundRecord>;

    /// Builds the record for a removed row, or `None` if the removal does
    /// not sync.
    fn record_for_removal(&self, collection: &str, key: &str) -> Option<OutboundRecord>;
}

// The inner state must never hold the database strongly: it is reachable
// from the database's own extension registry, and a strong reference would
// cycle and leak the store lock.
struct CloudQueueInner {
    name: String,
    handler: Arc<dyn RecordHandler>,
    resolver: Arc<dyn MergeResolver>,
    pipeline: Pipeline,
    db: RwLock<Option<Weak<Database>>>,
    durable_keys: Mutex<HashMap<Uuid, Vec<u8>>>,
}

/// The cloud queue: owns the durable operation table for one pipeline.
///
/// `CloudQueue` is a shared handle; attach it to a database with
/// [`CloudQueue::attach`], which registers it as an extension, recovers any
/// persisted operations, and wires terminal-disposition purging.
#[derive(Clone)]
pub struct CloudQueue {
    inner: Arc<CloudQueueInner>,
}

impl CloudQueue {
    /// Creates a cloud queue feeding the given pipeline.
    pub fn new(
        name: impl Into<String>,
        handler: Arc<dyn RecordHandler>,
        resolver: Arc<dyn MergeResolver>,
        pipeline: Pipeline,
    ) -> Self {
        Self {
            inner: Arc::new(CloudQueueInner {
                name: name.into(),
                handler,
                resolver,
                pipeline,
                db: RwLock::new(None),
                durable_keys: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the pipeline this queue feeds.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    /// Returns the queue's registered extension name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Attaches the queue to a database: registers it as an extension,
    /// recovers persisted operations into the pipeline (reverting `Started`
    /// back to `Pending`), and wires purging of terminal operations.
    ///
    /// Call once per process per database.
    pub fn attach(&self, db: &Arc<Database>) -> DbResult<()> {
        *self.inner.db.write() = Some(Arc::downgrade(db));

        db.register_extension(
            &self.inner.name,
            Arc::new(QueueExtension {
                inner: Arc::clone(&self.inner),
            }),
        )?;

        // Recover the durable queue: rebuild graphs in commit order.
        let conn = db.new_connection();
        let table = ops_table(&self.inner.name);
        let rows = conn.read(|txn| txn.store_reader().scan(&table))??;

        let mut graphs: BTreeMap<u64, Vec<CloudOperation>> = BTreeMap::new();
        {
            let mut durable_keys = self.inner.durable_keys.lock();
            for (key, record) in rows {
                if key.len() < 8 {
                    return Err(DbError::invalid_operation("queue row key malformed"));
                }
                let snapshot = u64::from_be_bytes(
                    key[0..8]
                        .try_into()
                        .map_err(|_| DbError::invalid_operation("queue row key malformed"))?,
                );
                let value = CborCodec.deserialize(&table, "op", &record.value)?;
                let mut operation = CloudOperation::decode(&value)
                    .map_err(|err| DbError::invalid_operation(err.to_string()))?;
                // An operation that was in flight at crash time restarts
                // from the beginning.
                if operation.status == OpStatus::Started {
                    operation.status = OpStatus::Pending;
                }
                durable_keys.insert(operation.uuid, key.clone());
                graphs.entry(snapshot).or_default().push(operation);
            }
        }
        for (snapshot, operations) in graphs {
            self.inner
                .pipeline
                .submit_graph(OperationGraph::new(snapshot, operations))
                .map_err(|err| DbError::invalid_operation(err.to_string()))?;
        }

        self.inner.pipeline.add_observer(Arc::new(PurgeObserver {
            inner: Arc::clone(&self.inner),
        }));
        tracing::debug!(queue = %self.inner.name, "cloud queue attached");
        Ok(())
    }

    /// Resolves a stale-record conflict: runs the merge strategy, then
    /// folds every still-queued local field change for `path` into the
    /// result, so an in-flight conflict resolution never discards a local
    /// edit that queued after the conflicting upload began.
    #[must_use]
    pub fn resolve_conflict(
        &self,
        path: &str,
        remote: &Value,
        pending: &Value,
        current: &Value,
    ) -> Value {
        let merged = self.inner.resolver.merge(remote, pending, current);
        self.merge_pending_changes(path, merged)
    }

    /// Overlays the field changes of every still-queued operation for
    /// `path` onto `record`.
    #[must_use]
    pub fn merge_pending_changes(&self, path: &str, mut record: Value) -> Value {
        for operation in self.inner.pipeline.pending_operations_for_path(path) {
            for field in &operation.changed_fields {
                if let Some(value) = operation.payload.get(field) {
                    record.set_field(field, value.clone());
                }
            }
        }
        record
    }

    /// Returns the union of changed field names across still-queued
    /// operations for `path`.
    #[must_use]
    pub fn pending_changed_fields(&self, path: &str) -> BTreeSet<String> {
        self.inner
            .pipeline
            .pending_operations_for_path(path)
            .into_iter()
            .flat_map(|op| op.changed_fields)
            .collect()
    }
}

impl std::fmt::Debug for CloudQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudQueue")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

struct PurgeObserver {
    inner: Arc<CloudQueueInner>,
}

impl QueueObserver for PurgeObserver {
    fn operation_resolved(&self, uuid: Uuid, status: OpStatus) {
        if !status.is_terminal() {
            return;
        }
        let Some(key) = self.inner.durable_keys.lock().remove(&uuid) else {
            return;
        };
        let Some(db) = self.inner.db.read().as_ref().and_then(Weak::upgrade) else {
            return;
        };
        let conn = db.new_connection();
        let table = ops_table(&self.inner.name);
        let result = conn.read_write(|txn| {
            txn.store_mut().delete(&table, &key)?;
            Ok(())
        });
        if let Err(err) = result {
            tracing::warn!(queue = %self.inner.name, %uuid, error = %err, "queue purge failed");
        }
    }
}

struct QueueExtension {
    inner: Arc<CloudQueueInner>,
}

impl Extension for QueueExtension {
    fn class_name(&self) -> &'static str {
        "cloud_queue"
    }

    fn version(&self) -> u32 {
        1
    }

    fn table_names(&self, registered_name: &str) -> Vec<String> {
        vec![ops_table(registered_name)]
    }

    fn required_access(&self) -> AccessLevel {
        self.inner.handler.access()
    }

    fn connect(&self, _registered_name: &str) -> Box<dyn ExtensionConnection> {
        Box::new(QueueConnection {
            inner: Arc::clone(&self.inner),
        })
    }
}

struct QueueConnection {
    inner: Arc<CloudQueueInner>,
}

impl ExtensionConnection for QueueConnection {
    fn registered_name(&self) -> &str {
        &self.inner.name
    }

    fn begin(&mut self) -> Box<dyn ExtensionTransaction> {
        Box::new(QueueTransaction {
            inner: Arc::clone(&self.inner),
            operations: Vec::new(),
            staged_keys: Vec::new(),
        })
    }

    fn process_changeset(&mut self, _changeset: &Changeset) {
        // The queue keeps no connection-local cache; the committing
        // connection alone submits to the pipeline.
    }

    fn reset(&mut self) {}

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct QueueTransaction {
    inner: Arc<CloudQueueInner>,
    operations: Vec<CloudOperation>,
    staged_keys: Vec<(Uuid, Vec<u8>)>,
}

impl QueueTransaction {
    fn push_record(&mut self, record: OutboundRecord, fresh_insert: bool) {
        if fresh_insert
            && !record
                .attach
                .resolve(self.inner.pipeline.config().default_attach)
        {
            // The row is assumed to exist remotely already (e.g. it was
            // just downloaded); nothing to upload.
            return;
        }
        let mut operation = CloudOperation::new(record.kind, record.path, record.payload)
            .with_priority(record.priority)
            .with_changed_fields(record.changed_fields);
        operation.dependencies = record.dependencies;
        operation.attach = record.attach;
        self.operations.push(operation);
    }

    fn push_removal(&mut self, collection: &str, key: &str) {
        if let Some(record) = self.inner.handler.record_for_removal(collection, key) {
            self.push_record(record, false);
        }
    }
}

impl ExtensionTransaction for QueueTransaction {
    fn prepare(&mut self, _host: &mut ExtensionHost<'_, '_>) -> DbResult<()> {
        Ok(())
    }

    fn handle_insert_or_update(
        &mut self,
        _host: &mut ExtensionHost<'_, '_>,
        change: &RowChange<'_>,
    ) -> DbResult<()> {
        if let Some(record) = self.inner.handler.record_for_row(change) {
            self.push_record(record, !change.update);
        }
        Ok(())
    }

    fn handle_metadata_update(
        &mut self,
        _host: &mut ExtensionHost<'_, '_>,
        change: &RowChange<'_>,
    ) -> DbResult<()> {
        if let Some(record) = self.inner.handler.record_for_row(change) {
            self.push_record(record, false);
        }
        Ok(())
    }

    fn handle_remove(
        &mut self,
        _host: &mut ExtensionHost<'_, '_>,
        collection: &str,
        key: &str,
        _rowid: Rowid,
    ) -> DbResult<()> {
        self.push_removal(collection, key);
        Ok(())
    }

    fn handle_remove_all_in_collection(
        &mut self,
        host: &mut ExtensionHost<'_, '_>,
        collection: &str,
    ) -> DbResult<()> {
        for (key, _) in host.collection_keys(collection)? {
            self.push_removal(collection, &key);
        }
        Ok(())
    }

    fn handle_remove_everything(&mut self, host: &mut ExtensionHost<'_, '_>) -> DbResult<()> {
        for collection in host.collection_names()? {
            for (key, _) in host.collection_keys(&collection)? {
                self.push_removal(&collection, &key);
            }
        }
        Ok(())
    }

    fn flush(&mut self, host: &mut ExtensionHost<'_, '_>) -> DbResult<()> {
        if self.operations.is_empty() {
            return Ok(());
        }
        // Fail fast on dependency cycles before anything commits.
        let probe = OperationGraph::new(0, self.operations.clone());
        probe
            .validate(self.inner.pipeline.name())
            .map_err(|err: SyncError| {
                DbError::extension_inconsistency(self.inner.name.clone(), err.to_string())
            })?;

        let table = ops_table(&self.inner.name);
        let snapshot = host.store.base_seq() + 1;
        for (index, operation) in self.operations.iter().enumerate() {
            let mut key = snapshot.to_be_bytes().to_vec();
            key.extend_from_slice(&(index as u32).to_be_bytes());
            let bytes = CborCodec.serialize(&table, "op", &operation.encode())?;
            host.store.put(&table, &key, bytes)?;
            self.staged_keys.push((operation.uuid, key));
        }
        Ok(())
    }

    fn changeset_fragment(&mut self) -> Option<Value> {
        if self.operations.is_empty() {
            return None;
        }
        Some(Value::record(vec![(
            "operations",
            Value::Integer(self.operations.len() as i64),
        )]))
    }

    fn did_commit(&mut self, snapshot: Snapshot) {
        if self.operations.is_empty() {
            return;
        }
        self.inner
            .durable_keys
            .lock()
            .extend(self.staged_keys.drain(..));
        let graph = OperationGraph::new(snapshot.as_u64(), std::mem::take(&mut self.operations));
        if let Err(err) = self.inner.pipeline.submit_graph(graph) {
            // The graph was validated at flush; this only fires on a bug.
            tracing::error!(queue = %self.inner.name, error = %err, "graph submission failed");
        }
    }

    fn rollback(&mut self) {
        self.operations.clear();
        self.staged_keys.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
