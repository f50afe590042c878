//! Database facade: the single physical store, the snapshot counter, and
//! the extension registry.

use crate::cache::SharedRowCache;
use crate::changeset::Changeset;
use crate::config::DatabaseConfig;
use crate::connection::Connection;
use crate::error::{DbError, DbResult};
use crate::extension::{AccessLevel, Extension};
use crate::notifications::{CommitHub, CommitNotification};
use crate::types::{ConnectionId, Snapshot};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use stratadb_codec::{
    CborCodec, ObjectDeserializer, ObjectSerializer, Value,
};
use stratadb_store::{Store, StoreOptions, StoreWriteTxn, TableRead};

/// Table prefix for primary collection tables.
pub(crate) const COLLECTION_PREFIX: &str = "r:";
/// Table holding persisted extension registrations.
pub(crate) const REGISTRY_TABLE: &str = "sys:extensions";

pub(crate) fn collection_table(collection: &str) -> String {
    format!("{COLLECTION_PREFIX}{collection}")
}

/// An optional pre/post storage transform applied to every written row.
///
/// The pre hooks run before serialization, caching, and extension dispatch;
/// they are pure transforms typically used to validate or normalize
/// objects. The post hook runs after the row has been handed to every
/// extension, typically to clear transient dirty-field markers.
pub trait RowSanitizer: Send + Sync {
    /// Transforms an object before it is stored.
    fn sanitize_object(&self, collection: &str, key: &str, object: Value) -> Value {
        let _ = (collection, key);
        object
    }

    /// Transforms metadata before it is stored.
    fn sanitize_metadata(&self, collection: &str, key: &str, metadata: Value) -> Value {
        let _ = (collection, key);
        metadata
    }

    /// Called after the row was written and every extension has observed it.
    fn did_store(&self, collection: &str, key: &str, object: &Value) {
        let _ = (collection, key, object);
    }
}

/// Per-connection bookkeeping the database keeps for coherency decisions.
#[derive(Debug)]
pub(crate) struct ConnectionTracker {
    pub(crate) id: ConnectionId,
    /// The newest snapshot whose changeset this connection has processed.
    pub(crate) last_snapshot: AtomicU64,
}

#[derive(Clone)]
pub(crate) struct RegisteredExtension {
    pub(crate) name: String,
    pub(crate) extension: Arc<dyn Extension>,
}

/// The main database handle.
///
/// `Database` owns the physical store, the monotonic snapshot counter, and
/// the registry of extensions. All data access goes through connections
/// created with [`Database::new_connection`]; callers should reuse
/// connections rather than create one per operation, since each connection
/// carries its own caches and worker.
///
/// # Opening a database
///
/// ```rust,ignore
/// use stratadb_core::Database;
///
/// let db = Database::open(Path::new("my_database"))?;
/// let conn = db.new_connection();
/// conn.read_write(|txn| {
///     txn.set("books", "moby-dick", Value::from("call me ishmael"), None)
/// })?;
/// ```
pub struct Database {
    /// Self-reference so connections can hold the database alive.
    weak_self: Weak<Database>,
    config: DatabaseConfig,
    store: Store,
    object_serializer: Arc<dyn ObjectSerializer>,
    object_deserializer: Arc<dyn ObjectDeserializer>,
    metadata_serializer: Arc<dyn ObjectSerializer>,
    metadata_deserializer: Arc<dyn ObjectDeserializer>,
    sanitizer: Option<Arc<dyn RowSanitizer>>,
    snapshot: AtomicU64,
    /// The global single-writer lock. parking_lot's eventually-fair
    /// unlocking gives waiting connections a bounded (but not FIFO) wait.
    pub(crate) write_lock: Mutex<()>,
    registry: RwLock<Vec<RegisteredExtension>>,
    hub: CommitHub,
    shared_object_cache: SharedRowCache,
    shared_metadata_cache: SharedRowCache,
    next_connection_id: AtomicU64,
    trackers: Mutex<Vec<Weak<ConnectionTracker>>>,
    previously_registered: Vec<String>,
}

impl Database {
    /// Opens or creates a database at the given directory with defaults:
    /// CBOR codecs for objects and metadata, no sanitizer.
    pub fn open(path: &Path) -> DbResult<Arc<Self>> {
        Self::builder().path(path).open()
    }

    /// Opens or creates a database with a custom configuration.
    pub fn open_with_config(path: &Path, config: DatabaseConfig) -> DbResult<Arc<Self>> {
        Self::builder().path(path).config(config).open()
    }

    /// Opens a fresh in-memory database for testing.
    pub fn open_in_memory() -> DbResult<Arc<Self>> {
        Self::builder().open()
    }

    /// Returns a builder for custom codecs, sanitizers, and configuration.
    #[must_use]
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    fn from_builder(builder: DatabaseBuilder) -> DbResult<Arc<Self>> {
        let config = builder.config;
        let store = match &builder.path {
            Some(path) => Store::open(
                path,
                StoreOptions::new()
                    .create_if_missing(config.create_if_missing)
                    .sync_on_commit(config.sync_on_commit),
            )?,
            None => Store::in_memory(),
        };
        let snapshot = store.committed_seq();

        // The registered extension names of the previous run, for cleanup
        // and upgrade tasks.
        let previously_registered = store
            .begin_read()
            .scan(REGISTRY_TABLE)?
            .into_iter()
            .filter_map(|(key, _)| String::from_utf8(key).ok())
            .collect();

        let db = Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            shared_object_cache: SharedRowCache::new(config.shared_cache_limit),
            shared_metadata_cache: SharedRowCache::new(config.shared_cache_limit),
            hub: CommitHub::new(config.notification_history_limit),
            config,
            store,
            object_serializer: builder.object_serializer,
            object_deserializer: builder.object_deserializer,
            metadata_serializer: builder.metadata_serializer,
            metadata_deserializer: builder.metadata_deserializer,
            sanitizer: builder.sanitizer,
            snapshot: AtomicU64::new(snapshot),
            write_lock: Mutex::new(()),
            registry: RwLock::new(Vec::new()),
            next_connection_id: AtomicU64::new(1),
            trackers: Mutex::new(Vec::new()),
            previously_registered,
        });
        tracing::debug!(snapshot, "database opened");
        Ok(db)
    }

    /// Returns a strong reference to this database.
    fn strong_self(&self) -> Arc<Database> {
        self.weak_self
            .upgrade()
            .expect("database is reachable through &self")
    }

    /// Returns the database configuration.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Returns the current snapshot: the most up-to-date state among all
    /// connections.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.snapshot.load(Ordering::SeqCst))
    }

    pub(crate) fn store_snapshot(&self, snapshot: Snapshot) {
        self.snapshot.store(snapshot.as_u64(), Ordering::SeqCst);
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn hub(&self) -> &CommitHub {
        &self.hub
    }

    pub(crate) fn sanitizer(&self) -> Option<&Arc<dyn RowSanitizer>> {
        self.sanitizer.as_ref()
    }

    pub(crate) fn object_serializer(&self) -> &dyn ObjectSerializer {
        &*self.object_serializer
    }

    pub(crate) fn object_deserializer(&self) -> &dyn ObjectDeserializer {
        &*self.object_deserializer
    }

    pub(crate) fn metadata_serializer(&self) -> &dyn ObjectSerializer {
        &*self.metadata_serializer
    }

    pub(crate) fn metadata_deserializer(&self) -> &dyn ObjectDeserializer {
        &*self.metadata_deserializer
    }

    pub(crate) fn shared_object_cache(&self) -> &SharedRowCache {
        &self.shared_object_cache
    }

    pub(crate) fn shared_metadata_cache(&self) -> &SharedRowCache {
        &self.shared_metadata_cache
    }

    pub(crate) fn registry_snapshot(&self) -> Vec<RegisteredExtension> {
        self.registry.read().clone()
    }

    /// The highest row representation any registered extension requires.
    pub(crate) fn max_extension_access(&self) -> Option<AccessLevel> {
        self.registry
            .read()
            .iter()
            .map(|r| r.extension.required_access())
            .max()
    }

    /// Subscribes to commit notifications.
    ///
    /// One event is delivered per committed read-write transaction: the new
    /// snapshot, the originating connection, the changeset, and the
    /// caller-supplied tag if any. This is the sole externally observable
    /// write-completion signal.
    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<Arc<CommitNotification>> {
        self.hub.subscribe()
    }

    /// Creates a new connection to this database.
    ///
    /// Connections are relatively heavyweight: they carry their own caches
    /// and a dedicated worker. Reuse them instead of creating one per
    /// operation.
    pub fn new_connection(&self) -> Connection {
        let id = ConnectionId::new(self.next_connection_id.fetch_add(1, Ordering::SeqCst));
        let tracker = Arc::new(ConnectionTracker {
            id,
            last_snapshot: AtomicU64::new(self.snapshot().as_u64()),
        });
        let mut trackers = self.trackers.lock();
        trackers.retain(|t| t.strong_count() > 0);
        trackers.push(Arc::downgrade(&tracker));
        drop(trackers);
        Connection::new(self.strong_self(), tracker)
    }

    pub(crate) fn publish_commit(
        &self,
        connection_id: ConnectionId,
        changeset: Arc<Changeset>,
        tag: Option<Arc<dyn Any + Send + Sync>>,
    ) {
        let snapshot = changeset.snapshot;
        self.hub.publish(Arc::new(CommitNotification {
            snapshot,
            connection_id,
            changeset,
            tag,
        }));
    }

    /// Applies a committed changeset to the shared caches. Called by the
    /// committing connection while it still holds the write lock.
    pub(crate) fn scrub_shared_caches(&self, changeset: &Changeset) {
        if changeset.all_keys_removed {
            self.shared_object_cache.clear();
            self.shared_metadata_cache.clear();
            return;
        }
        for row in changeset
            .object_changes
            .iter()
            .chain(&changeset.removed_keys)
        {
            self.shared_object_cache.remove(row);
            self.shared_metadata_cache.remove(row);
        }
        for row in &changeset.metadata_changes {
            self.shared_metadata_cache.remove(row);
        }
        if !changeset.removed_collections.is_empty() {
            let removed = changeset.removed_collections.clone();
            self.shared_object_cache
                .retain(|key| !removed.contains(&key.collection));
            let removed = changeset.removed_collections.clone();
            self.shared_metadata_cache
                .retain(|key| !removed.contains(&key.collection));
        }
    }

    // ========================================================================
    // Extensions
    // ========================================================================

    /// Registers `extension` under `name`.
    ///
    /// Registration runs as a read-write transaction: it creates the
    /// extension's tables, persists `{name, class, version}`, and populates
    /// the extension by scanning existing rows. Registration is idempotent
    /// across process restarts: a persisted registration with the same
    /// class and version is adopted without repopulating; a version or
    /// class change drops, recreates, and repopulates the tables.
    pub fn register_extension(
        &self,
        name: &str,
        extension: Arc<dyn Extension>,
    ) -> DbResult<()> {
        {
            let registry = self.registry.read();
            if registry.iter().any(|r| r.name == name) {
                return Err(DbError::NameAlreadyRegistered {
                    name: name.to_string(),
                });
            }
        }

        let conn = self.new_connection();
        let name_owned = name.to_string();
        let ext = Arc::clone(&extension);
        conn.read_write(move |txn| {
            let persisted = read_registry_record(txn.store_mut(), &name_owned)?;
            let up_to_date = persisted.as_ref().is_some_and(|record| {
                record.class == ext.class_name()
                    && record.version == ext.version()
                    && record.version_tag == ext.version_tag().unwrap_or_default()
            });

            if !up_to_date {
                if let Some(record) = &persisted {
                    for table in &record.tables {
                        txn.store_mut().clear_table(table)?;
                    }
                }
                tracing::debug!(name = %name_owned, class = ext.class_name(), "populating extension");
                txn.populate_extension(&name_owned, &*ext)?;
                write_registry_record(
                    txn.store_mut(),
                    &name_owned,
                    &RegistryRecord {
                        class: ext.class_name().to_string(),
                        version: ext.version(),
                        version_tag: ext.version_tag().unwrap_or_default(),
                        tables: ext.table_names(&name_owned),
                    },
                )?;
            }
            Ok(())
        })?;

        self.registry.write().push(RegisteredExtension {
            name: name.to_string(),
            extension,
        });
        Ok(())
    }

    /// Unregisters the extension with the given name and drops its tables.
    ///
    /// Works from the persisted name → table mapping alone, so an extension
    /// registered in a previous run can be dropped without instantiating
    /// its class.
    pub fn unregister_extension(&self, name: &str) -> DbResult<()> {
        self.registry.write().retain(|r| r.name != name);

        let conn = self.new_connection();
        let name_owned = name.to_string();
        conn.read_write(move |txn| {
            if let Some(record) = read_registry_record(txn.store_mut(), &name_owned)? {
                for table in &record.tables {
                    txn.store_mut().clear_table(table)?;
                }
                txn.store_mut().delete(REGISTRY_TABLE, name_owned.as_bytes())?;
            }
            Ok(())
        })
    }

    /// Returns the names of currently registered extensions, in
    /// registration order.
    #[must_use]
    pub fn registered_extension_names(&self) -> Vec<String> {
        self.registry.read().iter().map(|r| r.name.clone()).collect()
    }

    /// Returns the extension names persisted by the previous run, as read
    /// at open time.
    #[must_use]
    pub fn previously_registered_extension_names(&self) -> &[String] {
        &self.previously_registered
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Writes a checkpoint: compacts version history no connection can
    /// still see, persists a snapshot of the store, and truncates the log.
    pub fn checkpoint(&self) -> DbResult<()> {
        let floor = self.min_tracked_snapshot();
        self.store.compact(floor.as_u64());
        self.store.checkpoint()?;
        Ok(())
    }

    fn min_tracked_snapshot(&self) -> Snapshot {
        let trackers = self.trackers.lock();
        trackers
            .iter()
            .filter_map(Weak::upgrade)
            .map(|t| Snapshot::new(t.last_snapshot.load(Ordering::SeqCst)))
            .min()
            .unwrap_or_else(|| self.snapshot())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("snapshot", &self.snapshot())
            .field("extensions", &self.registered_extension_names())
            .finish_non_exhaustive()
    }
}

/// Builder for databases with custom codecs and sanitizers.
pub struct DatabaseBuilder {
    path: Option<PathBuf>,
    config: DatabaseConfig,
    object_serializer: Arc<dyn ObjectSerializer>,
    object_deserializer: Arc<dyn ObjectDeserializer>,
    metadata_serializer: Arc<dyn ObjectSerializer>,
    metadata_deserializer: Arc<dyn ObjectDeserializer>,
    sanitizer: Option<Arc<dyn RowSanitizer>>,
}

impl DatabaseBuilder {
    fn new() -> Self {
        Self {
            path: None,
            config: DatabaseConfig::default(),
            object_serializer: Arc::new(CborCodec),
            object_deserializer: Arc::new(CborCodec),
            metadata_serializer: Arc::new(CborCodec),
            metadata_deserializer: Arc::new(CborCodec),
            sanitizer: None,
        }
    }

    /// Sets the store directory. Without a path the database is in-memory.
    #[must_use]
    pub fn path(mut self, path: &Path) -> Self {
        self.path = Some(path.to_path_buf());
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: DatabaseConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the object codec.
    #[must_use]
    pub fn object_codec(
        mut self,
        serializer: Arc<dyn ObjectSerializer>,
        deserializer: Arc<dyn ObjectDeserializer>,
    ) -> Self {
        self.object_serializer = serializer;
        self.object_deserializer = deserializer;
        self
    }

    /// Sets the metadata codec.
    #[must_use]
    pub fn metadata_codec(
        mut self,
        serializer: Arc<dyn ObjectSerializer>,
        deserializer: Arc<dyn ObjectDeserializer>,
    ) -> Self {
        self.metadata_serializer = serializer;
        self.metadata_deserializer = deserializer;
        self
    }

    /// Sets the row sanitizer.
    #[must_use]
    pub fn sanitizer(mut self, sanitizer: Arc<dyn RowSanitizer>) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    /// Opens the database.
    pub fn open(self) -> DbResult<Arc<Database>> {
        Database::from_builder(self)
    }
}

impl std::fmt::Debug for DatabaseBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseBuilder")
            .field("path", &self.path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub(crate) struct RegistryRecord {
    pub(crate) class: String,
    pub(crate) version: u32,
    pub(crate) version_tag: String,
    pub(crate) tables: Vec<String>,
}

pub(crate) fn read_registry_record(
    store: &mut StoreWriteTxn<'_>,
    name: &str,
) -> DbResult<Option<RegistryRecord>> {
    let Some(row) = store.get(REGISTRY_TABLE, name.as_bytes())? else {
        return Ok(None);
    };
    let value = CborCodec.deserialize(REGISTRY_TABLE, name, &row.value)?;
    let class = value
        .get("class")
        .and_then(Value::as_text)
        .unwrap_or_default()
        .to_string();
    let version = value
        .get("version")
        .and_then(Value::as_integer)
        .unwrap_or_default() as u32;
    let version_tag = value
        .get("version_tag")
        .and_then(Value::as_text)
        .unwrap_or_default()
        .to_string();
    let tables = value
        .get("tables")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_text().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Ok(Some(RegistryRecord {
        class,
        version,
        version_tag,
        tables,
    }))
}

pub(crate) fn write_registry_record(
    store: &mut StoreWriteTxn<'_>,
    name: &str,
    record: &RegistryRecord,
) -> DbResult<()> {
    let value = Value::record(vec![
        ("class", Value::Text(record.class.clone())),
        ("version", Value::Integer(i64::from(record.version))),
        ("version_tag", Value::Text(record.version_tag.clone())),
        (
            "tables",
            Value::Array(
                record
                    .tables
                    .iter()
                    .map(|t| Value::Text(t.clone()))
                    .collect(),
            ),
        ),
    ]);
    let bytes = CborCodec.serialize(REGISTRY_TABLE, name, &value)?;
    store.put(REGISTRY_TABLE, name.as_bytes(), bytes)?;
    Ok(())
}
