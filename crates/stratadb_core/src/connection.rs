//! Connections: thread-confined gateways to the database.

use crate::cache::RowCache;
use crate::database::{ConnectionTracker, Database};
use crate::error::{DbError, DbResult};
use crate::extension::ExtensionConnection;
use crate::notifications::CommitNotification;
use crate::transaction::{ReadTransaction, ReadWriteTransaction};
use crate::types::{ConnectionId, Snapshot};
use parking_lot::{Mutex, MutexGuard};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, ThreadId};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct ConnectionState {
    pub(crate) object_cache: RowCache,
    pub(crate) metadata_cache: RowCache,
    pub(crate) ext_connections: Vec<(String, Box<dyn ExtensionConnection>)>,
    pub(crate) pinned: Option<Snapshot>,
}

pub(crate) struct ConnectionShared {
    pub(crate) db: Arc<Database>,
    pub(crate) tracker: Arc<ConnectionTracker>,
    state: Mutex<ConnectionState>,
    active_thread: Mutex<Option<ThreadId>>,
    worker: Mutex<Option<Sender<Job>>>,
}

/// A connection to the database: the unit of caching and statement reuse.
///
/// A connection serializes all access to itself: transactions on the same
/// connection never overlap, and reentering a connection from inside one of
/// its own transaction blocks is a fatal usage error. For concurrent access
/// use multiple connections: reads on different connections run in
/// parallel, and a read never blocks a writer.
///
/// `Connection` is a shared handle; clones refer to the same underlying
/// connection (the async variants use this internally).
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    pub(crate) fn new(db: Arc<Database>, tracker: Arc<ConnectionTracker>) -> Self {
        let config = db.config();
        let state = ConnectionState {
            object_cache: RowCache::new(config.object_cache_limit),
            metadata_cache: RowCache::new(config.metadata_cache_limit),
            ext_connections: Vec::new(),
            pinned: None,
        };
        Self {
            shared: Arc::new(ConnectionShared {
                db,
                tracker,
                state: Mutex::new(state),
                active_thread: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Returns this connection's identity within its database.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.shared.tracker.id
    }

    /// Returns the snapshot this connection last synchronized to.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.shared.tracker.last_snapshot.load(Ordering::SeqCst))
    }

    /// Returns the database this connection belongs to.
    #[must_use]
    pub fn database(&self) -> &Arc<Database> {
        &self.shared.db
    }

    /// Overrides this connection's object cache limit (0 = unbounded).
    pub fn set_object_cache_limit(&self, limit: usize) {
        if let Some(mut state) = self.try_lock_idle_state() {
            state.object_cache.set_limit(limit);
        }
    }

    /// Overrides this connection's metadata cache limit (0 = unbounded).
    pub fn set_metadata_cache_limit(&self, limit: usize) {
        if let Some(mut state) = self.try_lock_idle_state() {
            state.metadata_cache.set_limit(limit);
        }
    }

    fn try_lock_idle_state(&self) -> Option<MutexGuard<'_, ConnectionState>> {
        self.shared.state.try_lock()
    }

    /// Executes `block` with a read transaction on this connection.
    ///
    /// The block observes a consistent snapshot: concurrent commits on
    /// other connections do not affect it. May run concurrently with other
    /// connections' reads and writes.
    pub fn read<T>(&self, block: impl FnOnce(&mut ReadTransaction<'_>) -> T) -> DbResult<T> {
        let (mut state, _active) = self.shared.lock_state()?;
        self.shared.catch_up(&mut state);
        let snapshot = state.pinned.unwrap_or_else(|| self.snapshot());
        let mut txn = ReadTransaction::new(&self.shared.db, &mut state, snapshot);
        Ok(block(&mut txn))
    }

    /// Executes `block` with a read-write transaction on this connection.
    ///
    /// Blocks until no other connection is inside a read-write block. If
    /// the block returns `Ok`, the transaction commits, the snapshot
    /// advances by one, and the changeset is broadcast; on `Err` the
    /// transaction rolls back and the store is unchanged.
    pub fn read_write<T>(
        &self,
        block: impl FnOnce(&mut ReadWriteTransaction<'_>) -> DbResult<T>,
    ) -> DbResult<T> {
        self.read_write_inner(None, block)
    }

    /// Like [`Connection::read_write`], attaching `tag` to the commit
    /// notification.
    pub fn read_write_with_tag<T>(
        &self,
        tag: Arc<dyn Any + Send + Sync>,
        block: impl FnOnce(&mut ReadWriteTransaction<'_>) -> DbResult<T>,
    ) -> DbResult<T> {
        self.read_write_inner(Some(tag), block)
    }

    fn read_write_inner<T>(
        &self,
        tag: Option<Arc<dyn Any + Send + Sync>>,
        block: impl FnOnce(&mut ReadWriteTransaction<'_>) -> DbResult<T>,
    ) -> DbResult<T> {
        // The reentrancy check must come before the write lock: reentering
        // would otherwise self-deadlock instead of failing loudly.
        self.shared.check_reentrancy()?;

        let db = &self.shared.db;
        let _write_guard = db.write_lock.lock();
        let (mut state, _active) = self.shared.lock_state()?;
        if state.pinned.is_some() {
            return Err(DbError::invalid_operation(
                "connection is inside a long-lived read transaction",
            ));
        }
        self.shared.catch_up(&mut state);

        let ext_txns: Vec<_> = state
            .ext_connections
            .iter_mut()
            .map(|(name, conn)| (name.clone(), conn.begin()))
            .collect();

        let mut txn = ReadWriteTransaction::new(db, db.store().begin_write(), ext_txns);
        let result = block(&mut txn);

        match result {
            Ok(value) => {
                if let Some(err) = txn.take_failure() {
                    txn.rollback();
                    return Err(err);
                }
                let outcome = match txn.commit() {
                    Ok(outcome) => outcome,
                    Err(err) => return Err(err),
                };

                // Evict stale shared-cache entries first, then fold the
                // transaction's own writes into this connection's caches
                // and the shared caches, tagged with the new snapshot.
                db.scrub_shared_caches(&outcome.changeset);
                outcome.fold_into_caches(db, &mut state);
                db.store_snapshot(outcome.changeset.snapshot);
                self.shared
                    .tracker
                    .last_snapshot
                    .store(outcome.changeset.snapshot.as_u64(), Ordering::SeqCst);
                db.publish_commit(self.id(), Arc::new(outcome.changeset), tag);
                Ok(value)
            }
            Err(err) => {
                txn.rollback();
                Err(err)
            }
        }
    }

    /// Runs a read block on this connection's worker thread.
    pub fn async_read<T, F>(&self, block: F)
    where
        T: Send + 'static,
        F: FnOnce(&mut ReadTransaction<'_>) -> T + Send + 'static,
    {
        self.async_read_with(block, |_| {});
    }

    /// Runs a read block on this connection's worker thread, then invokes
    /// `completion` with the result.
    pub fn async_read_with<T, F, C>(&self, block: F, completion: C)
    where
        T: Send + 'static,
        F: FnOnce(&mut ReadTransaction<'_>) -> T + Send + 'static,
        C: FnOnce(DbResult<T>) + Send + 'static,
    {
        let conn = self.clone();
        self.submit(Box::new(move || {
            completion(conn.read(block));
        }));
    }

    /// Runs a read-write block on this connection's worker thread.
    pub fn async_read_write<T, F>(&self, block: F)
    where
        T: Send + 'static,
        F: FnOnce(&mut ReadWriteTransaction<'_>) -> DbResult<T> + Send + 'static,
    {
        self.async_read_write_with(block, |_| {});
    }

    /// Runs a read-write block on this connection's worker thread, then
    /// invokes `completion` after the connection has refreshed its own
    /// state, so the completion is guaranteed to observe the transaction's
    /// writes.
    pub fn async_read_write_with<T, F, C>(&self, block: F, completion: C)
    where
        T: Send + 'static,
        F: FnOnce(&mut ReadWriteTransaction<'_>) -> DbResult<T> + Send + 'static,
        C: FnOnce(DbResult<T>) + Send + 'static,
    {
        let conn = self.clone();
        self.submit(Box::new(move || {
            completion(conn.read_write(block));
        }));
    }

    fn submit(&self, job: Job) {
        let mut worker = self.shared.worker.lock();
        let sender = worker.get_or_insert_with(|| {
            let (tx, rx) = mpsc::channel::<Job>();
            thread::spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            });
            tx
        });
        // A send only fails if the worker thread died; respawn once.
        if sender.send(job).is_err() {
            *worker = None;
        }
    }

    // ========================================================================
    // Long-lived read transactions
    // ========================================================================

    /// Pins this connection to the current snapshot.
    ///
    /// Until [`Connection::end_long_lived_read_transaction`], every read
    /// block observes the pinned snapshot, giving a stable basis for
    /// multi-step UI refresh. Returns the commit notifications processed
    /// while moving up to the pin point (empty on the first call if the
    /// connection was already current). Calling this again re-pins to the
    /// latest snapshot.
    pub fn begin_long_lived_read_transaction(
        &self,
    ) -> DbResult<Vec<Arc<CommitNotification>>> {
        let (mut state, _active) = self.shared.lock_state()?;
        state.pinned = None;
        let processed = self.shared.catch_up(&mut state);
        state.pinned = Some(self.snapshot());
        Ok(processed)
    }

    /// Unpins the connection; the next transaction observes the latest
    /// snapshot again.
    pub fn end_long_lived_read_transaction(&self) -> DbResult<()> {
        let (mut state, _active) = self.shared.lock_state()?;
        state.pinned = None;
        Ok(())
    }

    /// Returns true if the connection is pinned to a snapshot.
    #[must_use]
    pub fn is_in_long_lived_read_transaction(&self) -> bool {
        self.shared.state.lock().pinned.is_some()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

struct ActiveGuard<'a> {
    shared: &'a ConnectionShared,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *self.shared.active_thread.lock() = None;
    }
}

impl ConnectionShared {
    fn check_reentrancy(&self) -> DbResult<()> {
        if *self.active_thread.lock() == Some(thread::current().id()) {
            tracing::error!("connection reentered from within its own transaction block");
            return Err(DbError::ConnectionReentrancy);
        }
        Ok(())
    }

    fn lock_state(&self) -> DbResult<(MutexGuard<'_, ConnectionState>, ActiveGuard<'_>)> {
        self.check_reentrancy()?;
        let state = self.state.lock();
        *self.active_thread.lock() = Some(thread::current().id());
        Ok((state, ActiveGuard { shared: self }))
    }

    /// Processes commit notifications this connection has not yet seen:
    /// evicts affected cache entries and forwards each changeset to every
    /// extension connection. Skipped while pinned to a snapshot.
    fn catch_up(&self, state: &mut ConnectionState) -> Vec<Arc<CommitNotification>> {
        self.sync_extensions(state);
        if state.pinned.is_some() {
            return Vec::new();
        }

        let last = Snapshot::new(self.tracker.last_snapshot.load(Ordering::SeqCst));
        let catch_up = self.db.hub().since(last);
        if !catch_up.complete {
            // Fell behind the notification history: reset wholesale.
            tracing::debug!(connection = %self.tracker.id, "notification gap, resetting caches");
            state.object_cache.clear();
            state.metadata_cache.clear();
            for (_, ext) in &mut state.ext_connections {
                ext.reset();
            }
            self.tracker
                .last_snapshot
                .store(self.db.hub().latest_snapshot().as_u64(), Ordering::SeqCst);
            return catch_up.notifications;
        }

        for notification in &catch_up.notifications {
            let changeset = &notification.changeset;
            if changeset.all_keys_removed {
                state.object_cache.clear();
                state.metadata_cache.clear();
            } else {
                for row in changeset
                    .object_changes
                    .iter()
                    .chain(&changeset.removed_keys)
                {
                    state.object_cache.remove(row);
                    state.metadata_cache.remove(row);
                }
                for row in &changeset.metadata_changes {
                    state.metadata_cache.remove(row);
                }
                if !changeset.removed_collections.is_empty() {
                    let removed = &changeset.removed_collections;
                    state
                        .object_cache
                        .retain(|key| !removed.contains(&key.collection));
                    state
                        .metadata_cache
                        .retain(|key| !removed.contains(&key.collection));
                }
            }
            for (_, ext) in &mut state.ext_connections {
                ext.process_changeset(changeset);
            }
            self.tracker
                .last_snapshot
                .store(notification.snapshot.as_u64(), Ordering::SeqCst);
        }
        catch_up.notifications
    }

    /// Aligns this connection's extension connections with the database
    /// registry, preserving existing state and discarding unregistered
    /// extensions.
    fn sync_extensions(&self, state: &mut ConnectionState) {
        let registry = self.db.registry_snapshot();
        let unchanged = registry.len() == state.ext_connections.len()
            && registry
                .iter()
                .zip(&state.ext_connections)
                .all(|(reg, (name, _))| reg.name == *name);
        if unchanged {
            return;
        }
        let mut existing: HashMap<String, Box<dyn ExtensionConnection>> =
            state.ext_connections.drain(..).collect();
        for reg in registry {
            let conn = existing
                .remove(&reg.name)
                .unwrap_or_else(|| reg.extension.connect(&reg.name));
            state.ext_connections.push((reg.name, conn));
        }
    }
}
