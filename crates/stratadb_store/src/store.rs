//! The keyspace engine: versioned tables, snapshot readers, write
//! transactions.

use crate::dir::StoreDir;
use crate::error::{StoreError, StoreResult};
use crate::log::{LogRecord, LogWriter};
use crate::media::{FileMedia, LogMedia, MemoryMedia};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Engine-assigned integer identity for a row.
///
/// A rowid identifies a row for the lifetime of that row and may be reused
/// after the row is deleted and its history compacted away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rowid(pub i64);

impl Rowid {
    /// Creates a rowid from its raw value.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw rowid value.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns the big-endian byte encoding, suitable as a table key.
    #[must_use]
    pub const fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Decodes a rowid from its big-endian byte encoding.
    pub fn from_be_bytes(bytes: &[u8]) -> StoreResult<Self> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| StoreError::corruption("rowid must be 8 bytes"))?;
        Ok(Self(i64::from_be_bytes(arr)))
    }
}

impl fmt::Display for Rowid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row:{}", self.0)
    }
}

/// A row as returned by reads: its rowid and value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRecord {
    /// The row's engine-assigned identity.
    pub rowid: Rowid,
    /// The row's value bytes.
    pub value: Arc<[u8]>,
}

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,
    /// Whether to fsync the log on every commit (safer but slower).
    pub sync_on_commit: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: true,
        }
    }
}

impl StoreOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the store if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to fsync the log on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }
}

/// One version of a row's value. `value: None` is a tombstone.
#[derive(Debug, Clone)]
struct Version {
    seq: u64,
    rowid: Rowid,
    value: Option<Arc<[u8]>>,
}

#[derive(Debug, Default)]
struct VersionChain {
    /// Versions in ascending sequence order.
    versions: Vec<Version>,
}

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<Vec<u8>, VersionChain>,
    /// Sequences at which the table was cleared. A clear at `d` hides every
    /// version with `seq < d` from readers at `seq >= d`.
    clears: Vec<u64>,
    /// Number of rows visible at the head sequence.
    live_count: usize,
}

impl Table {
    fn visible<'a>(&self, chain: &'a VersionChain, seq: u64) -> Option<&'a Version> {
        let version = chain.versions.iter().rev().find(|v| v.seq <= seq)?;
        if self.clears.iter().any(|&d| version.seq < d && d <= seq) {
            return None;
        }
        version.value.as_ref().map(|_| version)
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    tables: HashMap<String, Table>,
    /// Head-state rowid → (table, key). Entries outlive deletion until
    /// compaction so extensions can resolve recently removed rows.
    rowid_index: HashMap<Rowid, (String, Vec<u8>)>,
    next_rowid: i64,
    free_rowids: Vec<Rowid>,
}

impl StoreInner {
    fn reserve_rowid(&mut self) -> Rowid {
        if let Some(rowid) = self.free_rowids.pop() {
            return rowid;
        }
        self.next_rowid += 1;
        Rowid::new(self.next_rowid)
    }

    fn apply(&mut self, op: &TxnOp, seq: u64) {
        match op {
            TxnOp::Put {
                table,
                key,
                rowid,
                value,
            } => {
                let t = self.tables.entry(table.clone()).or_default();
                // Visibility at `seq` includes earlier operations of the
                // same batch, which matters for clear-then-put sequences.
                let was_live = t
                    .rows
                    .get(key)
                    .map_or(false, |chain| t.visible(chain, seq).is_some());
                let chain = t.rows.entry(key.clone()).or_default();
                chain.versions.push(Version {
                    seq,
                    rowid: *rowid,
                    value: Some(Arc::clone(value)),
                });
                if !was_live {
                    t.live_count += 1;
                }
                self.rowid_index
                    .insert(*rowid, (table.clone(), key.clone()));
            }
            TxnOp::Delete { table, key } => {
                if let Some(t) = self.tables.get_mut(table) {
                    let prior = t
                        .rows
                        .get(key)
                        .and_then(|chain| t.visible(chain, seq))
                        .map(|v| v.rowid);
                    if let Some(rowid) = prior {
                        let chain = t.rows.entry(key.clone()).or_default();
                        chain.versions.push(Version {
                            seq,
                            rowid,
                            value: None,
                        });
                        t.live_count = t.live_count.saturating_sub(1);
                    }
                }
            }
            TxnOp::Clear { table } => {
                if let Some(t) = self.tables.get_mut(table) {
                    t.clears.push(seq);
                    t.live_count = 0;
                }
            }
        }
    }
}

/// Transaction-local pending operation, in call order.
#[derive(Debug, Clone)]
enum TxnOp {
    Put {
        table: String,
        key: Vec<u8>,
        rowid: Rowid,
        value: Arc<[u8]>,
    },
    Delete {
        table: String,
        key: Vec<u8>,
    },
    Clear {
        table: String,
    },
}

/// Read access to tables at a fixed sequence.
///
/// Implemented by [`SnapshotReader`] (committed state at a snapshot) and
/// [`StoreWriteTxn`] (committed state plus the transaction's own pending
/// writes).
pub trait TableRead {
    /// Looks up a row by key.
    fn get(&self, table: &str, key: &[u8]) -> StoreResult<Option<RowRecord>>;

    /// Returns true if a row exists for the key.
    fn contains(&self, table: &str, key: &[u8]) -> StoreResult<bool> {
        Ok(self.get(table, key)?.is_some())
    }

    /// Returns every row of a table in ascending key order.
    fn scan(&self, table: &str) -> StoreResult<Vec<(Vec<u8>, RowRecord)>>;

    /// Returns rows with `lower <= key` (and `key < upper` when an upper
    /// bound is given), in ascending key order.
    fn scan_between(
        &self,
        table: &str,
        lower: &[u8],
        upper: Option<&[u8]>,
    ) -> StoreResult<Vec<(Vec<u8>, RowRecord)>>;

    /// Returns the number of rows in a table.
    fn row_count(&self, table: &str) -> StoreResult<usize>;

    /// Returns the names of all tables with at least one row.
    fn table_names(&self) -> StoreResult<Vec<String>>;

    /// Resolves a rowid to its (table, key) location.
    fn rowid_entry(&self, rowid: Rowid) -> StoreResult<Option<(String, Vec<u8>)>>;
}

impl<T: TableRead + ?Sized> TableRead for &T {
    fn get(&self, table: &str, key: &[u8]) -> StoreResult<Option<RowRecord>> {
        (**self).get(table, key)
    }

    fn scan(&self, table: &str) -> StoreResult<Vec<(Vec<u8>, RowRecord)>> {
        (**self).scan(table)
    }

    fn scan_between(
        &self,
        table: &str,
        lower: &[u8],
        upper: Option<&[u8]>,
    ) -> StoreResult<Vec<(Vec<u8>, RowRecord)>> {
        (**self).scan_between(table, lower, upper)
    }

    fn row_count(&self, table: &str) -> StoreResult<usize> {
        (**self).row_count(table)
    }

    fn table_names(&self) -> StoreResult<Vec<String>> {
        (**self).table_names()
    }

    fn rowid_entry(&self, rowid: Rowid) -> StoreResult<Option<(String, Vec<u8>)>> {
        (**self).rowid_entry(rowid)
    }
}

/// The keyspace engine.
///
/// One write transaction runs at a time; any number of [`SnapshotReader`]s
/// may read concurrently, each pinned to a sequence number. Committed data
/// is durable once [`StoreWriteTxn::commit`] returns (when `sync_on_commit`
/// is set).
pub struct Store {
    inner: RwLock<StoreInner>,
    wal: Mutex<LogWriter>,
    dir: Option<StoreDir>,
    options: StoreOptions,
    committed_seq: AtomicU64,
    write_gate: Mutex<()>,
}

impl Store {
    /// Opens or creates a persistent store at the given directory.
    pub fn open(path: &Path, options: StoreOptions) -> StoreResult<Self> {
        let dir = StoreDir::open(path, options.create_if_missing)?;
        let wal = LogWriter::new(Box::new(FileMedia::open(&dir.wal_path())?));

        let mut inner = StoreInner::default();
        let mut committed = 0u64;

        // Load checkpoint snapshot first, then replay the log over it.
        if let Some(data) = dir.read_snapshot()? {
            committed = Self::load_snapshot(&mut inner, &data)?;
        }
        let replayed = Self::replay(&mut inner, &wal, committed)?;
        committed = committed.max(replayed);
        tracing::debug!(seq = committed, "store opened");

        Ok(Self {
            inner: RwLock::new(inner),
            wal: Mutex::new(wal),
            dir: Some(dir),
            options,
            committed_seq: AtomicU64::new(committed),
            write_gate: Mutex::new(()),
        })
    }

    /// Creates a fresh in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            wal: Mutex::new(LogWriter::new(Box::new(MemoryMedia::new()))),
            dir: None,
            options: StoreOptions::default().sync_on_commit(false),
            committed_seq: AtomicU64::new(0),
            write_gate: Mutex::new(()),
        }
    }

    fn load_snapshot(inner: &mut StoreInner, data: &[u8]) -> StoreResult<u64> {
        let mut media = MemoryMedia::new();
        media.append(data)?;
        let reader = LogWriter::new(Box::new(media));
        let records = reader.read_all()?;

        let mut iter = records.into_iter();
        let seq = match iter.next() {
            Some(LogRecord::Snapshot { seq }) => seq,
            _ => {
                return Err(StoreError::corruption(
                    "snapshot file does not start with a snapshot header",
                ))
            }
        };
        for record in iter {
            match record {
                LogRecord::Put {
                    table,
                    key,
                    rowid,
                    value,
                } => {
                    let rowid = Rowid::new(rowid);
                    inner.next_rowid = inner.next_rowid.max(rowid.as_i64());
                    inner.apply(
                        &TxnOp::Put {
                            table,
                            key,
                            rowid,
                            value: value.into(),
                        },
                        seq,
                    );
                }
                other => {
                    return Err(StoreError::corruption(format!(
                        "unexpected record in snapshot file: {other:?}"
                    )))
                }
            }
        }
        Ok(seq)
    }

    /// Replays committed log batches newer than `after_seq`.
    fn replay(inner: &mut StoreInner, wal: &LogWriter, after_seq: u64) -> StoreResult<u64> {
        let records = wal.read_all()?;
        let mut pending: Vec<TxnOp> = Vec::new();
        let mut committed = after_seq;

        for record in records {
            match record {
                LogRecord::Put {
                    table,
                    key,
                    rowid,
                    value,
                } => {
                    let rowid = Rowid::new(rowid);
                    inner.next_rowid = inner.next_rowid.max(rowid.as_i64());
                    pending.push(TxnOp::Put {
                        table,
                        key,
                        rowid,
                        value: value.into(),
                    });
                }
                LogRecord::Delete { table, key } => {
                    pending.push(TxnOp::Delete { table, key });
                }
                LogRecord::ClearTable { table } => {
                    pending.push(TxnOp::Clear { table });
                }
                LogRecord::Commit { seq } => {
                    if seq > after_seq {
                        for op in &pending {
                            inner.apply(op, seq);
                        }
                        committed = committed.max(seq);
                    }
                    pending.clear();
                }
                LogRecord::Snapshot { .. } => {
                    return Err(StoreError::corruption(
                        "snapshot header found in write-ahead log",
                    ))
                }
            }
        }
        // Records after the last commit marker belong to an unfinished
        // transaction and are discarded.
        Ok(committed)
    }

    /// Returns the current committed sequence number.
    #[must_use]
    pub fn committed_seq(&self) -> u64 {
        self.committed_seq.load(Ordering::SeqCst)
    }

    /// Returns a reader pinned to the current committed sequence.
    #[must_use]
    pub fn begin_read(&self) -> SnapshotReader<'_> {
        self.reader_at(self.committed_seq())
    }

    /// Returns a reader pinned to the given sequence.
    #[must_use]
    pub fn reader_at(&self, seq: u64) -> SnapshotReader<'_> {
        SnapshotReader { store: self, seq }
    }

    /// Begins a write transaction, blocking until no other writer exists.
    pub fn begin_write(&self) -> StoreWriteTxn<'_> {
        let gate = self.write_gate.lock();
        let base_seq = self.committed_seq();
        StoreWriteTxn {
            store: self,
            _gate: gate,
            ops: Vec::new(),
            overlay: HashMap::new(),
            overlay_rowids: HashMap::new(),
            cleared: HashSet::new(),
            reserved: Vec::new(),
            base_seq,
            finished: false,
        }
    }

    /// Writes a checkpoint snapshot and truncates the log.
    ///
    /// For an in-memory store this only truncates the (in-memory) log.
    pub fn checkpoint(&self) -> StoreResult<()> {
        // The write gate keeps a committing writer from interleaving with
        // the snapshot + truncate pair.
        let _gate = self.write_gate.lock();
        let seq = self.committed_seq();

        if let Some(ref dir) = self.dir {
            let mut buf = Vec::new();
            LogRecord::Snapshot { seq }.encode_frame(&mut buf);
            {
                let inner = self.inner.read();
                for (name, table) in &inner.tables {
                    for (key, chain) in &table.rows {
                        if let Some(version) = table.visible(chain, seq) {
                            LogRecord::Put {
                                table: name.clone(),
                                key: key.clone(),
                                rowid: version.rowid.as_i64(),
                                value: version.value.as_deref().unwrap_or(&[]).to_vec(),
                            }
                            .encode_frame(&mut buf);
                        }
                    }
                }
            }
            dir.replace_snapshot(&buf)?;
        }

        self.wal.lock().clear()?;
        tracing::debug!(seq, "checkpoint complete");
        Ok(())
    }

    /// Prunes version history no reader at or above `before_seq` can see.
    ///
    /// Rowids of rows that were deleted before `before_seq` are released
    /// for reuse. Callers must guarantee no reader is pinned below
    /// `before_seq`.
    pub fn compact(&self, before_seq: u64) {
        let mut inner = self.inner.write();
        let inner = &mut *inner;
        let mut freed: Vec<Rowid> = Vec::new();

        inner.tables.retain(|_, table| {
            let clears = std::mem::take(&mut table.clears);
            let (old_clears, kept_clears): (Vec<u64>, Vec<u64>) =
                clears.into_iter().partition(|&d| d <= before_seq);
            table.clears = kept_clears;
            let max_old_clear = old_clears.into_iter().max().unwrap_or(0);

            table.rows.retain(|_, chain| {
                let head_rowid = chain.versions.last().map(|v| v.rowid);
                // Drop versions hidden by an old clear.
                chain.versions.retain(|v| v.seq >= max_old_clear);
                // Drop versions superseded by a later version at or below
                // the floor.
                let mut keep_from = 0;
                for (i, v) in chain.versions.iter().enumerate() {
                    if v.seq <= before_seq {
                        keep_from = i;
                    }
                }
                chain.versions.drain(0..keep_from);
                // A chain whose only remaining version is an old tombstone
                // is dead.
                if chain.versions.len() == 1 {
                    let v = &chain.versions[0];
                    if v.value.is_none() && v.seq <= before_seq {
                        chain.versions.clear();
                    }
                }
                if chain.versions.is_empty() {
                    // The row ended its lifetime (tombstoned or cleared)
                    // before the floor; its rowid can be reused.
                    if let Some(rowid) = head_rowid {
                        freed.push(rowid);
                    }
                    return false;
                }
                true
            });

            !table.rows.is_empty() || !table.clears.is_empty()
        });

        for rowid in freed {
            inner.rowid_index.remove(&rowid);
            inner.free_rowids.push(rowid);
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("committed_seq", &self.committed_seq())
            .field("persistent", &self.dir.is_some())
            .finish_non_exhaustive()
    }
}

/// A reader pinned to a sequence number.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotReader<'a> {
    store: &'a Store,
    seq: u64,
}

impl SnapshotReader<'_> {
    /// Returns the sequence this reader is pinned to.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl TableRead for SnapshotReader<'_> {
    fn get(&self, table: &str, key: &[u8]) -> StoreResult<Option<RowRecord>> {
        let inner = self.store.inner.read();
        Ok(inner.tables.get(table).and_then(|t| {
            t.rows.get(key).and_then(|chain| {
                t.visible(chain, self.seq).map(|v| RowRecord {
                    rowid: v.rowid,
                    value: Arc::clone(v.value.as_ref().expect("visible row has value")),
                })
            })
        }))
    }

    fn scan(&self, table: &str) -> StoreResult<Vec<(Vec<u8>, RowRecord)>> {
        self.scan_between(table, &[], None)
    }

    fn scan_between(
        &self,
        table: &str,
        lower: &[u8],
        upper: Option<&[u8]>,
    ) -> StoreResult<Vec<(Vec<u8>, RowRecord)>> {
        let inner = self.store.inner.read();
        let Some(t) = inner.tables.get(table) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (key, chain) in t.rows.range(lower.to_vec()..) {
            if let Some(upper) = upper {
                if key.as_slice() >= upper {
                    break;
                }
            }
            if let Some(v) = t.visible(chain, self.seq) {
                out.push((
                    key.clone(),
                    RowRecord {
                        rowid: v.rowid,
                        value: Arc::clone(v.value.as_ref().expect("visible row has value")),
                    },
                ));
            }
        }
        Ok(out)
    }

    fn row_count(&self, table: &str) -> StoreResult<usize> {
        let inner = self.store.inner.read();
        let Some(t) = inner.tables.get(table) else {
            return Ok(0);
        };
        if self.seq == self.store.committed_seq() {
            return Ok(t.live_count);
        }
        Ok(t.rows
            .iter()
            .filter(|(_, chain)| t.visible(chain, self.seq).is_some())
            .count())
    }

    fn table_names(&self) -> StoreResult<Vec<String>> {
        let inner = self.store.inner.read();
        let mut names: Vec<String> = inner
            .tables
            .iter()
            .filter(|(_, t)| {
                t.rows
                    .iter()
                    .any(|(_, chain)| t.visible(chain, self.seq).is_some())
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    fn rowid_entry(&self, rowid: Rowid) -> StoreResult<Option<(String, Vec<u8>)>> {
        let inner = self.store.inner.read();
        Ok(inner.rowid_index.get(&rowid).cloned())
    }
}

/// A write transaction: buffered mutations applied atomically on commit.
///
/// Reads through the transaction observe the transaction's own pending
/// writes overlaid on the committed state at transaction start.
pub struct StoreWriteTxn<'a> {
    store: &'a Store,
    _gate: MutexGuard<'a, ()>,
    ops: Vec<TxnOp>,
    overlay: HashMap<(String, Vec<u8>), Option<(Rowid, Arc<[u8]>)>>,
    overlay_rowids: HashMap<Rowid, (String, Vec<u8>)>,
    cleared: HashSet<String>,
    reserved: Vec<Rowid>,
    base_seq: u64,
    finished: bool,
}

impl StoreWriteTxn<'_> {
    /// Returns the committed sequence this transaction started from.
    #[must_use]
    pub fn base_seq(&self) -> u64 {
        self.base_seq
    }

    /// Inserts or replaces a row, returning its rowid.
    ///
    /// An existing live row keeps its rowid; a new row (including a key
    /// re-added after deletion) gets a fresh one.
    pub fn put(&mut self, table: &str, key: &[u8], value: Vec<u8>) -> StoreResult<Rowid> {
        let rowid = match self.current_rowid(table, key)? {
            Some(rowid) => rowid,
            None => {
                let rowid = self.store.inner.write().reserve_rowid();
                self.reserved.push(rowid);
                rowid
            }
        };
        let value: Arc<[u8]> = value.into();
        self.ops.push(TxnOp::Put {
            table: table.to_string(),
            key: key.to_vec(),
            rowid,
            value: Arc::clone(&value),
        });
        self.overlay
            .insert((table.to_string(), key.to_vec()), Some((rowid, value)));
        self.overlay_rowids
            .insert(rowid, (table.to_string(), key.to_vec()));
        Ok(rowid)
    }

    /// Deletes a row. Returns true if the row existed.
    pub fn delete(&mut self, table: &str, key: &[u8]) -> StoreResult<bool> {
        if self.current_rowid(table, key)?.is_none() {
            return Ok(false);
        }
        self.ops.push(TxnOp::Delete {
            table: table.to_string(),
            key: key.to_vec(),
        });
        self.overlay
            .insert((table.to_string(), key.to_vec()), None);
        Ok(true)
    }

    /// Removes every row from a table.
    pub fn clear_table(&mut self, table: &str) -> StoreResult<()> {
        self.overlay.retain(|(t, _), _| t != table);
        self.overlay_rowids.retain(|_, (t, _)| t != table);
        self.cleared.insert(table.to_string());
        // Earlier pending operations on the table are invisible after the
        // clear; dropping them keeps batch ordering unambiguous on replay.
        self.ops.retain(|op| {
            !matches!(op,
                TxnOp::Put { table: t, .. } | TxnOp::Delete { table: t, .. } | TxnOp::Clear { table: t }
                if t == table)
        });
        self.ops.push(TxnOp::Clear {
            table: table.to_string(),
        });
        Ok(())
    }

    fn current_rowid(&self, table: &str, key: &[u8]) -> StoreResult<Option<Rowid>> {
        if let Some(entry) = self.overlay.get(&(table.to_string(), key.to_vec())) {
            return Ok(entry.as_ref().map(|(rowid, _)| *rowid));
        }
        if self.cleared.contains(table) {
            return Ok(None);
        }
        Ok(self
            .store
            .reader_at(self.base_seq)
            .get(table, key)?
            .map(|r| r.rowid))
    }

    /// Commits the transaction, returning the assigned sequence number.
    ///
    /// The sequence advances by exactly one per commit. The log batch is
    /// flushed (and fsynced when configured) before the in-memory state is
    /// updated, so a commit that returns `Ok` is durable.
    pub fn commit(mut self) -> StoreResult<u64> {
        let seq = self.base_seq + 1;

        let mut records: Vec<LogRecord> = self
            .ops
            .iter()
            .map(|op| match op {
                TxnOp::Put {
                    table,
                    key,
                    rowid,
                    value,
                } => LogRecord::Put {
                    table: table.clone(),
                    key: key.clone(),
                    rowid: rowid.as_i64(),
                    value: value.to_vec(),
                },
                TxnOp::Delete { table, key } => LogRecord::Delete {
                    table: table.clone(),
                    key: key.clone(),
                },
                TxnOp::Clear { table } => LogRecord::ClearTable {
                    table: table.clone(),
                },
            })
            .collect();
        records.push(LogRecord::Commit { seq });

        {
            let mut wal = self.store.wal.lock();
            wal.append_batch(&records)?;
            if self.store.options.sync_on_commit {
                wal.sync()?;
            } else {
                wal.flush()?;
            }
        }

        {
            let mut inner = self.store.inner.write();
            for op in &self.ops {
                inner.apply(op, seq);
            }
        }
        self.store.committed_seq.store(seq, Ordering::SeqCst);
        self.finished = true;
        Ok(seq)
    }

    /// Discards the transaction's pending writes.
    pub fn rollback(mut self) {
        self.release_reserved();
        self.finished = true;
    }

    fn release_reserved(&mut self) {
        if self.reserved.is_empty() {
            return;
        }
        let mut inner = self.store.inner.write();
        inner.free_rowids.extend(self.reserved.drain(..));
    }
}

impl Drop for StoreWriteTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.release_reserved();
        }
    }
}

impl TableRead for StoreWriteTxn<'_> {
    fn get(&self, table: &str, key: &[u8]) -> StoreResult<Option<RowRecord>> {
        if let Some(entry) = self.overlay.get(&(table.to_string(), key.to_vec())) {
            return Ok(entry.as_ref().map(|(rowid, value)| RowRecord {
                rowid: *rowid,
                value: Arc::clone(value),
            }));
        }
        if self.cleared.contains(table) {
            return Ok(None);
        }
        self.store.reader_at(self.base_seq).get(table, key)
    }

    fn scan(&self, table: &str) -> StoreResult<Vec<(Vec<u8>, RowRecord)>> {
        self.scan_between(table, &[], None)
    }

    fn scan_between(
        &self,
        table: &str,
        lower: &[u8],
        upper: Option<&[u8]>,
    ) -> StoreResult<Vec<(Vec<u8>, RowRecord)>> {
        let mut merged: BTreeMap<Vec<u8>, RowRecord> = if self.cleared.contains(table) {
            BTreeMap::new()
        } else {
            self.store
                .reader_at(self.base_seq)
                .scan_between(table, lower, upper)?
                .into_iter()
                .collect()
        };
        for ((t, key), entry) in &self.overlay {
            if t != table || key.as_slice() < lower {
                continue;
            }
            if let Some(upper) = upper {
                if key.as_slice() >= upper {
                    continue;
                }
            }
            match entry {
                Some((rowid, value)) => {
                    merged.insert(
                        key.clone(),
                        RowRecord {
                            rowid: *rowid,
                            value: Arc::clone(value),
                        },
                    );
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    fn row_count(&self, table: &str) -> StoreResult<usize> {
        Ok(self.scan(table)?.len())
    }

    fn table_names(&self) -> StoreResult<Vec<String>> {
        let mut names: HashSet<String> = self
            .store
            .reader_at(self.base_seq)
            .table_names()?
            .into_iter()
            .filter(|name| !self.cleared.contains(name))
            .collect();
        for ((table, _), entry) in &self.overlay {
            if entry.is_some() {
                names.insert(table.clone());
            }
        }
        // Tables whose every row was deleted in this transaction no longer
        // count as present.
        let mut out: Vec<String> = names
            .into_iter()
            .filter(|name| {
                self.row_count(name)
                    .map(|count| count > 0)
                    .unwrap_or(false)
            })
            .collect();
        out.sort();
        Ok(out)
    }

    fn rowid_entry(&self, rowid: Rowid) -> StoreResult<Option<(String, Vec<u8>)>> {
        if let Some(entry) = self.overlay_rowids.get(&rowid) {
            return Ok(Some(entry.clone()));
        }
        self.store.reader_at(self.base_seq).rowid_entry(rowid)
    }
}

impl fmt::Debug for StoreWriteTxn<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreWriteTxn")
            .field("base_seq", &self.base_seq)
            .field("pending_ops", &self.ops.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let store = Store::in_memory();
        let mut txn = store.begin_write();
        txn.put("books", b"k1", vec![1, 2, 3]).unwrap();
        let seq = txn.commit().unwrap();
        assert_eq!(seq, 1);

        let reader = store.begin_read();
        let row = reader.get("books", b"k1").unwrap().unwrap();
        assert_eq!(&row.value[..], &[1, 2, 3]);
    }

    #[test]
    fn uncommitted_writes_invisible() {
        let store = Store::in_memory();
        let mut txn = store.begin_write();
        txn.put("books", b"k1", vec![1]).unwrap();

        // Visible inside the transaction, not outside.
        assert!(txn.get("books", b"k1").unwrap().is_some());
        assert!(store.begin_read().get("books", b"k1").unwrap().is_none());
        txn.rollback();
        assert!(store.begin_read().get("books", b"k1").unwrap().is_none());
    }

    #[test]
    fn snapshot_reads_are_stable() {
        let store = Store::in_memory();
        let mut txn = store.begin_write();
        txn.put("t", b"k", vec![1]).unwrap();
        let seq1 = txn.commit().unwrap();

        let old = store.reader_at(seq1);

        let mut txn = store.begin_write();
        txn.put("t", b"k", vec![2]).unwrap();
        txn.commit().unwrap();

        assert_eq!(&old.get("t", b"k").unwrap().unwrap().value[..], &[1]);
        assert_eq!(
            &store.begin_read().get("t", b"k").unwrap().unwrap().value[..],
            &[2]
        );
    }

    #[test]
    fn rowid_stable_across_update_fresh_after_delete() {
        let store = Store::in_memory();
        let mut txn = store.begin_write();
        let r1 = txn.put("t", b"k", vec![1]).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin_write();
        let r2 = txn.put("t", b"k", vec![2]).unwrap();
        txn.commit().unwrap();
        assert_eq!(r1, r2);

        let mut txn = store.begin_write();
        txn.delete("t", b"k").unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin_write();
        let r3 = txn.put("t", b"k", vec![3]).unwrap();
        txn.commit().unwrap();
        assert_ne!(r1, r3);
    }

    #[test]
    fn rowid_entry_resolves() {
        let store = Store::in_memory();
        let mut txn = store.begin_write();
        let rowid = txn.put("t", b"k", vec![1]).unwrap();
        assert_eq!(
            txn.rowid_entry(rowid).unwrap().unwrap(),
            ("t".to_string(), b"k".to_vec())
        );
        txn.commit().unwrap();
        let reader = store.begin_read();
        assert_eq!(
            reader.rowid_entry(rowid).unwrap().unwrap(),
            ("t".to_string(), b"k".to_vec())
        );
    }

    #[test]
    fn clear_table_hides_rows_from_new_readers_only() {
        let store = Store::in_memory();
        let mut txn = store.begin_write();
        txn.put("t", b"a", vec![1]).unwrap();
        txn.put("t", b"b", vec![2]).unwrap();
        let seq = txn.commit().unwrap();

        let old = store.reader_at(seq);

        let mut txn = store.begin_write();
        txn.clear_table("t").unwrap();
        txn.commit().unwrap();

        assert_eq!(old.row_count("t").unwrap(), 2);
        assert_eq!(store.begin_read().row_count("t").unwrap(), 0);
    }

    #[test]
    fn write_after_clear_in_same_txn() {
        let store = Store::in_memory();
        let mut txn = store.begin_write();
        txn.put("t", b"a", vec![1]).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin_write();
        txn.clear_table("t").unwrap();
        txn.put("t", b"b", vec![2]).unwrap();
        txn.commit().unwrap();

        let reader = store.begin_read();
        assert!(reader.get("t", b"a").unwrap().is_none());
        assert!(reader.get("t", b"b").unwrap().is_some());
        assert_eq!(reader.row_count("t").unwrap(), 1);
    }

    #[test]
    fn scan_between_bounds() {
        let store = Store::in_memory();
        let mut txn = store.begin_write();
        for key in [b"a", b"b", b"c", b"d"] {
            txn.put("t", key, key.to_vec()).unwrap();
        }
        txn.commit().unwrap();

        let reader = store.begin_read();
        let rows = reader.scan_between("t", b"b", Some(b"d")).unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn scan_merges_overlay() {
        let store = Store::in_memory();
        let mut txn = store.begin_write();
        txn.put("t", b"a", vec![1]).unwrap();
        txn.put("t", b"b", vec![2]).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin_write();
        txn.delete("t", b"a").unwrap();
        txn.put("t", b"c", vec![3]).unwrap();
        let rows = txn.scan("t").unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
        txn.rollback();
    }

    #[test]
    fn table_names_lists_nonempty_tables() {
        let store = Store::in_memory();
        let mut txn = store.begin_write();
        txn.put("alpha", b"k", vec![1]).unwrap();
        txn.put("beta", b"k", vec![1]).unwrap();
        txn.commit().unwrap();

        assert_eq!(store.begin_read().table_names().unwrap(), ["alpha", "beta"]);

        let mut txn = store.begin_write();
        txn.delete("beta", b"k").unwrap();
        txn.commit().unwrap();
        assert_eq!(store.begin_read().table_names().unwrap(), ["alpha"]);
    }

    #[test]
    fn sequence_advances_by_one() {
        let store = Store::in_memory();
        for expected in 1..=5u64 {
            let mut txn = store.begin_write();
            txn.put("t", b"k", vec![expected as u8]).unwrap();
            assert_eq!(txn.commit().unwrap(), expected);
        }
    }

    #[test]
    fn compact_prunes_history_and_frees_rowids() {
        let store = Store::in_memory();
        let mut txn = store.begin_write();
        let rowid = txn.put("t", b"k", vec![1]).unwrap();
        txn.commit().unwrap();
        let mut txn = store.begin_write();
        txn.delete("t", b"k").unwrap();
        let seq = txn.commit().unwrap();

        store.compact(seq);

        // The freed rowid is reused for the next insert.
        let mut txn = store.begin_write();
        let reused = txn.put("t", b"k2", vec![2]).unwrap();
        txn.commit().unwrap();
        assert_eq!(rowid, reused);
    }

    #[test]
    fn compact_keeps_visible_head() {
        let store = Store::in_memory();
        let mut txn = store.begin_write();
        txn.put("t", b"k", vec![1]).unwrap();
        txn.commit().unwrap();
        let mut txn = store.begin_write();
        txn.put("t", b"k", vec![2]).unwrap();
        let seq = txn.commit().unwrap();

        store.compact(seq);
        assert_eq!(
            &store.begin_read().get("t", b"k").unwrap().unwrap().value[..],
            &[2]
        );
    }
}

#[cfg(test)]
mod persistence_tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reopen_recovers_from_log() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");

        {
            let store = Store::open(&path, StoreOptions::default()).unwrap();
            let mut txn = store.begin_write();
            txn.put("t", b"k", vec![42]).unwrap();
            txn.commit().unwrap();
            // No checkpoint: recovery must come from the log.
        }

        {
            let store = Store::open(&path, StoreOptions::default()).unwrap();
            assert_eq!(store.committed_seq(), 1);
            let row = store.begin_read().get("t", b"k").unwrap().unwrap();
            assert_eq!(&row.value[..], &[42]);
        }
    }

    #[test]
    fn reopen_recovers_from_checkpoint_plus_log() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");

        {
            let store = Store::open(&path, StoreOptions::default()).unwrap();
            let mut txn = store.begin_write();
            txn.put("t", b"a", vec![1]).unwrap();
            txn.commit().unwrap();
            store.checkpoint().unwrap();

            let mut txn = store.begin_write();
            txn.put("t", b"b", vec![2]).unwrap();
            txn.commit().unwrap();
        }

        {
            let store = Store::open(&path, StoreOptions::default()).unwrap();
            assert_eq!(store.committed_seq(), 2);
            let reader = store.begin_read();
            assert_eq!(&reader.get("t", b"a").unwrap().unwrap().value[..], &[1]);
            assert_eq!(&reader.get("t", b"b").unwrap().unwrap().value[..], &[2]);
        }
    }

    #[test]
    fn rowids_stable_across_restart() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");
        let rowid;
        {
            let store = Store::open(&path, StoreOptions::default()).unwrap();
            let mut txn = store.begin_write();
            rowid = txn.put("t", b"k", vec![1]).unwrap();
            txn.commit().unwrap();
        }
        {
            let store = Store::open(&path, StoreOptions::default()).unwrap();
            let row = store.begin_read().get("t", b"k").unwrap().unwrap();
            assert_eq!(row.rowid, rowid);

            // A fresh insert must not collide with the recovered rowid.
            let mut txn = store.begin_write();
            let fresh = txn.put("t", b"k2", vec![2]).unwrap();
            txn.commit().unwrap();
            assert_ne!(fresh, rowid);
        }
    }

    #[test]
    fn second_process_is_locked_out() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");
        let _store = Store::open(&path, StoreOptions::default()).unwrap();
        assert!(matches!(
            Store::open(&path, StoreOptions::default()),
            Err(StoreError::Locked)
        ));
    }
}
