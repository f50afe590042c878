//! # StrataDB Core
//!
//! The core database engine for StrataDB: an embedded, transactional row
//! store with a plugin (extension) framework.
//!
//! This crate provides:
//! - [`Database`]: the physical store, the snapshot counter, and the
//!   extension registry
//! - [`Connection`]: thread-confined gateways with bounded caches
//! - [`ReadTransaction`] / [`ReadWriteTransaction`]: the only access path
//!   to data, with multi-reader / single-writer concurrency
//! - The extension framework ([`Extension`], [`ExtensionConnection`],
//!   [`ExtensionTransaction`]) and three built-in extensions: ordered
//!   views, secondary indexes, and geometric indexes
//! - Cross-connection cache coherency via per-commit changesets
//!
//! ## Example
//!
//! ```rust
//! use stratadb_codec::Value;
//! use stratadb_core::Database;
//!
//! let db = Database::open_in_memory().unwrap();
//! let conn = db.new_connection();
//!
//! conn.read_write(|txn| {
//!     txn.set("books", "moby-dick", Value::from("call me ishmael"), None)
//! })
//! .unwrap();
//!
//! let object = conn
//!     .read(|txn| txn.object("books", "moby-dick"))
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(object.map(|o| o.as_text().map(str::to_string)).flatten(),
//!     Some("call me ishmael".to_string()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod changeset;
mod config;
mod connection;
mod database;
mod error;
mod extension;
mod geo;
mod index;
mod notifications;
mod rows;
mod transaction;
mod types;
mod view;

pub use cache::CacheEntry;
pub use changeset::Changeset;
pub use config::DatabaseConfig;
pub use connection::Connection;
pub use database::{Database, DatabaseBuilder, RowSanitizer};
pub use error::{DbError, DbResult};
pub use extension::{
    AccessLevel, Extension, ExtensionConnection, ExtensionHost, ExtensionTransaction, RowChange,
    StoredRow,
};
pub use geo::{
    GeoConnection, GeoHandle, GeoIndexExtension, GeoOptions, GeoTransaction, Rect, RectSource,
};
pub use index::{
    encode_index_values, IndexConnection, IndexHandle, IndexKeyExtractor, IndexOptions,
    IndexTransaction, IndexValue, SecondaryIndexExtension,
};
pub use notifications::{CatchUp, CommitHub, CommitNotification};
pub use transaction::{Flow, MetadataFilter, ReadTransaction, ReadWriteTransaction};
pub use types::{ConnectionId, RowKey, Snapshot};
pub use view::{
    SnapshotViewSource, TxnViewSource, ViewConnection, ViewDirection, ViewExtension, ViewFind,
    ViewGrouper, ViewHandle, ViewOptions, ViewReader, ViewSorter, ViewTransaction, ViewWriter,
    DEFAULT_PAGE_SIZE,
};

// Re-exported so extension implementations and callers use one Value type.
pub use stratadb_codec::Value;
pub use stratadb_store::Rowid;
