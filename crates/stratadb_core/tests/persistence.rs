//! Restart behavior: recovery, registration idempotence, version bumps.

use std::cmp::Ordering;
use std::sync::Arc;

use stratadb_core::{
    AccessLevel, Database, Extension, StoredRow, Value, ViewDirection, ViewExtension, ViewGrouper,
    ViewOptions, ViewSorter,
};
use tempfile::tempdir;

struct FirstLetterGrouper;

impl ViewGrouper for FirstLetterGrouper {
    fn access(&self) -> AccessLevel {
        AccessLevel::Key
    }

    fn group(
        &self,
        _collection: &str,
        key: &str,
        _object: Option<&Value>,
        _metadata: Option<&Value>,
    ) -> Option<String> {
        key.chars().next().map(|c| c.to_string())
    }
}

struct KeyOrderSorter;

impl ViewSorter for KeyOrderSorter {
    fn access(&self) -> AccessLevel {
        AccessLevel::Key
    }

    fn compare(&self, _group: &str, a: &StoredRow, b: &StoredRow) -> Ordering {
        a.key.cmp(&b.key)
    }
}

fn letter_view(tag: &str) -> Arc<dyn Extension> {
    Arc::new(ViewExtension::new(
        Arc::new(FirstLetterGrouper),
        Arc::new(KeyOrderSorter),
        ViewOptions::new().version_tag(tag),
    ))
}

fn group_keys(conn: &stratadb_core::Connection, view: &str, group: &str) -> Vec<String> {
    conn.read(|txn| {
        let mut handle = txn.view(view)?;
        let mut keys = Vec::new();
        handle.enumerate_group(group, ViewDirection::Forward, |_i, _c, key| {
            keys.push(key.to_string());
            stratadb_core::Flow::Continue
        })?;
        Ok::<_, stratadb_core::DbError>(keys)
    })
    .unwrap()
    .unwrap()
}

#[test]
fn rows_and_snapshot_survive_restart() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("db");

    {
        let db = Database::open(&path).unwrap();
        let conn = db.new_connection();
        conn.read_write(|txn| txn.set("c", "k", Value::Integer(7), None))
            .unwrap();
        assert_eq!(db.snapshot().as_u64(), 1);
    }

    {
        let db = Database::open(&path).unwrap();
        assert_eq!(db.snapshot().as_u64(), 1);
        let conn = db.new_connection();
        let value = conn
            .read(|txn| txn.object("c", "k"))
            .unwrap()
            .unwrap()
            .and_then(|v| v.as_integer());
        assert_eq!(value, Some(7));
    }
}

#[test]
fn checkpoint_then_restart() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("db");

    {
        let db = Database::open(&path).unwrap();
        let conn = db.new_connection();
        conn.read_write(|txn| txn.set("c", "a", Value::Integer(1), None))
            .unwrap();
        db.checkpoint().unwrap();
        conn.read_write(|txn| txn.set("c", "b", Value::Integer(2), None))
            .unwrap();
    }

    {
        let db = Database::open(&path).unwrap();
        assert_eq!(db.snapshot().as_u64(), 2);
        let conn = db.new_connection();
        conn.read(|txn| {
            assert!(txn.exists("c", "a")?);
            assert!(txn.exists("c", "b")?);
            Ok::<_, stratadb_core::DbError>(())
        })
        .unwrap()
        .unwrap();
    }
}

#[test]
fn same_version_registration_is_adopted_without_repopulating() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("db");

    {
        let db = Database::open(&path).unwrap();
        let conn = db.new_connection();
        conn.read_write(|txn| {
            txn.set("c", "apple", Value::Integer(1), None)?;
            txn.set("c", "apricot", Value::Integer(2), None)?;
            txn.set("c", "banana", Value::Integer(3), None)
        })
        .unwrap();
        db.register_extension("letters", letter_view("v1")).unwrap();
        assert_eq!(
            group_keys(&db.new_connection(), "letters", "a"),
            vec!["apple", "apricot"]
        );
    }

    {
        let db = Database::open(&path).unwrap();
        assert_eq!(
            db.previously_registered_extension_names().to_vec(),
            vec!["letters".to_string()]
        );
        // Same class, version, and tag: adopted, view still answers.
        db.register_extension("letters", letter_view("v1")).unwrap();
        let snapshot_before = db.snapshot();
        assert_eq!(
            group_keys(&db.new_connection(), "letters", "b"),
            vec!["banana"]
        );
        assert_eq!(db.snapshot(), snapshot_before);
    }
}

#[test]
fn version_tag_change_repopulates() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("db");

    {
        let db = Database::open(&path).unwrap();
        let conn = db.new_connection();
        conn.read_write(|txn| {
            txn.set("c", "apple", Value::Integer(1), None)?;
            txn.set("c", "banana", Value::Integer(2), None)
        })
        .unwrap();
        db.register_extension("letters", letter_view("v1")).unwrap();
    }

    {
        let db = Database::open(&path).unwrap();
        // Changed tag: tables are dropped, recreated, and repopulated.
        db.register_extension("letters", letter_view("v2")).unwrap();
        let conn = db.new_connection();
        assert_eq!(group_keys(&conn, "letters", "a"), vec!["apple"]);
        assert_eq!(group_keys(&conn, "letters", "b"), vec!["banana"]);
    }
}

#[test]
fn unregister_works_without_the_extension_class() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("db");

    {
        let db = Database::open(&path).unwrap();
        let conn = db.new_connection();
        conn.read_write(|txn| txn.set("c", "apple", Value::Integer(1), None))
            .unwrap();
        db.register_extension("letters", letter_view("v1")).unwrap();
    }

    {
        // The class was never instantiated this run; the persisted
        // name → table mapping is enough to drop everything.
        let db = Database::open(&path).unwrap();
        assert_eq!(
            db.previously_registered_extension_names().to_vec(),
            vec!["letters".to_string()]
        );
        db.unregister_extension("letters").unwrap();
    }

    {
        let db = Database::open(&path).unwrap();
        assert!(db.previously_registered_extension_names().is_empty());
    }
}
