//! End-to-end tests for the sync pipeline and the durable cloud queue.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use stratadb_codec::Value;
use stratadb_core::{AccessLevel, Database, RowChange};
use stratadb_sync::{
    CloudOperation, CloudQueue, LocalWinsMerge, OperationGraph, OpStatus, OutboundRecord,
    Pipeline, PipelineConfig, PipelineDelegate, RecordHandler,
};

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Records dispatch order; optionally completes operations on the spot.
struct RecordingDelegate {
    starts: Mutex<Vec<String>>,
    auto_complete: bool,
}

impl RecordingDelegate {
    fn new(auto_complete: bool) -> Arc<Self> {
        Arc::new(Self {
            starts: Mutex::new(Vec::new()),
            auto_complete,
        })
    }

    fn starts(&self) -> Vec<String> {
        self.starts.lock().unwrap().clone()
    }
}

impl PipelineDelegate for RecordingDelegate {
    fn start_operation(&self, operation: &CloudOperation, pipeline: &Pipeline) {
        self.starts.lock().unwrap().push(operation.kind.clone());
        if self.auto_complete {
            pipeline.complete_operation(operation.uuid).unwrap();
        }
    }
}

// ============================================================================
// Pipeline scheduling
// ============================================================================

#[test]
fn graphs_drain_in_commit_order_with_dependencies_and_priority() {
    // Graph A = [opA1 (priority 1), opA2 (priority 5, depends on opA1)],
    // Graph B = [opB1]. Despite opA2's higher priority it must wait for
    // opA1, and opB1 must wait for all of graph A, regardless of the
    // concurrency bound.
    let pipeline = Pipeline::new("remote", PipelineConfig::new().max_concurrent(8));
    let a1 = CloudOperation::new("opA1", "p/a", Value::Null).with_priority(1);
    let a2 = CloudOperation::new("opA2", "p/a", Value::Null)
        .with_priority(5)
        .with_dependency(a1.uuid);
    let b1 = CloudOperation::new("opB1", "p/b", Value::Null);

    pipeline
        .submit_graph(OperationGraph::new(1, vec![a1, a2]))
        .unwrap();
    pipeline
        .submit_graph(OperationGraph::new(2, vec![b1]))
        .unwrap();

    let delegate = RecordingDelegate::new(true);
    pipeline.set_delegate(delegate.clone());

    wait_until("pipeline drain", || pipeline.operation_count() == 0);
    assert_eq!(delegate.starts(), vec!["opA1", "opA2", "opB1"]);
    pipeline.shutdown();
}

#[test]
fn priority_orders_independent_operations() {
    let pipeline = Pipeline::new("remote", PipelineConfig::new().max_concurrent(1));
    let low = CloudOperation::new("low", "p", Value::Null).with_priority(1);
    let high = CloudOperation::new("high", "p", Value::Null).with_priority(9);
    let mid = CloudOperation::new("mid", "p", Value::Null).with_priority(5);

    pipeline
        .submit_graph(OperationGraph::new(1, vec![low, high, mid]))
        .unwrap();
    let delegate = RecordingDelegate::new(true);
    pipeline.set_delegate(delegate.clone());

    wait_until("pipeline drain", || pipeline.operation_count() == 0);
    assert_eq!(delegate.starts(), vec!["high", "mid", "low"]);
    pipeline.shutdown();
}

#[test]
fn concurrency_bound_limits_started_operations() {
    let pipeline = Pipeline::new("remote", PipelineConfig::new().max_concurrent(2));
    let ops: Vec<CloudOperation> = (0..5)
        .map(|i| CloudOperation::new(format!("op{i}"), "p", Value::Null))
        .collect();
    let uuids: Vec<_> = ops.iter().map(|op| op.uuid).collect();
    pipeline.submit_graph(OperationGraph::new(1, ops)).unwrap();

    let delegate = RecordingDelegate::new(false);
    pipeline.set_delegate(delegate.clone());

    wait_until("first batch", || delegate.starts().len() == 2);
    // No further dispatch while both slots are busy.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(delegate.starts().len(), 2);

    // Freeing one slot dispatches exactly one more.
    let first_started = uuids
        .iter()
        .find(|uuid| pipeline.status_of(**uuid) == Some(OpStatus::Started))
        .copied()
        .unwrap();
    pipeline.complete_operation(first_started).unwrap();
    wait_until("third start", || delegate.starts().len() == 3);

    for uuid in uuids {
        if pipeline.status_of(uuid) == Some(OpStatus::Started) {
            pipeline.skip_operation(uuid).unwrap();
        }
    }
    pipeline.shutdown();
}

#[test]
fn suspend_gates_dispatch_but_accepts_graphs() {
    let pipeline = Pipeline::new("remote", PipelineConfig::default());
    let delegate = RecordingDelegate::new(true);
    pipeline.set_delegate(delegate.clone());

    assert_eq!(pipeline.suspend(), 1);
    assert_eq!(pipeline.suspend(), 2);

    pipeline
        .submit_graph(OperationGraph::new(
            1,
            vec![CloudOperation::new("op", "p", Value::Null)],
        ))
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(delegate.starts().is_empty());
    assert_eq!(pipeline.operation_count(), 1);

    // The counter nests: one resume is not enough.
    assert_eq!(pipeline.resume(), 1);
    std::thread::sleep(Duration::from_millis(50));
    assert!(delegate.starts().is_empty());

    assert_eq!(pipeline.resume(), 0);
    wait_until("dispatch after resume", || pipeline.operation_count() == 0);
    assert_eq!(delegate.starts(), vec!["op"]);
    pipeline.shutdown();
}

#[test]
fn requeue_with_backoff_redispatches_after_the_delay() {
    struct FlakyDelegate {
        attempts: Mutex<u32>,
    }
    impl PipelineDelegate for FlakyDelegate {
        fn start_operation(&self, operation: &CloudOperation, pipeline: &Pipeline) {
            let mut attempts = self.attempts.lock().unwrap();
            *attempts += 1;
            if *attempts == 1 {
                pipeline
                    .set_status_as_pending(operation.uuid, Some(Duration::from_millis(30)))
                    .unwrap();
            } else {
                pipeline.complete_operation(operation.uuid).unwrap();
            }
        }
    }

    let pipeline = Pipeline::new("remote", PipelineConfig::default());
    let op = CloudOperation::new("retry-me", "p", Value::Null);
    let uuid = op.uuid;
    pipeline.submit_graph(OperationGraph::new(1, vec![op])).unwrap();

    let delegate = Arc::new(FlakyDelegate {
        attempts: Mutex::new(0),
    });
    let started = Instant::now();
    pipeline.set_delegate(delegate.clone());

    wait_until("retried completion", || pipeline.operation_count() == 0);
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(*delegate.attempts.lock().unwrap(), 2);
    wait_until("graph purge", || pipeline.graph_count() == 0);
    assert_eq!(pipeline.status_of(uuid), None, "drained graphs are purged");
    pipeline.shutdown();
}

#[test]
fn circular_dependency_fails_at_submission() {
    let pipeline = Pipeline::new("remote", PipelineConfig::default());
    let mut a = CloudOperation::new("a", "p", Value::Null);
    let mut b = CloudOperation::new("b", "p", Value::Null);
    let (ua, ub) = (a.uuid, b.uuid);
    a.dependencies.push(ub);
    b.dependencies.push(ua);

    let result = pipeline.submit_graph(OperationGraph::new(1, vec![a, b]));
    assert!(matches!(
        result,
        Err(stratadb_sync::SyncError::CircularDependency { .. })
    ));
    assert_eq!(pipeline.graph_count(), 0);
}

// ============================================================================
// Cloud queue
// ============================================================================

struct BookHandler;

impl RecordHandler for BookHandler {
    fn access(&self) -> AccessLevel {
        AccessLevel::Object
    }

    fn record_for_row(&self, change: &RowChange<'_>) -> Option<OutboundRecord> {
        if change.collection != "books" {
            return None;
        }
        let payload = change.object?.clone();
        let changed_fields = payload
            .as_map()
            .map(|pairs| {
                pairs
                    .iter()
                    .filter_map(|(k, _)| k.as_text().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let mut record = OutboundRecord::new(
            "upload",
            format!("books/{}", change.key),
            payload,
        );
        record.changed_fields = changed_fields;
        Some(record)
    }

    fn record_for_removal(&self, collection: &str, key: &str) -> Option<OutboundRecord> {
        if collection != "books" {
            return None;
        }
        Some(OutboundRecord::new(
            "delete",
            format!("books/{key}"),
            Value::Null,
        ))
    }
}

fn book(title: &str, year: i64) -> Value {
    Value::record(vec![
        ("title", Value::from(title)),
        ("year", Value::Integer(year)),
    ])
}

fn new_queue(name: &str) -> CloudQueue {
    CloudQueue::new(
        name,
        Arc::new(BookHandler),
        Arc::new(LocalWinsMerge),
        Pipeline::new(name, PipelineConfig::default()),
    )
}

#[test]
fn commits_enqueue_one_graph_per_transaction() {
    let db = Database::open_in_memory().unwrap();
    let queue = new_queue("cloud");
    queue.attach(&db).unwrap();
    let conn = db.new_connection();

    conn.read_write(|txn| {
        txn.set("books", "moby-dick", book("Moby-Dick", 1851), None)?;
        txn.set("books", "typee", book("Typee", 1846), None)?;
        txn.set("notes", "scratch", Value::from("not synced"), None)
    })
    .unwrap();
    conn.read_write(|txn| txn.remove("books", "typee")).unwrap();

    let pipeline = queue.pipeline();
    assert_eq!(pipeline.graph_count(), 2);
    assert_eq!(pipeline.operation_count(), 3);

    let delegate = RecordingDelegate::new(true);
    pipeline.set_delegate(delegate.clone());
    wait_until("drain", || pipeline.operation_count() == 0);
    assert_eq!(delegate.starts(), vec!["upload", "upload", "delete"]);
    pipeline.shutdown();
}

#[test]
fn aborted_transaction_enqueues_nothing() {
    let db = Database::open_in_memory().unwrap();
    let queue = new_queue("cloud");
    queue.attach(&db).unwrap();
    let conn = db.new_connection();

    let result: Result<(), _> = conn.read_write(|txn| {
        txn.set("books", "ghost", book("Ghost", 2000), None)?;
        Err(stratadb_core::DbError::invalid_operation("abort"))
    });
    assert!(result.is_err());
    assert_eq!(queue.pipeline().graph_count(), 0);
    assert_eq!(queue.pipeline().operation_count(), 0);
}

#[test]
fn queue_is_durable_across_restart() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("db");

    {
        let db = Database::open(&path).unwrap();
        let queue = new_queue("cloud");
        queue.attach(&db).unwrap();
        let conn = db.new_connection();
        conn.read_write(|txn| {
            txn.set("books", "moby-dick", book("Moby-Dick", 1851), None)
        })
        .unwrap();
        // No delegate was ever set: the operation stays queued and
        // durable.
        assert_eq!(queue.pipeline().operation_count(), 1);
    }

    {
        let db = Database::open(&path).unwrap();
        let queue = new_queue("cloud");
        queue.attach(&db).unwrap();
        assert_eq!(queue.pipeline().graph_count(), 1);
        assert_eq!(queue.pipeline().operation_count(), 1);

        // Draining purges the durable row; a third attach recovers nothing.
        let delegate = RecordingDelegate::new(true);
        queue.pipeline().set_delegate(delegate.clone());
        wait_until("drain", || queue.pipeline().operation_count() == 0);
        assert_eq!(delegate.starts(), vec!["upload"]);
        queue.pipeline().shutdown();
    }
}

#[test]
fn completed_operations_are_purged_durably() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("db");

    {
        let db = Database::open(&path).unwrap();
        let queue = new_queue("cloud");
        queue.attach(&db).unwrap();
        let conn = db.new_connection();
        conn.read_write(|txn| {
            txn.set("books", "moby-dick", book("Moby-Dick", 1851), None)
        })
        .unwrap();

        let delegate = RecordingDelegate::new(true);
        queue.pipeline().set_delegate(delegate);
        wait_until("drain", || queue.pipeline().operation_count() == 0);
        // The purge runs through a write transaction of its own; give it
        // time to land before closing.
        let db_probe = Arc::clone(&db);
        wait_until("purge", move || db_probe.snapshot().as_u64() >= 2);
        queue.pipeline().shutdown();
    }

    // Drop everything so the process lock is released, then reopen.
    std::thread::sleep(Duration::from_millis(100));
    {
        let db = Database::open(&path).unwrap();
        let queue = new_queue("cloud");
        queue.attach(&db).unwrap();
        assert_eq!(queue.pipeline().operation_count(), 0);
    }
}

#[test]
fn conflict_resolution_folds_queued_field_changes() {
    let db = Database::open_in_memory().unwrap();
    let queue = new_queue("cloud");
    queue.attach(&db).unwrap();
    let conn = db.new_connection();

    // A queued-but-unsent edit changes the year.
    conn.read_write(|txn| {
        txn.set("books", "moby-dick", book("Moby-Dick", 1999), None)
    })
    .unwrap();

    let fields = queue.pending_changed_fields("books/moby-dick");
    assert!(fields.contains("year"));
    assert!(fields.contains("title"));

    // Remote says the record is stale: merging must not lose the queued
    // local year edit.
    let remote = Value::record(vec![
        ("title", Value::from("Moby-Dick; or, The Whale")),
        ("year", Value::Integer(1851)),
        ("remote_only", Value::Bool(true)),
    ]);
    let pending = book("Moby-Dick", 1851);
    let current = book("Moby-Dick", 1999);
    let merged = queue.resolve_conflict("books/moby-dick", &remote, &pending, &current);

    assert_eq!(merged.get("year").and_then(Value::as_integer), Some(1999));
    assert_eq!(
        merged.get("remote_only").and_then(Value::as_bool),
        Some(true)
    );
}
