//! Conflict-merge strategies.

use stratadb_codec::Value;

/// Resolves a conflict between a remote record and local state.
///
/// Invoked when the remote service reports the local record is stale:
/// `remote` is the server's current record, `pending` the locally queued
/// record whose upload conflicted, and `current` the newly built local
/// record. The result becomes the record to upload.
pub trait MergeResolver: Send + Sync {
    /// Produces the reconciled record.
    fn merge(&self, remote: &Value, pending: &Value, current: &Value) -> Value;
}

/// Starts from the remote record and overlays every field of the newly
/// built local record: local edits win field by field.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalWinsMerge;

impl MergeResolver for LocalWinsMerge {
    fn merge(&self, remote: &Value, _pending: &Value, current: &Value) -> Value {
        let mut merged = remote.clone();
        if let Some(fields) = current.as_map() {
            for (key, value) in fields {
                if let Some(name) = key.as_text() {
                    merged.set_field(name, value.clone());
                }
            }
        } else {
            // Non-map records cannot be merged field-wise; the local
            // record replaces the remote one.
            merged = current.clone();
        }
        merged
    }
}

/// Keeps the remote record unchanged; local edits are dropped (still-queued
/// field changes are folded back in by the queue afterwards).
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteWinsMerge;

impl MergeResolver for RemoteWinsMerge {
    fn merge(&self, remote: &Value, _pending: &Value, _current: &Value) -> Value {
        remote.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: Vec<(&str, i64)>) -> Value {
        Value::record(
            pairs
                .into_iter()
                .map(|(k, v)| (k, Value::Integer(v)))
                .collect(),
        )
    }

    #[test]
    fn local_wins_overlays_fields() {
        let remote = record(vec![("a", 1), ("b", 2)]);
        let current = record(vec![("b", 20), ("c", 30)]);
        let merged = LocalWinsMerge.merge(&remote, &Value::Null, &current);
        assert_eq!(merged.get("a").and_then(Value::as_integer), Some(1));
        assert_eq!(merged.get("b").and_then(Value::as_integer), Some(20));
        assert_eq!(merged.get("c").and_then(Value::as_integer), Some(30));
    }

    #[test]
    fn remote_wins_keeps_remote() {
        let remote = record(vec![("a", 1)]);
        let current = record(vec![("a", 9)]);
        let merged = RemoteWinsMerge.merge(&remote, &Value::Null, &current);
        assert_eq!(merged.get("a").and_then(Value::as_integer), Some(1));
    }
}
