//! Cloud operations: the unit of outbound work.

use crate::error::{SyncError, SyncResult};
use stratadb_codec::Value;
use uuid::Uuid;

/// Status of a cloud operation.
///
/// `Pending → Started → {Completed | Skipped}`; a delegate may move a
/// `Started` operation back to `Pending` for retry. Only `Completed` and
/// `Skipped` operations are purged from the durable queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// Queued, not yet handed to the delegate.
    Pending,
    /// Handed to the delegate, in flight.
    Started,
    /// Finished successfully.
    Completed,
    /// Permanently abandoned by delegate decision.
    Skipped,
}

impl OpStatus {
    /// Converts to a numeric code for persistence.
    #[must_use]
    pub fn to_code(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Started => 1,
            Self::Completed => 2,
            Self::Skipped => 3,
        }
    }

    /// Converts from a numeric code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Pending),
            1 => Some(Self::Started),
            2 => Some(Self::Completed),
            3 => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Returns true for `Completed` and `Skipped`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// Whether a freshly inserted row should be attached to the cloud (queued
/// for upload) or assumed to exist remotely already.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Attach {
    /// Always queue an upload for the row.
    Always,
    /// Never queue an upload; the row is assumed present remotely (e.g. it
    /// was just downloaded).
    Never,
    /// Defer to the pipeline's configured default.
    #[default]
    UseDefault,
}

impl Attach {
    fn to_code(self) -> u8 {
        match self {
            Self::Always => 0,
            Self::Never => 1,
            Self::UseDefault => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Always),
            1 => Some(Self::Never),
            2 => Some(Self::UseDefault),
            _ => None,
        }
    }

    /// Resolves the tri-state against a pipeline default.
    #[must_use]
    pub fn resolve(self, default: bool) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::UseDefault => default,
        }
    }
}

/// An immutable-once-submitted unit of outbound work.
#[derive(Debug, Clone)]
pub struct CloudOperation {
    /// Unique identity.
    pub uuid: Uuid,
    /// Operation kind, e.g. `"upload"` or `"delete"`.
    pub kind: String,
    /// Target path(s) in the remote service, e.g. `"books/moby-dick"`.
    pub paths: Vec<String>,
    /// Operations (by uuid) that must reach a terminal status before this
    /// one may start. Uuids outside the operation's graph are treated as
    /// already satisfied.
    pub dependencies: Vec<Uuid>,
    /// Dispatch priority among dependency-satisfied operations; higher
    /// dispatches first.
    pub priority: i32,
    /// Caller payload, e.g. the outbound record representation.
    pub payload: Value,
    /// The local field names whose changes produced this operation; used
    /// for conflict-time merging of still-queued edits.
    pub changed_fields: Vec<String>,
    /// Attach policy for freshly inserted rows.
    pub attach: Attach,
    /// Current status.
    pub status: OpStatus,
}

impl CloudOperation {
    /// Creates a pending operation with a fresh uuid.
    pub fn new(kind: impl Into<String>, path: impl Into<String>, payload: Value) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            kind: kind.into(),
            paths: vec![path.into()],
            dependencies: Vec::new(),
            priority: 0,
            payload,
            changed_fields: Vec::new(),
            attach: Attach::UseDefault,
            status: OpStatus::Pending,
        }
    }

    /// Sets the dispatch priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Adds a dependency on another operation.
    #[must_use]
    pub fn with_dependency(mut self, uuid: Uuid) -> Self {
        self.dependencies.push(uuid);
        self
    }

    /// Sets the changed field names.
    #[must_use]
    pub fn with_changed_fields(mut self, fields: Vec<String>) -> Self {
        self.changed_fields = fields;
        self
    }

    /// Returns the primary target path.
    #[must_use]
    pub fn path(&self) -> &str {
        self.paths.first().map_or("", String::as_str)
    }

    /// Encodes the operation into a [`Value`] for durable persistence.
    #[must_use]
    pub fn encode(&self) -> Value {
        Value::record(vec![
            ("uuid", Value::Bytes(self.uuid.as_bytes().to_vec())),
            ("kind", Value::Text(self.kind.clone())),
            (
                "paths",
                Value::Array(self.paths.iter().map(|p| Value::Text(p.clone())).collect()),
            ),
            (
                "deps",
                Value::Array(
                    self.dependencies
                        .iter()
                        .map(|d| Value::Bytes(d.as_bytes().to_vec()))
                        .collect(),
                ),
            ),
            ("priority", Value::Integer(i64::from(self.priority))),
            ("payload", self.payload.clone()),
            (
                "changed_fields",
                Value::Array(
                    self.changed_fields
                        .iter()
                        .map(|f| Value::Text(f.clone()))
                        .collect(),
                ),
            ),
            ("attach", Value::Integer(i64::from(self.attach.to_code()))),
            ("status", Value::Integer(i64::from(self.status.to_code()))),
        ])
    }

    /// Decodes an operation from its persisted [`Value`].
    pub fn decode(value: &Value) -> SyncResult<Self> {
        let uuid_bytes = value
            .get("uuid")
            .and_then(Value::as_bytes)
            .ok_or_else(|| SyncError::corruption("operation missing uuid"))?;
        let uuid = Uuid::from_slice(uuid_bytes)
            .map_err(|_| SyncError::corruption("operation uuid malformed"))?;
        let kind = value
            .get("kind")
            .and_then(Value::as_text)
            .ok_or_else(|| SyncError::corruption("operation missing kind"))?
            .to_string();
        let paths = value
            .get("paths")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_text().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let dependencies = value
            .get("deps")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_bytes)
                    .filter_map(|b| Uuid::from_slice(b).ok())
                    .collect()
            })
            .unwrap_or_default();
        let priority = value
            .get("priority")
            .and_then(Value::as_integer)
            .unwrap_or(0) as i32;
        let payload = value.get("payload").cloned().unwrap_or(Value::Null);
        let changed_fields = value
            .get("changed_fields")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_text().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let attach = value
            .get("attach")
            .and_then(Value::as_integer)
            .and_then(|code| Attach::from_code(code as u8))
            .unwrap_or_default();
        let status = value
            .get("status")
            .and_then(Value::as_integer)
            .and_then(|code| OpStatus::from_code(code as u8))
            .ok_or_else(|| SyncError::corruption("operation missing status"))?;

        Ok(Self {
            uuid,
            kind,
            paths,
            dependencies,
            priority,
            payload,
            changed_fields,
            attach,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_roundtrip() {
        for status in [
            OpStatus::Pending,
            OpStatus::Started,
            OpStatus::Completed,
            OpStatus::Skipped,
        ] {
            assert_eq!(OpStatus::from_code(status.to_code()), Some(status));
        }
        assert_eq!(OpStatus::from_code(9), None);
        assert!(OpStatus::Completed.is_terminal());
        assert!(!OpStatus::Started.is_terminal());
    }

    #[test]
    fn attach_resolution() {
        assert!(Attach::Always.resolve(false));
        assert!(!Attach::Never.resolve(true));
        assert!(Attach::UseDefault.resolve(true));
        assert!(!Attach::UseDefault.resolve(false));
    }

    #[test]
    fn operation_encode_decode_roundtrip() {
        let dep = Uuid::new_v4();
        let op = CloudOperation::new("upload", "books/moby-dick", Value::from("payload"))
            .with_priority(5)
            .with_dependency(dep)
            .with_changed_fields(vec!["title".into()]);
        let decoded = CloudOperation::decode(&op.encode()).unwrap();
        assert_eq!(decoded.uuid, op.uuid);
        assert_eq!(decoded.kind, "upload");
        assert_eq!(decoded.paths, vec!["books/moby-dick".to_string()]);
        assert_eq!(decoded.dependencies, vec![dep]);
        assert_eq!(decoded.priority, 5);
        assert_eq!(decoded.changed_fields, vec!["title".to_string()]);
        assert_eq!(decoded.status, OpStatus::Pending);
    }
}
