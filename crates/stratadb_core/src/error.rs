//! Error types for StrataDB core.
//!
//! The taxonomy distinguishes usage errors (caller bugs: fail fast, local
//! to the offending call) from storage faults and extension inconsistencies
//! (runtime conditions: the whole enclosing transaction rolls back).

use thiserror::Error;

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur in StrataDB core operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// The physical store reported a fault. The enclosing transaction is
    /// rolled back in full.
    #[error("storage fault: {0}")]
    Store(#[from] stratadb_store::StoreError),

    /// Serialization or deserialization failed.
    #[error("codec error: {0}")]
    Codec(#[from] stratadb_codec::CodecError),

    /// An extension could not apply a mutation. The enclosing transaction
    /// is rolled back in full; no partial extension state is retained.
    #[error("extension {extension} inconsistency: {message}")]
    ExtensionInconsistency {
        /// The registered name of the failing extension.
        extension: String,
        /// Description of the inconsistency.
        message: String,
    },

    /// An extension is already registered under this name.
    #[error("extension name already registered: {name}")]
    NameAlreadyRegistered {
        /// The colliding name.
        name: String,
    },

    /// No extension is registered under this name (or it has a different
    /// type than requested).
    #[error("extension not registered: {name}")]
    NotRegistered {
        /// The requested name.
        name: String,
    },

    /// A connection was reentered from inside one of its own transaction
    /// blocks.
    #[error("connection reentered from within its own transaction block")]
    ConnectionReentrancy,

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl DbError {
    /// Creates an extension inconsistency error.
    pub fn extension_inconsistency(
        extension: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ExtensionInconsistency {
            extension: extension.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a caller bug rather than a
    /// runtime condition.
    #[must_use]
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::NameAlreadyRegistered { .. }
                | Self::NotRegistered { .. }
                | Self::ConnectionReentrancy
                | Self::InvalidOperation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_error_classification() {
        assert!(DbError::ConnectionReentrancy.is_usage_error());
        assert!(DbError::NameAlreadyRegistered { name: "v".into() }.is_usage_error());
        assert!(!DbError::extension_inconsistency("v", "drift").is_usage_error());
    }
}
