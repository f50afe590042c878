//! Error types for store operations.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of the log media.
    #[error("read beyond end of media: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current media size.
        size: u64,
    },

    /// The log or snapshot file is corrupted.
    #[error("store corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Another process holds the store's exclusive lock.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// The store directory layout or format is invalid.
    #[error("invalid store format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },
}

impl StoreError {
    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }
}
