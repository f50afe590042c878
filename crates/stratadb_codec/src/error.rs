//! Error types for codec operations.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while serializing or deserializing values.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Encoding a value to bytes failed.
    #[error("encode error: {message}")]
    Encode {
        /// Description of the failure.
        message: String,
    },

    /// Decoding bytes to a value failed.
    #[error("decode error: {message}")]
    Decode {
        /// Description of the failure.
        message: String,
    },

    /// The value uses a shape the codec cannot represent.
    #[error("unsupported value: {message}")]
    Unsupported {
        /// Description of the unsupported shape.
        message: String,
    },
}

impl CodecError {
    /// Creates an encode error.
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    /// Creates a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates an unsupported-value error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }
}
