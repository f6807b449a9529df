//! Unified error handling for the Subspace channel core.
//!
//! One error enum for the whole crate. Conditions that are part of normal
//! operation (back-pressure on a reliable publisher, an empty read, a
//! placeholder subscriber) are expressed as absent values, never as errors.

use thiserror::Error;

/// Main error type for Subspace operations.
#[derive(Debug, Error)]
pub enum SubspaceError {
    /// I/O related errors (mapping, fd duplication, poll).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation that needs a mapped channel was invoked on an unmapped
    /// (placeholder) handle.
    #[error("channel '{0}' is not mapped")]
    NotConnected(String),

    /// An unreliable publisher exhausted the slot ring. Fatal for that
    /// publish call.
    #[error("out of slots for channel '{0}'")]
    ChannelFull(String),

    /// Shared memory allocation or mapping errors.
    #[error("memory error: {0}")]
    Memory(String),

    /// An invariant violation was detected in shared state, e.g. a slot
    /// missing from every list. Indicates a bug or external corruption.
    #[error("shared state corrupt: {0}")]
    Corrupt(String),

    /// Invalid input/argument errors.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A wait on a poll fd timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),
}

/// Convenience type alias for Results using SubspaceError.
pub type Result<T> = std::result::Result<T, SubspaceError>;

impl SubspaceError {
    /// Create a memory error with a custom message.
    pub fn memory<S: Into<String>>(msg: S) -> Self {
        SubspaceError::Memory(msg.into())
    }

    /// Create a corruption error with a custom message.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        SubspaceError::Corrupt(msg.into())
    }

    /// Create an invalid input error with a custom message.
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        SubspaceError::InvalidInput(msg.into())
    }
}
