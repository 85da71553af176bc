//! Error types for the ARQ protocol engine

use std::fmt;

/// Result type for ARQ core operations
pub type ArqResult<T> = std::result::Result<T, ArqError>;

/// Error types produced by the protocol engine
#[derive(Debug)]
pub enum ArqError {
    /// Protocol-level errors (malformed header, conv mismatch, unknown command)
    Protocol { message: String },
    /// Buffer management errors (empty send, message too large)
    Buffer { message: String },
    /// Invalid configuration value
    Config { message: String },
    /// Connection lost: a segment exceeded the dead-link retransmit threshold
    DeadLink,
}

impl ArqError {
    pub fn protocol(message: impl Into<String>) -> Self {
        ArqError::Protocol {
            message: message.into(),
        }
    }

    pub fn buffer(message: impl Into<String>) -> Self {
        ArqError::Buffer {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        ArqError::Config {
            message: message.into(),
        }
    }

    /// Fatal errors require the owning session to close
    pub fn is_fatal(&self) -> bool {
        matches!(self, ArqError::DeadLink)
    }
}

impl fmt::Display for ArqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArqError::Protocol { message } => write!(f, "protocol error: {message}"),
            ArqError::Buffer { message } => write!(f, "buffer error: {message}"),
            ArqError::Config { message } => write!(f, "config error: {message}"),
            ArqError::DeadLink => write!(f, "dead link: retransmit limit exceeded"),
        }
    }
}

impl std::error::Error for ArqError {}
