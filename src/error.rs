//! Error types for the transport stack

use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, NetError>;

/// Error types for transport operations
#[derive(Error, Debug)]
pub enum NetError {
    /// I/O related errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors surfaced by the ARQ protocol engine
    #[error("ARQ error: {0}")]
    Arq(#[from] arq_core::ArqError),

    /// Protocol-level errors outside the engine (framing, handshakes)
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// A session with this conversation ID is already registered
    #[error("Duplicate session for conv {0}")]
    DuplicateSession(u32),

    /// No stream connection registered under this ID
    #[error("No connection with id {0}")]
    ConnectionNotFound(i64),

    /// A bounded channel was full and the payload was dropped
    #[error("Channel full: {name}")]
    ChannelFull { name: &'static str },

    /// A framed-stream message exceeded the configured limit
    #[error("Frame too large: {size} bytes exceeds limit {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The session or connection is closed
    #[error("Closed")]
    Closed,

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl NetError {
    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        NetError::Protocol {
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        NetError::Config {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        NetError::Timeout { timeout_ms }
    }

    /// Errors that end the session rather than a single operation
    pub fn is_fatal(&self) -> bool {
        match self {
            NetError::Arq(e) => e.is_fatal(),
            NetError::Closed => true,
            NetError::Io(e) => {
                matches!(
                    e.kind(),
                    std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::UnexpectedEof
                )
            }
            _ => false,
        }
    }

    /// Errors worth retrying the same operation for
    pub fn is_recoverable(&self) -> bool {
        match self {
            NetError::Io(e) => {
                matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                )
            }
            NetError::Timeout { .. } => true,
            NetError::ChannelFull { .. } => true,
            _ => false,
        }
    }
}
