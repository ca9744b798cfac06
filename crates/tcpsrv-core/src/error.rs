//! Error types for the server-socket manager

use std::io;

use thiserror::Error;

use crate::id::SocketId;

/// Caller-facing result codes.
pub mod codes {
    /// Bind, accept, or channel-close failure
    pub const IO_FAILURE: i32 = -2;
    /// Malformed input or unknown socket id
    pub const INVALID_ARGUMENT: i32 = -4;
    /// The event-notification mechanism could not be created
    pub const INIT_FAILURE: i32 = -9;
}

/// Result type for server-socket operations
pub type Result<T> = std::result::Result<T, ServerSocketError>;

/// Errors that can occur in server-socket operations
#[derive(Debug, Error)]
pub enum ServerSocketError {
    /// Malformed or missing input
    #[error("Invalid Argument: {0}")]
    InvalidArgument(String),

    /// Operation referenced an unknown socket id
    #[error("No socket with socketId {0}")]
    NotFound(SocketId),

    /// Bind, accept, or close failed
    #[error("{0}")]
    Io(#[from] io::Error),

    /// `listen` on a socket that already holds a bound channel
    #[error("socket {0} is already listening")]
    AlreadyListening(SocketId),

    /// Registration requested for a socket without a bound channel
    #[error("socket {0} is not listening")]
    NotListening(SocketId),

    /// epoll or eventfd could not be created, or the loop thread failed to spawn
    #[error("event notification setup failed: {0}")]
    Initialization(#[source] io::Error),

    /// The control message was discarded before the event loop applied it
    #[error("event loop stopped before the command was applied")]
    LoopStopped,
}

impl ServerSocketError {
    /// Numeric code reported to callers.
    pub fn result_code(&self) -> i32 {
        match self {
            ServerSocketError::InvalidArgument(_) | ServerSocketError::NotFound(_) => {
                codes::INVALID_ARGUMENT
            }
            ServerSocketError::Initialization(_) => codes::INIT_FAILURE,
            ServerSocketError::Io(_)
            | ServerSocketError::AlreadyListening(_)
            | ServerSocketError::NotListening(_)
            | ServerSocketError::LoopStopped => codes::IO_FAILURE,
        }
    }

    /// `{resultCode, message}` pair for the caller.
    pub fn error_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.result_code(), self.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ServerSocketError::NotFound(_))
    }
}

/// Numeric code plus human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub result_code: i32,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(result_code: i32, message: impl Into<String>) -> Self {
        Self {
            result_code,
            message: message.into(),
        }
    }
}

impl From<&ServerSocketError> for ErrorInfo {
    fn from(e: &ServerSocketError) -> Self {
        e.error_info()
    }
}
