//! Error types for the connection layer.
//!
//! Only conditions that break the connection itself are errors. Application
//! failures (server-side errors, undecodable bodies, closed connections) are
//! delivered to callbacks as [`Response::Failure`](crate::ipc::Response) and
//! only become an [`IpcError::Server`] when a caller asks for it through
//! [`Response::check`](crate::ipc::Response::check).

use std::time::Duration;

use thiserror::Error;

use crate::ipc::response::FailureCode;

/// IPC-specific error types.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The transport could not be created (server binary missing, socket refused).
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// No response arrived within the caller's time budget.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The byte stream is desynchronized (bad length prefix, unknown id).
    ///
    /// Framing state cannot be trusted after this; reconnect.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server closed its end of the stream.
    #[error("Connection lost: server closed the stream")]
    ConnectionLost,

    /// A request failure converted into an error by `Response::check`.
    #[error("Server error ({code}): {message}")]
    Server { code: FailureCode, message: String },

    /// Request target contained a literal space, or a `.`/`..` component.
    #[error("Invalid target {0:?}")]
    InvalidTarget(String),

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}
