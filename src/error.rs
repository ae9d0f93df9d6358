use thiserror::Error;

/// Unified error type for the sidecar facade.
///
/// Engine errors cross the process boundary as wire payloads, so they are
/// carried here as message + optional SQLite result code rather than as a
/// native driver error value.
#[derive(Debug, Clone, Error)]
pub enum SidecarError {
    /// The engine rejected a statement (bad SQL, constraint violation,
    /// binding failure). The connection remains usable.
    #[error("{message}")]
    Sqlite {
        message: String,
        code: Option<i64>,
    },

    /// The connection is closed, closing, or the operation raced a close.
    #[error("Database closed")]
    Closed,

    /// The worker sent a frame the dispatcher cannot correlate or parse.
    /// Terminal: the connection is force-closed.
    #[error("Invalid message received")]
    InvalidMessage,

    /// Framing-level failure (oversized frame, malformed JSON). Terminal.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parameter conversion error: {0}")]
    Parameter(String),

    /// The worker child process could not be launched.
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    /// Socket-mode worker did not connect back within the handshake window.
    #[error("Timed out waiting for worker handshake")]
    HandshakeTimeout,

    /// A pending open was torn down before the worker came up.
    #[error("Opening database cancelled")]
    OpenCancelled,

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SidecarError {
    fn from(err: std::io::Error) -> Self {
        SidecarError::Io(err.to_string())
    }
}

impl SidecarError {
    /// Whether this error leaves the connection usable.
    #[must_use]
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            SidecarError::Sqlite { .. } | SidecarError::Parameter(_)
        )
    }
}
