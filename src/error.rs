//! Streamseal error types.
//!
//! # Error Classification
//!
//! Every failure the shim can observe falls into one of two classes:
//!
//! - **Recoverable**: the operation stopped at a safe point (socket would
//!   block, frame not yet complete, renegotiation just finished). The caller
//!   retries the same operation; nothing already accepted is lost or
//!   duplicated.
//! - **Fatal**: the session can no longer make progress (peer reset, provider
//!   rejected a record, credential acquisition failed). The session must be
//!   torn down.
//!
//! Both classes carry an [`ErrorCode`], which is also stored on the session as
//! its "last error". Capability probes that the shim deliberately does not
//! implement report [`SealError::Unsupported`], which is neither.

use serde::Serialize;
use thiserror::Error;

/// Low-level outcome code shared by sockets, providers and the session.
///
/// The recoverable set is `{Ok, WouldBlock, InProgress, MessageSize,
/// IncompleteMessage}`; everything else is fatal.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ErrorCode {
    /// No error recorded.
    #[default]
    #[error("ok")]
    Ok,

    /// Socket operation would block.
    #[error("operation would block")]
    WouldBlock,

    /// Socket operation already in progress.
    #[error("operation in progress")]
    InProgress,

    /// Datagram or buffer larger than the transport accepts.
    #[error("message too large for transport")]
    MessageSize,

    /// Peer closed or reset the connection.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// Operation exceeded its time budget.
    #[error("timed out")]
    TimedOut,

    /// The buffered ciphertext does not hold a complete frame yet.
    #[error("incomplete message")]
    IncompleteMessage,

    /// A frame or token does not fit in the space negotiated for it.
    #[error("frame exceeds negotiated window")]
    FrameOverflow,

    /// The secure-transport package is missing or unusable.
    #[error("secure transport unavailable")]
    Unavailable,

    /// Operating-system socket error not covered above.
    #[error("socket error {0}")]
    Socket(i32),

    /// Non-retryable provider status.
    #[error("provider status 0x{0:08x}")]
    Provider(u32),
}

impl ErrorCode {
    /// Whether retrying the same operation is safe.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::Ok | Self::WouldBlock | Self::InProgress | Self::MessageSize | Self::IncompleteMessage
        )
    }
}

/// Streamseal errors.
#[derive(Error, Debug)]
pub enum SealError {
    /// Retry the same operation later.
    #[error("Recoverable: {0}")]
    Recoverable(ErrorCode),

    /// The session must be discarded.
    #[error("Fatal: {0}")]
    Fatal(ErrorCode),

    /// Capability deliberately not implemented by the shim.
    #[error("Not supported: {0}")]
    Unsupported(&'static str),

    /// Operation requires a completed handshake.
    #[error("Session not negotiated")]
    NotNegotiated,

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error outside the session pipelines.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SealError {
    /// Build the outcome matching the class of `code`.
    pub fn from_code(code: ErrorCode) -> Self {
        if code.is_recoverable() {
            Self::Recoverable(code)
        } else {
            Self::Fatal(code)
        }
    }

    /// Check if the caller may retry the operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }

    /// Check if the session must be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Underlying code for recoverable and fatal outcomes.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Recoverable(code) | Self::Fatal(code) => Some(*code),
            _ => None,
        }
    }
}

/// Result type alias for streamseal operations
pub type Result<T> = std::result::Result<T, SealError>;

impl From<toml::de::Error> for SealError {
    fn from(err: toml::de::Error) -> Self {
        SealError::Config(err.to_string())
    }
}

impl From<SealError> for std::io::Error {
    fn from(err: SealError) -> Self {
        use std::io::ErrorKind;

        match err {
            SealError::Io(io) => io,
            other => {
                let kind = match &other {
                    SealError::Recoverable(_) => ErrorKind::WouldBlock,
                    SealError::Fatal(ErrorCode::ConnectionReset) => ErrorKind::ConnectionReset,
                    SealError::Fatal(ErrorCode::TimedOut) => ErrorKind::TimedOut,
                    SealError::Unsupported(_) => ErrorKind::Unsupported,
                    SealError::NotNegotiated => ErrorKind::NotConnected,
                    _ => ErrorKind::Other,
                };
                std::io::Error::new(kind, other)
            },
        }
    }
}
