//! Socket abstraction for the session pipelines.
//!
//! The session never owns its transport: it borrows a byte socket from the
//! enclosing connection and drives it with four primitives.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               Session                    │
//! │   handshake · read pipeline · write      │
//! └──────────────────┬──────────────────────┘
//!                    │ read / write / poll_readable / last_error
//!          ┌────────┴────────┐
//!          ▼                 ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │   TcpSocket     │ │ ScriptedSocket  │
//! │ (non-blocking)  │ │    (tests)      │
//! └─────────────────┘ └─────────────────┘
//! ```
//!
//! # Return Conventions
//!
//! | Result        | Meaning                                 |
//! |---------------|-----------------------------------------|
//! | `Ok(n)`, n>0  | `n` bytes transferred                   |
//! | `Ok(0)`       | orderly close (read) / nothing accepted |
//! | `Err(code)`   | error, classified by `is_recoverable`   |

mod tcp;

pub use tcp::TcpSocket;

use std::time::Duration;

use crate::error::ErrorCode;

/// Byte socket borrowed by a session.
pub trait Socket {
    /// Read into `buf`. `Ok(0)` means the peer closed the connection.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ErrorCode>;

    /// Write from `buf`, possibly partially.
    fn write(&mut self, buf: &[u8]) -> Result<usize, ErrorCode>;

    /// Wait up to `timeout` for the socket to become readable.
    fn poll_readable(&mut self, timeout: Duration) -> bool;

    /// Code of the most recent failed operation.
    fn last_error(&self) -> ErrorCode;

    /// Whether `code` is retry-safe on this socket.
    fn is_recoverable(&self, code: ErrorCode) -> bool {
        code.is_recoverable()
    }
}

impl<S: Socket + ?Sized> Socket for &mut S {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ErrorCode> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, ErrorCode> {
        (**self).write(buf)
    }

    fn poll_readable(&mut self, timeout: Duration) -> bool {
        (**self).poll_readable(timeout)
    }

    fn last_error(&self) -> ErrorCode {
        (**self).last_error()
    }

    fn is_recoverable(&self, code: ErrorCode) -> bool {
        (**self).is_recoverable(code)
    }
}
