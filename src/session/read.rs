//! Decrypt/read pipeline.
//!
//! ```text
//!   socket ──► recv window ──decrypt──► ready window ──► caller
//!               [0, fill)    in place    [drain, fill)
//! ```
//!
//! A call alternates between serving buffered plaintext and decrypting the
//! next record until the caller's buffer is full or a stop is reached.

use super::Session;
use crate::error::{ErrorCode, Result, SealError};
use crate::provider::{SecureTransport, Status};
use crate::socket::Socket;

/// Next step of a read call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadStep {
    /// Copy from the ready window
    Serve,
    /// Decrypt the next record into the ready window
    Fill,
}

impl<S: Socket, P: SecureTransport> Session<S, P> {
    /// Read decrypted bytes into `buf`.
    ///
    /// Returns as soon as `buf` is full. If it is only partly filled when the
    /// pipeline stops, the bytes copied so far are returned and the stop is
    /// reported by the next call.
    ///
    /// # Errors
    ///
    /// - `Recoverable(IncompleteMessage)` when no complete record is
    ///   buffered, including right after a renegotiation
    /// - `Fatal(..)` on peer close, socket failure or provider rejection
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_established()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let mut copied = 0;
        let mut step = ReadStep::Serve;
        loop {
            match step {
                ReadStep::Serve => {
                    let channel = self.channel.as_mut().ok_or(SealError::NotNegotiated)?;
                    copied += channel.ready.read_from_drain(&mut buf[copied..]);
                    if !channel.ready.has_unread() {
                        channel.ready.clear();
                    }
                    if copied == buf.len() {
                        break;
                    }
                    step = ReadStep::Fill;
                },
                ReadStep::Fill => match self.fill_ready() {
                    Ok(()) => step = ReadStep::Serve,
                    // The stop is reported again by the next call
                    Err(_) if copied > 0 => break,
                    Err(err) => return Err(err),
                },
            }
        }

        self.stats.bytes_delivered += copied as u64;
        tracing::trace!("Read {} bytes ({} pending)", copied, self.pending());
        Ok(copied)
    }

    /// Top up the recv window and decrypt one record into the ready window.
    fn fill_ready(&mut self) -> Result<()> {
        self.top_up()?;

        let Some(channel) = self.channel.as_mut() else {
            return Err(SealError::NotNegotiated);
        };
        if channel.recv.is_empty() {
            self.last_error = ErrorCode::IncompleteMessage;
            return Err(SealError::Recoverable(ErrorCode::IncompleteMessage));
        }
        let Some(context) = self.context.as_mut() else {
            return Err(SealError::NotNegotiated);
        };

        let output = self.provider.decrypt(context, channel.recv.filled_mut());
        let recv_full = channel.recv.remaining_capacity() == 0;

        match output.status {
            Status::Success => {
                let fill = channel.recv.fill();
                let plaintext = output.plaintext;
                if plaintext.start > plaintext.end
                    || plaintext.end > fill
                    || plaintext.len() > channel.ready.capacity()
                {
                    return Err(self.fail_code("decrypt", ErrorCode::FrameOverflow));
                }

                channel.ready.replace(&channel.recv.filled()[plaintext.clone()]);
                match output.extra {
                    Some(extra) => channel.recv.relocate_to_front(extra),
                    None => channel.recv.clear(),
                }

                self.stats.records_opened += 1;
                tracing::trace!(
                    "Opened record: {} plaintext bytes, {} bytes carried over",
                    plaintext.len(),
                    channel.recv.fill()
                );
                Ok(())
            },
            Status::IncompleteMessage if recv_full => {
                Err(self.fail_code("decrypt", ErrorCode::FrameOverflow))
            },
            Status::IncompleteMessage => {
                self.last_error = ErrorCode::IncompleteMessage;
                Err(SealError::Recoverable(ErrorCode::IncompleteMessage))
            },
            Status::RenegotiateRequested => {
                // Clip the provider's range to what was actually submitted
                let seed = output
                    .extra
                    .map(|extra| {
                        let filled = channel.recv.filled();
                        let end = extra.end.min(filled.len());
                        filled[extra.start.min(end)..end].to_vec()
                    })
                    .unwrap_or_default();
                channel.recv.clear();

                tracing::warn!("Session {} renegotiation requested by peer", self.id);
                self.stats.renegotiations += 1;
                self.perform_handshake(seed)?;

                self.last_error = ErrorCode::IncompleteMessage;
                Err(SealError::Recoverable(ErrorCode::IncompleteMessage))
            },
            status => Err(self.fail("decrypt", status)),
        }
    }

    /// Read from the socket into the recv window's spare space.
    fn top_up(&mut self) -> Result<()> {
        let Some(channel) = self.channel.as_mut() else {
            return Err(SealError::NotNegotiated);
        };
        if channel.recv.remaining_capacity() == 0 {
            return Ok(());
        }

        match self.socket.read(channel.recv.spare_mut()) {
            Ok(0) => Err(self.fail_code("read", ErrorCode::ConnectionReset)),
            Ok(n) => {
                channel.recv.advance_fill(n);
                tracing::trace!("Received {} bytes ({} buffered)", n, channel.recv.fill());
                Ok(())
            },
            Err(code) if self.socket.is_recoverable(code) => {
                self.last_error = code;
                Ok(())
            },
            Err(code) => Err(self.fail_code("read", code)),
        }
    }
}
