//! Encrypt/write pipeline.
//!
//! Plaintext is cut into chunks of at most `max_chunk_len` bytes. Each chunk
//! is sealed in place inside the send window and flushed before the next one
//! is laid out:
//!
//! ```text
//!  send window
//!  +----------+--------------------+-----------+
//!  | header   | data (chunk)       | trailer   |
//!  +----------+--------------------+-----------+
//!  0       header_len      header_len+len    fill
//! ```
//!
//! A chunk counts as accepted once sealed, even if the socket takes only
//! part of it. The remainder stays in the send window and goes out first on
//! the next `write` or `flush`.

use super::Session;
use crate::error::{ErrorCode, Result, SealError};
use crate::provider::{SecureTransport, Status};
use crate::socket::Socket;

impl<S: Socket, P: SecureTransport> Session<S, P> {
    /// Encrypt and send `data`.
    ///
    /// Returns the number of plaintext bytes accepted. `Ok(0)` means earlier
    /// records are still queued and nothing new was taken.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.ensure_established()?;
        if !self.flush_send()? {
            return Ok(0);
        }

        let max_chunk_len = self
            .sizing()
            .map(|sizing| sizing.max_chunk_len)
            .ok_or(SealError::NotNegotiated)?;

        let mut accepted = 0;
        for chunk in data.chunks(max_chunk_len) {
            self.seal_chunk(chunk)?;
            accepted += chunk.len();
            self.stats.bytes_accepted += chunk.len() as u64;

            if !self.flush_send()? {
                tracing::debug!(
                    "Write stalled after {} of {} bytes ({} queued)",
                    accepted,
                    data.len(),
                    self.pending_write()
                );
                break;
            }
        }

        Ok(accepted)
    }

    /// Push queued records to the socket.
    ///
    /// Returns `true` once the send window is empty.
    pub fn flush(&mut self) -> Result<bool> {
        self.ensure_established()?;
        self.flush_send()
    }

    /// One write attempt of the unsent `[drain, fill)` span.
    fn flush_send(&mut self) -> Result<bool> {
        let Some(channel) = self.channel.as_mut() else {
            return Err(SealError::NotNegotiated);
        };
        if !channel.send.has_unread() {
            channel.send.clear();
            return Ok(true);
        }

        match self.socket.write(channel.send.unread()) {
            Ok(n) => {
                channel.send.advance_drain(n);
                self.stats.bytes_flushed += n as u64;
                if channel.send.has_unread() {
                    tracing::warn!(
                        "Partial flush: {} bytes sent, {} queued",
                        n,
                        channel.send.unread_len()
                    );
                    return Ok(false);
                }
                channel.send.clear();
                Ok(true)
            },
            Err(code) if self.socket.is_recoverable(code) => {
                self.last_error = code;
                Ok(false)
            },
            Err(code) => Err(self.fail_code("write", code)),
        }
    }

    /// Lay out and seal one chunk in the send window.
    fn seal_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let (Some(channel), Some(context)) = (self.channel.as_mut(), self.context.as_mut()) else {
            return Err(SealError::NotNegotiated);
        };
        let sizing = channel.sizing;
        let total = sizing.header_len + chunk.len() + sizing.trailer_len;

        let status = match channel.send.prepare(total) {
            Some(frame) => {
                let (header, rest) = frame.split_at_mut(sizing.header_len);
                let (body, trailer) = rest.split_at_mut(chunk.len());
                body.copy_from_slice(chunk);
                self.provider.encrypt(context, header, body, trailer)
            },
            None => return Err(self.fail_code("encrypt", ErrorCode::FrameOverflow)),
        };

        if status != Status::Success {
            channel.send.clear();
            return Err(self.fail("encrypt", status));
        }

        self.stats.records_sealed += 1;
        tracing::trace!("Sealed record: {} plaintext bytes, {} on the wire", chunk.len(), total);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FailPoint, ScriptedProvider, ScriptedSocket};
    use crate::provider::codes;

    fn established<'a>(
        socket: &'a mut ScriptedSocket,
        provider: &'a mut ScriptedProvider,
    ) -> Session<&'a mut ScriptedSocket, &'a mut ScriptedProvider> {
        let mut session = Session::open(socket, provider, "peer.test").unwrap();
        session.start().unwrap();
        session
    }

    #[test]
    fn test_write_small_payload() {
        let mut socket = ScriptedSocket::new();
        let mut provider = ScriptedProvider::new();
        let mut session = established(&mut socket, &mut provider);

        assert_eq!(session.write(b"hello").unwrap(), 5);
        assert_eq!(session.pending_write(), 0);

        let records = ScriptedProvider::open_records(session.socket().written()).unwrap();
        assert_eq!(records, vec![b"hello".to_vec()]);
        assert_eq!(session.stats().records_sealed, 1);
    }

    #[test]
    fn test_write_fragments_into_chunks() {
        let mut socket = ScriptedSocket::new();
        let mut provider = ScriptedProvider::new().with_max_chunk_len(4);
        let mut session = established(&mut socket, &mut provider);

        assert_eq!(session.write(b"abcdefghij").unwrap(), 10);
        let records = ScriptedProvider::open_records(session.socket().written()).unwrap();
        assert_eq!(
            records,
            vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec()]
        );
        drop(session);
        assert_eq!(provider.encrypt_calls(), 3);
    }

    #[test]
    fn test_partial_flush_commits_optimistically() {
        let mut socket = ScriptedSocket::new();
        socket.limit_next_write(3);
        let mut provider = ScriptedProvider::new().with_max_chunk_len(4);
        let mut session = established(&mut socket, &mut provider);

        // First chunk is sealed and counted; the socket takes 3 of its 10 bytes
        assert_eq!(session.write(b"abcdefgh").unwrap(), 4);
        assert_eq!(session.pending_write(), 7);
        assert_eq!(session.socket().written().len(), 3);

        // Queued bytes go out before anything new
        assert_eq!(session.write(b"efgh").unwrap(), 4);
        let records = ScriptedProvider::open_records(session.socket().written()).unwrap();
        assert_eq!(records, vec![b"abcd".to_vec(), b"efgh".to_vec()]);
    }

    #[test]
    fn test_blocked_flush_accepts_nothing() {
        let mut socket = ScriptedSocket::new();
        socket.limit_next_write(1);
        socket.fail_next_write(ErrorCode::WouldBlock);
        let mut provider = ScriptedProvider::new();
        let mut session = established(&mut socket, &mut provider);

        assert_eq!(session.write(b"first").unwrap(), 5);
        assert_eq!(session.write(b"second").unwrap(), 0);
        assert_eq!(session.last_error(), ErrorCode::WouldBlock);
        assert!(session.is_established());

        assert!(session.flush().unwrap());
        assert_eq!(session.pending_write(), 0);
        let records = ScriptedProvider::open_records(session.socket().written()).unwrap();
        assert_eq!(records, vec![b"first".to_vec()]);
    }

    #[test]
    fn test_fatal_socket_error() {
        let mut socket = ScriptedSocket::new();
        socket.fail_next_write(ErrorCode::ConnectionReset);
        let mut provider = ScriptedProvider::new();
        let mut session = established(&mut socket, &mut provider);

        let err = session.write(b"doomed").unwrap_err();
        assert!(matches!(err, SealError::Fatal(ErrorCode::ConnectionReset)));
        assert!(session.write(b"again").unwrap_err().is_fatal());
    }

    #[test]
    fn test_encrypt_failure() {
        let mut socket = ScriptedSocket::new();
        let mut provider = ScriptedProvider::new().with_failure(FailPoint::Encrypt);
        let mut session = established(&mut socket, &mut provider);

        let err = session.write(b"data").unwrap_err();
        assert!(matches!(
            err,
            SealError::Fatal(ErrorCode::Provider(codes::ENCRYPT_FAILURE))
        ));
        assert_eq!(session.pending_write(), 0);
        assert!(session.socket().written().is_empty());
    }

    proptest::proptest! {
        #[test]
        fn prop_fragment_count(
            data in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..200),
            max_chunk_len in 1usize..24,
        ) {
            let mut socket = ScriptedSocket::new();
            let mut provider = ScriptedProvider::new().with_max_chunk_len(max_chunk_len);
            let mut session = established(&mut socket, &mut provider);

            proptest::prop_assert_eq!(session.write(&data).unwrap(), data.len());
            let records = ScriptedProvider::open_records(session.socket().written()).unwrap();
            proptest::prop_assert_eq!(records.concat(), data.clone());
            drop(session);
            proptest::prop_assert_eq!(
                provider.encrypt_calls(),
                provider.sizing().chunks_for(data.len())
            );
        }
    }

    #[test]
    fn test_empty_write() {
        let mut socket = ScriptedSocket::new();
        let mut provider = ScriptedProvider::new();
        let mut session = established(&mut socket, &mut provider);

        assert_eq!(session.write(&[]).unwrap(), 0);
        assert_eq!(session.socket().writes(), 0);
        assert!(session.flush().unwrap());
    }
}
