//! Handshake negotiator.
//!
//! Each round hands the accumulated peer token to the provider, sends any
//! token it produces, and, while the provider asks for more, reads the
//! peer's answer with the two-phase wait from [`HandshakeTiming`].
//!
//! Input between rounds:
//!
//! | Previous status       | Next input                                 |
//! |-----------------------|--------------------------------------------|
//! | `IncompleteMessage`   | existing input plus newly read bytes       |
//! | any other continuation| unconsumed `extra` tail plus new bytes     |

use std::time::{Duration, Instant};

use super::{Channel, Session, SessionState};
use crate::config::HandshakeTiming;
use crate::error::{ErrorCode, Result};
use crate::provider::{codes, FrameSizing, SecureTransport, Status};
use crate::socket::Socket;

impl<S: Socket, P: SecureTransport> Session<S, P> {
    /// Negotiate (or renegotiate) the channel.
    ///
    /// `seed` is peer input already received, such as bytes that followed a
    /// renegotiation request in the recv window.
    pub(super) fn perform_handshake(&mut self, seed: Vec<u8>) -> Result<FrameSizing> {
        let renegotiating = self.channel.is_some();
        self.state = SessionState::Negotiating;

        let deadline = Instant::now() + self.timing.timeout;
        let max_token = self.package.max_token_len;
        let mut input = seed;
        let mut rounds = 0u32;

        tracing::debug!(
            "Session {} {} with {} ({} seed bytes)",
            self.id,
            if renegotiating { "renegotiating" } else { "negotiating" },
            self.peer_name,
            input.len()
        );

        let extra = loop {
            rounds += 1;
            if rounds > self.timing.max_rounds || Instant::now() >= deadline {
                return Err(self.fail_code("handshake", ErrorCode::TimedOut));
            }

            let Some(credential) = self.credential.as_ref() else {
                return Err(self.fail("handshake", Status::Fatal(codes::INVALID_HANDLE)));
            };
            let output = self.provider.initialize_context(
                credential,
                &mut self.context,
                &self.peer_name,
                &input,
            );

            tracing::debug!(
                "Handshake round {}: {:?}, {} bytes in, {} bytes out, {} extra",
                rounds,
                output.status,
                input.len(),
                output.token.len(),
                output.extra
            );

            if !output.token.is_empty() {
                if let Err(code) = send_token(&mut self.socket, &output.token, &self.timing, deadline)
                {
                    return Err(self.fail_code("handshake send", code));
                }
            }

            match output.status {
                Status::Success => break output.extra,
                status if status.is_continuation() => {
                    let carried = if status == Status::IncompleteMessage {
                        if input.len() >= max_token {
                            return Err(self.fail_code("handshake", ErrorCode::FrameOverflow));
                        }
                        false
                    } else {
                        keep_tail(&mut input, output.extra);
                        !input.is_empty()
                    };

                    // Carried-over input may already hold the next token
                    let first_wait = if carried {
                        self.timing.drain
                    } else {
                        self.timing.settle
                    };
                    match accumulate_token(
                        &mut self.socket,
                        &mut input,
                        max_token,
                        first_wait,
                        &self.timing,
                        deadline,
                    ) {
                        Ok(received) => tracing::trace!("Handshake received {} bytes", received),
                        Err(code) => return Err(self.fail_code("handshake receive", code)),
                    }
                },
                status => return Err(self.fail("handshake", status)),
            }
        };

        let sizing = match self.context.as_ref() {
            Some(context) => self.provider.query_frame_sizing(context),
            None => Err(Status::Fatal(codes::INVALID_HANDLE)),
        };
        let sizing = match sizing {
            Ok(sizing) if sizing.max_chunk_len > 0 => sizing,
            Ok(_) => return Err(self.fail_code("frame sizing", ErrorCode::FrameOverflow)),
            Err(status) => return Err(self.fail("frame sizing", status)),
        };

        // Windows are allocated once and never resized
        let fits = match self.channel.as_mut() {
            Some(channel) if channel.fits(&sizing) => {
                channel.sizing = sizing;
                true
            },
            Some(_) => false,
            None => {
                self.channel = Some(Channel::new(sizing));
                true
            },
        };
        if !fits {
            return Err(self.fail_code("renegotiation", ErrorCode::FrameOverflow));
        }

        let tail = &input[input.len() - extra.min(input.len())..];
        if !tail.is_empty() {
            let copied = self
                .channel
                .as_mut()
                .map_or(0, |channel| channel.recv.write_at_fill(tail));
            if copied < tail.len() {
                return Err(self.fail_code("handshake", ErrorCode::FrameOverflow));
            }
            tracing::debug!("Carried {} handshake bytes into the recv window", tail.len());
        }

        self.state = SessionState::Established;
        self.stats.handshakes += 1;
        tracing::debug!(
            "Session {} established after {} rounds: header {}, chunk {}, trailer {}",
            self.id,
            rounds,
            sizing.header_len,
            sizing.max_chunk_len,
            sizing.trailer_len
        );
        Ok(sizing)
    }
}

/// Keep only the last `extra` bytes of `input`.
fn keep_tail(input: &mut Vec<u8>, extra: usize) {
    let keep = extra.min(input.len());
    input.drain(..input.len() - keep);
}

/// Write `token` in full, retrying recoverable stops until `deadline`.
fn send_token<S: Socket>(
    socket: &mut S,
    token: &[u8],
    timing: &HandshakeTiming,
    deadline: Instant,
) -> std::result::Result<(), ErrorCode> {
    let mut sent = 0;
    while sent < token.len() {
        match socket.write(&token[sent..]) {
            Ok(0) => return Err(ErrorCode::ConnectionReset),
            Ok(n) => sent += n,
            Err(code) if socket.is_recoverable(code) => {
                if Instant::now() >= deadline {
                    return Err(ErrorCode::TimedOut);
                }
                std::thread::sleep(timing.drain);
            },
            Err(code) => return Err(code),
        }
    }
    Ok(())
}

/// Append peer bytes to `input` (up to `max_token`).
///
/// Waits `first_wait` for the socket to become readable, then keeps reading
/// while it becomes readable again within `timing.drain`. Returns the number
/// of bytes received.
fn accumulate_token<S: Socket>(
    socket: &mut S,
    input: &mut Vec<u8>,
    max_token: usize,
    first_wait: Duration,
    timing: &HandshakeTiming,
    deadline: Instant,
) -> std::result::Result<usize, ErrorCode> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if !socket.poll_readable(first_wait.min(remaining)) {
        return Ok(0);
    }

    let mut received = 0;
    loop {
        let start = input.len();
        if start >= max_token {
            break;
        }
        input.resize(max_token, 0);

        match socket.read(&mut input[start..]) {
            Ok(0) => {
                input.truncate(start);
                return Err(ErrorCode::ConnectionReset);
            },
            Ok(n) => {
                input.truncate(start + n);
                received += n;
            },
            Err(code) if socket.is_recoverable(code) => {
                input.truncate(start);
                break;
            },
            Err(code) => {
                input.truncate(start);
                return Err(code);
            },
        }

        if Instant::now() >= deadline || !socket.poll_readable(timing.drain) {
            break;
        }
    }
    Ok(received)
}
