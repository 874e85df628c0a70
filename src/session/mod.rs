//! Encrypted byte-stream session.
//!
//! A [`Session`] borrows a [`Socket`] and drives a [`SecureTransport`]
//! provider so that callers see plain `read`/`write` semantics.
//!
//! # Lifecycle
//!
//! ```text
//!   open ──► Acquired ──start──► Negotiating ──► Established ◄──┐
//!              │                     │               │          │ renegotiation
//!              │                     ▼               └──────────┘
//!              └───────────────►  Failed
//! ```
//!
//! Opening queries the provider package, acquires credentials and runs the
//! credential attribute queries. Any failure there drops the partially built
//! session, which releases exactly what was acquired.
//!
//! # Windows
//!
//! Frame sizing and the recv / ready / send windows are allocated together by
//! the first successful handshake and never resized afterwards.

mod handshake;
mod read;
mod write;

use std::io;

use serde::Serialize;

use crate::config::{Config, HandshakeTiming};
use crate::error::{ErrorCode, Result, SealError};
use crate::provider::{
    CredentialAttribute, CredentialDirection, CredentialQuery, FrameSizing, PackageInfo,
    SecureTransport, Status,
};
use crate::socket::Socket;
use crate::window::ByteWindow;

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Credentials held, no handshake yet
    Acquired,
    /// Handshake in progress
    Negotiating,
    /// Channel ready for data
    Established,
    /// A fatal error occurred; the session must be dropped
    Failed,
    /// Provider handles released
    Closed,
}

impl SessionState {
    /// Check if reads and writes may still succeed.
    pub fn is_usable(self) -> bool {
        self == SessionState::Established
    }
}

/// Negotiated sizing and the three windows sized from it.
#[derive(Debug)]
struct Channel {
    sizing: FrameSizing,
    /// Ciphertext read from the socket
    recv: ByteWindow,
    /// Plaintext awaiting the caller
    ready: ByteWindow,
    /// Sealed records awaiting the socket
    send: ByteWindow,
}

impl Channel {
    fn new(sizing: FrameSizing) -> Self {
        Self {
            sizing,
            recv: ByteWindow::with_capacity(sizing.frame_len()),
            ready: ByteWindow::with_capacity(sizing.max_chunk_len),
            send: ByteWindow::with_capacity(sizing.frame_len()),
        }
    }

    /// Whether a renegotiated sizing fits the existing windows.
    fn fits(&self, sizing: &FrameSizing) -> bool {
        sizing.frame_len() <= self.recv.capacity()
            && sizing.frame_len() <= self.send.capacity()
            && sizing.max_chunk_len <= self.ready.capacity()
    }
}

#[derive(Debug, Default)]
struct Counters {
    records_sealed: u64,
    records_opened: u64,
    bytes_accepted: u64,
    bytes_delivered: u64,
    bytes_flushed: u64,
    handshakes: u32,
    renegotiations: u32,
}

/// Encrypted session over a borrowed socket.
///
/// Pass `&mut socket` / `&mut provider` to keep ownership with the caller;
/// both traits are implemented for mutable references.
pub struct Session<S: Socket, P: SecureTransport> {
    /// Session ID
    id: String,
    /// Current state
    state: SessionState,
    socket: S,
    provider: P,
    /// Package limits reported at open
    package: PackageInfo,
    /// Server name (outbound) or local name (inbound)
    peer_name: String,
    direction: CredentialDirection,
    timing: HandshakeTiming,
    credential: Option<P::Credential>,
    context: Option<P::Context>,
    /// Credential query answers, in query order
    attributes: Vec<CredentialAttribute>,
    /// Set by the first successful handshake
    channel: Option<Channel>,
    last_error: ErrorCode,
    stats: Counters,
}

impl<S: Socket, P: SecureTransport> Session<S, P> {
    /// Open an outbound session with the default configuration.
    pub fn open(socket: S, provider: P, peer_name: &str) -> Result<Self> {
        Self::open_with(
            socket,
            provider,
            peer_name,
            CredentialDirection::Outbound,
            &Config::default(),
        )
    }

    /// Open a session: package check, credential acquisition and queries.
    ///
    /// No handshake is performed; call [`Session::start`].
    pub fn open_with(
        socket: S,
        mut provider: P,
        peer_name: &str,
        direction: CredentialDirection,
        config: &Config,
    ) -> Result<Self> {
        config.validate()?;

        let package = provider.package_info(&config.package).map_err(|status| {
            tracing::error!("Secure transport package {} unavailable: {:?}", config.package, status);
            SealError::Fatal(ErrorCode::Unavailable)
        })?;

        let mut session = Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: SessionState::Acquired,
            socket,
            provider,
            package,
            peer_name: peer_name.to_string(),
            direction,
            timing: config.timing(),
            credential: None,
            context: None,
            attributes: Vec::with_capacity(CredentialQuery::ALL.len()),
            channel: None,
            last_error: ErrorCode::Ok,
            stats: Counters::default(),
        };

        match session.provider.acquire_credentials(&config.package, direction) {
            Ok(credential) => session.credential = Some(credential),
            Err(status) => return Err(session.fail("acquire credentials", status)),
        }

        for query in CredentialQuery::ALL {
            let Some(credential) = session.credential.as_ref() else {
                break;
            };
            match session.provider.query_credentials(credential, query) {
                Ok(attribute) => session.attributes.push(attribute),
                Err(status) => return Err(session.fail("credential query", status)),
            }
        }

        tracing::debug!(
            "Session {} opened: {:?} credentials for {} (max token {} bytes)",
            session.id,
            direction,
            session.peer_name,
            session.package.max_token_len
        );
        Ok(session)
    }

    /// Open an outbound session and complete the handshake.
    pub fn connect(socket: S, provider: P, peer_name: &str, config: &Config) -> Result<Self> {
        let mut session =
            Self::open_with(socket, provider, peer_name, CredentialDirection::Outbound, config)?;
        session.start()?;
        Ok(session)
    }

    /// Open an inbound session answering to `local_name` and complete the
    /// handshake.
    pub fn accept(socket: S, provider: P, local_name: &str, config: &Config) -> Result<Self> {
        let mut session =
            Self::open_with(socket, provider, local_name, CredentialDirection::Inbound, config)?;
        session.start()?;
        Ok(session)
    }

    /// Run the initial handshake and return the negotiated sizing.
    pub fn start(&mut self) -> Result<FrameSizing> {
        match self.state {
            SessionState::Acquired => self.perform_handshake(Vec::new()),
            SessionState::Established => self.sizing().ok_or(SealError::NotNegotiated),
            SessionState::Failed => Err(SealError::Fatal(self.last_error)),
            SessionState::Negotiating | SessionState::Closed => Err(SealError::NotNegotiated),
        }
    }

    /// Release provider handles and windows, returning final statistics.
    pub fn close(mut self) -> SessionStats {
        self.release();
        self.state = SessionState::Closed;
        tracing::debug!("Session {} closed", self.id);
        self.stats()
    }

    /// Get session ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Check if session is established
    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Credential direction
    pub fn direction(&self) -> CredentialDirection {
        self.direction
    }

    /// Peer (outbound) or local (inbound) name used in the handshake
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// Negotiated sizing, once established
    pub fn sizing(&self) -> Option<FrameSizing> {
        self.channel.as_ref().map(|channel| channel.sizing)
    }

    /// Answers to the credential queries run at open
    pub fn credential_attributes(&self) -> &[CredentialAttribute] {
        &self.attributes
    }

    /// Code of the most recent failure.
    pub fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    /// Whether `code` is retry-safe on this session's socket.
    pub fn is_recoverable(&self, code: ErrorCode) -> bool {
        self.socket.is_recoverable(code)
    }

    /// Decrypted bytes buffered and not yet read.
    pub fn pending(&self) -> usize {
        self.channel.as_ref().map_or(0, |channel| channel.ready.unread_len())
    }

    /// Sealed bytes still waiting for the socket.
    pub fn pending_write(&self) -> usize {
        self.channel.as_ref().map_or(0, |channel| channel.send.unread_len())
    }

    /// Borrow the socket.
    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// Mutably borrow the socket.
    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    /// Borrow the provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Mutably borrow the provider.
    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    /// Get session statistics
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id.clone(),
            state: self.state,
            records_sealed: self.stats.records_sealed,
            records_opened: self.stats.records_opened,
            bytes_accepted: self.stats.bytes_accepted,
            bytes_delivered: self.stats.bytes_delivered,
            bytes_flushed: self.stats.bytes_flushed,
            handshakes: self.stats.handshakes,
            renegotiations: self.stats.renegotiations,
        }
    }

    /// Peer certificate. Certificate handling is not provided.
    pub fn peer_certificate(&self) -> Result<Vec<u8>> {
        Err(SealError::Unsupported("peer certificate"))
    }

    /// Identities the peer accepts for client authentication.
    pub fn client_auth_identities(&self) -> Result<Vec<String>> {
        Err(SealError::Unsupported("client authentication identities"))
    }

    /// Install a certificate and private key.
    pub fn set_credentials(&mut self, _certificate: &[u8], _private_key: &[u8]) -> Result<()> {
        Err(SealError::Unsupported("explicit credentials"))
    }

    /// Channel binding data for the negotiated channel.
    pub fn channel_binding(&self) -> Result<Vec<u8>> {
        Err(SealError::Unsupported("channel binding"))
    }

    /// Send a close notification to the peer.
    pub fn shutdown(&mut self) -> Result<()> {
        Err(SealError::Unsupported("shutdown"))
    }

    fn ensure_established(&self) -> Result<()> {
        match self.state {
            SessionState::Established => Ok(()),
            SessionState::Failed => Err(SealError::Fatal(self.last_error)),
            _ => Err(SealError::NotNegotiated),
        }
    }

    /// Record a fatal provider status.
    fn fail(&mut self, operation: &str, status: Status) -> SealError {
        self.fail_code(operation, status.error_code())
    }

    /// Record a fatal code and move to `Failed`.
    fn fail_code(&mut self, operation: &str, code: ErrorCode) -> SealError {
        self.last_error = code;
        self.state = SessionState::Failed;
        tracing::error!("Session {} {} failed: {}", self.id, operation, code);
        SealError::Fatal(code)
    }

    fn release(&mut self) {
        if let Some(context) = self.context.take() {
            self.provider.delete_context(context);
        }
        if let Some(credential) = self.credential.take() {
            self.provider.release_credentials(credential);
        }
        self.channel = None;
    }
}

impl<S: Socket, P: SecureTransport> Drop for Session<S, P> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<S: Socket, P: SecureTransport> std::fmt::Debug for Session<S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("peer_name", &self.peer_name)
            .field("direction", &self.direction)
            .field("channel", &self.channel)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

/// `WouldBlock` for recoverable stops; `Ok(0)` only for an empty buffer.
impl<S: Socket, P: SecureTransport> io::Read for Session<S, P> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Session::read(self, buf).map_err(io::Error::from)
    }
}

impl<S: Socket, P: SecureTransport> io::Write for Session<S, P> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match Session::write(self, buf) {
            Ok(0) if !buf.is_empty() => Err(io::ErrorKind::WouldBlock.into()),
            Ok(n) => Ok(n),
            Err(err) => Err(err.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match Session::flush(self) {
            Ok(true) => Ok(()),
            Ok(false) => Err(io::ErrorKind::WouldBlock.into()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Session statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Session ID
    pub session_id: String,
    /// Session state
    pub state: SessionState,
    /// Records encrypted
    pub records_sealed: u64,
    /// Records decrypted
    pub records_opened: u64,
    /// Plaintext bytes accepted by `write`
    pub bytes_accepted: u64,
    /// Plaintext bytes returned by `read`
    pub bytes_delivered: u64,
    /// Ciphertext bytes handed to the socket
    pub bytes_flushed: u64,
    /// Completed handshakes, renegotiations included
    pub handshakes: u32,
    /// Renegotiations requested by the peer
    pub renegotiations: u32,
}

impl SessionStats {
    /// Ciphertext bytes per plaintext byte written (1.0 when nothing written)
    pub fn write_overhead(&self) -> f64 {
        if self.bytes_accepted == 0 {
            1.0
        } else {
            self.bytes_flushed as f64 / self.bytes_accepted as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FailPoint, ScriptedProvider, ScriptedSocket};

    fn established<'a>(
        socket: &'a mut ScriptedSocket,
        provider: &'a mut ScriptedProvider,
    ) -> Session<&'a mut ScriptedSocket, &'a mut ScriptedProvider> {
        let mut session = Session::open(socket, provider, "peer.test").unwrap();
        session.start().unwrap();
        session
    }

    #[test]
    fn test_open_runs_credential_queries() {
        let mut socket = ScriptedSocket::new();
        let mut provider = ScriptedProvider::new();
        let session = Session::open(&mut socket, &mut provider, "peer.test").unwrap();

        assert_eq!(session.state(), SessionState::Acquired);
        assert_eq!(session.credential_attributes().len(), 3);
        assert!(matches!(
            session.credential_attributes()[1],
            CredentialAttribute::CipherStrengths { .. }
        ));
        assert_eq!(session.sizing(), None);
        assert_eq!(session.pending(), 0);
    }

    #[test]
    fn test_start_allocates_windows() {
        let mut socket = ScriptedSocket::new();
        let mut provider = ScriptedProvider::new().with_max_chunk_len(32);
        let session = established(&mut socket, &mut provider);

        let channel = session.channel.as_ref().unwrap();
        assert_eq!(channel.recv.capacity(), 4 + 32 + 2);
        assert_eq!(channel.send.capacity(), 4 + 32 + 2);
        assert_eq!(channel.ready.capacity(), 32);
        assert!(session.is_established());
        assert_eq!(session.stats().handshakes, 1);
    }

    #[test]
    fn test_io_before_handshake_is_misuse() {
        let mut socket = ScriptedSocket::new();
        let mut provider = ScriptedProvider::new();
        let mut session = Session::open(&mut socket, &mut provider, "peer.test").unwrap();

        let mut buf = [0u8; 4];
        assert!(matches!(session.read(&mut buf), Err(SealError::NotNegotiated)));
        assert!(matches!(session.write(b"data"), Err(SealError::NotNegotiated)));
    }

    #[test]
    fn test_unavailable_package() {
        let mut socket = ScriptedSocket::new();
        let mut provider = ScriptedProvider::new().with_failure(FailPoint::PackageInfo);
        let err = Session::open(&mut socket, &mut provider, "peer.test").unwrap_err();
        assert!(matches!(err, SealError::Fatal(ErrorCode::Unavailable)));
        assert!(provider.acquired().is_empty());
        assert!(provider.released().is_empty());
    }

    #[test]
    fn test_capability_probes_unsupported() {
        let mut socket = ScriptedSocket::new();
        let mut provider = ScriptedProvider::new();
        let mut session = established(&mut socket, &mut provider);

        assert!(matches!(session.peer_certificate(), Err(SealError::Unsupported(_))));
        assert!(matches!(session.client_auth_identities(), Err(SealError::Unsupported(_))));
        assert!(matches!(
            session.set_credentials(b"cert", b"key"),
            Err(SealError::Unsupported(_))
        ));
        assert!(matches!(session.channel_binding(), Err(SealError::Unsupported(_))));
        assert!(matches!(session.shutdown(), Err(SealError::Unsupported(_))));
        // Probes leave the session usable
        assert!(session.is_established());
        assert_eq!(session.last_error(), ErrorCode::Ok);
    }

    #[test]
    fn test_close_releases_once() {
        let mut socket = ScriptedSocket::new();
        let mut provider = ScriptedProvider::new();
        let stats = established(&mut socket, &mut provider).close();

        assert_eq!(stats.state, SessionState::Closed);
        assert_eq!(provider.released(), &[1]);
        assert_eq!(provider.contexts_created(), 1);
        assert_eq!(provider.contexts_deleted(), 1);
    }

    #[test]
    fn test_stats_serialize() {
        let mut socket = ScriptedSocket::new();
        let mut provider = ScriptedProvider::new();
        let session = established(&mut socket, &mut provider);

        let json = serde_json::to_value(session.stats()).unwrap();
        assert_eq!(json["state"], "Established");
        assert_eq!(json["handshakes"], 1);
        assert_eq!(session.stats().write_overhead(), 1.0);
    }
}
