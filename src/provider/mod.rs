//! Secure-transport provider interface.
//!
//! The shim never performs cryptography itself. A provider owns the
//! handshake messages and the record protection; the session only moves
//! bytes between the provider and the socket.
//!
//! # Operations
//!
//! | Operation               | Used by            | Purpose                                   |
//! |-------------------------|--------------------|-------------------------------------------|
//! | `package_info`          | session open       | capability check, maximum token size      |
//! | `acquire_credentials`   | session open       | outbound/inbound credential handle        |
//! | `query_credentials`     | session open       | algorithm / strength / protocol queries   |
//! | `release_credentials`   | session close      |                                           |
//! | `initialize_context`    | handshake          | one negotiation step per call             |
//! | `query_frame_sizing`    | handshake          | header / max chunk / trailer lengths      |
//! | `decrypt`               | read pipeline      | in-place, one record per call             |
//! | `encrypt`               | write pipeline     | in-place over header / data / trailer     |
//! | `delete_context`        | session close      |                                           |
//!
//! # Backends
//!
//! - [`SealedTransport`] (feature `crypto`): X25519 + HKDF-SHA256 +
//!   ChaCha20-Poly1305 records.
//! - [`crate::mock::ScriptedProvider`]: deterministic fake for tests.

#[cfg(feature = "crypto")]
mod sealed;

#[cfg(feature = "crypto")]
pub use sealed::{SealedContext, SealedCredential, SealedError, SealedTransport, PACKAGE_NAME};

use std::ops::Range;

use serde::Serialize;

use crate::error::ErrorCode;

/// Provider status codes for fatal outcomes.
///
/// Values follow the SSPI numbering so that logs from different backends
/// read the same.
pub mod codes {
    /// Handle does not refer to a usable context or credential.
    pub const INVALID_HANDLE: u32 = 0x8009_0301;
    /// Requested security package does not exist.
    pub const PACKAGE_NOT_FOUND: u32 = 0x8009_0305;
    /// Token or record is malformed.
    pub const INVALID_TOKEN: u32 = 0x8009_0308;
    /// Record arrived out of sequence.
    pub const OUT_OF_SEQUENCE: u32 = 0x8009_0310;
    /// Peer name does not match the negotiated principal.
    pub const WRONG_PRINCIPAL: u32 = 0x8009_0322;
    /// Record failed authentication.
    pub const DECRYPT_FAILURE: u32 = 0x8009_0330;
    /// Record could not be protected.
    pub const ENCRYPT_FAILURE: u32 = 0x8009_0331;
    /// Credentials could not be obtained.
    pub const NO_CREDENTIALS: u32 = 0x8009_030E;
    /// Attribute query is not supported by the package.
    pub const UNSUPPORTED_FUNCTION: u32 = 0x8009_0302;
}

/// Outcome of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Status {
    /// Operation completed.
    Success,
    /// Handshake needs another token from the peer.
    ContinueNeeded,
    /// Peer asked for credentials; continue without them.
    IncompleteCredentials,
    /// Input does not hold a complete token or record yet.
    IncompleteMessage,
    /// Peer requested a new handshake mid-stream.
    RenegotiateRequested,
    /// Non-retryable failure with a provider code.
    Fatal(u32),
}

impl Status {
    /// Whether the handshake loop must read more input and call again.
    pub fn is_continuation(self) -> bool {
        matches!(
            self,
            Self::ContinueNeeded | Self::IncompleteCredentials | Self::IncompleteMessage
        )
    }

    /// Error code recorded on the session for this status.
    pub fn error_code(self) -> ErrorCode {
        match self {
            Self::Success => ErrorCode::Ok,
            Self::IncompleteMessage => ErrorCode::IncompleteMessage,
            Self::Fatal(code) => ErrorCode::Provider(code),
            // Only meaningful where they are expected
            Self::ContinueNeeded | Self::IncompleteCredentials | Self::RenegotiateRequested => {
                ErrorCode::Provider(codes::OUT_OF_SEQUENCE)
            },
        }
    }
}

/// Credential direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum CredentialDirection {
    /// Client side: this end starts the handshake (default)
    #[default]
    Outbound,
    /// Server side: this end answers the handshake
    Inbound,
}

/// Package capabilities reported before any credential is acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    /// Package name
    pub name: String,
    /// Largest handshake token the package produces or accepts
    pub max_token_len: usize,
}

/// Credential attribute queries run after acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialQuery {
    /// Supported algorithms
    SupportedAlgorithms,
    /// Minimum and maximum cipher strength
    CipherStrengths,
    /// Supported protocol versions
    SupportedProtocols,
}

impl CredentialQuery {
    /// All queries, in the order the session runs them.
    pub const ALL: [CredentialQuery; 3] = [
        CredentialQuery::SupportedAlgorithms,
        CredentialQuery::CipherStrengths,
        CredentialQuery::SupportedProtocols,
    ];
}

/// Answer to a [`CredentialQuery`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CredentialAttribute {
    /// Algorithm names
    Algorithms(Vec<String>),
    /// Cipher strength range in bits
    CipherStrengths {
        /// Weakest cipher offered
        min_bits: u32,
        /// Strongest cipher offered
        max_bits: u32,
    },
    /// Protocol version names
    Protocols(Vec<String>),
}

/// Negotiated record layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameSizing {
    /// Bytes before the data region of every record
    pub header_len: usize,
    /// Largest plaintext chunk per record
    pub max_chunk_len: usize,
    /// Bytes after the data region of every record
    pub trailer_len: usize,
}

impl FrameSizing {
    /// Largest record on the wire.
    pub fn frame_len(&self) -> usize {
        self.header_len + self.max_chunk_len + self.trailer_len
    }

    /// Records needed for `len` plaintext bytes.
    pub fn chunks_for(&self, len: usize) -> usize {
        if self.max_chunk_len == 0 {
            return 0;
        }
        (len + self.max_chunk_len - 1) / self.max_chunk_len
    }
}

/// Result of one `initialize_context` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOutput {
    /// Step status
    pub status: Status,
    /// Token to send to the peer (may be empty)
    pub token: Vec<u8>,
    /// Trailing input bytes the provider did not consume
    pub extra: usize,
}

impl InitOutput {
    /// Status without a token.
    pub fn status(status: Status) -> Self {
        Self {
            status,
            token: Vec::new(),
            extra: 0,
        }
    }

    /// Status with a token for the peer.
    pub fn with_token(status: Status, token: Vec<u8>) -> Self {
        Self {
            status,
            token,
            extra: 0,
        }
    }

    /// Mark trailing input bytes as unconsumed.
    pub fn with_extra(mut self, extra: usize) -> Self {
        self.extra = extra;
        self
    }
}

/// Result of one in-place `decrypt` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptOutput {
    /// Record status
    pub status: Status,
    /// Plaintext span inside the submitted buffer
    pub plaintext: Range<usize>,
    /// Start of the next record, still encrypted
    pub extra: Option<Range<usize>>,
}

impl DecryptOutput {
    /// Status without any spans.
    pub fn status(status: Status) -> Self {
        Self {
            status,
            plaintext: 0..0,
            extra: None,
        }
    }

    /// Successful decrypt of `plaintext`.
    pub fn success(plaintext: Range<usize>) -> Self {
        Self {
            status: Status::Success,
            plaintext,
            extra: None,
        }
    }

    /// Attach an extra span; empty spans are dropped.
    pub fn with_extra(mut self, extra: Range<usize>) -> Self {
        self.extra = if extra.is_empty() { None } else { Some(extra) };
        self
    }
}

/// Message-oriented secure-channel provider.
///
/// Implementations are opaque to the session and freely swappable. All
/// buffers are borrowed for the duration of one call.
pub trait SecureTransport {
    /// Credential handle.
    type Credential;
    /// Security context handle.
    type Context;

    /// Check the package is usable and report its limits.
    fn package_info(&mut self, package: &str) -> Result<PackageInfo, Status>;

    /// Acquire credentials for `package`.
    fn acquire_credentials(
        &mut self,
        package: &str,
        direction: CredentialDirection,
    ) -> Result<Self::Credential, Status>;

    /// Run one credential attribute query.
    fn query_credentials(
        &mut self,
        credential: &Self::Credential,
        query: CredentialQuery,
    ) -> Result<CredentialAttribute, Status>;

    /// Release credentials obtained from `acquire_credentials`.
    fn release_credentials(&mut self, credential: Self::Credential);

    /// Run one handshake step.
    ///
    /// `context` is `None` on the first call; the provider creates it.
    /// `input` holds the peer's token bytes received so far.
    fn initialize_context(
        &mut self,
        credential: &Self::Credential,
        context: &mut Option<Self::Context>,
        peer_name: &str,
        input: &[u8],
    ) -> InitOutput;

    /// Record layout of an established context.
    fn query_frame_sizing(&mut self, context: &Self::Context) -> Result<FrameSizing, Status>;

    /// Decrypt the first record in `data` in place.
    fn decrypt(&mut self, context: &mut Self::Context, data: &mut [u8]) -> DecryptOutput;

    /// Encrypt `data` in place, filling `header` and `trailer`.
    fn encrypt(
        &mut self,
        context: &mut Self::Context,
        header: &mut [u8],
        data: &mut [u8],
        trailer: &mut [u8],
    ) -> Status;

    /// Destroy a context.
    fn delete_context(&mut self, context: Self::Context);
}

impl<P: SecureTransport + ?Sized> SecureTransport for &mut P {
    type Credential = P::Credential;
    type Context = P::Context;

    fn package_info(&mut self, package: &str) -> Result<PackageInfo, Status> {
        (**self).package_info(package)
    }

    fn acquire_credentials(
        &mut self,
        package: &str,
        direction: CredentialDirection,
    ) -> Result<Self::Credential, Status> {
        (**self).acquire_credentials(package, direction)
    }

    fn query_credentials(
        &mut self,
        credential: &Self::Credential,
        query: CredentialQuery,
    ) -> Result<CredentialAttribute, Status> {
        (**self).query_credentials(credential, query)
    }

    fn release_credentials(&mut self, credential: Self::Credential) {
        (**self).release_credentials(credential);
    }

    fn initialize_context(
        &mut self,
        credential: &Self::Credential,
        context: &mut Option<Self::Context>,
        peer_name: &str,
        input: &[u8],
    ) -> InitOutput {
        (**self).initialize_context(credential, context, peer_name, input)
    }

    fn query_frame_sizing(&mut self, context: &Self::Context) -> Result<FrameSizing, Status> {
        (**self).query_frame_sizing(context)
    }

    fn decrypt(&mut self, context: &mut Self::Context, data: &mut [u8]) -> DecryptOutput {
        (**self).decrypt(context, data)
    }

    fn encrypt(
        &mut self,
        context: &mut Self::Context,
        header: &mut [u8],
        data: &mut [u8],
        trailer: &mut [u8],
    ) -> Status {
        (**self).encrypt(context, header, data, trailer)
    }

    fn delete_context(&mut self, context: Self::Context) {
        (**self).delete_context(context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuation_statuses() {
        assert!(Status::ContinueNeeded.is_continuation());
        assert!(Status::IncompleteCredentials.is_continuation());
        assert!(Status::IncompleteMessage.is_continuation());
        assert!(!Status::Success.is_continuation());
        assert!(!Status::RenegotiateRequested.is_continuation());
        assert!(!Status::Fatal(codes::INVALID_TOKEN).is_continuation());
    }

    #[test]
    fn test_status_error_codes() {
        assert!(Status::IncompleteMessage.error_code().is_recoverable());
        assert_eq!(
            Status::Fatal(codes::DECRYPT_FAILURE).error_code(),
            ErrorCode::Provider(codes::DECRYPT_FAILURE)
        );
        assert!(!Status::Fatal(codes::DECRYPT_FAILURE).error_code().is_recoverable());
        assert!(!Status::ContinueNeeded.error_code().is_recoverable());
    }

    #[test]
    fn test_frame_sizing() {
        let sizing = FrameSizing {
            header_len: 5,
            max_chunk_len: 16,
            trailer_len: 16,
        };
        assert_eq!(sizing.frame_len(), 37);
        assert_eq!(sizing.chunks_for(0), 0);
        assert_eq!(sizing.chunks_for(16), 1);
        assert_eq!(sizing.chunks_for(17), 2);
        assert_eq!(sizing.chunks_for(48), 3);
    }

    #[test]
    fn test_decrypt_output_drops_empty_extra() {
        let out = DecryptOutput::success(4..8).with_extra(10..10);
        assert_eq!(out.extra, None);
        let out = DecryptOutput::success(4..8).with_extra(10..12);
        assert_eq!(out.extra, Some(10..12));
    }
}
