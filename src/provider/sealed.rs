//! Sealed secure-transport backend.
//!
//! A compact secure channel built from the same primitives the rest of the
//! ecosystem trusts:
//!
//! - **X25519** ephemeral key agreement
//! - **HKDF-SHA256** key schedule, bound to both public keys and the peer name
//! - **ChaCha20-Poly1305** record protection with per-direction counter nonces
//!
//! Certificates are out of scope: the channel is confidential and integrity
//! protected, but the peer is not authenticated.
//!
//! # Wire Format
//!
//! Every handshake token and record shares a 5-byte header:
//!
//! ```text
//! +---------+-----------+-------------+
//! | type:1  | version:2 | length:2 BE |
//! +---------+-----------+-------------+
//! ```
//!
//! | Type   | Payload                                                  |
//! |--------|----------------------------------------------------------|
//! | `0x16` | client hello: `pub:32 name_len:1 name`; server hello: `pub:32`; hello request: empty |
//! | `0x17` | `ciphertext || tag:16` (header is the AEAD associated data) |
//!
//! # Handshake
//!
//! ```text
//! Client (outbound)                      Server (inbound)
//!    |                                      |  initialize_context(∅) -> ContinueNeeded
//!    |------ client hello (pub_c, name) --->|
//!    |                                      |  initialize_context(hello) -> Success
//!    |<----------- server hello (pub_s) ----|
//!    |  initialize_context(hello) -> Success|
//! ```
//!
//! A hello request from the server surfaces on the client as
//! `RenegotiateRequested`; the client's next hello surfaces the same way on
//! the server and the handshake repeats with fresh keys.

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::{
    codes, CredentialAttribute, CredentialDirection, CredentialQuery, DecryptOutput, FrameSizing,
    InitOutput, PackageInfo, SecureTransport, Status,
};

/// Package name accepted by [`SealedTransport`].
pub const PACKAGE_NAME: &str = "streamseal";

const PROTOCOL_VERSION: [u8; 2] = [0x01, 0x00];
const HEADER_LEN: usize = 5;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PUBLIC_KEY_LEN: usize = 32;
const MAX_NAME_LEN: usize = 255;
const MAX_TOKEN_LEN: usize = 1024;
const MAX_CHUNK_LEN: usize = 16 * 1024;

const CONTENT_HANDSHAKE: u8 = 0x16;
const CONTENT_APPLICATION: u8 = 0x17;

const LABEL_CLIENT_WRITE: &[u8] = b"streamseal/v1 c2s ";
const LABEL_SERVER_WRITE: &[u8] = b"streamseal/v1 s2c ";

/// Errors from the sealed backend.
///
/// Each maps onto a provider [`Status`] before leaving the backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SealedError {
    /// Input ends before the token or record does
    #[error("Truncated input")]
    Truncated,

    /// Unknown or unexpected content type
    #[error("Unexpected content type 0x{0:02x}")]
    ContentType(u8),

    /// Unsupported protocol version
    #[error("Unsupported protocol version {0}.{1}")]
    Version(u8, u8),

    /// Structurally invalid token
    #[error("Malformed {0}")]
    Malformed(&'static str),

    /// Client addressed a different server name
    #[error("Peer name mismatch: expected {expected}, got {actual}")]
    NameMismatch {
        /// Name this end answers to
        expected: String,
        /// Name the client asked for
        actual: String,
    },

    /// Peer name does not fit in a client hello
    #[error("Peer name longer than {MAX_NAME_LEN} bytes")]
    NameTooLong,

    /// Key agreement produced a low-order shared secret
    #[error("Non-contributory key agreement")]
    WeakKey,

    /// HKDF expansion failed
    #[error("Key derivation failed: {0}")]
    Derivation(String),

    /// Record failed authentication
    #[error("Record authentication failed")]
    BadRecord,

    /// Record counter would wrap
    #[error("Record sequence exhausted")]
    SequenceExhausted,

    /// No traffic keys yet
    #[error("Context not established")]
    NotEstablished,

    /// Header, data or trailer region has the wrong size
    #[error("Record layout mismatch")]
    Layout,
}

impl SealedError {
    /// Provider status reported for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::Truncated => Status::IncompleteMessage,
            Self::NameMismatch { .. } => Status::Fatal(codes::WRONG_PRINCIPAL),
            Self::BadRecord => Status::Fatal(codes::DECRYPT_FAILURE),
            Self::SequenceExhausted => Status::Fatal(codes::OUT_OF_SEQUENCE),
            Self::NotEstablished => Status::Fatal(codes::INVALID_HANDLE),
            Self::Layout | Self::Derivation(_) => Status::Fatal(codes::ENCRYPT_FAILURE),
            Self::ContentType(_)
            | Self::Version(..)
            | Self::Malformed(_)
            | Self::NameTooLong
            | Self::WeakKey => Status::Fatal(codes::INVALID_TOKEN),
        }
    }
}

/// Credential handle: the sealed backend has no long-term identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealedCredential {
    direction: CredentialDirection,
}

impl SealedCredential {
    /// Direction the credential was acquired for.
    pub fn direction(&self) -> CredentialDirection {
        self.direction
    }
}

enum Phase {
    /// Nothing sent (client) or awaiting a client hello (server)
    Idle,
    /// Client hello sent, awaiting the server hello
    HelloSent {
        secret: StaticSecret,
        public: [u8; PUBLIC_KEY_LEN],
    },
    Established,
}

struct TrafficKeys {
    seal: ChaCha20Poly1305,
    open: ChaCha20Poly1305,
    seal_seq: u64,
    open_seq: u64,
}

impl TrafficKeys {
    fn new(direction: CredentialDirection, client_write: &[u8], server_write: &[u8]) -> Self {
        let (seal, open) = match direction {
            CredentialDirection::Outbound => (client_write, server_write),
            CredentialDirection::Inbound => (server_write, client_write),
        };
        Self {
            seal: ChaCha20Poly1305::new(Key::from_slice(seal)),
            open: ChaCha20Poly1305::new(Key::from_slice(open)),
            seal_seq: 0,
            open_seq: 0,
        }
    }
}

/// Security context of the sealed backend.
pub struct SealedContext {
    direction: CredentialDirection,
    max_chunk_len: usize,
    phase: Phase,
    keys: Option<TrafficKeys>,
    handshakes: u32,
}

impl SealedContext {
    fn new(direction: CredentialDirection, max_chunk_len: usize) -> Self {
        Self {
            direction,
            max_chunk_len,
            phase: Phase::Idle,
            keys: None,
            handshakes: 0,
        }
    }

    /// Check if traffic keys are in place.
    pub fn is_established(&self) -> bool {
        matches!(self.phase, Phase::Established)
    }

    /// Completed handshakes on this context, renegotiations included.
    pub fn handshakes(&self) -> u32 {
        self.handshakes
    }

    fn client_step(&mut self, peer_name: &str, input: &[u8]) -> Result<InitOutput, SealedError> {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        let was_established = matches!(phase, Phase::Established);
        match phase {
            Phase::HelloSent { secret, public } => {
                match self.finish_client(&secret, &public, peer_name, input) {
                    Err(SealedError::Truncated) => {
                        self.phase = Phase::HelloSent { secret, public };
                        Err(SealedError::Truncated)
                    },
                    other => other,
                }
            },
            // First handshake, or a renegotiation on an established context
            Phase::Idle | Phase::Established => {
                let result = self.start_client(peer_name, input);
                if result.is_err() && was_established {
                    self.phase = Phase::Established;
                }
                result
            },
        }
    }

    fn start_client(&mut self, peer_name: &str, input: &[u8]) -> Result<InitOutput, SealedError> {
        if peer_name.len() > MAX_NAME_LEN {
            return Err(SealedError::NameTooLong);
        }

        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();

        let mut payload = Vec::with_capacity(PUBLIC_KEY_LEN + 1 + peer_name.len());
        payload.extend_from_slice(&public);
        payload.push(peer_name.len() as u8);
        payload.extend_from_slice(peer_name.as_bytes());

        self.phase = Phase::HelloSent { secret, public };
        tracing::trace!("sealed: client hello for {}", peer_name);

        // Nothing from the peer is consumed by a hello
        Ok(InitOutput::with_token(Status::ContinueNeeded, frame(CONTENT_HANDSHAKE, &payload))
            .with_extra(input.len()))
    }

    fn finish_client(
        &mut self,
        secret: &StaticSecret,
        public: &[u8; PUBLIC_KEY_LEN],
        peer_name: &str,
        input: &[u8],
    ) -> Result<InitOutput, SealedError> {
        let (payload, consumed) = parse_frame(input, CONTENT_HANDSHAKE)?;
        let server_public: [u8; PUBLIC_KEY_LEN] = payload
            .try_into()
            .map_err(|_| SealedError::Malformed("server hello"))?;

        let shared = secret.diffie_hellman(&PublicKey::from(server_public));
        if !shared.was_contributory() {
            return Err(SealedError::WeakKey);
        }

        let (client_write, server_write) =
            derive_keys(shared.as_bytes(), public, &server_public, peer_name)?;
        self.install(&client_write[..], &server_write[..]);

        Ok(InitOutput::status(Status::Success).with_extra(input.len() - consumed))
    }

    fn server_step(&mut self, local_name: &str, input: &[u8]) -> Result<InitOutput, SealedError> {
        if matches!(self.phase, Phase::HelloSent { .. }) {
            return Err(SealedError::Malformed("server state"));
        }
        if input.is_empty() {
            return Ok(InitOutput::status(Status::ContinueNeeded));
        }

        let (payload, consumed) = parse_frame(input, CONTENT_HANDSHAKE)?;
        if payload.len() < PUBLIC_KEY_LEN + 1 {
            return Err(SealedError::Malformed("client hello"));
        }
        let name_len = payload[PUBLIC_KEY_LEN] as usize;
        let name = &payload[PUBLIC_KEY_LEN + 1..];
        if name.len() != name_len {
            return Err(SealedError::Malformed("client hello name"));
        }
        if name != local_name.as_bytes() {
            return Err(SealedError::NameMismatch {
                expected: local_name.to_string(),
                actual: String::from_utf8_lossy(name).into_owned(),
            });
        }

        let mut client_public = [0u8; PUBLIC_KEY_LEN];
        client_public.copy_from_slice(&payload[..PUBLIC_KEY_LEN]);

        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        let shared = secret.diffie_hellman(&PublicKey::from(client_public));
        if !shared.was_contributory() {
            return Err(SealedError::WeakKey);
        }

        let (client_write, server_write) =
            derive_keys(shared.as_bytes(), &client_public, &public, local_name)?;
        self.install(&client_write[..], &server_write[..]);
        tracing::trace!("sealed: server hello for {}", local_name);

        Ok(
            InitOutput::with_token(Status::Success, frame(CONTENT_HANDSHAKE, &public))
                .with_extra(input.len() - consumed),
        )
    }

    fn install(&mut self, client_write: &[u8], server_write: &[u8]) {
        self.keys = Some(TrafficKeys::new(self.direction, client_write, server_write));
        self.phase = Phase::Established;
        self.handshakes += 1;
    }

    fn open_record(&mut self, data: &mut [u8]) -> Result<DecryptOutput, SealedError> {
        let (content, len) = parse_header(data)?;
        let total = HEADER_LEN + len;
        if data.len() < total {
            return Err(SealedError::Truncated);
        }

        match content {
            CONTENT_APPLICATION => {},
            CONTENT_HANDSHAKE => return self.handshake_record(len, total, data.len()),
            other => return Err(SealedError::ContentType(other)),
        }

        if len < TAG_LEN {
            return Err(SealedError::Malformed("record"));
        }
        let keys = self.keys.as_mut().ok_or(SealedError::NotEstablished)?;

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&data[..HEADER_LEN]);
        let body_end = total - TAG_LEN;
        let tag = Tag::clone_from_slice(&data[body_end..total]);
        let nonce = nonce_for(keys.open_seq);

        keys.open
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                &header,
                &mut data[HEADER_LEN..body_end],
                &tag,
            )
            .map_err(|_| SealedError::BadRecord)?;
        keys.open_seq = keys.open_seq.checked_add(1).ok_or(SealedError::SequenceExhausted)?;

        Ok(DecryptOutput::success(HEADER_LEN..body_end).with_extra(total..data.len()))
    }

    fn handshake_record(
        &self,
        len: usize,
        total: usize,
        available: usize,
    ) -> Result<DecryptOutput, SealedError> {
        match (self.direction, len) {
            // Hello request: consumed, the rest stays with the caller
            (CredentialDirection::Outbound, 0) => Ok(DecryptOutput::status(
                Status::RenegotiateRequested,
            )
            .with_extra(total..available)),
            // New client hello: left unconsumed to seed the handshake
            (CredentialDirection::Inbound, len) if len > 0 => Ok(DecryptOutput::status(
                Status::RenegotiateRequested,
            )
            .with_extra(0..available)),
            _ => Err(SealedError::ContentType(CONTENT_HANDSHAKE)),
        }
    }

    fn seal_record(
        &mut self,
        header: &mut [u8],
        data: &mut [u8],
        trailer: &mut [u8],
    ) -> Result<(), SealedError> {
        if header.len() != HEADER_LEN || trailer.len() != TAG_LEN || data.len() > self.max_chunk_len
        {
            return Err(SealedError::Layout);
        }
        let keys = self.keys.as_mut().ok_or(SealedError::NotEstablished)?;

        header[0] = CONTENT_APPLICATION;
        header[1..3].copy_from_slice(&PROTOCOL_VERSION);
        header[3..5].copy_from_slice(&((data.len() + TAG_LEN) as u16).to_be_bytes());

        let nonce = nonce_for(keys.seal_seq);
        let tag = keys
            .seal
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), header, data)
            .map_err(|_| SealedError::Layout)?;
        trailer.copy_from_slice(&tag);
        keys.seal_seq = keys.seal_seq.checked_add(1).ok_or(SealedError::SequenceExhausted)?;

        Ok(())
    }
}

impl std::fmt::Debug for SealedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self.phase {
            Phase::Idle => "idle",
            Phase::HelloSent { .. } => "hello-sent",
            Phase::Established => "established",
        };
        f.debug_struct("SealedContext")
            .field("direction", &self.direction)
            .field("phase", &phase)
            .field("keys", &self.keys.as_ref().map(|_| "[REDACTED]"))
            .field("handshakes", &self.handshakes)
            .finish()
    }
}

/// X25519 / HKDF-SHA256 / ChaCha20-Poly1305 provider.
#[derive(Debug, Clone)]
pub struct SealedTransport {
    max_chunk_len: usize,
}

impl Default for SealedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SealedTransport {
    /// Create a provider with 16 KiB records.
    pub fn new() -> Self {
        Self {
            max_chunk_len: MAX_CHUNK_LEN,
        }
    }

    /// Limit the plaintext per record (clamped to `1..=16384`).
    pub fn with_max_chunk_len(mut self, max_chunk_len: usize) -> Self {
        self.max_chunk_len = max_chunk_len.clamp(1, MAX_CHUNK_LEN);
        self
    }

    /// Hello request record a server sends to ask for renegotiation.
    pub fn hello_request() -> Vec<u8> {
        frame(CONTENT_HANDSHAKE, &[])
    }
}

impl SecureTransport for SealedTransport {
    type Credential = SealedCredential;
    type Context = SealedContext;

    fn package_info(&mut self, package: &str) -> Result<PackageInfo, Status> {
        if package != PACKAGE_NAME {
            return Err(Status::Fatal(codes::PACKAGE_NOT_FOUND));
        }
        Ok(PackageInfo {
            name: PACKAGE_NAME.to_string(),
            max_token_len: MAX_TOKEN_LEN,
        })
    }

    fn acquire_credentials(
        &mut self,
        package: &str,
        direction: CredentialDirection,
    ) -> Result<Self::Credential, Status> {
        if package != PACKAGE_NAME {
            return Err(Status::Fatal(codes::NO_CREDENTIALS));
        }
        Ok(SealedCredential { direction })
    }

    fn query_credentials(
        &mut self,
        _credential: &Self::Credential,
        query: CredentialQuery,
    ) -> Result<CredentialAttribute, Status> {
        Ok(match query {
            CredentialQuery::SupportedAlgorithms => CredentialAttribute::Algorithms(vec![
                "X25519".to_string(),
                "HKDF-SHA256".to_string(),
                "CHACHA20-POLY1305".to_string(),
            ]),
            CredentialQuery::CipherStrengths => CredentialAttribute::CipherStrengths {
                min_bits: 256,
                max_bits: 256,
            },
            CredentialQuery::SupportedProtocols => {
                CredentialAttribute::Protocols(vec!["streamseal/1.0".to_string()])
            },
        })
    }

    fn release_credentials(&mut self, _credential: Self::Credential) {}

    fn initialize_context(
        &mut self,
        credential: &Self::Credential,
        context: &mut Option<Self::Context>,
        peer_name: &str,
        input: &[u8],
    ) -> InitOutput {
        let max_chunk_len = self.max_chunk_len;
        let ctx =
            context.get_or_insert_with(|| SealedContext::new(credential.direction, max_chunk_len));

        let result = match credential.direction {
            CredentialDirection::Outbound => ctx.client_step(peer_name, input),
            CredentialDirection::Inbound => ctx.server_step(peer_name, input),
        };

        result.unwrap_or_else(|err| {
            if err != SealedError::Truncated {
                tracing::debug!("sealed handshake step failed: {}", err);
            }
            InitOutput::status(err.status())
        })
    }

    fn query_frame_sizing(&mut self, context: &Self::Context) -> Result<FrameSizing, Status> {
        if context.keys.is_none() {
            return Err(SealedError::NotEstablished.status());
        }
        Ok(FrameSizing {
            header_len: HEADER_LEN,
            max_chunk_len: context.max_chunk_len,
            trailer_len: TAG_LEN,
        })
    }

    fn decrypt(&mut self, context: &mut Self::Context, data: &mut [u8]) -> DecryptOutput {
        context.open_record(data).unwrap_or_else(|err| {
            if err != SealedError::Truncated {
                tracing::debug!("sealed decrypt failed: {}", err);
            }
            DecryptOutput::status(err.status())
        })
    }

    fn encrypt(
        &mut self,
        context: &mut Self::Context,
        header: &mut [u8],
        data: &mut [u8],
        trailer: &mut [u8],
    ) -> Status {
        match context.seal_record(header, data, trailer) {
            Ok(()) => Status::Success,
            Err(err) => {
                tracing::debug!("sealed encrypt failed: {}", err);
                err.status()
            },
        }
    }

    fn delete_context(&mut self, _context: Self::Context) {}
}

fn frame(content: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(content);
    out.extend_from_slice(&PROTOCOL_VERSION);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn parse_header(input: &[u8]) -> Result<(u8, usize), SealedError> {
    if input.len() < HEADER_LEN {
        return Err(SealedError::Truncated);
    }
    if input[1..3] != PROTOCOL_VERSION {
        return Err(SealedError::Version(input[1], input[2]));
    }
    let len = u16::from_be_bytes([input[3], input[4]]) as usize;
    Ok((input[0], len))
}

/// Split the first frame of `content` type. Returns its payload and length.
fn parse_frame(input: &[u8], content: u8) -> Result<(&[u8], usize), SealedError> {
    let (actual, len) = parse_header(input)?;
    if actual != content {
        return Err(SealedError::ContentType(actual));
    }
    let total = HEADER_LEN + len;
    if input.len() < total {
        return Err(SealedError::Truncated);
    }
    Ok((&input[HEADER_LEN..total], total))
}

fn nonce_for(seq: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&seq.to_be_bytes());
    nonce
}

type KeyPair = (Zeroizing<[u8; KEY_LEN]>, Zeroizing<[u8; KEY_LEN]>);

/// Derive `(client_write, server_write)` keys.
fn derive_keys(
    shared: &[u8; 32],
    client_public: &[u8; PUBLIC_KEY_LEN],
    server_public: &[u8; PUBLIC_KEY_LEN],
    server_name: &str,
) -> Result<KeyPair, SealedError> {
    let mut salt = [0u8; PUBLIC_KEY_LEN * 2];
    salt[..PUBLIC_KEY_LEN].copy_from_slice(client_public);
    salt[PUBLIC_KEY_LEN..].copy_from_slice(server_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut client_write = Zeroizing::new([0u8; KEY_LEN]);
    let mut server_write = Zeroizing::new([0u8; KEY_LEN]);

    hk.expand_multi_info(&[LABEL_CLIENT_WRITE, server_name.as_bytes()], &mut client_write[..])
        .map_err(|e| SealedError::Derivation(e.to_string()))?;
    hk.expand_multi_info(&[LABEL_SERVER_WRITE, server_name.as_bytes()], &mut server_write[..])
        .map_err(|e| SealedError::Derivation(e.to_string()))?;

    Ok((client_write, server_write))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    struct Pair {
        provider: SealedTransport,
        client_cred: SealedCredential,
        server_cred: SealedCredential,
        client: Option<SealedContext>,
        server: Option<SealedContext>,
    }

    fn pair(name: &str) -> Pair {
        let mut provider = SealedTransport::new().with_max_chunk_len(64);
        let client_cred = provider
            .acquire_credentials(PACKAGE_NAME, CredentialDirection::Outbound)
            .unwrap();
        let server_cred = provider
            .acquire_credentials(PACKAGE_NAME, CredentialDirection::Inbound)
            .unwrap();
        let mut pair = Pair {
            provider,
            client_cred,
            server_cred,
            client: None,
            server: None,
        };

        let hello = pair.provider.initialize_context(&pair.client_cred, &mut pair.client, name, &[]);
        assert_eq!(hello.status, Status::ContinueNeeded);

        let idle = pair.provider.initialize_context(&pair.server_cred, &mut pair.server, name, &[]);
        assert_eq!(idle.status, Status::ContinueNeeded);
        assert!(idle.token.is_empty());

        let reply =
            pair.provider
                .initialize_context(&pair.server_cred, &mut pair.server, name, &hello.token);
        assert_eq!(reply.status, Status::Success);
        assert_eq!(reply.extra, 0);

        let done =
            pair.provider
                .initialize_context(&pair.client_cred, &mut pair.client, name, &reply.token);
        assert_eq!(done.status, Status::Success);
        assert!(done.token.is_empty());
        pair
    }

    fn seal(pair: &mut Pair, client: bool, plaintext: &[u8]) -> Vec<u8> {
        let mut record = vec![0u8; HEADER_LEN + plaintext.len() + TAG_LEN];
        record[HEADER_LEN..HEADER_LEN + plaintext.len()].copy_from_slice(plaintext);
        let (header, rest) = record.split_at_mut(HEADER_LEN);
        let (data, trailer) = rest.split_at_mut(plaintext.len());
        let ctx = if client { &mut pair.client } else { &mut pair.server };
        let status = pair.provider.encrypt(ctx.as_mut().unwrap(), header, data, trailer);
        assert_eq!(status, Status::Success);
        record
    }

    #[test]
    fn test_frame_header_layout() {
        assert_eq!(SealedTransport::hello_request(), hex!("16 01 00 00 00"));
        assert_eq!(frame(CONTENT_APPLICATION, b"ab"), hex!("17 01 00 00 02 61 62"));
    }

    #[test]
    fn test_nonce_layout() {
        assert_eq!(nonce_for(0), [0u8; 12]);
        assert_eq!(nonce_for(258), hex!("00 00 00 00 00 00 00 00 00 00 01 02"));
    }

    #[test]
    fn test_handshake_and_records_both_directions() {
        let mut pair = pair("chat.example");
        assert!(pair.client.as_ref().unwrap().is_established());
        assert!(pair.server.as_ref().unwrap().is_established());

        let mut record = seal(&mut pair, true, b"client says hi");
        let out = pair.provider.decrypt(pair.server.as_mut().unwrap(), &mut record);
        assert_eq!(out.status, Status::Success);
        assert_eq!(&record[out.plaintext], b"client says hi");
        assert_eq!(out.extra, None);

        let mut record = seal(&mut pair, false, b"server answers");
        let out = pair.provider.decrypt(pair.client.as_mut().unwrap(), &mut record);
        assert_eq!(out.status, Status::Success);
        assert_eq!(&record[out.plaintext], b"server answers");
    }

    #[test]
    fn test_partial_tokens_are_incomplete() {
        let mut provider = SealedTransport::new();
        let client_cred = provider
            .acquire_credentials(PACKAGE_NAME, CredentialDirection::Outbound)
            .unwrap();
        let server_cred = provider
            .acquire_credentials(PACKAGE_NAME, CredentialDirection::Inbound)
            .unwrap();
        let mut client = None;
        let mut server = None;

        let hello = provider.initialize_context(&client_cred, &mut client, "host", &[]);
        let out = provider.initialize_context(&server_cred, &mut server, "host", &hello.token[..3]);
        assert_eq!(out.status, Status::IncompleteMessage);

        let out = provider.initialize_context(&server_cred, &mut server, "host", &hello.token[..10]);
        assert_eq!(out.status, Status::IncompleteMessage);

        let reply = provider.initialize_context(&server_cred, &mut server, "host", &hello.token);
        assert_eq!(reply.status, Status::Success);

        // Client keeps its secret across an incomplete step
        let out = provider.initialize_context(&client_cred, &mut client, "host", &reply.token[..7]);
        assert_eq!(out.status, Status::IncompleteMessage);
        let out = provider.initialize_context(&client_cred, &mut client, "host", &reply.token);
        assert_eq!(out.status, Status::Success);
    }

    #[test]
    fn test_server_rejects_wrong_name() {
        let mut provider = SealedTransport::new();
        let client_cred = provider
            .acquire_credentials(PACKAGE_NAME, CredentialDirection::Outbound)
            .unwrap();
        let server_cred = provider
            .acquire_credentials(PACKAGE_NAME, CredentialDirection::Inbound)
            .unwrap();
        let mut client = None;
        let mut server = None;

        let hello = provider.initialize_context(&client_cred, &mut client, "evil.example", &[]);
        let out = provider.initialize_context(&server_cred, &mut server, "good.example", &hello.token);
        assert_eq!(out.status, Status::Fatal(codes::WRONG_PRINCIPAL));
    }

    #[test]
    fn test_tampered_record_fails() {
        let mut pair = pair("host");
        let mut record = seal(&mut pair, true, b"integrity");
        record[HEADER_LEN] ^= 0x01;
        let out = pair.provider.decrypt(pair.server.as_mut().unwrap(), &mut record);
        assert_eq!(out.status, Status::Fatal(codes::DECRYPT_FAILURE));
    }

    #[test]
    fn test_replayed_record_fails() {
        let mut pair = pair("host");
        let record = seal(&mut pair, true, b"once");
        let mut first = record.clone();
        let mut replay = record;
        let out = pair.provider.decrypt(pair.server.as_mut().unwrap(), &mut first);
        assert_eq!(out.status, Status::Success);
        let out = pair.provider.decrypt(pair.server.as_mut().unwrap(), &mut replay);
        assert_eq!(out.status, Status::Fatal(codes::DECRYPT_FAILURE));
    }

    #[test]
    fn test_extra_and_incomplete_records() {
        let mut pair = pair("host");
        let mut stream = seal(&mut pair, true, b"first");
        let first_len = stream.len();
        stream.extend_from_slice(&seal(&mut pair, true, b"second"));

        let out = pair.provider.decrypt(pair.server.as_mut().unwrap(), &mut stream);
        assert_eq!(out.status, Status::Success);
        assert_eq!(&stream[out.plaintext.clone()], b"first");
        assert_eq!(out.extra, Some(first_len..stream.len()));

        let mut partial = stream[first_len..stream.len() - 1].to_vec();
        let out = pair.provider.decrypt(pair.server.as_mut().unwrap(), &mut partial);
        assert_eq!(out.status, Status::IncompleteMessage);
    }

    #[test]
    fn test_hello_request_signals_renegotiation() {
        let mut pair = pair("host");
        let mut stream = SealedTransport::hello_request();
        stream.extend_from_slice(b"tail");

        let out = pair.provider.decrypt(pair.client.as_mut().unwrap(), &mut stream);
        assert_eq!(out.status, Status::RenegotiateRequested);
        assert_eq!(out.extra, Some(HEADER_LEN..HEADER_LEN + 4));
    }

    #[test]
    fn test_renegotiation_rekeys_both_ends() {
        let mut pair = pair("host");

        let hello = pair
            .provider
            .initialize_context(&pair.client_cred, &mut pair.client, "host", &[]);
        assert_eq!(hello.status, Status::ContinueNeeded);

        // The new client hello reaches the server through its read path
        let mut inbound = hello.token.clone();
        let out = pair.provider.decrypt(pair.server.as_mut().unwrap(), &mut inbound);
        assert_eq!(out.status, Status::RenegotiateRequested);
        assert_eq!(out.extra, Some(0..hello.token.len()));

        let reply = pair
            .provider
            .initialize_context(&pair.server_cred, &mut pair.server, "host", &hello.token);
        assert_eq!(reply.status, Status::Success);
        let done = pair
            .provider
            .initialize_context(&pair.client_cred, &mut pair.client, "host", &reply.token);
        assert_eq!(done.status, Status::Success);
        assert_eq!(pair.client.as_ref().unwrap().handshakes(), 2);

        let mut record = seal(&mut pair, true, b"fresh keys");
        let out = pair.provider.decrypt(pair.server.as_mut().unwrap(), &mut record);
        assert_eq!(out.status, Status::Success);
        assert_eq!(&record[out.plaintext], b"fresh keys");
    }

    #[test]
    fn test_unknown_package() {
        let mut provider = SealedTransport::new();
        assert_eq!(
            provider.package_info("schannel"),
            Err(Status::Fatal(codes::PACKAGE_NOT_FOUND))
        );
        let info = provider.package_info(PACKAGE_NAME).unwrap();
        assert_eq!(info.max_token_len, MAX_TOKEN_LEN);
    }

    #[test]
    fn test_sizing_requires_established_context() {
        let mut provider = SealedTransport::new().with_max_chunk_len(100);
        let cred = provider
            .acquire_credentials(PACKAGE_NAME, CredentialDirection::Outbound)
            .unwrap();
        let mut ctx = None;
        provider.initialize_context(&cred, &mut ctx, "host", &[]);
        assert_eq!(
            provider.query_frame_sizing(ctx.as_ref().unwrap()),
            Err(Status::Fatal(codes::INVALID_HANDLE))
        );

        let pair = pair("host");
        let mut provider = pair.provider.clone();
        let sizing = provider.query_frame_sizing(pair.client.as_ref().unwrap()).unwrap();
        assert_eq!(
            sizing,
            FrameSizing {
                header_len: 5,
                max_chunk_len: 64,
                trailer_len: 16
            }
        );
    }
}
