//! Scripted socket and provider.
//!
//! Deterministic in-memory collaborators for exercising sessions without a
//! network or real cryptography. Both record everything the session does to
//! them so tests can assert on call counts and exact bytes.
//!
//! # Mock Record Format
//!
//! ```text
//! +------+------+-----------+----------------------+-------------+
//! | 0xA5 | kind | len:2 BE  | plaintext ^ 0x5A     | sum:2 BE    |
//! +------+------+-----------+----------------------+-------------+
//! ```
//!
//! `kind` is `0x17` for data and `0x16` for a renegotiation request (which
//! carries no body). The trailer is the wrapping sum of the plaintext bytes.

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::ErrorCode;
use crate::provider::{
    codes, CredentialAttribute, CredentialDirection, CredentialQuery, DecryptOutput, FrameSizing,
    InitOutput, PackageInfo, SecureTransport, Status,
};
use crate::socket::Socket;

/// Mock record header length.
pub const MOCK_HEADER_LEN: usize = 4;
/// Mock record trailer length.
pub const MOCK_TRAILER_LEN: usize = 2;

const MAGIC: u8 = 0xA5;
const KIND_DATA: u8 = 0x17;
const KIND_RENEGOTIATE: u8 = 0x16;
const MASK: u8 = 0x5A;

#[derive(Debug, Clone)]
enum Incoming {
    Data(Vec<u8>),
    Error(ErrorCode),
    Close,
}

/// In-memory socket driven by a script of incoming chunks and write limits.
///
/// Each `read` returns bytes from at most one queued chunk. An empty inbox
/// reads as `WouldBlock`.
#[derive(Debug, Default)]
pub struct ScriptedSocket {
    inbox: VecDeque<Incoming>,
    write_plan: VecDeque<Result<usize, ErrorCode>>,
    written: Vec<u8>,
    last_error: ErrorCode,
    reads: usize,
    writes: usize,
    polls: usize,
}

impl ScriptedSocket {
    /// Create an idle socket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the next reads.
    pub fn push_incoming(&mut self, bytes: &[u8]) {
        if !bytes.is_empty() {
            self.inbox.push_back(Incoming::Data(bytes.to_vec()));
        }
    }

    /// Queue a read error.
    pub fn push_error(&mut self, code: ErrorCode) {
        self.inbox.push_back(Incoming::Error(code));
    }

    /// Queue an orderly close; every later read returns `Ok(0)`.
    pub fn push_close(&mut self) {
        self.inbox.push_back(Incoming::Close);
    }

    /// Accept at most `n` bytes on the next write.
    pub fn limit_next_write(&mut self, n: usize) {
        self.write_plan.push_back(Ok(n));
    }

    /// Fail the next write with `code`.
    pub fn fail_next_write(&mut self, code: ErrorCode) {
        self.write_plan.push_back(Err(code));
    }

    /// Everything written so far.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// Take everything written so far.
    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.written)
    }

    /// Check if queued input remains.
    pub fn has_incoming(&self) -> bool {
        !self.inbox.is_empty()
    }

    /// Number of `read` calls.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Number of `write` calls.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Number of `poll_readable` calls.
    pub fn polls(&self) -> usize {
        self.polls
    }
}

impl Socket for ScriptedSocket {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ErrorCode> {
        self.reads += 1;
        match self.inbox.pop_front() {
            Some(Incoming::Data(mut data)) => {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    data.drain(..n);
                    self.inbox.push_front(Incoming::Data(data));
                }
                Ok(n)
            },
            Some(Incoming::Error(code)) => {
                self.last_error = code;
                Err(code)
            },
            Some(Incoming::Close) => {
                self.inbox.push_front(Incoming::Close);
                Ok(0)
            },
            None => {
                self.last_error = ErrorCode::WouldBlock;
                Err(ErrorCode::WouldBlock)
            },
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, ErrorCode> {
        self.writes += 1;
        let n = match self.write_plan.pop_front() {
            Some(Ok(limit)) => limit.min(buf.len()),
            Some(Err(code)) => {
                self.last_error = code;
                return Err(code);
            },
            None => buf.len(),
        };
        self.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn poll_readable(&mut self, _timeout: Duration) -> bool {
        self.polls += 1;
        !self.inbox.is_empty()
    }

    fn last_error(&self) -> ErrorCode {
        self.last_error
    }
}

/// Provider call that a [`ScriptedProvider`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// `package_info` reports the package missing
    PackageInfo,
    /// `acquire_credentials` fails
    AcquireCredentials,
    /// One credential attribute query fails
    Query(CredentialQuery),
    /// `query_frame_sizing` fails
    FrameSizing,
    /// Every `encrypt` fails
    Encrypt,
}

/// One scripted `initialize_context` answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeStep {
    /// Status to report
    pub status: Status,
    /// Token to hand to the session
    pub token: Vec<u8>,
    /// Trailing input bytes to report as unconsumed
    pub extra: usize,
}

impl HandshakeStep {
    /// Step with a status and token.
    pub fn new(status: Status, token: &[u8]) -> Self {
        Self {
            status,
            token: token.to_vec(),
            extra: 0,
        }
    }

    /// Report `extra` trailing input bytes as unconsumed.
    pub fn with_extra(mut self, extra: usize) -> Self {
        self.extra = extra;
        self
    }
}

/// Credential handle issued by [`ScriptedProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockCredential {
    /// Issue order, starting at 1
    pub id: u32,
    /// Requested direction
    pub direction: CredentialDirection,
}

/// Context handle issued by [`ScriptedProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockContext {
    /// Issue order, starting at 1
    pub id: u32,
    /// Completed handshakes
    pub handshakes: u32,
}

/// Deterministic provider with a scripted handshake and reversible records.
///
/// With an empty script every handshake step reports `Success` without a
/// token and leaves its input unconsumed, so sessions negotiate without
/// socket traffic.
#[derive(Debug)]
pub struct ScriptedProvider {
    script: VecDeque<HandshakeStep>,
    fail: Option<FailPoint>,
    max_chunk_len: usize,
    max_token_len: usize,
    next_id: u32,
    inputs: Vec<Vec<u8>>,
    decrypt_inputs: Vec<Vec<u8>>,
    forced_decrypts: VecDeque<DecryptOutput>,
    acquired: Vec<u32>,
    released: Vec<u32>,
    contexts_created: u32,
    contexts_deleted: u32,
    encrypt_calls: usize,
    decrypt_calls: usize,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    /// Create a provider with 16-byte chunks and 64-byte tokens.
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            fail: None,
            max_chunk_len: 16,
            max_token_len: 64,
            next_id: 0,
            inputs: Vec::new(),
            decrypt_inputs: Vec::new(),
            forced_decrypts: VecDeque::new(),
            acquired: Vec::new(),
            released: Vec::new(),
            contexts_created: 0,
            contexts_deleted: 0,
            encrypt_calls: 0,
            decrypt_calls: 0,
        }
    }

    /// Set the largest plaintext chunk per record.
    pub fn with_max_chunk_len(mut self, max_chunk_len: usize) -> Self {
        self.max_chunk_len = max_chunk_len;
        self
    }

    /// Set the largest handshake token.
    pub fn with_max_token_len(mut self, max_token_len: usize) -> Self {
        self.max_token_len = max_token_len;
        self
    }

    /// Queue handshake answers.
    pub fn with_script(mut self, steps: impl IntoIterator<Item = HandshakeStep>) -> Self {
        self.script.extend(steps);
        self
    }

    /// Queue one more handshake answer.
    pub fn push_step(&mut self, step: HandshakeStep) {
        self.script.push_back(step);
    }

    /// Answer the next `decrypt` with `output` instead of opening the input.
    pub fn push_decrypt_output(&mut self, output: DecryptOutput) {
        self.forced_decrypts.push_back(output);
    }

    /// Fail the given call.
    pub fn with_failure(mut self, point: FailPoint) -> Self {
        self.fail = Some(point);
        self
    }

    /// Change or clear the injected failure.
    pub fn set_failure(&mut self, point: Option<FailPoint>) {
        self.fail = point;
    }

    /// Frame sizing this provider negotiates.
    pub fn sizing(&self) -> FrameSizing {
        FrameSizing {
            header_len: MOCK_HEADER_LEN,
            max_chunk_len: self.max_chunk_len,
            trailer_len: MOCK_TRAILER_LEN,
        }
    }

    /// Inputs passed to each `initialize_context` call.
    pub fn handshake_inputs(&self) -> &[Vec<u8>] {
        &self.inputs
    }

    /// Buffers passed to each `decrypt` call, as submitted.
    pub fn decrypt_inputs(&self) -> &[Vec<u8>] {
        &self.decrypt_inputs
    }

    /// IDs of acquired credentials.
    pub fn acquired(&self) -> &[u32] {
        &self.acquired
    }

    /// IDs of released credentials, in release order.
    pub fn released(&self) -> &[u32] {
        &self.released
    }

    /// Contexts created so far.
    pub fn contexts_created(&self) -> u32 {
        self.contexts_created
    }

    /// Contexts deleted so far.
    pub fn contexts_deleted(&self) -> u32 {
        self.contexts_deleted
    }

    /// Number of `encrypt` calls.
    pub fn encrypt_calls(&self) -> usize {
        self.encrypt_calls
    }

    /// Number of `decrypt` calls.
    pub fn decrypt_calls(&self) -> usize {
        self.decrypt_calls
    }

    /// Seal `plaintext` into one mock record.
    pub fn seal(plaintext: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(MOCK_HEADER_LEN + plaintext.len() + MOCK_TRAILER_LEN);
        out.extend_from_slice(&header(KIND_DATA, plaintext.len()));
        out.extend(plaintext.iter().map(|b| b ^ MASK));
        out.extend_from_slice(&checksum(plaintext).to_be_bytes());
        out
    }

    /// Record asking the receiver to renegotiate.
    pub fn renegotiate_marker() -> Vec<u8> {
        let mut out = header(KIND_RENEGOTIATE, 0).to_vec();
        out.extend_from_slice(&[0, 0]);
        out
    }

    /// Open a sequence of complete mock data records.
    ///
    /// Returns the plaintext of each, or the status of the first bad record.
    pub fn open_records(mut bytes: &[u8]) -> Result<Vec<Vec<u8>>, Status> {
        let mut records = Vec::new();
        while !bytes.is_empty() {
            let mut copy = bytes.to_vec();
            let out = open(&mut copy, usize::MAX);
            if out.status != Status::Success {
                return Err(out.status);
            }
            records.push(copy[out.plaintext].to_vec());
            let consumed = out.extra.map_or(bytes.len(), |extra| extra.start);
            bytes = &bytes[consumed..];
        }
        Ok(records)
    }

    fn failing(&self, point: FailPoint) -> bool {
        self.fail == Some(point)
    }
}

fn header(kind: u8, len: usize) -> [u8; MOCK_HEADER_LEN] {
    let len = (len as u16).to_be_bytes();
    [MAGIC, kind, len[0], len[1]]
}

fn checksum(plaintext: &[u8]) -> u16 {
    plaintext
        .iter()
        .fold(0u16, |sum, b| sum.wrapping_add(u16::from(*b)))
}

fn open(data: &mut [u8], max_chunk_len: usize) -> DecryptOutput {
    if data.len() < MOCK_HEADER_LEN {
        return DecryptOutput::status(Status::IncompleteMessage);
    }
    if data[0] != MAGIC {
        return DecryptOutput::status(Status::Fatal(codes::INVALID_TOKEN));
    }
    let kind = data[1];
    let len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if len > max_chunk_len {
        return DecryptOutput::status(Status::Fatal(codes::INVALID_TOKEN));
    }
    let total = MOCK_HEADER_LEN + len + MOCK_TRAILER_LEN;
    if data.len() < total {
        return DecryptOutput::status(Status::IncompleteMessage);
    }

    match kind {
        KIND_DATA => {},
        KIND_RENEGOTIATE => {
            return DecryptOutput::status(Status::RenegotiateRequested)
                .with_extra(total..data.len());
        },
        _ => return DecryptOutput::status(Status::Fatal(codes::INVALID_TOKEN)),
    }

    let body = MOCK_HEADER_LEN..MOCK_HEADER_LEN + len;
    for b in &mut data[body.clone()] {
        *b ^= MASK;
    }
    let expected = u16::from_be_bytes([data[body.end], data[body.end + 1]]);
    if checksum(&data[body.clone()]) != expected {
        return DecryptOutput::status(Status::Fatal(codes::DECRYPT_FAILURE));
    }

    DecryptOutput::success(body).with_extra(total..data.len())
}

impl SecureTransport for ScriptedProvider {
    type Credential = MockCredential;
    type Context = MockContext;

    fn package_info(&mut self, package: &str) -> Result<PackageInfo, Status> {
        if self.failing(FailPoint::PackageInfo) {
            return Err(Status::Fatal(codes::PACKAGE_NOT_FOUND));
        }
        Ok(PackageInfo {
            name: package.to_string(),
            max_token_len: self.max_token_len,
        })
    }

    fn acquire_credentials(
        &mut self,
        _package: &str,
        direction: CredentialDirection,
    ) -> Result<Self::Credential, Status> {
        if self.failing(FailPoint::AcquireCredentials) {
            return Err(Status::Fatal(codes::NO_CREDENTIALS));
        }
        self.next_id += 1;
        self.acquired.push(self.next_id);
        Ok(MockCredential {
            id: self.next_id,
            direction,
        })
    }

    fn query_credentials(
        &mut self,
        _credential: &Self::Credential,
        query: CredentialQuery,
    ) -> Result<CredentialAttribute, Status> {
        if self.failing(FailPoint::Query(query)) {
            return Err(Status::Fatal(codes::UNSUPPORTED_FUNCTION));
        }
        Ok(match query {
            CredentialQuery::SupportedAlgorithms => {
                CredentialAttribute::Algorithms(vec!["MOCK-XOR".to_string()])
            },
            CredentialQuery::CipherStrengths => CredentialAttribute::CipherStrengths {
                min_bits: 8,
                max_bits: 8,
            },
            CredentialQuery::SupportedProtocols => {
                CredentialAttribute::Protocols(vec!["mock/1".to_string()])
            },
        })
    }

    fn release_credentials(&mut self, credential: Self::Credential) {
        self.released.push(credential.id);
    }

    fn initialize_context(
        &mut self,
        _credential: &Self::Credential,
        context: &mut Option<Self::Context>,
        _peer_name: &str,
        input: &[u8],
    ) -> InitOutput {
        self.inputs.push(input.to_vec());
        if context.is_none() {
            self.contexts_created += 1;
            *context = Some(MockContext {
                id: self.contexts_created,
                handshakes: 0,
            });
        }

        // Unscripted steps succeed without consuming any input
        let step = self
            .script
            .pop_front()
            .unwrap_or_else(|| HandshakeStep::new(Status::Success, &[]).with_extra(input.len()));
        if step.status == Status::Success {
            if let Some(ctx) = context.as_mut() {
                ctx.handshakes += 1;
            }
        }
        InitOutput::with_token(step.status, step.token).with_extra(step.extra)
    }

    fn query_frame_sizing(&mut self, _context: &Self::Context) -> Result<FrameSizing, Status> {
        if self.failing(FailPoint::FrameSizing) {
            return Err(Status::Fatal(codes::INVALID_HANDLE));
        }
        Ok(self.sizing())
    }

    fn decrypt(&mut self, _context: &mut Self::Context, data: &mut [u8]) -> DecryptOutput {
        self.decrypt_calls += 1;
        self.decrypt_inputs.push(data.to_vec());
        match self.forced_decrypts.pop_front() {
            Some(output) => output,
            None => open(data, self.max_chunk_len),
        }
    }

    fn encrypt(
        &mut self,
        _context: &mut Self::Context,
        header_region: &mut [u8],
        data: &mut [u8],
        trailer: &mut [u8],
    ) -> Status {
        self.encrypt_calls += 1;
        if self.failing(FailPoint::Encrypt)
            || header_region.len() != MOCK_HEADER_LEN
            || trailer.len() != MOCK_TRAILER_LEN
            || data.len() > self.max_chunk_len
        {
            return Status::Fatal(codes::ENCRYPT_FAILURE);
        }

        header_region.copy_from_slice(&header(KIND_DATA, data.len()));
        trailer.copy_from_slice(&checksum(data).to_be_bytes());
        for b in data.iter_mut() {
            *b ^= MASK;
        }
        Status::Success
    }

    fn delete_context(&mut self, _context: Self::Context) {
        self.contexts_deleted += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_reads_one_chunk_at_a_time() {
        let mut socket = ScriptedSocket::new();
        socket.push_incoming(b"abc");
        socket.push_incoming(b"def");

        let mut buf = [0u8; 16];
        assert_eq!(socket.read(&mut buf), Ok(3));
        assert_eq!(&buf[..3], b"abc");

        let mut small = [0u8; 2];
        assert_eq!(socket.read(&mut small), Ok(2));
        assert_eq!(socket.read(&mut small), Ok(1));
        assert_eq!(socket.read(&mut small), Err(ErrorCode::WouldBlock));
    }

    #[test]
    fn test_socket_close_is_sticky() {
        let mut socket = ScriptedSocket::new();
        socket.push_close();
        let mut buf = [0u8; 4];
        assert_eq!(socket.read(&mut buf), Ok(0));
        assert_eq!(socket.read(&mut buf), Ok(0));
    }

    #[test]
    fn test_socket_write_plan() {
        let mut socket = ScriptedSocket::new();
        socket.limit_next_write(2);
        socket.fail_next_write(ErrorCode::ConnectionReset);

        assert_eq!(socket.write(b"hello"), Ok(2));
        assert_eq!(socket.write(b"llo"), Err(ErrorCode::ConnectionReset));
        assert_eq!(socket.last_error(), ErrorCode::ConnectionReset);
        assert_eq!(socket.write(b"llo"), Ok(3));
        assert_eq!(socket.written(), b"hello");
    }

    #[test]
    fn test_seal_and_open() {
        let record = ScriptedProvider::seal(b"mock data");
        assert_eq!(record.len(), MOCK_HEADER_LEN + 9 + MOCK_TRAILER_LEN);
        assert_eq!(&record[..4], &[0xA5, 0x17, 0x00, 0x09]);

        let mut stream = record.clone();
        stream.extend_from_slice(&ScriptedProvider::seal(b"more"));
        let records = ScriptedProvider::open_records(&stream).unwrap();
        assert_eq!(records, vec![b"mock data".to_vec(), b"more".to_vec()]);
    }

    #[test]
    fn test_open_detects_corruption() {
        let mut record = ScriptedProvider::seal(b"abc");
        record[5] ^= 0xFF;
        assert_eq!(
            ScriptedProvider::open_records(&record),
            Err(Status::Fatal(codes::DECRYPT_FAILURE))
        );
    }

    #[test]
    fn test_renegotiate_marker() {
        let mut provider = ScriptedProvider::new();
        let mut ctx = MockContext {
            id: 1,
            handshakes: 1,
        };
        let mut data = ScriptedProvider::renegotiate_marker();
        data.extend_from_slice(b"xy");
        let out = provider.decrypt(&mut ctx, &mut data);
        assert_eq!(out.status, Status::RenegotiateRequested);
        assert_eq!(out.extra, Some(6..8));
    }

    #[test]
    fn test_empty_script_succeeds_immediately() {
        let mut provider = ScriptedProvider::new();
        let cred = provider
            .acquire_credentials("mock", CredentialDirection::Outbound)
            .unwrap();
        let mut ctx = None;
        let out = provider.initialize_context(&cred, &mut ctx, "peer", &[]);
        assert_eq!(out.status, Status::Success);
        assert_eq!(ctx.map(|c| c.handshakes), Some(1));
    }
}
