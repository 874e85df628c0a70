//! # Streamseal - Byte-Stream Encrypted Sockets
//!
//! Turns a message-oriented secure-channel provider into an encrypted socket
//! with ordinary `read`/`write` semantics.
//!
//! ## Features
//!
//! - **Handshake negotiation**: drives the provider's context loop over any socket
//! - **Record framing**: fragments writes into provider-sized sealed records
//! - **Stream reassembly**: partial records, carried-over bytes and renegotiation
//!   are absorbed below `read`
//! - **Pluggable providers**: [`SecureTransport`] trait with a real
//!   X25519 / ChaCha20-Poly1305 backend and a scripted test double
//!
//! ## Architecture
//!
//! ```text
//!            application
//!         read ▲      │ write
//!              │      ▼
//!  ┌───────────────────────────────────┐
//!  │             Session               │
//!  │  ready ◄─ recv        send        │
//!  │  window   window      window      │
//!  └────┬───────────┬──────────┬───────┘
//!       │ decrypt   │ read     │ write
//!       │ encrypt   │          │
//!  ┌────▼─────┐ ┌───▼──────────▼──┐
//!  │ Provider │ │     Socket      │
//!  └──────────┘ └─────────────────┘
//! ```
//!
//! ### Session States
//!
//! ```text
//!     [Acquired] ──start()──> [Negotiating] ──> [Established]
//!         │                        │               │   ▲
//!         │                        │               └───┘ renegotiation
//!         v                        v
//!      [Failed] <──────────────────┘     close() ──> [Closed]
//! ```
//!
//! ### Error Classes
//!
//! | Class         | Examples                                         | Caller action       |
//! |---------------|--------------------------------------------------|---------------------|
//! | Recoverable   | `WouldBlock`, `IncompleteMessage`, renegotiation | retry the same call |
//! | Fatal         | peer reset, provider rejection, handshake timeout | drop the session    |
//! | Unsupported   | certificate and channel-binding probes           | none                |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use streamseal::{Config, SealedTransport, Session, TcpSocket};
//!
//! let mut socket = TcpSocket::connect("127.0.0.1:4433")?;
//! let mut session = Session::connect(&mut socket, SealedTransport::new(), "echo.local", &Config::default())?;
//!
//! session.write(b"hello")?;
//! let mut buf = [0u8; 64];
//! loop {
//!     match session.read(&mut buf) {
//!         Ok(n) => { println!("{}", String::from_utf8_lossy(&buf[..n])); break; }
//!         Err(e) if e.is_recoverable() => { session.socket_mut().poll_readable(Duration::from_millis(50)); }
//!         Err(e) => return Err(e.into()),
//!     }
//! }
//! ```
//!
//! ## Modules
//!
//! - [`session`]: Session lifecycle, handshake, read and write pipelines
//! - [`provider`]: Secure-transport provider trait and the sealed backend
//! - [`socket`]: Socket trait and non-blocking TCP socket
//! - [`window`]: Byte window with fill and drain cursors
//! - [`mock`]: Scripted socket and provider
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod config;
pub mod error;
pub mod mock;
pub mod provider;
pub mod session;
pub mod socket;
pub mod window;

// Re-exports for convenience
pub use config::{Config, HandshakeConfig, HandshakeTiming};
pub use error::{ErrorCode, Result, SealError};
pub use provider::{
    CredentialAttribute, CredentialDirection, CredentialQuery, FrameSizing, SecureTransport,
    Status,
};
#[cfg(feature = "crypto")]
pub use provider::{SealedError, SealedTransport};
pub use session::{Session, SessionState, SessionStats};
pub use socket::{Socket, TcpSocket};
pub use window::ByteWindow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
