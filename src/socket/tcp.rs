//! Non-blocking TCP socket.
//!
//! Wraps a `std::net::TcpStream` switched to non-blocking mode. Readiness is
//! polled by temporarily blocking on a zero-copy `peek` with a read timeout,
//! which gives `select`-style "wait up to N" semantics without an event loop.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::Socket;
use crate::error::ErrorCode;

/// Platform error numbers the recoverable set is defined over.
mod raw {
    #[cfg(target_os = "linux")]
    pub const IN_PROGRESS: Option<i32> = Some(115);
    #[cfg(target_os = "linux")]
    pub const MESSAGE_SIZE: Option<i32> = Some(90);

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    pub const IN_PROGRESS: Option<i32> = Some(36);
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    pub const MESSAGE_SIZE: Option<i32> = Some(40);

    // WSAEINPROGRESS / WSAEMSGSIZE
    #[cfg(windows)]
    pub const IN_PROGRESS: Option<i32> = Some(10036);
    #[cfg(windows)]
    pub const MESSAGE_SIZE: Option<i32> = Some(10040);

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        windows
    )))]
    pub const IN_PROGRESS: Option<i32> = None;
    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        windows
    )))]
    pub const MESSAGE_SIZE: Option<i32> = None;
}

/// Map an I/O error onto the shim's error codes.
pub(crate) fn classify(err: &io::Error) -> ErrorCode {
    match err.kind() {
        io::ErrorKind::WouldBlock => return ErrorCode::WouldBlock,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => return ErrorCode::ConnectionReset,
        io::ErrorKind::TimedOut => return ErrorCode::TimedOut,
        _ => {},
    }

    match err.raw_os_error() {
        Some(code) if Some(code) == raw::IN_PROGRESS => ErrorCode::InProgress,
        Some(code) if Some(code) == raw::MESSAGE_SIZE => ErrorCode::MessageSize,
        Some(code) => ErrorCode::Socket(code),
        None => ErrorCode::Socket(-1),
    }
}

/// Non-blocking TCP socket for sessions.
#[derive(Debug)]
pub struct TcpSocket {
    stream: TcpStream,
    last_error: ErrorCode,
}

impl TcpSocket {
    /// Wrap a connected stream, switching it to non-blocking mode.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            last_error: ErrorCode::Ok,
        })
    }

    /// Connect to `addr` and wrap the stream.
    pub fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        tracing::debug!("TCP connected to {}", stream.peer_addr()?);
        Self::new(stream)
    }

    /// Remote address.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }

    /// Unwrap the underlying stream (still non-blocking).
    pub fn into_inner(self) -> TcpStream {
        self.stream
    }

    fn record(&mut self, err: &io::Error) -> ErrorCode {
        let code = classify(err);
        self.last_error = code;
        code
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        // A zero read timeout is rejected by the OS
        let timeout = timeout.max(Duration::from_millis(1));
        self.stream.set_nonblocking(false)?;
        self.stream.set_read_timeout(Some(timeout))?;

        let mut probe = [0u8; 1];
        let ready = match self.stream.peek(&mut probe) {
            // Orderly close is readable too: the next read reports it
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(false)
            },
            Err(e) => Err(e),
        };

        // Non-blocking mode comes back even if clearing the timeout fails
        let cleared = self.stream.set_read_timeout(None);
        self.stream.set_nonblocking(true)?;
        cleared?;
        ready
    }
}

impl Socket for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ErrorCode> {
        match io::Read::read(&mut self.stream, buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.record(&e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, ErrorCode> {
        match io::Write::write(&mut self.stream, buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.record(&e)),
        }
    }

    fn poll_readable(&mut self, timeout: Duration) -> bool {
        match self.wait_readable(timeout) {
            Ok(ready) => ready,
            Err(e) => {
                let code = self.record(&e);
                tracing::debug!("poll_readable failed: {}", code);
                // Let the following read surface the error
                true
            },
        }
    }

    fn last_error(&self) -> ErrorCode {
        self.last_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    fn pair() -> (TcpSocket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpSocket::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_classify_kinds() {
        let err = io::Error::from(io::ErrorKind::WouldBlock);
        assert_eq!(classify(&err), ErrorCode::WouldBlock);

        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(classify(&err), ErrorCode::ConnectionReset);

        let err = io::Error::new(io::ErrorKind::Other, "custom");
        assert_eq!(classify(&err), ErrorCode::Socket(-1));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_classify_raw_codes() {
        assert_eq!(classify(&io::Error::from_raw_os_error(115)), ErrorCode::InProgress);
        assert_eq!(classify(&io::Error::from_raw_os_error(90)), ErrorCode::MessageSize);
        assert_eq!(classify(&io::Error::from_raw_os_error(111)), ErrorCode::Socket(111));
    }

    #[test]
    fn test_read_would_block_when_idle() {
        let (mut client, _server) = pair();
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf), Err(ErrorCode::WouldBlock));
        assert_eq!(client.last_error(), ErrorCode::WouldBlock);
        assert!(!client.poll_readable(Duration::from_millis(5)));
    }

    #[test]
    fn test_poll_restores_nonblocking() {
        let (mut client, _server) = pair();
        assert!(!client.poll_readable(Duration::from_millis(5)));

        let started = std::time::Instant::now();
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf), Err(ErrorCode::WouldBlock));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(client.get_ref().read_timeout().unwrap().is_none());
    }

    #[test]
    fn test_poll_then_read() {
        let (mut client, mut server) = pair();
        server.write_all(b"ping").unwrap();

        assert!(client.poll_readable(Duration::from_secs(2)));
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn test_orderly_close_reads_zero() {
        let (mut client, server) = pair();
        drop(server);

        assert!(client.poll_readable(Duration::from_secs(2)));
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf), Ok(0));
    }
}
