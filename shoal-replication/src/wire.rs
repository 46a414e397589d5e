//! Peer connection abstraction and RESP bulk formatting.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use shoal_common::error::{ShoalError, ShoalResult};

/// Framed, blocking link to the migration destination.
///
/// Timed-out reads surface as `ShoalError::Network`; the `Timeout` error kind
/// is reserved for the catch-up iteration budget.
pub trait PeerConnection: Send {
    /// Writes the full payload.
    ///
    /// # Errors
    ///
    /// Returns `ShoalError::Network` on any write failure.
    fn write_data(&mut self, payload: &[u8]) -> ShoalResult<()>;

    /// Reads exactly `len` bytes within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `ShoalError::Network` on read failure or timeout.
    fn read_exact(&mut self, len: usize, timeout: Duration) -> ShoalResult<Vec<u8>>;

    /// Reads one `\r\n`-terminated line within `timeout`, terminator stripped.
    ///
    /// # Errors
    ///
    /// Returns `ShoalError::Network` on read failure or timeout.
    fn read_line(&mut self, timeout: Duration) -> ShoalResult<String>;

    /// Human-readable remote endpoint, for logs.
    fn remote_repr(&self) -> String;
}

/// Blocking TCP implementation of [`PeerConnection`].
#[derive(Debug)]
pub struct TcpPeerConnection {
    stream: TcpStream,
    peer: String,
}

impl TcpPeerConnection {
    /// Connects to the destination endpoint.
    ///
    /// # Errors
    ///
    /// Returns `ShoalError::Network` when the connection cannot be opened.
    pub fn connect<A: ToSocketAddrs + std::fmt::Display>(addr: A) -> ShoalResult<Self> {
        let peer = addr.to_string();
        let stream = TcpStream::connect(addr)
            .map_err(|error| ShoalError::Network(format!("connect {peer} failed: {error}")))?;
        stream
            .set_nodelay(true)
            .map_err(|error| ShoalError::Network(format!("set_nodelay failed: {error}")))?;
        Ok(Self { stream, peer })
    }

    /// Wraps an already-connected stream.
    #[must_use]
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map_or_else(|_| "unknown".to_owned(), |addr| addr.to_string());
        Self { stream, peer }
    }

    fn apply_read_timeout(&mut self, timeout: Duration) -> ShoalResult<()> {
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(|error| ShoalError::Network(format!("set_read_timeout failed: {error}")))
    }

    fn map_read_error(&self, error: &std::io::Error) -> ShoalError {
        match error.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                ShoalError::Network(format!("read from {} timed out", self.peer))
            }
            _ => ShoalError::Network(format!("read from {} failed: {error}", self.peer)),
        }
    }
}

impl PeerConnection for TcpPeerConnection {
    fn write_data(&mut self, payload: &[u8]) -> ShoalResult<()> {
        self.stream
            .write_all(payload)
            .map_err(|error| ShoalError::Network(format!("write to {} failed: {error}", self.peer)))
    }

    fn read_exact(&mut self, len: usize, timeout: Duration) -> ShoalResult<Vec<u8>> {
        self.apply_read_timeout(timeout)?;
        let mut buffer = vec![0_u8; len];
        self.stream
            .read_exact(&mut buffer)
            .map_err(|error| self.map_read_error(&error))?;
        Ok(buffer)
    }

    fn read_line(&mut self, timeout: Duration) -> ShoalResult<String> {
        self.apply_read_timeout(timeout)?;
        let mut line = Vec::new();
        let mut byte = [0_u8; 1];
        loop {
            self.stream
                .read_exact(&mut byte)
                .map_err(|error| self.map_read_error(&error))?;
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        if line.last() == Some(&b'\r') {
            let _ = line.pop();
        }
        String::from_utf8(line)
            .map_err(|_| ShoalError::Network(format!("non-UTF-8 line from {}", self.peer)))
    }

    fn remote_repr(&self) -> String {
        self.peer.clone()
    }
}

/// Appends a RESP multi-bulk header `*<len>\r\n`.
pub fn fmt_multi_bulk_len(output: &mut Vec<u8>, len: usize) {
    output.push(b'*');
    output.extend_from_slice(len.to_string().as_bytes());
    output.extend_from_slice(b"\r\n");
}

/// Appends one RESP bulk string `$<len>\r\n<payload>\r\n`.
pub fn fmt_bulk(output: &mut Vec<u8>, payload: &[u8]) {
    output.push(b'$');
    output.extend_from_slice(payload.len().to_string().as_bytes());
    output.extend_from_slice(b"\r\n");
    output.extend_from_slice(payload);
    output.extend_from_slice(b"\r\n");
}
