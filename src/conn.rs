//! Byte-stream connections to devices.
//!
//! Workers talk to a [`Link`] obtained from a [`Connector`], so transport
//! logic can be driven by a real [`TcpLink`] or by an in-memory script.
//! Synchronous: callers drive timing via `recv_timeout()`.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::Deserialize;

use crate::error::TransportError;

/// Shortest read timeout handed to the socket (zero means "block" to std).
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Host and port of one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Resolve to the first socket address.
    pub fn resolve(&self) -> Result<SocketAddr, TransportError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::Resolve { endpoint: self.to_string() })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A connected, bidirectional byte stream.
pub trait Link: Send {
    /// Write all of `data`.
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Wait up to `timeout` for data.
    ///
    /// Returns `Ok(None)` if nothing arrived in time and
    /// [`TransportError::Disconnected`] once the peer closed the stream.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError>;

    /// Close the stream. Errors are ignored.
    fn shutdown(&mut self);
}

/// Opens [`Link`]s. One connector per worker; called again on every reconnect.
pub trait Connector: Send {
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Link>, TransportError>;
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// TCP connection to a device.
pub struct TcpLink {
    stream: TcpStream,
    peer: SocketAddr,
    read_buf: [u8; 4096],
}

impl TcpLink {
    /// Connect with an explicit timeout.
    pub fn connect(addr: &SocketAddr, timeout: Duration) -> Result<Self, TransportError> {
        let stream = TcpStream::connect_timeout(addr, timeout)?;
        Ok(Self::from_stream(stream)?)
    }

    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        // Short text commands; disable Nagle to avoid latency.
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok(Self { stream, peer, read_buf: [0u8; 4096] })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl fmt::Debug for TcpLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcpLink({})", self.peer)
    }
}

impl Link for TcpLink {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(data)?;
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        self.stream.set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))?;
        match self.stream.read(&mut self.read_buf) {
            Ok(0) => Err(TransportError::Disconnected),
            Ok(n) => Ok(Some(self.read_buf[..n].to_vec())),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Opens [`TcpLink`]s with a connect timeout.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(5) }
    }
}

impl Connector for TcpConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Link>, TransportError> {
        let addr = endpoint.resolve()?;
        Ok(Box::new(TcpLink::connect(&addr, self.connect_timeout)?))
    }
}
