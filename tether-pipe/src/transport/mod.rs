//! Byte-stream transports between host and device.
//!
//! The protocol only needs a reliable, ordered, bidirectional stream. Two
//! carriers are provided:
//!
//! - **Unix sockets**, by path or in the Linux abstract namespace
//! - **TCP**, for devices reached through a port forward
//!
//! Endpoints are written as strings:
//!
//! ```text
//! unix:/run/tether.sock    path socket
//! /run/tether.sock         same, prefix omitted
//! abstract:dfuse.socket    abstract socket (Linux)
//! tcp:127.0.0.1:6666       TCP
//! ```

mod tcp;
mod unix;

use std::fmt;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

pub use tcp::{TcpListener, TcpTransport};
pub use unix::{UnixListener, UnixTransport};

/// Abstract socket name devices listen on by default.
pub const DEFAULT_SOCKET_NAME: &str = "dfuse.socket";

/// TCP port devices listen on by default.
pub const DEFAULT_TCP_PORT: u16 = 6666;

/// A blocking connection usable by the host client.
pub trait Transport: Read + Write + Send {
    /// Apply the same timeout to reads and writes. `None` blocks forever.
    fn set_io_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

/// An accepted async connection on the device side.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Transport error types.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid endpoint {0:?}: expected unix:PATH, abstract:NAME or tcp:HOST:PORT")]
    InvalidEndpoint(String),

    #[error("Transport not supported on this platform")]
    NotSupported,
}

impl From<TransportError> for io::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(e) => e,
            TransportError::InvalidEndpoint(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            TransportError::NotSupported => io::Error::new(io::ErrorKind::Unsupported, err),
        }
    }
}

/// Where a device listens or a host connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Abstract(String),
    Tcp(String),
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Abstract(DEFAULT_SOCKET_NAME.to_string())
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidEndpoint(s.to_string());
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(name) = s.strip_prefix("abstract:") {
            if name.is_empty() {
                return Err(invalid());
            }
            return Ok(Endpoint::Abstract(name.to_string()));
        }
        if let Some(addr) = s.strip_prefix("tcp:") {
            let addr = if addr.parse::<u16>().is_ok() {
                format!("127.0.0.1:{}", addr)
            } else {
                addr.to_string()
            };
            return match addr.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                    Ok(Endpoint::Tcp(addr))
                }
                _ => Err(invalid()),
            };
        }
        if s.is_empty() || s.contains(':') {
            return Err(invalid());
        }
        Ok(Endpoint::Unix(PathBuf::from(s)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Abstract(name) => write!(f, "abstract:{}", name),
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

impl Endpoint {
    /// Open a blocking connection to this endpoint.
    pub fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        Ok(match self {
            Endpoint::Unix(path) => Box::new(UnixTransport::connect(path)?),
            Endpoint::Abstract(name) => Box::new(UnixTransport::connect_abstract(name)?),
            Endpoint::Tcp(addr) => Box::new(TcpTransport::connect(addr)?),
        })
    }
}

/// A bound device-side listener.
pub enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    /// Bind `endpoint`. Must be called inside a tokio runtime.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, TransportError> {
        Ok(match endpoint {
            Endpoint::Unix(path) => Listener::Unix(UnixListener::bind(path)?),
            Endpoint::Abstract(name) => Listener::Unix(UnixListener::bind_abstract(name)?),
            Endpoint::Tcp(addr) => Listener::Tcp(TcpListener::bind(addr).await?),
        })
    }

    /// Wait for the next host. Returns the stream and a printable peer name.
    pub async fn accept(&self) -> io::Result<(Box<dyn AsyncStream>, String)> {
        match self {
            Listener::Unix(l) => {
                let stream = l.accept().await?;
                Ok((Box::new(stream), "unix".to_string()))
            }
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                Ok((Box::new(stream), peer.to_string()))
            }
        }
    }
}
