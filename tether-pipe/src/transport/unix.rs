//! Unix socket transport implementation.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use super::{Transport, TransportError};

/// A blocking Unix socket connection.
#[derive(Debug)]
pub struct UnixTransport {
    stream: UnixStream,
}

impl UnixTransport {
    /// Connect to a Unix socket at the given path.
    pub fn connect<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        Ok(Self { stream })
    }

    /// Connect to a socket in the Linux abstract namespace.
    #[cfg(target_os = "linux")]
    pub fn connect_abstract(name: &str) -> Result<Self, TransportError> {
        use std::os::linux::net::SocketAddrExt;

        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
        let stream = UnixStream::connect_addr(&addr)?;
        Ok(Self { stream })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn connect_abstract(_name: &str) -> Result<Self, TransportError> {
        Err(TransportError::NotSupported)
    }

    /// Create a transport from an existing UnixStream.
    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// A connected pair, handy for running both ends in one process.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_stream(a), Self::from_stream(b)))
    }

    pub fn get_ref(&self) -> &UnixStream {
        &self.stream
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
        })
    }
}

impl Read for UnixTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for UnixTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl AsRawFd for UnixTransport {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Transport for UnixTransport {
    fn set_io_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)
    }
}

/// An async Unix socket listener. A path socket is unlinked again on drop.
pub struct UnixListener {
    listener: tokio::net::UnixListener,
    path: Option<PathBuf>,
}

impl UnixListener {
    /// Bind to a Unix socket path, replacing a stale socket file.
    pub fn bind<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let _ = std::fs::remove_file(path);
        let listener = tokio::net::UnixListener::bind(path)?;
        debug!(target: "tether-pipe::transport", path = %path.display(), "bound unix socket");
        Ok(Self {
            listener,
            path: Some(path.to_path_buf()),
        })
    }

    /// Bind a socket in the Linux abstract namespace.
    #[cfg(target_os = "linux")]
    pub fn bind_abstract(name: &str) -> Result<Self, TransportError> {
        use std::os::linux::net::SocketAddrExt;

        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
        let std_listener = std::os::unix::net::UnixListener::bind_addr(&addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = tokio::net::UnixListener::from_std(std_listener)?;
        debug!(target: "tether-pipe::transport", name, "bound abstract socket");
        Ok(Self {
            listener,
            path: None,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn bind_abstract(_name: &str) -> Result<Self, TransportError> {
        Err(TransportError::NotSupported)
    }

    pub async fn accept(&self) -> io::Result<tokio::net::UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }
}

impl Drop for UnixListener {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}
