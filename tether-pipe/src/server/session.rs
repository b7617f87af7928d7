//! Device event loop and the async server accepting hosts.
//!
//! One session is `handshake → (read request → dispatch → write reply)*`.
//! It ends after answering `quit`, when the host closes the stream, or on
//! the first I/O failure (without a reply). However it ends, the filesystem
//! is told through [`LocalFs::end_session`] so handles the host left open are
//! closed.

use std::io::{Read, Write};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::{DispatchTable, LocalFs, PassthroughFs, ServerConfig};
use crate::protocol::{
    negotiate, negotiate_async, read_message, read_message_async, write_message,
    write_message_async, OpCode, Packet, ProtocolError, Result, Role, PROTOCOL_VERSION,
};
use crate::transport::{Endpoint, Listener};

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Host sent `quit`.
    Quit,
    /// Host closed the stream.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub requests: u64,
    pub end: SessionEnd,
}

/// A filesystem plus the table routing requests into it.
///
/// Clones share the filesystem, so a device serves one session at a time.
/// [`DeviceServer`] builds a fresh one per host.
pub struct Device<F> {
    fs: Arc<F>,
    table: Arc<DispatchTable<F>>,
    version: u32,
}

impl<F> Clone for Device<F> {
    fn clone(&self) -> Self {
        Self {
            fs: Arc::clone(&self.fs),
            table: Arc::clone(&self.table),
            version: self.version,
        }
    }
}

impl<F: LocalFs + 'static> Device<F> {
    pub fn new(fs: F) -> Self {
        Self::with_table(fs, DispatchTable::new())
    }

    pub fn with_table(fs: F, table: DispatchTable<F>) -> Self {
        Self {
            fs: Arc::new(fs),
            table: Arc::new(table),
            version: PROTOCOL_VERSION,
        }
    }

    /// Announce a different protocol version in the handshake.
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    /// Answer one request. Op codes outside the enumeration get `ENOSYS`.
    pub fn handle(&self, request: &Packet) -> Packet {
        if !request.header.is_host() {
            warn!(target: "tether-pipe::server", op = request.header.op_code, "request not flagged as host packet");
        }
        match self.table.dispatch(&self.fs, request) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(target: "tether-pipe::server", op = request.header.op_code, error = %e, "rejected request");
                Packet::error_reply(request.header.op_code, e.errno())
            }
        }
    }

    /// Run a blocking session over `stream`.
    pub fn serve<S: Read + Write>(&self, stream: &mut S) -> Result<SessionSummary> {
        let result = self.run(stream);
        self.fs.end_session();
        result
    }

    fn run<S: Read + Write>(&self, stream: &mut S) -> Result<SessionSummary> {
        negotiate(stream, Role::Device, self.version)?;
        let mut requests = 0u64;
        loop {
            let request = match read_message(stream) {
                Ok(request) => request,
                Err(ProtocolError::Closed) => return Ok(summary(requests, SessionEnd::Closed)),
                Err(e) => return Err(e),
            };
            requests += 1;
            let reply = self.handle(&request);
            write_message(stream, &reply.header, &reply.payload)?;
            if request.header.op_code == OpCode::Quit.as_u8() {
                return Ok(summary(requests, SessionEnd::Quit));
            }
        }
    }

    /// Run a session over an async stream. Each request is executed on the
    /// blocking pool.
    pub async fn serve_async<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
    ) -> Result<SessionSummary> {
        let result = self.run_async(stream).await;
        let device = self.clone();
        if tokio::task::spawn_blocking(move || device.fs.end_session())
            .await
            .is_err()
        {
            warn!(target: "tether-pipe::server", "session cleanup panicked");
        }
        result
    }

    async fn run_async<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
    ) -> Result<SessionSummary> {
        negotiate_async(stream, Role::Device, self.version).await?;
        let mut requests = 0u64;
        loop {
            let request = match read_message_async(stream).await {
                Ok(request) => request,
                Err(ProtocolError::Closed) => return Ok(summary(requests, SessionEnd::Closed)),
                Err(e) => return Err(e),
            };
            requests += 1;
            let op_code = request.header.op_code;

            let device = self.clone();
            let reply = tokio::task::spawn_blocking(move || device.handle(&request))
                .await
                .unwrap_or_else(|_| Packet::error_reply(op_code, libc::EIO));
            write_message_async(stream, &reply.header, &reply.payload).await?;

            if op_code == OpCode::Quit.as_u8() {
                return Ok(summary(requests, SessionEnd::Quit));
            }
        }
    }
}

fn summary(requests: u64, end: SessionEnd) -> SessionSummary {
    debug!(target: "tether-pipe::server", requests, ?end, "session finished");
    SessionSummary { requests, end }
}

type FsFactory<F> = Arc<dyn Fn() -> F + Send + Sync>;

/// Accepts hosts and runs a session for each, at most `max_sessions` at once.
/// Every session gets its own filesystem instance from the factory.
pub struct DeviceServer<F> {
    make_fs: FsFactory<F>,
    table: Arc<DispatchTable<F>>,
    config: ServerConfig,
}

impl DeviceServer<PassthroughFs> {
    /// Serve `config.root` through a [`PassthroughFs`].
    pub fn passthrough(config: ServerConfig) -> Self {
        let root = config.root.clone();
        let read_only = config.read_only;
        Self::with_config(
            move || PassthroughFs::new(root.clone()).read_only(read_only),
            config,
        )
    }
}

impl<F: LocalFs + 'static> DeviceServer<F> {
    pub fn new(make_fs: impl Fn() -> F + Send + Sync + 'static) -> Self {
        Self::with_config(make_fs, ServerConfig::default())
    }

    pub fn with_config(
        make_fs: impl Fn() -> F + Send + Sync + 'static,
        config: ServerConfig,
    ) -> Self {
        Self {
            make_fs: Arc::new(make_fs),
            table: Arc::new(DispatchTable::new()),
            config,
        }
    }

    fn session_device(&self) -> Device<F> {
        Device {
            fs: Arc::new((self.make_fs)()),
            table: Arc::clone(&self.table),
            version: self.config.protocol_version,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind `endpoint` and serve forever.
    pub async fn serve(self, endpoint: &Endpoint) -> anyhow::Result<()> {
        let listener = Listener::bind(endpoint).await?;
        info!(target: "tether-pipe::server", %endpoint, root = %self.config.root.display(), "listening");
        self.serve_listener(listener).await
    }

    /// Serve hosts arriving on an already bound listener.
    pub async fn serve_listener(self, listener: Listener) -> anyhow::Result<()> {
        let permits = Arc::new(Semaphore::new(self.config.max_sessions.max(1)));
        let mut session_id = 0u64;

        loop {
            let permit = Arc::clone(&permits).acquire_owned().await?;
            let (mut stream, peer) = listener.accept().await?;
            let device = self.session_device();
            let id = session_id;
            session_id += 1;

            info!(target: "tether-pipe::server", session = id, %peer, "host connected");

            tokio::spawn(async move {
                match device.serve_async(&mut stream).await {
                    Ok(s) => {
                        info!(target: "tether-pipe::server", session = id, requests = s.requests, end = ?s.end, "host disconnected")
                    }
                    Err(e) => {
                        error!(target: "tether-pipe::server", session = id, error = %e, "session failed")
                    }
                }
                drop(permit);
            });
        }
    }
}
