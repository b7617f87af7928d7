//! Proxying POSIX filesystem calls between a host and a device.
//!
//! `tether-pipe` provides both ends of a small request/reply protocol:
//!
//! - **Protocol**: 8-byte framed packets carrying self-describing tagged
//!   values, plus a version handshake
//! - **Server**: the device side, dispatching each request into a local
//!   filesystem
//! - **Client**: the host side, one typed call per filesystem operation
//! - **Transport**: Unix (path or abstract) and TCP sockets
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tether_pipe::{DeviceServer, Endpoint, ServerConfig};
//!
//! // Serve /srv to one host at a time
//! let server = DeviceServer::passthrough(ServerConfig::new().root("/srv"));
//! server.serve(&"abstract:dfuse.socket".parse::<Endpoint>()?).await?;
//! ```
//!
//! # Features
//!
//! - `fuse-client`: FUSE front-end adapter and mount helpers via `fuser`

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{connect, ClientConfig, Connection, RemoteFs};
pub use protocol::{
    FileInfo, FileStat, FsStat, OpCode, Packet, PacketHeader, ProtocolError, TimeSpec, Value,
    PROTOCOL_VERSION,
};
pub use server::{Device, DeviceServer, DispatchTable, LocalFs, PassthroughFs, ServerConfig};
pub use transport::{Endpoint, Listener, Transport};

#[cfg(feature = "fuse-client")]
pub use client::{mount, mount_spawn, MountConfig};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::client::{ClientConfig, RemoteFs};
    pub use crate::protocol::{FileInfo, FileStat, FsStat, OpCode, ProtocolError, TimeSpec};
    pub use crate::server::{LocalFs, PassthroughFs, ServerConfig};
    pub use crate::transport::Endpoint;
}
