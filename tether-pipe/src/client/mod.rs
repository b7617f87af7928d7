//! Host side: connects to a device and issues filesystem operations.
//!
//! [`Connection`] carries the raw `remote_call` / `remote_answer` pair;
//! [`RemoteFs`] wraps it in one typed method per operation. With the
//! `fuse-client` feature, [`FuseClient`] exposes a `RemoteFs` to the kernel
//! and [`mount`] puts it on a mount point.
//!
//! ```rust,ignore
//! use tether_pipe::client::{connect, ClientConfig, RemoteFs};
//!
//! let endpoint = "abstract:dfuse.socket".parse()?;
//! let mut fs = RemoteFs::new(connect(&endpoint, &ClientConfig::default())?);
//! let stat = fs.getattr("/etc/hostname".as_ref())?;
//! fs.quit()?;
//! ```

mod connection;
mod remote;

#[cfg(feature = "fuse-client")]
mod fuse;
#[cfg(feature = "fuse-client")]
mod mount;

pub use connection::{connect, ClientConfig, Connection};
pub use remote::{RemoteFs, XattrValue};

#[cfg(feature = "fuse-client")]
pub use fuse::{FuseClient, InodeTable};
#[cfg(feature = "fuse-client")]
pub use mount::{mount, mount_spawn, MountConfig, MountHandle};
