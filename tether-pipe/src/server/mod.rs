//! Device side: answers host requests against a local filesystem.
//!
//! - [`LocalFs`]: the effect layer a request ends up in
//! - [`PassthroughFs`]: serves a directory tree of the device
//! - [`DispatchTable`]: one handler per op code, decoding arguments and
//!   encoding replies
//! - [`Device`] / [`DeviceServer`]: the session loop and the listener
//!   running it per host

mod config;
mod dispatch;
mod handler;
mod passthrough;
mod session;

pub use config::ServerConfig;
pub use dispatch::{not_supported, DispatchTable, Handler, MAX_READ_SIZE};
pub use handler::{DirFiller, LocalFs, XattrReply};
pub use passthrough::PassthroughFs;
pub use session::{Device, DeviceServer, SessionEnd, SessionSummary};
