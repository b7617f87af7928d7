//! Shared fixture: a device thread serving a temp directory over a socket
//! pair, and a `RemoteFs` connected to it.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;
use std::thread::{self, JoinHandle};

use tempfile::TempDir;
use tether_pipe::client::{ClientConfig, Connection, RemoteFs};
use tether_pipe::protocol::Result;
use tether_pipe::server::{Device, PassthroughFs, SessionSummary};
use tether_pipe::transport::UnixTransport;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    });
}

pub struct DeviceFixture {
    pub dir: TempDir,
    pub fs: RemoteFs<UnixTransport>,
    device: JoinHandle<Result<SessionSummary>>,
}

impl DeviceFixture {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Send `quit` and wait for the device loop to end.
    pub fn finish(mut self) -> SessionSummary {
        self.fs.quit().expect("quit");
        self.join()
    }

    /// Close the host end without `quit` and wait for the device loop.
    pub fn disconnect(self) -> SessionSummary {
        let DeviceFixture { dir, fs, device } = self;
        drop(fs);
        let summary = wait(device);
        drop(dir);
        summary
    }

    fn join(self) -> SessionSummary {
        wait(self.device)
    }
}

fn wait(device: JoinHandle<Result<SessionSummary>>) -> SessionSummary {
    device
        .join()
        .expect("device thread panicked")
        .expect("device session failed")
}

/// Device serving a fresh temp directory.
pub fn spawn_device() -> DeviceFixture {
    spawn_device_with(|root| PassthroughFs::new(root))
}

/// Device serving a fresh temp directory through a custom passthrough setup.
pub fn spawn_device_with(make_fs: impl FnOnce(&Path) -> PassthroughFs) -> DeviceFixture {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let device = Device::new(make_fs(dir.path()));

    let (host, mut dev) = UnixTransport::pair().expect("socketpair");
    let handle = thread::spawn(move || device.serve(&mut dev));

    let conn = Connection::establish(host, &ClientConfig::default()).expect("handshake");
    DeviceFixture {
        dir,
        fs: RemoteFs::new(conn),
        device: handle,
    }
}
