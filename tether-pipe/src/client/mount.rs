//! Mounting a device through FUSE.

use std::path::Path;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use fuser::{MountOption, SessionUnmounter};
use tracing::{debug, error, info};

use super::{connect, ClientConfig, FuseClient, RemoteFs};
use crate::transport::Endpoint;

/// Configuration for a FUSE mount.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Name shown as the mount source.
    pub fsname: String,
    /// Let other users access the mount (needs `user_allow_other` unless root).
    pub allow_other: bool,
    pub client: ClientConfig,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            fsname: "tetherfs".to_string(),
            allow_other: false,
            client: ClientConfig::default(),
        }
    }
}

impl MountConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fsname(mut self, name: impl Into<String>) -> Self {
        self.fsname = name.into();
        self
    }

    pub fn allow_other(mut self, allow: bool) -> Self {
        self.allow_other = allow;
        self
    }

    pub fn client(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    fn options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(self.fsname.clone()),
            MountOption::DefaultPermissions,
        ];
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        options
    }
}

/// Handle for a spawned mount. Unmounts when dropped.
pub struct MountHandle {
    thread: Option<JoinHandle<anyhow::Result<()>>>,
    unmounter: Option<SessionUnmounter>,
}

impl MountHandle {
    /// Wait for an external unmount (`fusermount3 -u`) without triggering one.
    pub fn join(mut self) -> anyhow::Result<()> {
        self.unmounter.take();
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| anyhow::anyhow!("mount thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if let Some(mut unmounter) = self.unmounter.take() {
            debug!(target: "tether-pipe::client", "unmounting");
            let _ = unmounter.unmount();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Connect to `endpoint` and mount it at `mount_point`. Blocks until the
/// filesystem is unmounted.
pub fn mount<P: AsRef<Path>>(
    endpoint: &Endpoint,
    mount_point: P,
    config: MountConfig,
) -> anyhow::Result<()> {
    mount_internal(endpoint, mount_point.as_ref(), &config, None)
}

/// Like [`mount`], but runs the session on a thread and returns once mounted.
pub fn mount_spawn<P: AsRef<Path> + Send + 'static>(
    endpoint: &Endpoint,
    mount_point: P,
    config: MountConfig,
) -> anyhow::Result<MountHandle> {
    let (tx, rx) = std::sync::mpsc::channel();
    let endpoint = endpoint.clone();

    let thread = thread::spawn(move || {
        mount_internal(&endpoint, mount_point.as_ref(), &config, Some(tx))
    });

    match rx.recv() {
        Ok(unmounter) => Ok(MountHandle {
            thread: Some(thread),
            unmounter: Some(unmounter),
        }),
        Err(_) => match thread.join() {
            Ok(Err(e)) => Err(e),
            _ => Err(anyhow::anyhow!("mount thread failed before mounting")),
        },
    }
}

fn mount_internal(
    endpoint: &Endpoint,
    mount_point: &Path,
    config: &MountConfig,
    unmounter_tx: Option<std::sync::mpsc::Sender<SessionUnmounter>>,
) -> anyhow::Result<()> {
    info!(target: "tether-pipe::client", %endpoint, "connecting");
    let conn = connect(endpoint, &config.client)
        .with_context(|| format!("connecting to {}", endpoint))?;
    let fs = FuseClient::new(RemoteFs::new(conn));

    let options = config.options();
    info!(target: "tether-pipe::client", ?options, "using mount options");
    let mut session = fuser::Session::new(fs, mount_point, &options)
        .with_context(|| format!("mounting at {}", mount_point.display()))?;
    info!(target: "tether-pipe::client", mount_point = %mount_point.display(), "mounted");

    if let Some(tx) = unmounter_tx {
        let _ = tx.send(session.unmount_callable());
    }

    let result = session.run();
    drop(session);
    if let Err(e) = result {
        error!(target: "tether-pipe::client", error = %e, "FUSE session failed");
        return Err(e.into());
    }
    debug!(target: "tether-pipe::client", "FUSE session exited");
    Ok(())
}
