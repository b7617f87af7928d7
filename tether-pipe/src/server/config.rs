//! Device configuration.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::protocol::PROTOCOL_VERSION;

/// Configuration for a device serving a directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Directory that wire paths are resolved against.
    pub root: PathBuf,

    /// Refuse every mutating operation with `EROFS`.
    pub read_only: bool,

    /// Hosts served at the same time. Further connections wait.
    pub max_sessions: usize,

    /// Version announced in the handshake.
    pub protocol_version: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            read_only: false,
            max_sessions: 1,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.root = root.into();
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set the session limit (at least 1).
    pub fn max_sessions(mut self, n: usize) -> Self {
        self.max_sessions = n.max(1);
        self
    }

    pub fn protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }
}
