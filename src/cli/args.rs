use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use tether_pipe::Endpoint;

#[derive(Parser, Debug)]
#[command(
    name = "tetherfs",
    version,
    about = "Proxy POSIX filesystem operations from a host to a remote device"
)]
pub struct Cli {
    /// Raise the default log level (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve a directory tree to hosts
    Device(DeviceArgs),
    /// Mount a device through FUSE
    Mount(MountArgs),
    /// Print the attributes of a remote path
    Stat(PathArgs),
    /// List a remote directory
    Ls(PathArgs),
    /// Write a remote file to stdout
    Cat(PathArgs),
    /// Print filesystem usage of a remote path
    Df(PathArgs),
}

#[derive(Args, Debug)]
pub struct DeviceArgs {
    /// Endpoint to listen on (unix:PATH, abstract:NAME, tcp:HOST:PORT)
    #[arg(long, default_value = "abstract:dfuse.socket")]
    pub listen: Endpoint,

    /// Directory served to hosts [default: /]
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Refuse every mutating operation
    #[arg(long)]
    pub read_only: bool,

    /// Hosts served at the same time
    #[arg(long)]
    pub max_sessions: Option<usize>,

    /// JSON config file; flags given on the command line take precedence
    #[arg(long, env = "TETHERFS_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct MountArgs {
    /// Device endpoint
    #[arg(long, default_value = "abstract:dfuse.socket")]
    pub connect: Endpoint,

    /// Where to mount
    pub mountpoint: PathBuf,

    /// Name shown as the mount source
    #[arg(long, default_value = "tetherfs")]
    pub fsname: String,

    /// Let other users access the mount
    #[arg(long)]
    pub allow_other: bool,
}

#[derive(Args, Debug)]
pub struct PathArgs {
    /// Device endpoint
    #[arg(long, default_value = "abstract:dfuse.socket")]
    pub connect: Endpoint,

    /// Path on the device
    pub path: PathBuf,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,

    /// Socket read/write timeout in seconds (0 disables)
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,
}
