use anyhow::Result;

use crate::cli::MountArgs;

#[cfg(feature = "fuse-client")]
pub async fn cmd_mount(args: MountArgs) -> Result<()> {
    use anyhow::Context;
    use tether_pipe::MountConfig;
    use tracing::info;

    info!(
        endpoint = %args.connect,
        mountpoint = %args.mountpoint.display(),
        "tetherfs mount"
    );
    let config = MountConfig::new()
        .fsname(args.fsname)
        .allow_other(args.allow_other);

    tokio::task::spawn_blocking(move || {
        tether_pipe::mount(&args.connect, &args.mountpoint, config)
    })
    .await
    .context("mount thread failed")?
}

#[cfg(not(feature = "fuse-client"))]
pub async fn cmd_mount(args: MountArgs) -> Result<()> {
    anyhow::bail!(
        "cannot mount {}: tetherfs was built without the `fuse-client` feature",
        args.mountpoint.display()
    )
}
