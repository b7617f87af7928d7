use anyhow::Result;
use tether_pipe::{DeviceServer, ServerConfig};
use tracing::info;

use crate::cli::DeviceArgs;

/// Merge the optional config file with command-line flags.
pub fn server_config(args: &DeviceArgs) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(root) = &args.root {
        config = config.root(root);
    }
    if args.read_only {
        config = config.read_only(true);
    }
    if let Some(n) = args.max_sessions {
        config = config.max_sessions(n);
    }
    Ok(config)
}

pub async fn cmd_device(args: DeviceArgs) -> Result<()> {
    let config = server_config(&args)?;
    info!(
        root = %config.root.display(),
        read_only = config.read_only,
        max_sessions = config.max_sessions,
        "tetherfs device"
    );

    let server = DeviceServer::passthrough(config);
    tokio::select! {
        result = server.serve(&args.listen) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl-C, shutting down");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::path::PathBuf;

    use crate::cli::{Cli, Commands};

    fn device_args(argv: &[&str]) -> DeviceArgs {
        match Cli::try_parse_from(argv).unwrap().cmd {
            Commands::Device(args) => args,
            other => panic!("expected device command, got {:?}", other),
        }
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        std::fs::write(&path, r#"{"root": "/data", "max_sessions": 4}"#).unwrap();

        let args = device_args(&[
            "tetherfs",
            "device",
            "--config",
            path.to_str().unwrap(),
            "--root",
            "/srv",
            "--read-only",
        ]);
        let config = server_config(&args).unwrap();
        assert_eq!(config.root, PathBuf::from("/srv"));
        assert_eq!(config.max_sessions, 4);
        assert!(config.read_only);
    }

    #[test]
    fn test_defaults_without_config() {
        let args = device_args(&["tetherfs", "device"]);
        let config = server_config(&args).unwrap();
        assert_eq!(config, ServerConfig::default());
    }
}
