// Focused CLI parsing tests (tests command-line parsing only, not business logic)

use std::path::PathBuf;

use clap::Parser;
use tether_pipe::Endpoint;
use tetherfs::cli::{Cli, Commands};

#[test]
fn test_all_commands_parse() {
    let test_cases = vec![
        vec!["tetherfs", "device"],
        vec!["tetherfs", "device", "--listen", "unix:/tmp/dev.sock", "--root", "/srv"],
        vec!["tetherfs", "-v", "device", "--read-only", "--max-sessions", "4"],
        vec!["tetherfs", "mount", "/mnt/dev"],
        vec!["tetherfs", "mount", "--connect", "tcp:10.0.0.2:6666", "/mnt/dev", "--allow-other"],
        vec!["tetherfs", "stat", "/tmp/a"],
        vec!["tetherfs", "ls", "--json", "/"],
        vec!["tetherfs", "cat", "--connect", "abstract:dfuse.socket", "/etc/hostname"],
        vec!["tetherfs", "df", "/", "-vv"],
    ];

    for args in test_cases {
        Cli::try_parse_from(&args).unwrap_or_else(|e| panic!("Failed to parse {:?}: {}", args, e));
    }
}

#[test]
fn test_device_defaults() {
    let cli = Cli::try_parse_from(["tetherfs", "device"]).unwrap();
    assert_eq!(cli.verbose, 0);
    match cli.cmd {
        Commands::Device(d) => {
            assert_eq!(d.listen, Endpoint::default());
            assert!(d.root.is_none());
            assert!(!d.read_only);
            assert!(d.max_sessions.is_none());
        }
        _ => panic!("Expected Device command"),
    }
}

#[test]
fn test_device_with_all_options() {
    let args = vec![
        "tetherfs",
        "device",
        "--listen",
        "tcp:0.0.0.0:6666",
        "--root",
        "/data",
        "--read-only",
        "--max-sessions",
        "2",
        "--config",
        "/etc/tetherfs.json",
    ];

    let cli = Cli::try_parse_from(args).unwrap();
    match cli.cmd {
        Commands::Device(d) => {
            assert_eq!(d.listen, Endpoint::Tcp("0.0.0.0:6666".to_string()));
            assert_eq!(d.root, Some(PathBuf::from("/data")));
            assert!(d.read_only);
            assert_eq!(d.max_sessions, Some(2));
            assert_eq!(d.config, Some(PathBuf::from("/etc/tetherfs.json")));
        }
        _ => panic!("Expected Device command"),
    }
}

#[test]
fn test_mount_options() {
    let cli = Cli::try_parse_from([
        "tetherfs",
        "mount",
        "--connect",
        "/run/dev.sock",
        "--fsname",
        "phone",
        "/mnt/phone",
    ])
    .unwrap();
    match cli.cmd {
        Commands::Mount(m) => {
            assert_eq!(m.connect, Endpoint::Unix(PathBuf::from("/run/dev.sock")));
            assert_eq!(m.fsname, "phone");
            assert_eq!(m.mountpoint, PathBuf::from("/mnt/phone"));
            assert!(!m.allow_other);
        }
        _ => panic!("Expected Mount command"),
    }
}

#[test]
fn test_query_flags() {
    let cli = Cli::try_parse_from(["tetherfs", "-vv", "stat", "--json", "--timeout", "0", "/a"])
        .unwrap();
    assert_eq!(cli.verbose, 2);
    match cli.cmd {
        Commands::Stat(p) => {
            assert_eq!(p.path, PathBuf::from("/a"));
            assert!(p.json);
            assert_eq!(p.timeout, 0);
            assert_eq!(p.connect, Endpoint::default());
        }
        _ => panic!("Expected Stat command"),
    }
}

#[test]
fn test_invalid_arguments_rejected() {
    assert!(Cli::try_parse_from(["tetherfs"]).is_err());
    assert!(Cli::try_parse_from(["tetherfs", "stat"]).is_err());
    assert!(Cli::try_parse_from(["tetherfs", "mount"]).is_err());
    assert!(Cli::try_parse_from(["tetherfs", "ls", "--connect", "bogus:thing", "/"]).is_err());
    assert!(Cli::try_parse_from(["tetherfs", "device", "--max-sessions", "many"]).is_err());
}
