use anyhow::Result;
use clap::Parser;
use tetherfs::cli::{Cli, Commands};
use tetherfs::commands;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    // Logs go to stderr so `cat` and `--json` output stay clean
    let use_color = atty::is(atty::Stream::Stderr);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(use_color)
        .init();

    let result = match cli.cmd {
        Commands::Device(args) => commands::cmd_device(args).await,
        Commands::Mount(args) => commands::cmd_mount(args).await,
        Commands::Stat(args) => commands::cmd_stat(args).await,
        Commands::Ls(args) => commands::cmd_ls(args).await,
        Commands::Cat(args) => commands::cmd_cat(args).await,
        Commands::Df(args) => commands::cmd_df(args).await,
    };

    if let Err(e) = &result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }

    result
}
