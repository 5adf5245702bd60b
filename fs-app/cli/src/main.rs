//! `extfs` binary: image creation plus the interactive shell

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use log::debug;

mod commands;

#[derive(Parser)]
#[command(name = "extfs", version, about = "User-space ext2 engine with a mount-aware shell")]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG wins when set
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fresh single-group ext2 image
    Mkfs(commands::mkfs::MkfsArgs),

    /// Mount an image as `/` and read commands from stdin
    Shell(commands::shell::ShellArgs),
}

fn default_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter(cli.verbose)))
        .format_timestamp_millis()
        .init();
    debug!("extfs {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Mkfs(args) => commands::mkfs::run(args).await,
        Commands::Shell(args) => commands::shell::run(args).await,
    }
}
