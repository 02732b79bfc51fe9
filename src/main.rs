use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use muxd::config::Config;
use muxd::server::Server;

/// Terminal multiplexer server.
///
/// The full CLI front-end (attach UI, status tables) is a separate client
/// binary; this one only runs the server.
#[derive(Parser, Debug)]
#[command(name = "muxd", version, about)]
struct Args {
    /// Server name; namespaces the socket and state directory.
    #[arg(long)]
    name: Option<String>,

    /// Listen on this socket path instead of the default.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Log to stderr instead of the state-directory log file.
    #[arg(long)]
    foreground: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.name, args.socket);

    let filter = EnvFilter::try_from_env("MUXD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    if args.foreground {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        // The server outlives any terminal, so the log file is the ground
        // truth for what happened.
        std::fs::create_dir_all(&config.state_dir)
            .with_context(|| format!("create state dir {}", config.state_dir.display()))?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.log_path())
            .with_context(|| format!("open log file {}", config.log_path().display()))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(log))
            .with_ansi(false)
            .init();
    }

    let mut server = Server::new(config)?;
    server.run()
}
