//! Puppet Service RPC - command line front end for the puppet service bridge.
//!
//! `serve` exposes an in-memory puppet over TCP; `watch` connects a session to
//! a running service and prints every event it re-raises.

mod serve;
mod watch;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "puppet-service-rpc")]
#[command(about = "Serve or watch a remote chat-automation puppet")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve an in-memory puppet
    Serve(serve::ServeArgs),
    /// Connect a session and print its events
    Watch(watch::WatchArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Command::Serve(serve_args) => serve::run(serve_args).await,
        Command::Watch(watch_args) => watch::run(watch_args).await,
    }
}
