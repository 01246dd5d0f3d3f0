//! `serve`: expose a [`MockPuppet`] to remote sessions.

use anyhow::Result;
use clap::Args;
use puppet_service::{MockPuppet, PuppetService, ServerOptions};
use std::sync::Arc;
use tracing::info;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    pub port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Token clients must present
    #[arg(long, env = "PUPPET_SERVICE_TOKEN")]
    pub token: String,

    /// Identity announced to clients
    #[arg(long)]
    pub server_name: Option<String>,

    /// Log the puppet in as this account before serving
    #[arg(long)]
    pub login: Option<String>,
}

impl ServeArgs {
    fn server_options(&self) -> ServerOptions {
        let options = ServerOptions::new(format!("{}:{}", self.host, self.port), &self.token);
        match &self.server_name {
            Some(name) => options.with_server_name(name),
            None => options,
        }
    }
}

pub async fn run(args: ServeArgs) -> Result<()> {
    info!("Starting puppet service");

    let puppet = Arc::new(MockPuppet::new());
    if let Some(account) = &args.login {
        puppet.login(account);
        puppet.mark_ready();
    }

    let service = PuppetService::new(puppet);
    let mut handle = service.serve(args.server_options()).await?;

    // Print port for callers to read (intentional stdout)
    println!("PUPPET_SERVICE_PORT={}", handle.port);
    info!("Puppet service running on {}", handle.addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    handle.shutdown();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        serve: ServeArgs,
    }

    #[test]
    fn test_server_options_from_args() {
        let cli = Cli::parse_from([
            "serve",
            "--token",
            "insecure_cli",
            "--port",
            "8788",
            "--server-name",
            "puppet.local",
        ]);
        let options = cli.serve.server_options();

        assert_eq!(options.bind, "127.0.0.1:8788");
        assert_eq!(options.token, "insecure_cli");
        assert_eq!(options.server_name.as_deref(), Some("puppet.local"));
        assert!(options.validate().is_ok());
    }
}
