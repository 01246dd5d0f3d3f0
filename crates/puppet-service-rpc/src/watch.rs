//! `watch`: run a session against a service and print its events.

use anyhow::{Context, Result};
use clap::Args;
use puppet_service::config::PathsConfig;
use puppet_service::{
    ClientOptions, EventKind, MemoryWatermarkStore, PuppetSession, SessionOptions,
    SqliteWatermarkStore, TlsOptions, WatermarkStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Service endpoint as host:port
    #[arg(long, default_value = "127.0.0.1:8788")]
    pub endpoint: String,

    /// Token presented to the service
    #[arg(long, env = "PUPPET_SERVICE_TOKEN")]
    pub token: String,

    /// PEM file with the CA certificate (required unless the token is insecure_*)
    #[arg(long, requires = "server_name")]
    pub ca_cert: Option<PathBuf>,

    /// Identity the service must announce
    #[arg(long)]
    pub server_name: Option<String>,

    /// Watermark database (defaults to the user data directory)
    #[arg(long, conflicts_with = "no_persist")]
    pub watermark_db: Option<PathBuf>,

    /// Keep the watermark in memory only
    #[arg(long)]
    pub no_persist: bool,
}

impl WatchArgs {
    fn client_options(&self) -> Result<ClientOptions> {
        let options = ClientOptions::new(&self.endpoint, &self.token);
        let (Some(path), Some(name)) = (&self.ca_cert, &self.server_name) else {
            return Ok(options);
        };
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read CA certificate {}", path.display()))?;
        Ok(options.with_tls(TlsOptions::new(pem, name)))
    }

    fn watermark_store(&self) -> Result<Arc<dyn WatermarkStore>> {
        if self.no_persist {
            return Ok(Arc::new(MemoryWatermarkStore::new()));
        }
        let path = match &self.watermark_db {
            Some(path) => path.clone(),
            None => PathsConfig::default_watermark_db()?,
        };
        info!("Watermarks stored in {}", path.display());
        Ok(Arc::new(SqliteWatermarkStore::new(path)?))
    }
}

pub async fn run(args: WatchArgs) -> Result<()> {
    let options = SessionOptions::new(args.client_options()?);
    let session = PuppetSession::new(options, args.watermark_store()?);

    for kind in EventKind::ALL {
        session.events().on(kind, |event| {
            println!("{:?}", event);
        });
    }

    session.start().await?;
    info!("Watching {}", args.endpoint);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping session");
    if let Err(e) = session.stop().await {
        warn!("Session stop failed: {}", e);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        watch: WatchArgs,
    }

    #[test]
    fn test_insecure_token_needs_no_tls() {
        let cli = Cli::parse_from(["watch", "--token", "insecure_cli", "--no-persist"]);
        let options = cli.watch.client_options().unwrap();

        assert!(options.tls.is_none());
        assert!(options.validate().is_ok());
        assert!(cli.watch.watermark_store().is_ok());
    }

    #[test]
    fn test_ca_cert_requires_server_name() {
        let result = Cli::try_parse_from([
            "watch",
            "--token",
            "secret",
            "--ca-cert",
            "/tmp/ca.pem",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_ca_file_is_reported() {
        let cli = Cli::parse_from([
            "watch",
            "--token",
            "secret",
            "--ca-cert",
            "/nonexistent/ca.pem",
            "--server-name",
            "puppet.local",
        ]);
        let err = cli.watch.client_options().unwrap_err();
        assert!(err.to_string().contains("CA certificate"));
    }
}
