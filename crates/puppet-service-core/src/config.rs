//! Centralized configuration for the puppet service bridge.
//!
//! Timing constants are grouped by the component that owns them. Runtime
//! options (endpoint, credential, TLS material) live in plain structs with
//! builder-style setters.

use crate::error::{PuppetServiceError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Server-side event stream timing.
pub struct StreamConfig;

impl StreamConfig {
    /// Delay before re-announcing `ready` to a freshly attached subscriber.
    pub const READY_GRACE: Duration = Duration::from_secs(15);
    /// How long a client waits for the first heartbeat after the subscription ack.
    pub const FIRST_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Payload carried by the synthetic heartbeat sent on attach.
    pub const STREAM_READY_HEARTBEAT: &'static str = "stream ready";
}

/// Client-side reconnect timing.
pub struct ReconnectConfig;

impl ReconnectConfig {
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const RETRY_DELAY: Duration = Duration::from_secs(5);
    pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);
    pub const READY_TIMEOUT: Duration = Duration::from_secs(20);
    /// Retry budget is the operation timeout divided by this.
    pub const BUDGET_DIVISOR: u32 = 10;
}

/// Wire transport limits.
pub struct TransportConfig;

impl TransportConfig {
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(20 * 60);
    pub const MAX_CONNECTIONS: usize = 32;
    /// Tokens with this prefix are allowed over plaintext.
    pub const INSECURE_TOKEN_PREFIX: &'static str = "insecure_";
}

/// Client session state handling.
pub struct SessionConfig;

impl SessionConfig {
    /// A watermark older than this is discarded instead of resumed.
    pub const WATERMARK_STALE_AFTER: Duration = Duration::from_secs(15 * 60);
    pub const PAYLOAD_CACHE_TTL: Duration = Duration::from_secs(10 * 60);
    pub const PAYLOAD_CACHE_CAPACITY: u64 = 2048;
    /// Logout reason the server reports while the session shuts itself down.
    pub const STOP_LOGOUT_REASON: &'static str = "puppet stop()";
    /// Logout reason used for the synthetic logout of a full reset.
    pub const RESET_LOGOUT_REASON: &'static str = "reset";
    /// Logout reason raised for the previous account when another one logs in.
    pub const SWITCH_LOGOUT_REASON: &'static str = "account switched";
}

/// File box transfer.
pub struct FileBoxConfig;

impl FileBoxConfig {
    pub const CHUNK_SIZE: usize = 64 * 1024;
    /// Largest file a peer may announce for transfer.
    pub const MAX_FILE_SIZE: u64 = 256 * 1024 * 1024;
    /// Reassembly buffers start at most this big and grow with the data.
    pub const MAX_PREALLOCATION: usize = 16 * Self::CHUNK_SIZE;
}

/// Shared directory and file names.
pub struct PathsConfig;

impl PathsConfig {
    pub const DATA_DIR_NAME: &'static str = "puppet-service";
    pub const WATERMARK_DB_NAME: &'static str = "watermark.sqlite";
}

impl PathsConfig {
    /// Default location of the watermark database.
    pub fn default_watermark_db() -> Result<PathBuf> {
        let data_dir = dirs::data_dir().ok_or_else(|| PuppetServiceError::Config {
            message: "Could not determine the user data directory".to_string(),
        })?;
        Ok(data_dir
            .join(Self::DATA_DIR_NAME)
            .join(Self::WATERMARK_DB_NAME))
    }
}

/// Transport security material for non-plaintext deployments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    /// PEM encoded CA certificate.
    pub ca_cert_pem: String,
    /// Identity the server must present during the handshake.
    pub server_name: String,
}

impl TlsOptions {
    const PEM_BEGIN: &'static str = "-----BEGIN CERTIFICATE-----";
    const PEM_END: &'static str = "-----END CERTIFICATE-----";

    pub fn new(ca_cert_pem: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            ca_cert_pem: ca_cert_pem.into(),
            server_name: server_name.into(),
        }
    }

    /// Check the material is structurally usable before any connection is made.
    pub fn validate(&self) -> Result<()> {
        let pem = self.ca_cert_pem.trim();
        let body = pem
            .strip_prefix(Self::PEM_BEGIN)
            .and_then(|rest| rest.strip_suffix(Self::PEM_END))
            .ok_or_else(|| PuppetServiceError::InvalidTlsMaterial {
                message: "CA certificate is not a PEM certificate block".to_string(),
            })?;

        let body: String = body.chars().filter(|c| !c.is_whitespace()).collect();
        if body.is_empty()
            || !body
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        {
            return Err(PuppetServiceError::InvalidTlsMaterial {
                message: "CA certificate body is not base64".to_string(),
            });
        }

        if !is_valid_server_name(&self.server_name) {
            return Err(PuppetServiceError::InvalidTlsMaterial {
                message: format!("Invalid server name: {:?}", self.server_name),
            });
        }

        Ok(())
    }
}

fn is_valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
}

/// Options for the client side transport.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// `host:port` of the puppet service.
    pub endpoint: String,
    /// Opaque bearer credential presented on every connection.
    pub token: String,
    pub tls: Option<TlsOptions>,
    /// Overall operation timeout; the reconnect budget is derived from it.
    pub timeout: Duration,
}

impl ClientOptions {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            tls: None,
            timeout: TransportConfig::DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the token allows a plaintext connection.
    pub fn is_insecure(&self) -> bool {
        self.token.starts_with(TransportConfig::INSECURE_TOKEN_PREFIX)
    }

    /// Total time the reconnect loop may spend re-establishing the stream.
    pub fn retry_budget(&self) -> Duration {
        self.timeout / ReconnectConfig::BUDGET_DIVISOR
    }

    /// Validate credential and TLS material. Fails fast, never retried.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(PuppetServiceError::Config {
                message: "Endpoint must not be empty".to_string(),
            });
        }

        validate_token(&self.token)?;

        match &self.tls {
            Some(tls) => tls.validate(),
            None if self.is_insecure() => Ok(()),
            None => Err(PuppetServiceError::InvalidTlsMaterial {
                message: format!(
                    "TLS material is required unless the token starts with {:?}",
                    TransportConfig::INSECURE_TOKEN_PREFIX
                ),
            }),
        }
    }
}

/// Options for the server side transport.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to bind, `127.0.0.1:0` picks a free port.
    pub bind: String,
    /// Token clients must present.
    pub token: String,
    /// Identity announced in the handshake ack.
    pub server_name: Option<String>,
}

impl ServerOptions {
    pub fn new(bind: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            token: token.into(),
            server_name: None,
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_token(&self.token)?;
        if let Some(name) = &self.server_name {
            if !is_valid_server_name(name) {
                return Err(PuppetServiceError::Config {
                    message: format!("Invalid server name: {:?}", name),
                });
            }
        }
        Ok(())
    }
}

fn validate_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(PuppetServiceError::Unauthenticated {
            message: "Token must not be empty".to_string(),
        });
    }
    if token.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(PuppetServiceError::Unauthenticated {
            message: "Token contains whitespace or control characters".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA: &str = "-----BEGIN CERTIFICATE-----\nMIIBszCCAVmgAwIBAgIUQ0==\n-----END CERTIFICATE-----\n";

    #[test]
    fn test_retry_budget_is_a_tenth_of_timeout() {
        let opts = ClientOptions::new("127.0.0.1:8788", "insecure_token");
        assert_eq!(opts.retry_budget(), Duration::from_secs(120));

        let opts = opts.with_timeout(Duration::from_secs(3600));
        assert_eq!(opts.retry_budget(), Duration::from_secs(360));
    }

    #[test]
    fn test_insecure_token_needs_no_tls() {
        let opts = ClientOptions::new("127.0.0.1:8788", "insecure_token");
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_secure_token_requires_tls() {
        let opts = ClientOptions::new("127.0.0.1:8788", "puppet_token");
        assert!(matches!(
            opts.validate(),
            Err(PuppetServiceError::InvalidTlsMaterial { .. })
        ));

        let opts = opts.with_tls(TlsOptions::new(CA, "puppet.example.com"));
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_invalid_tls_material_rejected() {
        let bad_pem = TlsOptions::new("not a cert", "puppet.example.com");
        assert!(bad_pem.validate().is_err());

        let bad_body = TlsOptions::new(
            "-----BEGIN CERTIFICATE-----\n%%%\n-----END CERTIFICATE-----",
            "puppet.example.com",
        );
        assert!(bad_body.validate().is_err());

        let bad_name = TlsOptions::new(CA, "bad name");
        assert!(bad_name.validate().is_err());
    }

    #[test]
    fn test_bad_tokens_are_unauthenticated() {
        for token in ["", "has space", "tab\there"] {
            let opts = ClientOptions::new("127.0.0.1:1", token);
            assert!(matches!(
                opts.validate(),
                Err(PuppetServiceError::Unauthenticated { .. })
            ));
        }
    }

    #[test]
    fn test_timeouts_are_ordered() {
        assert!(ReconnectConfig::RETRY_DELAY < ReconnectConfig::ATTEMPT_TIMEOUT);
        assert!(StreamConfig::FIRST_HEARTBEAT_TIMEOUT < StreamConfig::READY_GRACE);
    }
}
