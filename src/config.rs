//! Configuration for the reasoner client
//!
//! `ClientConfig` is the library-facing settings struct. `ConnectionArgs` is
//! the clap/env surface embedders flatten into their own CLI.

use clap::Args;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{ClientError, Result, SessionIdentity};

/// Client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Reasoning server host
    pub host: String,
    /// Base port of the server's API endpoint
    pub base_port: u16,
    /// Per-request reply timeout enforced by the transport
    pub request_timeout_ms: u64,
    /// Length of the access lease to request; 0 disables leasing
    pub lease_duration_ms: u64,
    /// Bound on releasing server-side inference state during close
    pub release_timeout_ms: u64,
    /// Default local timeout for query workers; 0 means none
    pub query_timeout_ms: u64,
    /// Buffered server events per connection before the transport backs off
    pub event_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            base_port: 3600,
            request_timeout_ms: 30000,
            lease_duration_ms: 0,
            release_timeout_ms: 5000,
            query_timeout_ms: 0,
            event_channel_capacity: 1000,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, base_port: u16) -> Self {
        Self {
            host: host.into(),
            base_port,
            ..Default::default()
        }
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn identity(&self) -> SessionIdentity {
        SessionIdentity::new(self.host.clone(), self.base_port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }

    /// Local timeout for query workers, `Duration::ZERO` when unbounded
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ClientError::Config("host must not be empty".to_string()));
        }
        if self.base_port == 0 {
            return Err(ClientError::Config("base port must be non-zero".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ClientError::Config(
                "request timeout must be non-zero".to_string(),
            ));
        }
        if self.lease_duration_ms != 0 && self.lease_duration_ms < 1000 {
            return Err(ClientError::Config(
                "lease duration must be at least 1000ms (or 0 to disable)".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(ClientError::Config(
                "event channel capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reasoning server connection flags, meant to be `#[command(flatten)]`-ed
#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Reasoning server host
    #[arg(long = "reasoner-host", env = "REASONER_HOST", default_value = "localhost")]
    pub host: String,

    /// Reasoning server base port
    #[arg(long = "reasoner-port", env = "REASONER_PORT", default_value = "3600")]
    pub base_port: u16,

    /// Request timeout in milliseconds
    #[arg(long, env = "REASONER_REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,

    /// API lease duration in milliseconds (0 disables leasing)
    #[arg(long, env = "REASONER_LEASE_MS", default_value = "0")]
    pub lease_duration_ms: u64,

    /// Timeout for releasing server-side inference state, in milliseconds
    #[arg(long, env = "REASONER_RELEASE_TIMEOUT_MS", default_value = "5000")]
    pub release_timeout_ms: u64,

    /// Default local timeout for query workers in milliseconds (0 = none)
    #[arg(long, env = "REASONER_QUERY_TIMEOUT_MS", default_value = "0")]
    pub query_timeout_ms: u64,
}

impl From<ConnectionArgs> for ClientConfig {
    fn from(args: ConnectionArgs) -> Self {
        Self {
            host: args.host,
            base_port: args.base_port,
            request_timeout_ms: args.request_timeout_ms,
            lease_duration_ms: args.lease_duration_ms,
            release_timeout_ms: args.release_timeout_ms,
            query_timeout_ms: args.query_timeout_ms,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        connection: ConnectionArgs,
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.base_port, 3600);
        assert_eq!(config.lease_duration(), Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_short_lease() {
        let config = ClientConfig::default().with_lease_duration(Duration::from_millis(200));
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn test_args_flatten_into_config() {
        let cli = TestCli::parse_from([
            "probe",
            "--reasoner-host",
            "kb.internal",
            "--reasoner-port",
            "3614",
            "--lease-duration-ms",
            "60000",
        ]);
        let config: ClientConfig = cli.connection.into();
        assert_eq!(config.identity(), SessionIdentity::new("kb.internal", 3614));
        assert_eq!(config.lease_duration(), Duration::from_secs(60));
        assert_eq!(config.event_channel_capacity, 1000);
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"host": "kb.internal", "query_timeout_ms": 2500}"#).unwrap();
        assert_eq!(config.host, "kb.internal");
        assert_eq!(config.base_port, 3600);
        assert_eq!(config.query_timeout(), Duration::from_millis(2500));
    }
}
