//! CLI arguments and server configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::{Config, IngestConfig, StorageConfig};
use crate::error::{Error, Result};

/// Command-line arguments. The environment variables `LOGLAKE_PORT`,
/// `LOGLAKE_STORAGE_PATH`, and `LOGLAKE_API_KEY` override their flags.
#[derive(Parser, Debug)]
#[command(name = "loglake", about = "Label-indexed log aggregation service")]
pub struct CliArgs {
    /// Port for the HTTP server.
    #[arg(long, env = "LOGLAKE_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Base directory for chunk storage.
    #[arg(long, env = "LOGLAKE_STORAGE_PATH", default_value = "./data/logs")]
    pub storage_path: PathBuf,

    /// API key required in the X-API-Key header. Auth is disabled when
    /// unset.
    #[arg(long, env = "LOGLAKE_API_KEY")]
    pub api_key: Option<String>,

    /// Per-stream entry count that triggers a flush.
    #[arg(long, default_value_t = 1000)]
    pub buffer_size: usize,

    /// Background flush period in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub flush_interval_ms: u64,

    /// Advisory upper bound on bytes per chunk.
    #[arg(long, default_value_t = 1024 * 1024)]
    pub chunk_size_bytes: usize,

    /// Retention horizon in days.
    #[arg(long, default_value_t = 7)]
    pub retention_days: u32,

    /// Handling of unparseable entry timestamps: reject, now, or
    /// best-effort.
    #[arg(long, default_value = "now")]
    pub timestamp_policy: String,

    /// JSON file with webhook definitions.
    #[arg(long)]
    pub webhook_config: Option<PathBuf>,

    /// JSON file with alert rules.
    #[arg(long)]
    pub alert_config: Option<PathBuf>,

    /// Alert evaluation period in seconds.
    #[arg(long, default_value_t = 60)]
    pub alert_interval_secs: u64,
}

impl CliArgs {
    /// Resolves the engine configuration. Fails on an unknown timestamp
    /// policy; config failures at startup are fatal.
    pub fn to_config(&self) -> Result<Config> {
        let timestamp_policy = self
            .timestamp_policy
            .parse()
            .map_err(Error::InvalidInput)?;
        Ok(Config {
            storage: StorageConfig {
                path: self.storage_path.clone(),
                chunk_size_bytes: self.chunk_size_bytes,
                retention_days: self.retention_days,
                ..StorageConfig::default()
            },
            ingest: IngestConfig {
                buffer_size: self.buffer_size,
                flush_interval: Duration::from_millis(self.flush_interval_ms),
                timestamp_policy,
            },
        })
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            api_key: self.api_key.clone(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub port: u16,
    pub api_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimestampPolicy;

    #[test]
    fn should_resolve_config_from_defaults() {
        // given
        let args = CliArgs::parse_from(["loglake"]);

        // when
        let config = args.to_config().unwrap();

        // then
        assert_eq!(config.ingest.buffer_size, 1000);
        assert_eq!(config.ingest.flush_interval, Duration::from_millis(5000));
        assert_eq!(config.storage.retention_days, 7);
        assert_eq!(args.server_config().port, 8080);
    }

    #[test]
    fn should_resolve_explicit_flags() {
        // given
        let args = CliArgs::parse_from([
            "loglake",
            "--port",
            "9000",
            "--buffer-size",
            "50",
            "--timestamp-policy",
            "best-effort",
            "--api-key",
            "secret",
        ]);

        // when
        let config = args.to_config().unwrap();

        // then
        assert_eq!(args.port, 9000);
        assert_eq!(config.ingest.buffer_size, 50);
        assert_eq!(
            config.ingest.timestamp_policy,
            TimestampPolicy::BestEffort
        );
        assert_eq!(args.server_config().api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn should_fail_on_unknown_timestamp_policy() {
        // given
        let args = CliArgs::parse_from(["loglake", "--timestamp-policy", "whenever"]);

        // when/then
        assert!(args.to_config().is_err());
    }
}
