//! Configuration for the ingest pipeline and chunk storage.
//!
//! This module defines the engine-side settings: where chunks live, when
//! buffers flush, and how unparseable timestamps are treated. The HTTP
//! server resolves these from CLI flags and environment variables in
//! [`server::config`](crate::server::config).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
///
/// This struct holds everything needed to run the storage and ingest
/// subsystems. The defaults are suitable for local use.
///
/// # Example
///
/// ```
/// use loglake::{Config, TimestampPolicy};
///
/// let config = Config::default();
/// assert_eq!(config.ingest.buffer_size, 1000);
/// assert_eq!(config.ingest.timestamp_policy, TimestampPolicy::Now);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Chunk storage settings.
    pub storage: StorageConfig,

    /// Ingest pipeline settings.
    pub ingest: IngestConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

/// Chunk storage configuration.
///
/// Controls where chunk files land on disk, how large a single chunk may
/// grow, and how long chunks survive before the retention sweeper removes
/// them.
///
/// # On-Disk Layout
///
/// Everything lives under [`path`](StorageConfig::path):
///
/// ```text
/// <path>/<labelset-segment>/<chunk_id>.log    one JSON entry per line
/// <path>/<labelset-segment>/<chunk_id>.meta   the chunk descriptor
/// ```
///
/// # Example
///
/// ```
/// use loglake::StorageConfig;
///
/// // Keep a week of chunks under /var/lib/loglake.
/// let config = StorageConfig {
///     path: "/var/lib/loglake".into(),
///     retention_days: 7,
///     ..StorageConfig::default()
/// };
/// assert_eq!(config.retention_days, 7);
/// ```
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Base directory for chunk files and sidecars.
    ///
    /// Each stream gets a subdirectory named after its sorted labels;
    /// chunk `.log` files and their `.meta` sidecars live inside it. The
    /// directory is created on first write.
    pub path: PathBuf,

    /// Advisory upper bound on buffered bytes per stream.
    ///
    /// Reaching it triggers a flush just like the entry-count threshold
    /// does, so a burst of very long lines cannot hold an oversized
    /// buffer in memory waiting for the count to fill up.
    pub chunk_size_bytes: usize,

    /// Rolling retention horizon in days.
    ///
    /// Files whose modification time precedes `now - retention_days` are
    /// deleted by the sweeper, and directories left empty are pruned.
    /// Swept chunks leave the index before their files are unlinked, so
    /// queries never select a chunk mid-deletion.
    pub retention_days: u32,

    /// Period of the background retention sweeper.
    ///
    /// One pass per hour is plenty for a horizon measured in days; the
    /// sweeper holds no locks between passes.
    pub retention_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/logs"),
            chunk_size_bytes: 1024 * 1024,
            retention_days: 7,
            retention_interval: Duration::from_secs(3600),
        }
    }
}

/// Ingest pipeline configuration.
///
/// Buffering is the durability trade-off of the pipeline: entries sit in
/// memory until a flush writes them to a chunk, so larger buffers and
/// longer intervals mean fewer, bigger chunks but a wider window of
/// entries lost on a crash.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use loglake::IngestConfig;
///
/// // Flush small batches quickly, for tests or low-volume streams.
/// let config = IngestConfig {
///     buffer_size: 10,
///     flush_interval: Duration::from_millis(500),
///     ..IngestConfig::default()
/// };
/// assert_eq!(config.buffer_size, 10);
/// ```
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Per-stream entry count that triggers an immediate flush.
    ///
    /// The check runs after every append, so a buffer reaching exactly
    /// this size flushes before the next entry lands in it.
    pub buffer_size: usize,

    /// Period of the background flush timer.
    ///
    /// Every non-empty buffer is flushed on each tick, bounding how long
    /// a slow stream's entries stay memory-only.
    pub flush_interval: Duration,

    /// How unparseable entry timestamps are handled. See
    /// [`TimestampPolicy`].
    pub timestamp_policy: TimestampPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            flush_interval: Duration::from_secs(5),
            timestamp_policy: TimestampPolicy::Now,
        }
    }
}

/// Policy for entry timestamps that fail to parse as RFC 3339.
///
/// Producers are expected to send RFC 3339 timestamps, but real agents
/// ship all sorts of things. The policy decides what happens to an entry
/// whose `ts` field does not parse.
///
/// # Choosing a Policy
///
/// - [`Now`](TimestampPolicy::Now) keeps every entry and stamps it with
///   the ingest wall-clock time. Nothing is lost, at the cost of a
///   slightly wrong timestamp. This is the default.
/// - [`BestEffort`](TimestampPolicy::BestEffort) additionally recognizes
///   bare unix timestamps (seconds, milliseconds, microseconds, or
///   nanoseconds by magnitude) before falling back to the ingest time.
/// - [`Reject`](TimestampPolicy::Reject) drops the entry and counts it,
///   for deployments that prefer visible loss over silently skewed
///   timestamps.
///
/// # Example
///
/// ```
/// use loglake::TimestampPolicy;
///
/// let policy: TimestampPolicy = "best-effort".parse().unwrap();
/// assert_eq!(policy, TimestampPolicy::BestEffort);
/// assert!("whenever".parse::<TimestampPolicy>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimestampPolicy {
    /// Drop the entry and count it as rejected.
    Reject,
    /// Substitute the ingest wall-clock time.
    Now,
    /// Also accept integer unix seconds, milliseconds, microseconds, or
    /// nanoseconds before falling back to the ingest time.
    BestEffort,
}

impl FromStr for TimestampPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(Self::Reject),
            "now" => Ok(Self::Now),
            "best-effort" => Ok(Self::BestEffort),
            other => Err(format!(
                "unknown timestamp policy {:?}, expected reject|now|best-effort",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_use_documented_defaults() {
        // given/when
        let config = Config::default();

        // then
        assert_eq!(config.ingest.buffer_size, 1000);
        assert_eq!(config.ingest.flush_interval, Duration::from_secs(5));
        assert_eq!(config.ingest.timestamp_policy, TimestampPolicy::Now);
        assert_eq!(config.storage.chunk_size_bytes, 1024 * 1024);
        assert_eq!(config.storage.retention_days, 7);
    }

    #[test]
    fn should_parse_timestamp_policy_from_str() {
        // given/when/then
        assert_eq!(
            "reject".parse::<TimestampPolicy>().unwrap(),
            TimestampPolicy::Reject
        );
        assert_eq!(
            "best-effort".parse::<TimestampPolicy>().unwrap(),
            TimestampPolicy::BestEffort
        );
        assert!("sometimes".parse::<TimestampPolicy>().is_err());
    }
}
