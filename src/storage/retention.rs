//! Background retention sweeping.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::Result;
use crate::index::LabelIndex;
use crate::storage::collect_files;

/// Outcome of one sweep pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub deleted_files: usize,
    pub deleted_bytes: u64,
}

/// Deletes chunk files older than the retention horizon and prunes empty
/// stream directories.
///
/// A chunk is removed from the index before its files are unlinked, so a
/// query started after the sweep touched it can no longer select it.
pub struct RetentionSweeper {
    base_path: PathBuf,
    retention: Duration,
    interval: Duration,
    index: Arc<LabelIndex>,
    clock: Arc<dyn Clock>,
}

impl RetentionSweeper {
    pub fn new(
        base_path: impl Into<PathBuf>,
        retention_days: u32,
        interval: Duration,
        index: Arc<LabelIndex>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            retention: Duration::from_secs(u64::from(retention_days) * 86_400),
            interval,
            index,
            clock,
        }
    }

    /// Runs sweeps forever on the configured interval. Spawn as a
    /// background task; it holds no locks between passes.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        // The immediate first tick would race startup rebuilds; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.sweep().await {
                Ok(stats) if stats.deleted_files > 0 => {
                    tracing::info!(
                        "retention sweep deleted {} files ({} bytes)",
                        stats.deleted_files,
                        stats.deleted_bytes
                    );
                }
                Ok(_) => {}
                Err(err) => tracing::error!("retention sweep failed: {}", err),
            }
        }
    }

    /// One sweep pass: delete files older than the horizon, then prune
    /// directories left empty.
    pub async fn sweep(&self) -> Result<SweepStats> {
        let cutoff = self.clock.now_system() - self.retention;
        let mut stats = SweepStats::default();

        for path in collect_files(&self.base_path).await? {
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta,
                // Vanished between walk and stat: someone else deleted it.
                Err(_) => continue,
            };
            let modified = match meta.modified() {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            if modified >= cutoff {
                continue;
            }

            if let Some(chunk_id) = path.file_stem().and_then(|s| s.to_str()) {
                self.index.remove_chunk(chunk_id);
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    stats.deleted_files += 1;
                    stats.deleted_bytes += meta.len();
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!("failed to delete {}: {}", path.display(), err);
                }
            }
        }

        self.prune_empty_dirs(&self.base_path).await;
        Ok(stats)
    }

    /// Removes stream directories that no longer contain any files. The
    /// base path itself is kept.
    async fn prune_empty_dirs(&self, base: &Path) {
        let mut entries = match tokio::fs::read_dir(base).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            if dir_is_empty(&path).await {
                if let Err(err) = tokio::fs::remove_dir(&path).await {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("failed to prune {}: {}", path.display(), err);
                    }
                }
            }
        }
    }
}

async fn dir_is_empty(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}
