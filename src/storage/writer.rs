//! Write path of the chunk store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::labels::LabelSet;
use crate::model::{ChunkId, ChunkMeta, LogEntry};
use crate::storage::collect_files;

/// Writes batches of entries as immutable chunk files.
///
/// Chunk ids are `chunk_<unix_seconds>_<sequence>` where the sequence is a
/// process-wide monotonically increasing counter, so an id is never reused
/// within a process lifetime.
pub struct ChunkWriter {
    base_path: PathBuf,
    sequence: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl ChunkWriter {
    pub fn new(base_path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self::with_sequence(base_path, clock, 0)
    }

    /// Creates a writer whose sequence counter starts after `last_sequence`.
    /// Used at startup so restored chunks cannot collide with new ids.
    pub fn with_sequence(
        base_path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        last_sequence: u64,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            sequence: AtomicU64::new(last_sequence),
            clock,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Persists one batch of entries sharing a label set.
    ///
    /// Writes the `.log` file (one JSON object per line, caller order),
    /// then the `.meta` sidecar, and only then returns. On failure nothing
    /// is advertised to callers; at worst an orphaned file remains for the
    /// retention sweeper or the startup reconcile to collect.
    pub async fn write_chunk(
        &self,
        labels: &LabelSet,
        entries: &[LogEntry],
    ) -> Result<(ChunkId, DateTime<Utc>, DateTime<Utc>)> {
        if entries.is_empty() {
            return Err(Error::InvalidInput(
                "cannot write an empty chunk".to_string(),
            ));
        }

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let unix_seconds = self.clock.now_utc().timestamp();
        let chunk_id = format!("chunk_{}_{}", unix_seconds, seq);

        let dir = self.base_path.join(labels.path_segment());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Storage(format!("create {}: {}", dir.display(), e)))?;

        let mut buf = String::new();
        let mut start_time = entries[0].timestamp;
        let mut end_time = entries[0].timestamp;
        for entry in entries {
            start_time = start_time.min(entry.timestamp);
            end_time = end_time.max(entry.timestamp);
            let line = serde_json::to_string(entry)
                .map_err(|e| Error::Storage(format!("encode entry: {}", e)))?;
            buf.push_str(&line);
            buf.push('\n');
        }

        let chunk_path = dir.join(format!("{}.log", chunk_id));
        tokio::fs::write(&chunk_path, buf.as_bytes())
            .await
            .map_err(|e| Error::Storage(format!("write {}: {}", chunk_path.display(), e)))?;

        let meta = ChunkMeta {
            id: chunk_id.clone(),
            labels: labels.clone(),
            start_time: start_time.timestamp(),
            end_time: end_time.timestamp(),
            entry_count: entries.len(),
        };
        let meta_path = dir.join(format!("{}.meta", chunk_id));
        let meta_bytes = serde_json::to_vec(&meta)
            .map_err(|e| Error::Storage(format!("encode meta: {}", e)))?;
        tokio::fs::write(&meta_path, meta_bytes)
            .await
            .map_err(|e| Error::Storage(format!("write {}: {}", meta_path.display(), e)))?;

        Ok((chunk_id, start_time, end_time))
    }

    /// Total bytes of all files under the base path.
    pub async fn storage_size(&self) -> Result<u64> {
        let mut size = 0;
        for path in collect_files(&self.base_path).await? {
            // Files may vanish mid-walk (retention); skip them.
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                size += meta.len();
            }
        }
        Ok(size)
    }

    /// Number of `.log` files under the base path.
    pub async fn chunk_count(&self) -> Result<usize> {
        let files = collect_files(&self.base_path).await?;
        Ok(files
            .iter()
            .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
            .count())
    }
}
