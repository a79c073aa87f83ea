//! Read path of the chunk store, plus the startup index rebuild.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::index::LabelIndex;
use crate::labels::LabelSet;
use crate::model::{ChunkId, ChunkMeta, LogEntry};
use crate::storage::collect_files;

/// Reads chunk files and sidecars back from disk.
pub struct ChunkReader {
    base_path: PathBuf,
}

/// Outcome of [`ChunkReader::rebuild_index`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    /// Chunks restored into the index.
    pub chunks: usize,
    /// Chunks whose sidecar was missing and had to be reconstructed from
    /// the log file itself.
    pub reconciled: usize,
    /// Highest chunk sequence number seen, for seeding the writer.
    pub last_sequence: u64,
}

impl ChunkReader {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Reads every entry of a chunk, in file order.
    ///
    /// Lines that fail to parse are dropped with a warning; a damaged tail
    /// does not fail the rest of the chunk.
    pub async fn read_chunk(&self, labels: &LabelSet, chunk_id: &str) -> Result<Vec<LogEntry>> {
        let path = self.chunk_path(labels, chunk_id, "log");
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Storage(format!("read {}: {}", path.display(), e)))?;
        Ok(parse_entries(&content, chunk_id))
    }

    /// Reads a chunk, keeping only entries within `[start, end]`.
    ///
    /// Also returns the number of lines scanned, for query statistics.
    pub async fn read_chunk_filtered(
        &self,
        labels: &LabelSet,
        chunk_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(Vec<LogEntry>, usize)> {
        let entries = self.read_chunk(labels, chunk_id).await?;
        let scanned = entries.len();
        let filtered = entries
            .into_iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .collect();
        Ok((filtered, scanned))
    }

    /// Reads a chunk's sidecar descriptor.
    pub async fn get_chunk_meta(&self, labels: &LabelSet, chunk_id: &str) -> Result<ChunkMeta> {
        let path = self.chunk_path(labels, chunk_id, "meta");
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Storage(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Storage(format!("decode {}: {}", path.display(), e)))
    }

    /// Lists the chunk ids stored for a label set. A stream that has never
    /// flushed yields an empty list.
    pub async fn list_chunks(&self, labels: &LabelSet) -> Result<Vec<ChunkId>> {
        let dir = self.base_path.join(labels.path_segment());
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(Error::Storage(format!("list {}: {}", dir.display(), err)));
            }
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Storage(format!("list {}: {}", dir.display(), e)))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "log") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    chunks.push(stem.to_string());
                }
            }
        }
        Ok(chunks)
    }

    /// Rebuilds the index by replaying sidecar files.
    ///
    /// A `.log` file without a sidecar (a crash between the two writes) has
    /// its descriptor reconstructed by scanning its entries, so the chunk
    /// becomes visible again after restart.
    pub async fn rebuild_index(&self, index: &LabelIndex) -> Result<RebuildSummary> {
        let files = collect_files(&self.base_path).await?;
        let mut summary = RebuildSummary::default();

        let meta_paths: Vec<&PathBuf> = files
            .iter()
            .filter(|p| p.extension().is_some_and(|ext| ext == "meta"))
            .collect();
        let mut indexed: std::collections::HashSet<String> = std::collections::HashSet::new();

        for path in meta_paths {
            let content = match tokio::fs::read_to_string(path).await {
                Ok(content) => content,
                Err(err) => {
                    tracing::warn!("skipping unreadable sidecar {}: {}", path.display(), err);
                    continue;
                }
            };
            let meta: ChunkMeta = match serde_json::from_str(&content) {
                Ok(meta) => meta,
                Err(err) => {
                    tracing::warn!("skipping malformed sidecar {}: {}", path.display(), err);
                    continue;
                }
            };
            indexed.insert(meta.id.clone());
            summary.last_sequence = summary.last_sequence.max(chunk_sequence(&meta.id));
            index.add_chunk(
                meta.id.clone(),
                meta.labels,
                meta.start_time,
                meta.end_time,
                meta.entry_count,
            );
            summary.chunks += 1;
        }

        // Orphaned .log files: reconstruct their descriptors from content.
        for path in files
            .iter()
            .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        {
            let Some(chunk_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if indexed.contains(chunk_id) {
                continue;
            }
            let content = match tokio::fs::read_to_string(path).await {
                Ok(content) => content,
                Err(err) => {
                    tracing::warn!("skipping unreadable chunk {}: {}", path.display(), err);
                    continue;
                }
            };
            let entries = parse_entries(&content, chunk_id);
            let Some(first) = entries.first() else {
                continue;
            };
            let start = entries.iter().map(|e| e.timestamp).min().unwrap_or(first.timestamp);
            let end = entries.iter().map(|e| e.timestamp).max().unwrap_or(first.timestamp);
            summary.last_sequence = summary.last_sequence.max(chunk_sequence(chunk_id));
            index.add_chunk(
                chunk_id.to_string(),
                first.labels.clone(),
                start.timestamp(),
                end.timestamp(),
                entries.len(),
            );
            summary.chunks += 1;
            summary.reconciled += 1;
        }

        Ok(summary)
    }

    fn chunk_path(&self, labels: &LabelSet, chunk_id: &str, ext: &str) -> PathBuf {
        self.base_path
            .join(labels.path_segment())
            .join(format!("{}.{}", chunk_id, ext))
    }
}

fn parse_entries(content: &str, chunk_id: &str) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                tracing::warn!("dropping malformed line in chunk {}: {}", chunk_id, err);
            }
        }
    }
    entries
}

/// Extracts the trailing sequence number from `chunk_<secs>_<seq>`.
fn chunk_sequence(chunk_id: &str) -> u64 {
    chunk_id
        .rsplit('_')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}
