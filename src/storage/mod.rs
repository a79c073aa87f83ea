//! Chunk storage engine: append-only chunk files plus sidecar metadata.
//!
//! On-disk layout, rooted at the configured base path:
//!
//! ```text
//! <base>/<labelset-path-segment>/<chunk_id>.log    JSON lines, one entry per line
//! <base>/<labelset-path-segment>/<chunk_id>.meta   single JSON object
//! ```

mod reader;
mod retention;
mod writer;

pub use reader::{ChunkReader, RebuildSummary};
pub use retention::{RetentionSweeper, SweepStats};
pub use writer::ChunkWriter;

use std::io;
use std::path::{Path, PathBuf};

/// Collects every regular file under `base`, depth-first. A missing base
/// directory yields an empty list.
pub(crate) async fn collect_files(base: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![base.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            // Entries can vanish between the listing and the stat.
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                files.push(path);
            }
        }
    }

    Ok(files)
}
