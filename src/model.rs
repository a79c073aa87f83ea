//! Core data types for loglake.
//!
//! This module defines the fundamental data structures shared across the
//! ingest, storage, index, and query subsystems: entries, chunk
//! descriptors, and the ingest wire types.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::labels::LabelSet;

/// Identifier of a chunk file.
///
/// Chunk ids have the form `chunk_<unix_seconds>_<sequence>`, where the
/// sequence is a process-wide monotonically increasing counter assigned
/// when the chunk is written. The sequence part orders chunks by creation
/// within a process; an id is never reused during a process lifetime.
pub type ChunkId = String;

/// A single ingested log observation.
///
/// Entries are created by the ingest pipeline, broadcast to live-tail
/// subscribers, buffered per stream, and eventually persisted as one JSON
/// line inside a chunk file. They are immutable once created and live
/// until the retention sweeper removes their containing chunk.
///
/// # Identity and Ordering
///
/// Each entry carries a process-unique id assigned at ingest time by
/// [`EntryIdAllocator`]. Ids sort lexicographically in creation order,
/// which the query engine uses to break timestamp ties when sorting
/// results newest-first.
///
/// # Labels
///
/// An entry always carries the complete label set of the stream it was
/// ingested under. Every entry persisted in a chunk has labels equal to
/// that chunk's label set, so a chunk can be attributed to its stream
/// from any single line.
///
/// # Example
///
/// ```ignore
/// let entry = LogEntry {
///     id: allocator.next(clock.now_utc()),
///     timestamp: "2024-01-15T10:30:00Z".parse()?,
///     line: "connection established".to_string(),
///     labels: LabelSet::from([("service", "api"), ("env", "prod")]),
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Process-unique identifier, sortable by creation time.
    pub id: String,

    /// Absolute timestamp of the observation.
    ///
    /// Serialized as RFC 3339 with nanosecond precision. Parsed from the
    /// producer's `ts` field, or substituted at ingest time according to
    /// the configured timestamp policy.
    pub timestamp: DateTime<Utc>,

    /// Opaque log content.
    ///
    /// The service never interprets or indexes the content; line filters
    /// evaluate it at query time only. Serialized under the wire name
    /// `message`.
    #[serde(rename = "message")]
    pub line: String,

    /// The complete label set the entry was ingested under.
    pub labels: LabelSet,
}

/// Descriptor of a chunk, kept in the index and mirrored in the on-disk
/// `.meta` sidecar.
///
/// The sidecar is written right after the chunk's `.log` file and is the
/// unit of index recovery: at startup the index is rebuilt by replaying
/// every sidecar found under the storage base path.
///
/// # Time Bounds
///
/// `start_time` and `end_time` are unix seconds holding the minimum and
/// maximum entry timestamps observed while the chunk was written, so
/// `start_time <= end_time` always holds. Queries use them to skip
/// chunks whose interval cannot intersect the requested window.
///
/// # Example
///
/// ```ignore
/// let meta = reader.get_chunk_meta(&labels, "chunk_1705314600_1").await?;
/// assert!(meta.start_time <= meta.end_time);
/// assert_eq!(meta.labels, labels);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// The chunk's id, matching its file names on disk.
    pub id: ChunkId,

    /// Label set shared by every entry in the chunk.
    pub labels: LabelSet,

    /// Minimum entry timestamp, unix seconds.
    pub start_time: i64,

    /// Maximum entry timestamp, unix seconds.
    pub end_time: i64,

    /// Number of entries the chunk holds.
    pub entry_count: usize,
}

/// Incoming ingest payload: a batch of streams.
///
/// This is the body of `POST /ingest`. Streams are processed in order; a
/// stream that fails validation is logged and skipped while the rest of
/// the batch continues, and the response reports only the entries that
/// were accepted.
///
/// # Example
///
/// ```ignore
/// // {"streams": [{"labels": {"service": "api"},
/// //               "entries": [{"ts": "2024-01-15T10:30:00Z", "line": "hello"}]}]}
/// let request: IngestRequest = serde_json::from_slice(&body)?;
/// let accepted = ingestor.ingest(&request).await?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub streams: Vec<StreamPayload>,
}

/// One stream within an ingest request.
///
/// # Stream Identity
///
/// The label set is the stream: two payloads with equal labels feed the
/// same buffer and end up in the same chunk directory, regardless of
/// which request carried them. Key and value rules are enforced per
/// stream at ingest time (keys match `[A-Za-z_][A-Za-z0-9_]*`, values
/// are newline-free and bounded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPayload {
    /// Labels identifying the stream. Must be non-empty.
    pub labels: LabelSet,

    /// Raw entries, in the order the producer observed them. Must be
    /// non-empty.
    pub entries: Vec<EntryPayload>,
}

/// One raw entry within a stream payload.
///
/// # Timestamp Format
///
/// The timestamp arrives as a string and is parsed as RFC 3339. What
/// happens when it does not parse is a policy decision: substitute the
/// ingest wall-clock time (the default), also try bare unix
/// seconds/millis/nanos, or reject the entry. See
/// [`TimestampPolicy`](crate::config::TimestampPolicy).
///
/// # Example
///
/// ```
/// use loglake::EntryPayload;
///
/// let entry = EntryPayload {
///     ts: "2024-01-15T10:30:00Z".to_string(),
///     line: "request served in 12ms".to_string(),
/// };
/// assert!(entry.ts.parse::<chrono::DateTime<chrono::Utc>>().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPayload {
    /// Producer-supplied timestamp string.
    pub ts: String,

    /// The log content.
    pub line: String,
}

/// Allocates process-unique, creation-ordered entry identifiers.
///
/// Ids are the entry's ingest time in nanoseconds, bumped past the
/// previous allocation whenever the clock ties or runs backwards, and
/// rendered as a fixed-width decimal so lexicographic order equals
/// numeric order.
///
/// # Ordering
///
/// Allocation is lock-free: a compare-and-swap loop over the last issued
/// value guarantees strict monotonicity even when many ingest tasks
/// allocate concurrently with identical wall-clock readings.
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use loglake::model::EntryIdAllocator;
///
/// let allocator = EntryIdAllocator::new();
/// let now = Utc::now();
/// let first = allocator.next(now);
/// let second = allocator.next(now);
/// assert!(first < second);
/// ```
#[derive(Debug, Default)]
pub struct EntryIdAllocator {
    last: AtomicI64,
}

impl EntryIdAllocator {
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }

    /// Issues the next id for an entry ingested at `now`.
    pub fn next(&self, now: DateTime<Utc>) -> String {
        let nanos = now.timestamp_nanos_opt().unwrap_or_default();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let assigned = nanos.max(prev + 1);
            match self.last.compare_exchange_weak(
                prev,
                assigned,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return format!("{:019}", assigned),
                Err(actual) => prev = actual,
            }
        }
    }
}
