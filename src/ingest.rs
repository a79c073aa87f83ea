//! Ingest pipeline: validation, per-stream buffering, flushing, fan-out.
//!
//! Entries are buffered per stream until either the entry-count or byte
//! threshold is reached, or the background flush timer fires. The buffer
//! map is sharded by the first byte of the stream fingerprint so ingests
//! into different streams rarely contend. A buffer is flushed while its
//! shard lock is held, so a given stream never has two flushes in flight
//! and is always either entirely in memory or entirely in a chunk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::{IngestConfig, TimestampPolicy};
use crate::error::{Error, Result};
use crate::index::LabelIndex;
use crate::labels::LabelSet;
use crate::model::{EntryIdAllocator, IngestRequest, LogEntry};
use crate::storage::ChunkWriter;

/// Number of buffer-map shards.
const SHARD_COUNT: usize = 32;

/// Anything that wants to see every accepted entry as it is ingested.
///
/// Implementations must not block: they are invoked on the ingest path.
/// The live-tail hub and the webhook notifier are the in-tree observers.
pub trait EntryObserver: Send + Sync {
    fn publish(&self, entry: &LogEntry);
}

/// Pending entries for one stream.
struct StreamBuffer {
    labels: LabelSet,
    entries: Vec<LogEntry>,
    bytes: usize,
}

/// Snapshot of ingestion counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub ingested_lines: u64,
    pub ingested_bytes: u64,
    /// Entries dropped by the `reject` timestamp policy.
    pub rejected_entries: u64,
    /// Entries whose flush attempt failed. They stay buffered and retry,
    /// so after `stop()` this is the persistence discrepancy.
    pub flush_failed_entries: u64,
}

/// The ingest pipeline.
pub struct Ingestor {
    config: IngestConfig,
    chunk_size_bytes: usize,
    shards: Vec<Mutex<HashMap<String, StreamBuffer>>>,
    index: Arc<LabelIndex>,
    writer: Arc<ChunkWriter>,
    observers: Vec<Arc<dyn EntryObserver>>,
    ids: EntryIdAllocator,
    clock: Arc<dyn Clock>,

    ingested_lines: AtomicU64,
    ingested_bytes: AtomicU64,
    rejected_entries: AtomicU64,
    flush_failed_entries: AtomicU64,

    stopped: AtomicBool,
    flush_task: Mutex<Option<(tokio::sync::oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl Ingestor {
    pub fn new(
        config: IngestConfig,
        chunk_size_bytes: usize,
        index: Arc<LabelIndex>,
        writer: Arc<ChunkWriter>,
        observers: Vec<Arc<dyn EntryObserver>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            config,
            chunk_size_bytes,
            shards,
            index,
            writer,
            observers,
            ids: EntryIdAllocator::new(),
            clock,
            ingested_lines: AtomicU64::new(0),
            ingested_bytes: AtomicU64::new(0),
            rejected_entries: AtomicU64::new(0),
            flush_failed_entries: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            flush_task: Mutex::new(None),
        }
    }

    /// Launches the background flush timer.
    pub async fn start(self: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        let ingestor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ingestor.config.flush_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => ingestor.flush_all().await,
                    _ = &mut shutdown_rx => return,
                }
            }
        });
        *self.flush_task.lock().await = Some((shutdown_tx, handle));
    }

    /// Stops the flush timer, waits for it, then flushes every buffer one
    /// last time. `ingest` must not be called afterwards.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some((shutdown_tx, handle)) = self.flush_task.lock().await.take() {
            let _ = shutdown_tx.send(());
            let _ = handle.await;
        }
        self.flush_all().await;
    }

    /// Processes an ingest request and returns the number of accepted
    /// entries.
    ///
    /// A stream that fails validation is logged and skipped; the remaining
    /// streams still ingest. Unparseable entry timestamps follow the
    /// configured [`TimestampPolicy`].
    pub async fn ingest(&self, request: &IngestRequest) -> Result<usize> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::InvalidInput("ingestor is stopped".to_string()));
        }

        let mut accepted = 0;
        for stream in &request.streams {
            if let Err(err) = validate_stream(&stream.labels, stream.entries.len()) {
                tracing::warn!("skipping invalid stream: {}", err);
                continue;
            }

            let fingerprint = stream.labels.fingerprint();
            let shard = &self.shards[shard_of(&fingerprint)];
            let mut buffers = shard.lock().await;
            let buffer = buffers.entry(fingerprint).or_insert_with(|| StreamBuffer {
                labels: stream.labels.clone(),
                entries: Vec::with_capacity(self.config.buffer_size),
                bytes: 0,
            });

            for raw in &stream.entries {
                let Some(timestamp) = self.parse_timestamp(&raw.ts) else {
                    self.rejected_entries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("rejecting entry with unparseable timestamp {:?}", raw.ts);
                    continue;
                };

                let entry = LogEntry {
                    id: self.ids.next(self.clock.now_utc()),
                    timestamp,
                    line: raw.line.clone(),
                    labels: stream.labels.clone(),
                };

                for observer in &self.observers {
                    observer.publish(&entry);
                }

                self.ingested_lines.fetch_add(1, Ordering::Relaxed);
                self.ingested_bytes
                    .fetch_add(raw.line.len() as u64, Ordering::Relaxed);

                buffer.bytes += entry.line.len();
                buffer.entries.push(entry);
                accepted += 1;

                if buffer.entries.len() >= self.config.buffer_size
                    || buffer.bytes >= self.chunk_size_bytes
                {
                    self.flush_stream(buffer).await;
                }
            }
        }

        Ok(accepted)
    }

    /// Flushes every non-empty buffer.
    pub async fn flush_all(&self) {
        for shard in &self.shards {
            let mut buffers = shard.lock().await;
            for buffer in buffers.values_mut() {
                self.flush_stream(buffer).await;
            }
        }
    }

    /// Writes one buffer out as a chunk. The caller holds the shard lock.
    /// On failure the entries stay in the buffer and retry on the next
    /// trigger; the buffer resets only on success.
    async fn flush_stream(&self, buffer: &mut StreamBuffer) {
        if buffer.entries.is_empty() {
            return;
        }
        match self.writer.write_chunk(&buffer.labels, &buffer.entries).await {
            Ok((chunk_id, start, end)) => {
                self.index.add_chunk(
                    chunk_id.clone(),
                    buffer.labels.clone(),
                    start.timestamp(),
                    end.timestamp(),
                    buffer.entries.len(),
                );
                tracing::debug!(
                    "flushed chunk {} with {} entries",
                    chunk_id,
                    buffer.entries.len()
                );
                buffer.entries.clear();
                buffer.bytes = 0;
            }
            Err(err) => {
                self.flush_failed_entries
                    .fetch_add(buffer.entries.len() as u64, Ordering::Relaxed);
                tracing::error!(
                    "failed to flush {} entries for stream {}: {}",
                    buffer.entries.len(),
                    buffer.labels.path_segment(),
                    err
                );
            }
        }
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            ingested_lines: self.ingested_lines.load(Ordering::Relaxed),
            ingested_bytes: self.ingested_bytes.load(Ordering::Relaxed),
            rejected_entries: self.rejected_entries.load(Ordering::Relaxed),
            flush_failed_entries: self.flush_failed_entries.load(Ordering::Relaxed),
        }
    }

    fn parse_timestamp(&self, raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        match self.config.timestamp_policy {
            TimestampPolicy::Reject => None,
            TimestampPolicy::Now => Some(self.clock.now_utc()),
            TimestampPolicy::BestEffort => {
                parse_unix_timestamp(raw).or_else(|| Some(self.clock.now_utc()))
            }
        }
    }
}

fn shard_of(fingerprint: &str) -> usize {
    fingerprint.as_bytes().first().copied().unwrap_or(0) as usize % SHARD_COUNT
}

fn validate_stream(labels: &LabelSet, entry_count: usize) -> Result<()> {
    labels.validate()?;
    if entry_count == 0 {
        return Err(Error::InvalidInput("entries cannot be empty".to_string()));
    }
    Ok(())
}

/// Interprets a bare integer as unix seconds, milliseconds, microseconds,
/// or nanoseconds depending on magnitude.
fn parse_unix_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let n: i64 = raw.parse().ok()?;
    if n >= 100_000_000_000_000_000 {
        Some(DateTime::from_timestamp_nanos(n))
    } else if n >= 100_000_000_000_000 {
        DateTime::from_timestamp_micros(n)
    } else if n >= 100_000_000_000 {
        DateTime::from_timestamp_millis(n)
    } else {
        DateTime::from_timestamp(n, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{MockClock, SystemClock};
    use crate::model::{EntryPayload, StreamPayload};
    use crate::storage::ChunkReader;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        index: Arc<LabelIndex>,
        writer: Arc<ChunkWriter>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let index = Arc::new(LabelIndex::new());
            let writer = Arc::new(ChunkWriter::new(dir.path(), Arc::new(SystemClock)));
            Self { dir, index, writer }
        }

        fn ingestor(&self, config: IngestConfig) -> Ingestor {
            self.ingestor_with(config, Vec::new(), Arc::new(SystemClock))
        }

        fn ingestor_with(
            &self,
            config: IngestConfig,
            observers: Vec<Arc<dyn EntryObserver>>,
            clock: Arc<dyn Clock>,
        ) -> Ingestor {
            Ingestor::new(
                config,
                1024 * 1024,
                self.index.clone(),
                self.writer.clone(),
                observers,
                clock,
            )
        }
    }

    fn request(labels: LabelSet, entries: &[(&str, &str)]) -> IngestRequest {
        IngestRequest {
            streams: vec![StreamPayload {
                labels,
                entries: entries
                    .iter()
                    .map(|(ts, line)| EntryPayload {
                        ts: ts.to_string(),
                        line: line.to_string(),
                    })
                    .collect(),
            }],
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        seen: StdMutex<Vec<String>>,
    }

    impl EntryObserver for RecordingObserver {
        fn publish(&self, entry: &LogEntry) {
            self.seen.lock().unwrap().push(entry.line.clone());
        }
    }

    #[tokio::test]
    async fn should_buffer_until_threshold_then_flush() {
        // given
        let fx = Fixture::new();
        let config = IngestConfig {
            buffer_size: 2,
            ..IngestConfig::default()
        };
        let ingestor = fx.ingestor(config);
        let labels = LabelSet::from([("service", "api")]);

        // when - three entries with a threshold of two
        let accepted = ingestor
            .ingest(&request(
                labels.clone(),
                &[
                    ("2024-01-15T10:30:00Z", "one"),
                    ("2024-01-15T10:30:01Z", "two"),
                    ("2024-01-15T10:30:02Z", "three"),
                ],
            ))
            .await
            .unwrap();

        // then - one chunk flushed, one entry still buffered
        assert_eq!(accepted, 3);
        assert_eq!(fx.writer.chunk_count().await.unwrap(), 1);
        assert_eq!(fx.index.stats().0, 1);

        // and the remainder flushes on demand
        ingestor.flush_all().await;
        assert_eq!(fx.writer.chunk_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn should_flush_when_byte_threshold_reached() {
        // given - a tiny per-chunk byte threshold
        let fx = Fixture::new();
        let ingestor = Ingestor::new(
            IngestConfig::default(),
            8,
            fx.index.clone(),
            fx.writer.clone(),
            Vec::new(),
            Arc::new(SystemClock),
        );
        let labels = LabelSet::from([("service", "api")]);

        // when
        ingestor
            .ingest(&request(
                labels,
                &[("2024-01-15T10:30:00Z", "0123456789")],
            ))
            .await
            .unwrap();

        // then
        assert_eq!(fx.writer.chunk_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn should_skip_invalid_stream_and_keep_processing() {
        // given - first stream has an invalid label key
        let fx = Fixture::new();
        let ingestor = fx.ingestor(IngestConfig::default());
        let request = IngestRequest {
            streams: vec![
                StreamPayload {
                    labels: LabelSet::from([("0bad", "x")]),
                    entries: vec![EntryPayload {
                        ts: "2024-01-15T10:30:00Z".to_string(),
                        line: "dropped".to_string(),
                    }],
                },
                StreamPayload {
                    labels: LabelSet::from([("service", "api")]),
                    entries: vec![EntryPayload {
                        ts: "2024-01-15T10:30:00Z".to_string(),
                        line: "kept".to_string(),
                    }],
                },
            ],
        };

        // when
        let accepted = ingestor.ingest(&request).await.unwrap();

        // then
        assert_eq!(accepted, 1);
        assert_eq!(ingestor.stats().ingested_lines, 1);
    }

    #[tokio::test]
    async fn should_skip_stream_with_no_entries() {
        // given
        let fx = Fixture::new();
        let ingestor = fx.ingestor(IngestConfig::default());
        let request = IngestRequest {
            streams: vec![StreamPayload {
                labels: LabelSet::from([("service", "api")]),
                entries: Vec::new(),
            }],
        };

        // when
        let accepted = ingestor.ingest(&request).await.unwrap();

        // then
        assert_eq!(accepted, 0);
    }

    #[tokio::test]
    async fn should_substitute_now_for_bad_timestamp() {
        // given - a mock clock pinned to a known instant
        let fx = Fixture::new();
        let pinned = chrono::DateTime::from_timestamp(1_705_314_600, 0).unwrap();
        let clock = Arc::new(MockClock::at(pinned));
        let ingestor = fx.ingestor_with(IngestConfig::default(), Vec::new(), clock);
        let labels = LabelSet::from([("service", "api")]);

        // when
        let accepted = ingestor
            .ingest(&request(labels.clone(), &[("not-a-time", "hello")]))
            .await
            .unwrap();
        ingestor.flush_all().await;

        // then - the entry is stored with the ingest wall-clock time
        assert_eq!(accepted, 1);
        let reader = ChunkReader::new(fx.dir.path());
        let chunks = reader.list_chunks(&labels).await.unwrap();
        let entries = reader.read_chunk(&labels, &chunks[0]).await.unwrap();
        assert_eq!(entries[0].timestamp.timestamp(), 1_705_314_600);
    }

    #[tokio::test]
    async fn should_reject_bad_timestamp_under_reject_policy() {
        // given
        let fx = Fixture::new();
        let config = IngestConfig {
            timestamp_policy: TimestampPolicy::Reject,
            ..IngestConfig::default()
        };
        let ingestor = fx.ingestor(config);

        // when
        let accepted = ingestor
            .ingest(&request(
                LabelSet::from([("service", "api")]),
                &[("not-a-time", "dropped"), ("2024-01-15T10:30:00Z", "kept")],
            ))
            .await
            .unwrap();

        // then
        assert_eq!(accepted, 1);
        assert_eq!(ingestor.stats().rejected_entries, 1);
    }

    #[tokio::test]
    async fn should_accept_unix_timestamps_under_best_effort_policy() {
        // given
        let fx = Fixture::new();
        let config = IngestConfig {
            timestamp_policy: TimestampPolicy::BestEffort,
            ..IngestConfig::default()
        };
        let ingestor = fx.ingestor(config);
        let labels = LabelSet::from([("service", "api")]);

        // when - unix seconds and unix milliseconds
        ingestor
            .ingest(&request(
                labels.clone(),
                &[("1705314600", "seconds"), ("1705314600500", "millis")],
            ))
            .await
            .unwrap();
        ingestor.flush_all().await;

        // then
        let reader = ChunkReader::new(fx.dir.path());
        let chunks = reader.list_chunks(&labels).await.unwrap();
        let entries = reader.read_chunk(&labels, &chunks[0]).await.unwrap();
        assert_eq!(entries[0].timestamp.timestamp(), 1_705_314_600);
        assert_eq!(entries[1].timestamp.timestamp_millis(), 1_705_314_600_500);
    }

    #[tokio::test]
    async fn should_publish_entries_to_observers() {
        // given
        let fx = Fixture::new();
        let observer = Arc::new(RecordingObserver::default());
        let ingestor = fx.ingestor_with(
            IngestConfig::default(),
            vec![observer.clone()],
            Arc::new(SystemClock),
        );

        // when
        ingestor
            .ingest(&request(
                LabelSet::from([("service", "api")]),
                &[("2024-01-15T10:30:00Z", "one"), ("2024-01-15T10:30:01Z", "two")],
            ))
            .await
            .unwrap();

        // then
        assert_eq!(*observer.seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn should_track_line_and_byte_counters() {
        // given
        let fx = Fixture::new();
        let ingestor = fx.ingestor(IngestConfig::default());

        // when
        ingestor
            .ingest(&request(
                LabelSet::from([("service", "api")]),
                &[("2024-01-15T10:30:00Z", "12345"), ("2024-01-15T10:30:01Z", "123")],
            ))
            .await
            .unwrap();

        // then
        let stats = ingestor.stats();
        assert_eq!(stats.ingested_lines, 2);
        assert_eq!(stats.ingested_bytes, 8);
    }

    #[tokio::test]
    async fn should_preserve_arrival_order_within_chunk() {
        // given
        let fx = Fixture::new();
        let ingestor = fx.ingestor(IngestConfig::default());
        let labels = LabelSet::from([("service", "api")]);

        // when - entries arrive out of timestamp order
        ingestor
            .ingest(&request(
                labels.clone(),
                &[
                    ("2024-01-15T10:31:00Z", "second-ts"),
                    ("2024-01-15T10:30:00Z", "first-ts"),
                ],
            ))
            .await
            .unwrap();
        ingestor.flush_all().await;

        // then - the chunk keeps arrival order
        let reader = ChunkReader::new(fx.dir.path());
        let chunks = reader.list_chunks(&labels).await.unwrap();
        let entries = reader.read_chunk(&labels, &chunks[0]).await.unwrap();
        assert_eq!(entries[0].line, "second-ts");
        assert_eq!(entries[1].line, "first-ts");
    }

    #[tokio::test]
    async fn should_flush_everything_on_stop_and_refuse_further_ingest() {
        // given
        let ingestor = {
            let fx = Fixture::new();
            let ingestor = Arc::new(fx.ingestor(IngestConfig::default()));
            ingestor.start().await;
            ingestor
                .ingest(&request(
                    LabelSet::from([("service", "api")]),
                    &[("2024-01-15T10:30:00Z", "pending")],
                ))
                .await
                .unwrap();

            // when
            ingestor.stop().await;

            // then
            assert_eq!(fx.writer.chunk_count().await.unwrap(), 1);
            assert_eq!(fx.index.stats().0, 1);
            ingestor
        };
        assert!(ingestor
            .ingest(&IngestRequest { streams: vec![] })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn should_flush_periodically_in_background() {
        // given - a very short flush interval
        let fx = Fixture::new();
        let config = IngestConfig {
            flush_interval: std::time::Duration::from_millis(20),
            ..IngestConfig::default()
        };
        let ingestor = Arc::new(fx.ingestor(config));
        ingestor.start().await;

        // when
        ingestor
            .ingest(&request(
                LabelSet::from([("service", "api")]),
                &[("2024-01-15T10:30:00Z", "tick")],
            ))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;

        // then
        assert_eq!(fx.writer.chunk_count().await.unwrap(), 1);
        ingestor.stop().await;
    }

    #[tokio::test]
    async fn should_keep_buffer_on_flush_failure() {
        // given - a writer pointed at an unwritable location
        let fx = Fixture::new();
        let bad_writer = Arc::new(ChunkWriter::new(
            "/proc/loglake-cannot-write-here",
            Arc::new(SystemClock),
        ));
        let ingestor = Ingestor::new(
            IngestConfig::default(),
            1024 * 1024,
            fx.index.clone(),
            bad_writer,
            Vec::new(),
            Arc::new(SystemClock),
        );

        // when
        ingestor
            .ingest(&request(
                LabelSet::from([("service", "api")]),
                &[("2024-01-15T10:30:00Z", "stuck")],
            ))
            .await
            .unwrap();
        ingestor.flush_all().await;

        // then - nothing indexed, the failure is counted
        assert_eq!(fx.index.stats().0, 0);
        assert!(ingestor.stats().flush_failed_entries >= 1);
    }
}
