//! End-to-end tests for the ingest -> storage -> index -> query pipeline.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use loglake::clock::{Clock, MockClock, SystemClock};
use loglake::{
    ChunkReader, ChunkWriter, EntryPayload, Executor, IngestConfig, IngestRequest, Ingestor,
    LabelIndex, LabelSet, RetentionSweeper, StreamPayload, TailHub,
};

struct Pipeline {
    dir: TempDir,
    index: Arc<LabelIndex>,
    writer: Arc<ChunkWriter>,
    reader: Arc<ChunkReader>,
    ingestor: Arc<Ingestor>,
    executor: Executor,
}

fn pipeline(config: IngestConfig) -> Pipeline {
    let dir = TempDir::new().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let index = Arc::new(LabelIndex::new());
    let writer = Arc::new(ChunkWriter::new(dir.path(), clock.clone()));
    let reader = Arc::new(ChunkReader::new(dir.path()));
    let hub = Arc::new(TailHub::new());
    let ingestor = Arc::new(Ingestor::new(
        config,
        1024 * 1024,
        index.clone(),
        writer.clone(),
        vec![hub],
        clock,
    ));
    let executor = Executor::new(index.clone(), reader.clone());
    Pipeline {
        dir,
        index,
        writer,
        reader,
        ingestor,
        executor,
    }
}

fn stream(labels: &[(&str, &str)], entries: &[(&str, &str)]) -> StreamPayload {
    StreamPayload {
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        entries: entries
            .iter()
            .map(|(ts, line)| EntryPayload {
                ts: ts.to_string(),
                line: line.to_string(),
            })
            .collect(),
    }
}

#[tokio::test]
async fn test_ingest_flush_query_roundtrip() {
    let pipeline = pipeline(IngestConfig::default());

    // Ingest one stream, flush it, query it back.
    let accepted = pipeline
        .ingestor
        .ingest(&IngestRequest {
            streams: vec![stream(
                &[("service", "api"), ("env", "prod")],
                &[("2024-01-15T10:30:00Z", "hello")],
            )],
        })
        .await
        .unwrap();
    assert_eq!(accepted, 1);
    pipeline.ingestor.flush_all().await;

    let result = pipeline
        .executor
        .execute(
            r#"{service="api"}"#,
            "2024-01-15T10:00:00Z".parse().unwrap(),
            "2024-01-15T11:00:00Z".parse().unwrap(),
            10,
        )
        .await
        .unwrap();

    assert_eq!(result.logs.len(), 1);
    assert_eq!(result.logs[0].message, "hello");
    assert!(result.stats.queried_chunks >= 1);
}

#[tokio::test]
async fn test_selector_distinguishes_streams() {
    let pipeline = pipeline(IngestConfig::default());

    pipeline
        .ingestor
        .ingest(&IngestRequest {
            streams: vec![
                stream(
                    &[("service", "api"), ("env", "prod")],
                    &[
                        ("2024-01-15T10:30:00Z", "p1"),
                        ("2024-01-15T10:31:00Z", "p2"),
                        ("2024-01-15T10:32:00Z", "p3"),
                    ],
                ),
                stream(
                    &[("service", "api"), ("env", "dev")],
                    &[
                        ("2024-01-15T10:30:00Z", "d1"),
                        ("2024-01-15T10:31:00Z", "d2"),
                    ],
                ),
            ],
        })
        .await
        .unwrap();
    pipeline.ingestor.flush_all().await;

    let result = pipeline
        .executor
        .execute(
            r#"{service="api", env="prod"}"#,
            "2024-01-15T10:00:00Z".parse().unwrap(),
            "2024-01-15T11:00:00Z".parse().unwrap(),
            100,
        )
        .await
        .unwrap();

    assert_eq!(result.logs.len(), 3);
    assert!(result
        .logs
        .iter()
        .all(|l| l.labels.get("env") == Some("prod")));
}

#[tokio::test]
async fn test_entries_on_disk_after_stop_match_ingest() {
    let pipeline = pipeline(IngestConfig::default());
    let labels = LabelSet::from([("service", "api")]);

    pipeline
        .ingestor
        .ingest(&IngestRequest {
            streams: vec![stream(
                &[("service", "api")],
                &[
                    ("2024-01-15T10:30:00Z", "one"),
                    ("2024-01-15T10:31:00Z", "two"),
                    ("2024-01-15T10:32:00Z", "three"),
                ],
            )],
        })
        .await
        .unwrap();

    // Nothing flushed yet: the buffer threshold was not reached.
    assert_eq!(pipeline.writer.chunk_count().await.unwrap(), 0);

    pipeline.ingestor.stop().await;

    // The final flush persisted every accepted entry.
    let chunks = pipeline.reader.list_chunks(&labels).await.unwrap();
    assert_eq!(chunks.len(), 1);
    let entries = pipeline.reader.read_chunk(&labels, &chunks[0]).await.unwrap();
    let lines: Vec<&str> = entries.iter().map(|e| e.line.as_str()).collect();
    assert_eq!(lines, vec!["one", "two", "three"]);
    assert_eq!(pipeline.ingestor.stats().flush_failed_entries, 0);
}

#[tokio::test]
async fn test_index_rebuild_after_restart() {
    let pipeline = pipeline(IngestConfig::default());

    pipeline
        .ingestor
        .ingest(&IngestRequest {
            streams: vec![stream(
                &[("service", "api")],
                &[("2024-01-15T10:30:00Z", "persisted")],
            )],
        })
        .await
        .unwrap();
    pipeline.ingestor.stop().await;

    // A fresh index and executor, as after a process restart.
    let index = Arc::new(LabelIndex::new());
    let reader = Arc::new(ChunkReader::new(pipeline.dir.path()));
    let summary = reader.rebuild_index(&index).await.unwrap();
    assert_eq!(summary.chunks, 1);

    let executor = Executor::new(index.clone(), reader);
    let result = executor
        .execute(
            r#"{service="api"}"#,
            "2024-01-15T10:00:00Z".parse().unwrap(),
            "2024-01-15T11:00:00Z".parse().unwrap(),
            10,
        )
        .await
        .unwrap();
    assert_eq!(result.logs.len(), 1);
    assert_eq!(result.logs[0].message, "persisted");
    assert_eq!(index.get_label_values("service"), vec!["api"]);
}

#[tokio::test]
async fn test_retention_sweep_hides_old_chunks_from_queries() {
    let pipeline = pipeline(IngestConfig::default());

    pipeline
        .ingestor
        .ingest(&IngestRequest {
            streams: vec![stream(
                &[("service", "api")],
                &[("2024-01-15T10:30:00Z", "ancient")],
            )],
        })
        .await
        .unwrap();
    pipeline.ingestor.flush_all().await;
    assert_eq!(pipeline.index.stats().0, 1);

    // The sweeper's clock says two days have passed; retention is one day.
    let clock = Arc::new(MockClock::new());
    clock.advance(Duration::from_secs(2 * 86_400));
    let sweeper = RetentionSweeper::new(
        pipeline.dir.path(),
        1,
        Duration::from_secs(3600),
        pipeline.index.clone(),
        clock,
    );
    let stats = sweeper.sweep().await.unwrap();
    assert!(stats.deleted_files >= 2);

    // The swept range queries clean, with no logs and no error.
    let result = pipeline
        .executor
        .execute(
            r#"{service="api"}"#,
            "2024-01-15T10:00:00Z".parse().unwrap(),
            "2024-01-15T11:00:00Z".parse().unwrap(),
            10,
        )
        .await
        .unwrap();
    assert_eq!(result.logs.len(), 0);
    assert_eq!(result.stats.queried_chunks, 0);
    assert_eq!(pipeline.writer.chunk_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_count_over_time_buckets() {
    let pipeline = pipeline(IngestConfig::default());

    // Ten entries at 30-second intervals from t0.
    let entries: Vec<(String, String)> = (0..10)
        .map(|i| {
            (
                format!("2024-01-15T10:{:02}:{:02}Z", i / 2, (i % 2) * 30),
                format!("line-{}", i),
            )
        })
        .collect();
    let entry_refs: Vec<(&str, &str)> = entries
        .iter()
        .map(|(ts, line)| (ts.as_str(), line.as_str()))
        .collect();
    pipeline
        .ingestor
        .ingest(&IngestRequest {
            streams: vec![stream(&[("service", "x")], &entry_refs)],
        })
        .await
        .unwrap();
    pipeline.ingestor.flush_all().await;

    let result = pipeline
        .executor
        .execute(
            r#"count_over_time({service="x"}[1m])"#,
            "2024-01-15T10:00:00Z".parse().unwrap(),
            "2024-01-15T10:05:00Z".parse().unwrap(),
            100,
        )
        .await
        .unwrap();

    let agg = result.aggregation.unwrap();
    assert_eq!(agg.value, 10.0);
    assert_eq!(agg.series.len(), 5);
    assert!(agg.series.iter().all(|p| p.value == 2.0));
}
