//! Query execution: chunk selection, per-entry filtering, aggregation.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::index::LabelIndex;
use crate::labels::LabelSet;
use crate::model::LogEntry;
use crate::query::parser::{Aggregation, AggregationKind, ParsedQuery};
use crate::storage::ChunkReader;

/// Executes parsed queries against the index and chunk store.
pub struct Executor {
    index: Arc<LabelIndex>,
    reader: Arc<ChunkReader>,
}

/// Query response: matching entries plus execution statistics, and the
/// aggregation result when the query contained one.
#[derive(Debug, Serialize)]
pub struct QueryResult {
    pub logs: Vec<LogResponse>,
    pub stats: QueryStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<AggregationResult>,
}

/// One entry in the response, shaped for the wire.
#[derive(Debug, Serialize)]
pub struct LogResponse {
    pub id: String,
    /// RFC 3339 with nanoseconds.
    pub timestamp: String,
    /// The `level` label when present, `"info"` otherwise.
    pub level: String,
    pub message: String,
    pub labels: LabelSet,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStats {
    pub queried_chunks: usize,
    pub scanned_lines: usize,
    pub matched_lines: usize,
    /// Milliseconds.
    pub execution_time: u64,
}

#[derive(Debug, Serialize)]
pub struct AggregationResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub series: Vec<SeriesPoint>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<AggregationGroup>,
}

#[derive(Debug, Serialize)]
pub struct SeriesPoint {
    /// RFC 3339 bucket start.
    pub timestamp: String,
    pub value: f64,
}

#[derive(Debug, Serialize)]
pub struct AggregationGroup {
    pub labels: LabelSet,
    pub value: f64,
}

impl Executor {
    pub fn new(index: Arc<LabelIndex>, reader: Arc<ChunkReader>) -> Self {
        Self { index, reader }
    }

    /// Runs a query over `[start, end]`.
    ///
    /// Parse failures surface as errors; per-chunk read failures are logged
    /// and the chunk skipped, so the result is best-effort partial rather
    /// than an error. A non-positive `limit` means no truncation; the limit
    /// never applies to aggregation queries.
    pub async fn execute(
        &self,
        query_text: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> Result<QueryResult> {
        let started = Instant::now();
        let parsed = ParsedQuery::parse(query_text)?;

        let exact = parsed.exact_match_labels();
        let chunk_ids = self
            .index
            .find_chunks(&exact, start.timestamp(), end.timestamp());

        let mut stats = QueryStats {
            queried_chunks: chunk_ids.len(),
            ..QueryStats::default()
        };

        let mut matched: Vec<LogEntry> = Vec::new();
        for chunk_id in &chunk_ids {
            let Some(meta) = self.index.get_chunk_meta(chunk_id) else {
                continue;
            };
            let (entries, scanned) = match self
                .reader
                .read_chunk_filtered(&meta.labels, chunk_id, start, end)
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!("skipping unreadable chunk {}: {}", chunk_id, err);
                    continue;
                }
            };
            stats.scanned_lines += scanned;

            for entry in entries {
                if !parsed.matches_labels(&entry.labels) {
                    continue;
                }
                if !parsed.matches_line(&entry.line) {
                    continue;
                }
                matched.push(entry);
            }
        }

        stats.matched_lines = matched.len();

        // Newest first; creation order breaks timestamp ties.
        matched.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.id.cmp(&a.id))
        });

        let aggregation = parsed
            .aggregation
            .as_ref()
            .map(|agg| compute_aggregation(agg, &matched, start, end));

        if aggregation.is_none() && limit > 0 && matched.len() > limit as usize {
            matched.truncate(limit as usize);
        }

        let logs = matched.into_iter().map(to_log_response).collect();
        stats.execution_time = started.elapsed().as_millis() as u64;

        Ok(QueryResult {
            logs,
            stats,
            aggregation,
        })
    }
}

fn to_log_response(entry: LogEntry) -> LogResponse {
    let level = entry
        .labels
        .get("level")
        .unwrap_or("info")
        .to_string();
    LogResponse {
        id: entry.id,
        timestamp: entry.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        level,
        message: entry.line,
        labels: entry.labels,
    }
}

fn compute_aggregation(
    agg: &Aggregation,
    entries: &[LogEntry],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> AggregationResult {
    let window_seconds = (end - start).num_milliseconds() as f64 / 1000.0;
    let total_bytes: u64 = entries.iter().map(|e| e.line.len() as u64).sum();

    let (value, series) = match agg.kind {
        AggregationKind::CountOverTime => (
            entries.len() as f64,
            compute_series(entries, agg.step_seconds, start, end, |count, _, _| {
                count as f64
            }),
        ),
        AggregationKind::Rate => (
            if window_seconds > 0.0 {
                entries.len() as f64 / window_seconds
            } else {
                0.0
            },
            compute_series(entries, agg.step_seconds, start, end, |count, _, secs| {
                if secs > 0.0 {
                    count as f64 / secs
                } else {
                    0.0
                }
            }),
        ),
        AggregationKind::BytesOverTime => (
            total_bytes as f64,
            compute_series(entries, agg.step_seconds, start, end, |_, bytes, _| {
                bytes as f64
            }),
        ),
        AggregationKind::BytesRate => (
            if window_seconds > 0.0 {
                total_bytes as f64 / window_seconds
            } else {
                0.0
            },
            compute_series(entries, agg.step_seconds, start, end, |_, bytes, secs| {
                if secs > 0.0 {
                    bytes as f64 / secs
                } else {
                    0.0
                }
            }),
        ),
        // Content is opaque text, so these reduce to the entry count.
        AggregationKind::Sum
        | AggregationKind::Avg
        | AggregationKind::Min
        | AggregationKind::Max => (entries.len() as f64, Vec::new()),
    };

    let groups = if agg.group_by.is_empty() {
        Vec::new()
    } else {
        compute_groups(agg, entries)
    };

    AggregationResult {
        kind: agg.kind.as_str().to_string(),
        value,
        series,
        groups,
    }
}

/// Splits `[start, end)` into `step`-second buckets and evaluates `f` over
/// each bucket's (entry count, byte total, actual bucket seconds).
fn compute_series(
    entries: &[LogEntry],
    step_seconds: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    f: impl Fn(usize, u64, f64) -> f64,
) -> Vec<SeriesPoint> {
    let step_seconds = if step_seconds > 0 { step_seconds } else { 60 };
    let step = ChronoDuration::seconds(step_seconds);
    let mut series = Vec::new();

    let mut bucket_start = start;
    while bucket_start < end {
        let bucket_end = (bucket_start + step).min(end);
        let mut count = 0;
        let mut bytes = 0u64;
        for entry in entries {
            if entry.timestamp >= bucket_start && entry.timestamp < bucket_end {
                count += 1;
                bytes += entry.line.len() as u64;
            }
        }
        let seconds = (bucket_end - bucket_start).num_milliseconds() as f64 / 1000.0;
        series.push(SeriesPoint {
            timestamp: bucket_start.to_rfc3339_opts(SecondsFormat::Secs, true),
            value: f(count, bytes, seconds),
        });
        bucket_start = bucket_end;
    }

    series
}

/// Per-group values for a `by (...)` clause. Entries group by the subset of
/// their labels named in the clause; the value is the group's entry count,
/// or its byte total for the bytes functions.
fn compute_groups(agg: &Aggregation, entries: &[LogEntry]) -> Vec<AggregationGroup> {
    use std::collections::BTreeMap;

    let mut groups: BTreeMap<String, (LabelSet, f64)> = BTreeMap::new();
    for entry in entries {
        let mut group_labels = LabelSet::new();
        for key in &agg.group_by {
            if let Some(value) = entry.labels.get(key) {
                group_labels.insert(key.clone(), value.to_string());
            }
        }
        let group_key = group_labels.path_segment();
        let slot = groups.entry(group_key).or_insert((group_labels, 0.0));
        match agg.kind {
            AggregationKind::BytesOverTime | AggregationKind::BytesRate => {
                slot.1 += entry.line.len() as f64;
            }
            _ => slot.1 += 1.0,
        }
    }

    groups
        .into_values()
        .map(|(labels, value)| AggregationGroup { labels, value })
        .collect()
}
