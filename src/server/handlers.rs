//! HTTP route handlers for the REST surface.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::Json;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::error::ApiError;
use super::metrics::Metrics;
use crate::error::Error;
use crate::index::LabelIndex;
use crate::ingest::Ingestor;
use crate::model::IngestRequest;
use crate::query::{Executor, QueryResult};
use crate::storage::ChunkWriter;
use crate::tail::TailHub;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub executor: Arc<Executor>,
    pub index: Arc<LabelIndex>,
    pub writer: Arc<ChunkWriter>,
    pub hub: Arc<TailHub>,
    pub metrics: Arc<Metrics>,
    pub started_at: Instant,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub accepted: usize,
}

/// Handle GET /health
pub async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.ingestor.stats();
    let (chunks_count, _) = state.index.stats();
    let storage_used = state.writer.storage_size().await.unwrap_or(0);
    let uptime = state.started_at.elapsed().as_secs();
    let ingestion_rate = if uptime > 0 {
        stats.ingested_lines / uptime
    } else {
        0
    };

    Json(json!({
        "status": "healthy",
        "ingestionRate": ingestion_rate,
        "storageUsed": storage_used,
        "chunksCount": chunks_count,
        "uptime": uptime,
    }))
}

/// Handle POST /ingest
pub async fn handle_ingest(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<IngestResponse>, ApiError> {
    let request: IngestRequest = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidInput(format!("Invalid JSON: {}", e)))?;

    let accepted = state.ingestor.ingest(&request).await?;
    Ok(Json(IngestResponse { accepted }))
}

/// Query string for GET /query.
#[derive(Debug, Deserialize)]
pub struct QueryParams {
    #[serde(default)]
    pub query: String,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<i64>,
}

/// Handle GET /query
pub async fn handle_query(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> Result<Json<QueryResult>, ApiError> {
    let now = Utc::now();
    let start = parse_time(params.start.as_deref(), now - ChronoDuration::hours(1))?;
    let end = parse_time(params.end.as_deref(), now)?;
    // Non-positive limits fall back to the default at the HTTP boundary;
    // the engine itself treats them as "no limit".
    let limit = match params.limit {
        Some(limit) if limit > 0 => limit,
        _ => 100,
    };

    let result = state.executor.execute(&params.query, start, end, limit).await?;
    Ok(Json(result))
}

fn parse_time(raw: Option<&str>, default: DateTime<Utc>) -> Result<DateTime<Utc>, ApiError> {
    match raw {
        None | Some("") => Ok(default),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| {
                ApiError(Error::InvalidInput(format!(
                    "invalid time format {:?}",
                    raw
                )))
            }),
    }
}

/// Handle GET /labels
pub async fn handle_labels(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.index.get_all_labels())
}

/// Handle GET /labels/:name/values
pub async fn handle_label_values(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<Vec<String>> {
    Json(state.index.get_label_values(&name))
}

/// Handle GET /metrics
///
/// Gauges and counters sync from the engine's own counters at scrape time,
/// so the exposition never drifts from what the pipeline actually saw.
pub async fn handle_metrics(State(state): State<AppState>) -> String {
    let stats = state.ingestor.stats();
    let lines_counted = state.metrics.ingested_lines.get();
    if stats.ingested_lines > lines_counted {
        state
            .metrics
            .ingested_lines
            .inc_by(stats.ingested_lines - lines_counted);
    }
    let bytes_counted = state.metrics.ingested_bytes.get();
    if stats.ingested_bytes > bytes_counted {
        state
            .metrics
            .ingested_bytes
            .inc_by(stats.ingested_bytes - bytes_counted);
    }

    let (chunks_count, _) = state.index.stats();
    state.metrics.chunks_stored.set(chunks_count as i64);
    let storage = state.writer.storage_size().await.unwrap_or(0);
    state.metrics.storage_bytes.set(storage as i64);
    state
        .metrics
        .uptime_seconds
        .set(state.started_at.elapsed().as_secs() as i64);

    state.metrics.encode()
}
