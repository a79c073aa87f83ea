//! Loki-compatible endpoints for Grafana.
//!
//! Thin translator in front of the query engine: accepts Loki's time
//! encodings (unix nanoseconds or RFC 3339) and reshapes results into the
//! `resultType: streams` format Grafana expects.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::error::ApiError;
use super::handlers::AppState;
use crate::error::Error;
use crate::labels::LabelSet;
use crate::query::QueryResult;

#[derive(Debug, Deserialize)]
pub struct QueryRangeParams {
    #[serde(default)]
    pub query: String,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct InstantQueryParams {
    #[serde(default)]
    pub query: String,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct LokiResponse {
    pub status: &'static str,
    pub data: LokiResultData,
}

#[derive(Debug, Serialize)]
pub struct LokiResultData {
    #[serde(rename = "resultType")]
    pub result_type: &'static str,
    pub result: Vec<LokiStream>,
}

/// One stream in a Loki response: its labels and `[ns, line]` value pairs.
#[derive(Debug, Serialize)]
pub struct LokiStream {
    pub stream: LabelSet,
    pub values: Vec<[String; 2]>,
}

/// Handle GET /loki/api/v1/query_range
pub async fn handle_query_range(
    State(state): State<AppState>,
    Query(params): Query<QueryRangeParams>,
) -> Result<Json<LokiResponse>, ApiError> {
    let now = Utc::now();
    let start = parse_loki_time(params.start.as_deref(), now - ChronoDuration::hours(1))?;
    let end = parse_loki_time(params.end.as_deref(), now)?;
    let limit = match params.limit {
        Some(limit) if limit > 0 => limit,
        _ => 1000,
    };

    let result = state.executor.execute(&params.query, start, end, limit).await?;
    Ok(Json(to_loki_response(result)))
}

/// Handle GET /loki/api/v1/query (instant query over the last 5 minutes)
pub async fn handle_instant_query(
    State(state): State<AppState>,
    Query(params): Query<InstantQueryParams>,
) -> Result<Json<LokiResponse>, ApiError> {
    let end = Utc::now();
    let start = end - ChronoDuration::minutes(5);
    let limit = match params.limit {
        Some(limit) if limit > 0 => limit,
        _ => 100,
    };

    let result = state.executor.execute(&params.query, start, end, limit).await?;
    Ok(Json(to_loki_response(result)))
}

/// Handle GET /loki/api/v1/labels
pub async fn handle_labels(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "success",
        "data": state.index.get_all_labels(),
    }))
}

/// Handle GET /loki/api/v1/label/:name/values
pub async fn handle_label_values(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<serde_json::Value> {
    Json(json!({
        "status": "success",
        "data": state.index.get_label_values(&name),
    }))
}

/// Handle GET /ready
pub async fn handle_ready() -> &'static str {
    "ready"
}

/// Groups executed entries by label set into Loki streams.
fn to_loki_response(result: QueryResult) -> LokiResponse {
    let mut streams: BTreeMap<String, LokiStream> = BTreeMap::new();

    for log in result.logs {
        let nanos = log
            .timestamp
            .parse::<DateTime<Utc>>()
            .map(|t| t.timestamp_nanos_opt().unwrap_or_default())
            .unwrap_or_default();
        let key = log.labels.path_segment();
        streams
            .entry(key)
            .or_insert_with(|| LokiStream {
                stream: log.labels.clone(),
                values: Vec::new(),
            })
            .values
            .push([nanos.to_string(), log.message]);
    }

    LokiResponse {
        status: "success",
        data: LokiResultData {
            result_type: "streams",
            result: streams.into_values().collect(),
        },
    }
}

/// Parses unix nanoseconds or RFC 3339.
fn parse_loki_time(
    raw: Option<&str>,
    default: DateTime<Utc>,
) -> Result<DateTime<Utc>, ApiError> {
    let Some(raw) = raw.filter(|s| !s.is_empty()) else {
        return Ok(default);
    };
    if let Ok(nanos) = raw.parse::<i64>() {
        return Ok(DateTime::from_timestamp_nanos(nanos));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| {
            ApiError(Error::InvalidInput(format!(
                "invalid time format {:?}",
                raw
            )))
        })
}
