//! Loglake - a lightweight, label-indexed log aggregation service.
//!
//! Producers push structured log entries tagged with key/value labels;
//! consumers query them back by label selector and time window, or follow
//! a live tail over WebSocket. Only labels are indexed, never content: raw
//! entries land in append-only, per-stream chunk files with JSON sidecar
//! descriptors, and a rolling retention horizon sweeps old chunks away.
//!
//! # Architecture
//!
//! - **Ingest** ([`ingest::Ingestor`]): validates streams, buffers entries
//!   per stream in a sharded map, flushes on size or on a timer, and
//!   publishes every accepted entry to registered observers.
//! - **Storage** ([`storage::ChunkWriter`], [`storage::ChunkReader`],
//!   [`storage::RetentionSweeper`]): immutable JSON-lines chunk files plus
//!   `.meta` sidecars under a directory derived from the labels.
//! - **Index** ([`index::LabelIndex`]): in-memory maps from stream
//!   fingerprints to chunk descriptors with an inverted label catalog,
//!   rebuilt from sidecars at startup.
//! - **Query** ([`query::Executor`]): parses the LogQL subset, selects
//!   chunks through the index, filters entries, aggregates.
//! - **Live tail** ([`tail::TailHub`]): lossy fan-out of fresh entries to
//!   filtered WebSocket subscribers.
//! - **Server** ([`server::LogServer`]): the axum HTTP surface, including
//!   Loki-compatible endpoints for Grafana.

pub mod clock;
pub mod config;
pub mod error;
pub mod index;
pub mod ingest;
pub mod labels;
pub mod model;
pub mod notify;
pub mod query;
pub mod server;
pub mod storage;
pub mod tail;

pub use config::{Config, IngestConfig, StorageConfig, TimestampPolicy};
pub use error::{Error, Result};
pub use index::LabelIndex;
pub use ingest::{EntryObserver, Ingestor};
pub use labels::LabelSet;
pub use model::{ChunkMeta, EntryPayload, IngestRequest, LogEntry, StreamPayload};
pub use query::Executor;
pub use storage::{ChunkReader, ChunkWriter, RetentionSweeper};
pub use tail::TailHub;
