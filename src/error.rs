//! Error types for loglake operations.

use thiserror::Error;

use crate::query::parser::ParseError;

/// Errors surfaced by the ingest, storage, index, and query subsystems.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request payloads, invalid label keys/values, empty streams.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Query text that failed to parse.
    #[error("Invalid query: {0}")]
    InvalidQuery(#[from] ParseError),

    /// Disk failures while writing or reading chunk files.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
