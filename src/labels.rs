//! Label sets: the stream identity primitive.
//!
//! Every log entry is ingested under a set of key/value labels. Two entries
//! belong to the same stream exactly when their label sets are equal,
//! regardless of insertion order. The sorted representation drives both the
//! stream fingerprint and the on-disk directory name for the stream.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Maximum length of a label key.
const MAX_KEY_LEN: usize = 128;
/// Maximum length of a label value.
const MAX_VALUE_LEN: usize = 2048;

/// A finite mapping from label keys to values.
///
/// Backed by a `BTreeMap` so iteration is always in sorted key order, which
/// makes [`fingerprint`](LabelSet::fingerprint) and
/// [`path_segment`](LabelSet::path_segment) stable by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Deterministic short hash identifying this stream.
    ///
    /// Serializes the sorted `key=value,` pairs, hashes with SHA-256 and
    /// renders the first 8 bytes as lowercase hex. Equal label sets always
    /// produce equal fingerprints; distinct sets collide only if the hash
    /// does.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (k, v) in &self.0 {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b",");
        }
        let digest = hasher.finalize();
        digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Filesystem-safe directory segment for this stream.
    ///
    /// Sorted `k=v` tokens joined with `_`. Bytes outside `[A-Za-z0-9.-]`
    /// are percent-escaped inside each token, so distinct label sets never
    /// map to the same segment and the result is legal on every target
    /// filesystem.
    pub fn path_segment(&self) -> String {
        let mut parts = Vec::with_capacity(self.0.len());
        for (k, v) in &self.0 {
            parts.push(format!("{}={}", escape_component(k), escape_component(v)));
        }
        parts.join("_")
    }

    /// Returns true iff every `k=v` pair of `query` is present and equal
    /// here. An empty query matches everything.
    pub fn matches(&self, query: &LabelSet) -> bool {
        query
            .0
            .iter()
            .all(|(k, v)| self.0.get(k).is_some_and(|have| have == v))
    }

    /// Validates every key and value against the ingestion rules.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::InvalidInput("labels cannot be empty".to_string()));
        }
        for (key, value) in &self.0 {
            validate_key(key)?;
            validate_value(key, value)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for LabelSet {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[(&str, &str); N]> for LabelSet {
    fn from(pairs: [(&str, &str); N]) -> Self {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

/// Percent-escapes bytes that are unsafe in a directory name.
///
/// The separators `=` and `_` are escaped inside components, so in the
/// final segment they only ever appear as separators.
fn escape_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' => out.push(b as char),
            // '_' joins tokens in the segment, so it must be escaped inside one
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Keys match `[A-Za-z_][A-Za-z0-9_]*`, length 1..=128.
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(Error::InvalidInput(format!(
            "label key {:?} must be 1-{} characters",
            key, MAX_KEY_LEN
        )));
    }
    let mut chars = key.chars();
    let first = chars.next().unwrap_or('\0');
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(Error::InvalidInput(format!(
            "label key {:?} must start with a letter or underscore",
            key
        )));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::InvalidInput(format!(
            "label key {:?} contains invalid characters",
            key
        )));
    }
    Ok(())
}

/// Values are 1..=2048 bytes and contain no newline.
fn validate_value(key: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > MAX_VALUE_LEN {
        return Err(Error::InvalidInput(format!(
            "value for label {:?} must be 1-{} bytes",
            key, MAX_VALUE_LEN
        )));
    }
    if value.contains('\n') {
        return Err(Error::InvalidInput(format!(
            "value for label {:?} contains a newline",
            key
        )));
    }
    Ok(())
}
