//! In-memory label index: the map from streams to chunk descriptors.
//!
//! The index answers three questions at query time: which chunks could
//! contain entries for a selector and time window, what metadata a chunk
//! has, and which label keys/values exist. It is rebuilt from chunk
//! sidecar files at startup and updated by the ingest pipeline after every
//! successful flush.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::labels::LabelSet;
use crate::model::{ChunkId, ChunkMeta};

#[derive(Default)]
struct IndexInner {
    /// fingerprint -> chunk ids of that stream.
    chunks_by_fingerprint: HashMap<String, Vec<ChunkId>>,
    /// chunk id -> descriptor.
    meta_by_chunk: HashMap<ChunkId, ChunkMeta>,
    /// Every label key ever observed on a live chunk.
    label_keys: HashSet<String>,
    /// key -> every value observed under that key.
    values_by_key: HashMap<String, HashSet<String>>,
    /// (key, value) -> fingerprints of streams carrying that pair.
    ///
    /// Inverted lookup: a selector's exact-match pairs intersect these sets
    /// to find candidate streams without walking every chunk.
    fingerprints_by_label: HashMap<(String, String), HashSet<String>>,
}

/// Thread-safe label index. Readers take a shared lock, writers exclusive.
#[derive(Default)]
pub struct LabelIndex {
    inner: RwLock<IndexInner>,
}

impl LabelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a flushed chunk. Called exactly once per chunk, after its
    /// file and sidecar are durable.
    pub fn add_chunk(
        &self,
        chunk_id: ChunkId,
        labels: LabelSet,
        start_time: i64,
        end_time: i64,
        entry_count: usize,
    ) {
        let fingerprint = labels.fingerprint();
        let mut inner = self.inner.write().unwrap();

        inner
            .chunks_by_fingerprint
            .entry(fingerprint.clone())
            .or_default()
            .push(chunk_id.clone());

        for (k, v) in labels.iter() {
            inner.label_keys.insert(k.to_string());
            inner
                .values_by_key
                .entry(k.to_string())
                .or_default()
                .insert(v.to_string());
            inner
                .fingerprints_by_label
                .entry((k.to_string(), v.to_string()))
                .or_default()
                .insert(fingerprint.clone());
        }

        inner.meta_by_chunk.insert(
            chunk_id.clone(),
            ChunkMeta {
                id: chunk_id,
                labels,
                start_time,
                end_time,
                entry_count,
            },
        );
    }

    /// Drops a chunk from the index, typically ahead of a retention sweep
    /// unlinking its files. Unknown ids are ignored.
    ///
    /// The key/value catalog is monotone: values stay listed even after the
    /// last chunk carrying them is swept.
    pub fn remove_chunk(&self, chunk_id: &str) {
        let mut inner = self.inner.write().unwrap();

        let Some(meta) = inner.meta_by_chunk.remove(chunk_id) else {
            return;
        };

        let fingerprint = meta.labels.fingerprint();
        let stream_empty = {
            let Some(chunks) = inner.chunks_by_fingerprint.get_mut(&fingerprint) else {
                return;
            };
            chunks.retain(|id| id != chunk_id);
            chunks.is_empty()
        };

        if stream_empty {
            inner.chunks_by_fingerprint.remove(&fingerprint);
            for (k, v) in meta.labels.iter() {
                if let Some(fps) = inner
                    .fingerprints_by_label
                    .get_mut(&(k.to_string(), v.to_string()))
                {
                    fps.remove(&fingerprint);
                }
            }
        }
    }

    /// Returns ids of chunks whose `[start_time, end_time]` intersects
    /// `[start, end]` (unix seconds) and whose labels are a superset of
    /// `query`. Order is unspecified.
    pub fn find_chunks(&self, query: &LabelSet, start: i64, end: i64) -> Vec<ChunkId> {
        let inner = self.inner.read().unwrap();

        if query.is_empty() {
            return inner
                .meta_by_chunk
                .values()
                .filter(|meta| overlaps(meta, start, end))
                .map(|meta| meta.id.clone())
                .collect();
        }

        // Intersect candidate streams over the selector's pairs; a pair
        // nobody carries means no chunk can match.
        let mut candidates: Option<HashSet<String>> = None;
        for (k, v) in query.iter() {
            let Some(fps) = inner
                .fingerprints_by_label
                .get(&(k.to_string(), v.to_string()))
            else {
                return Vec::new();
            };
            candidates = Some(match candidates {
                None => fps.clone(),
                Some(current) => current.intersection(fps).cloned().collect(),
            });
        }

        let mut matching = Vec::new();
        for fingerprint in candidates.unwrap_or_default() {
            let Some(chunks) = inner.chunks_by_fingerprint.get(&fingerprint) else {
                continue;
            };
            for chunk_id in chunks {
                if let Some(meta) = inner.meta_by_chunk.get(chunk_id) {
                    if overlaps(meta, start, end) {
                        matching.push(chunk_id.clone());
                    }
                }
            }
        }
        matching
    }

    /// Returns the descriptor for a chunk, if still indexed.
    pub fn get_chunk_meta(&self, chunk_id: &str) -> Option<ChunkMeta> {
        self.inner.read().unwrap().meta_by_chunk.get(chunk_id).cloned()
    }

    /// Snapshot of all label keys ever observed.
    pub fn get_all_labels(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let mut keys: Vec<String> = inner.label_keys.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Snapshot of all values observed under a key.
    pub fn get_label_values(&self, key: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let mut values: Vec<String> = inner
            .values_by_key
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        values.sort();
        values
    }

    /// (indexed chunk count, distinct label key count).
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.inner.read().unwrap();
        (inner.meta_by_chunk.len(), inner.label_keys.len())
    }
}

fn overlaps(meta: &ChunkMeta, start: i64, end: i64) -> bool {
    meta.end_time >= start && meta.start_time <= end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn should_find_chunk_by_exact_labels_and_window() {
        // given
        let index = LabelIndex::new();
        index.add_chunk(
            "chunk_100_1".to_string(),
            labels(&[("service", "api"), ("env", "prod")]),
            100,
            200,
            10,
        );

        // when
        let found = index.find_chunks(&labels(&[("service", "api")]), 150, 300);

        // then
        assert_eq!(found, vec!["chunk_100_1".to_string()]);
    }

    #[test]
    fn should_exclude_chunks_outside_time_window() {
        // given
        let index = LabelIndex::new();
        index.add_chunk(
            "chunk_100_1".to_string(),
            labels(&[("service", "api")]),
            100,
            200,
            10,
        );

        // when/then - windows ending before or starting after miss
        assert!(index.find_chunks(&LabelSet::new(), 0, 99).is_empty());
        assert!(index.find_chunks(&LabelSet::new(), 201, 300).is_empty());
        // boundary-touching windows still hit
        assert_eq!(index.find_chunks(&LabelSet::new(), 200, 300).len(), 1);
    }

    #[test]
    fn should_require_superset_match_across_pairs() {
        // given
        let index = LabelIndex::new();
        index.add_chunk(
            "chunk_100_1".to_string(),
            labels(&[("service", "api"), ("env", "prod")]),
            100,
            200,
            3,
        );
        index.add_chunk(
            "chunk_100_2".to_string(),
            labels(&[("service", "api"), ("env", "dev")]),
            100,
            200,
            2,
        );

        // when
        let prod = index.find_chunks(&labels(&[("service", "api"), ("env", "prod")]), 0, 500);
        let api = index.find_chunks(&labels(&[("service", "api")]), 0, 500);
        let none = index.find_chunks(&labels(&[("service", "api"), ("env", "test")]), 0, 500);

        // then
        assert_eq!(prod, vec!["chunk_100_1".to_string()]);
        assert_eq!(api.len(), 2);
        assert!(none.is_empty());
    }

    #[test]
    fn should_match_all_streams_with_empty_query() {
        // given
        let index = LabelIndex::new();
        index.add_chunk(
            "chunk_100_1".to_string(),
            labels(&[("service", "api")]),
            100,
            200,
            1,
        );
        index.add_chunk(
            "chunk_100_2".to_string(),
            labels(&[("service", "web")]),
            100,
            200,
            1,
        );

        // when
        let found = index.find_chunks(&LabelSet::new(), 0, 500);

        // then
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn should_track_label_catalog() {
        // given
        let index = LabelIndex::new();
        index.add_chunk(
            "chunk_100_1".to_string(),
            labels(&[("service", "api"), ("env", "prod")]),
            100,
            200,
            1,
        );
        index.add_chunk(
            "chunk_100_2".to_string(),
            labels(&[("service", "web")]),
            100,
            200,
            1,
        );

        // when/then
        assert_eq!(index.get_all_labels(), vec!["env", "service"]);
        assert_eq!(index.get_label_values("service"), vec!["api", "web"]);
        assert!(index.get_label_values("missing").is_empty());
    }

    #[test]
    fn should_remove_chunk_and_keep_catalog() {
        // given
        let index = LabelIndex::new();
        index.add_chunk(
            "chunk_100_1".to_string(),
            labels(&[("service", "api")]),
            100,
            200,
            1,
        );

        // when
        index.remove_chunk("chunk_100_1");

        // then - chunk is gone but the catalog stays monotone
        assert!(index.find_chunks(&LabelSet::new(), 0, 500).is_empty());
        assert!(index.get_chunk_meta("chunk_100_1").is_none());
        assert_eq!(index.get_all_labels(), vec!["service"]);
        assert_eq!(index.stats(), (0, 1));
    }

    #[test]
    fn should_ignore_removal_of_unknown_chunk() {
        // given
        let index = LabelIndex::new();

        // when/then - no panic
        index.remove_chunk("chunk_does_not_exist");
        assert_eq!(index.stats(), (0, 0));
    }

    #[test]
    fn should_report_stats() {
        // given
        let index = LabelIndex::new();
        index.add_chunk(
            "chunk_100_1".to_string(),
            labels(&[("service", "api"), ("env", "prod")]),
            100,
            200,
            1,
        );

        // when
        let (chunks, keys) = index.stats();

        // then
        assert_eq!(chunks, 1);
        assert_eq!(keys, 2);
    }
}
