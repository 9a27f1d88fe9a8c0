//! Persistent failed-idea memory with brute-force nearest-neighbour lookup.
//!
//! Every record lives on one JSONL line that carries its synthetic id, the
//! idea metadata, the embedding vector and a CRC32 over all of them, so vector
//! and metadata are written in a single append and cannot drift apart. A torn
//! trailing line left by a crash is detected on load, logged and ignored; the
//! next append truncates it before writing.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::embedder::Embedder;

/// Default store location, relative to the working directory.
pub const DEFAULT_MEMORY_FILE: &str = "cro_memory.jsonl";
/// Outcome label written for ideas that did not work.
pub const FAILED_OUTCOME: &str = "failed";
/// Prompt placeholder used when nothing relevant is remembered.
pub const NO_MEMORY_TEXT: &str = "No past failed CRO ideas.";

/// Errors raised by the memory store.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Reading or appending the store file failed.
    #[error("memory store io error at {path}: {source}")]
    Io {
        /// Store file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A line before the end of the file is unreadable or fails its checksum.
    #[error("memory store corrupt at line {line}: {reason}")]
    Corrupt {
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },
    /// A vector does not match the dimension fixed by the first record.
    #[error("embedding dimension {found} does not match store dimension {expected}; rebuild the store")]
    DimensionMismatch {
        /// Dimension of the stored vectors.
        expected: usize,
        /// Dimension that was offered.
        found: usize,
    },
    /// The embedding backend failed.
    #[error("embedding failed: {0:#}")]
    Embedding(anyhow::Error),
    /// A record could not be serialized.
    #[error("failed to encode memory record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One remembered idea and its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Synthetic identifier, unique within the store.
    pub id: u64,
    /// Issue the idea addressed.
    pub issue: String,
    /// Fix that was attempted.
    pub fix: String,
    /// Observed outcome (the pipeline writes `failed`).
    pub outcome: String,
    /// Milliseconds since the epoch when the record was written.
    pub recorded_epoch_ms: u64,
    /// Embedding of `issue + " " + fix`.
    pub embedding: Vec<f32>,
    /// CRC32 over the fields above.
    pub checksum: u32,
}

impl MemoryRecord {
    fn compute_checksum(&self) -> u32 {
        let mut hasher = Crc32::new();
        hasher.update(&self.id.to_le_bytes());
        for text in [&self.issue, &self.fix, &self.outcome] {
            hasher.update(&(text.len() as u64).to_le_bytes());
            hasher.update(text.as_bytes());
        }
        hasher.update(&self.recorded_epoch_ms.to_le_bytes());
        for value in &self.embedding {
            hasher.update(&value.to_le_bytes());
        }
        hasher.finalize()
    }

    /// Text embedded for this record.
    pub fn embedding_text(issue: &str, fix: &str) -> String {
        format!("{issue} {fix}")
    }
}

/// A retrieved record with its distance from the query.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryHit {
    /// Stored record.
    pub record: MemoryRecord,
    /// Euclidean distance to the query vector.
    pub distance: f32,
}

/// Result of a memory lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryLookup {
    /// Nothing is remembered yet (or the query could not be embedded).
    Empty,
    /// Closest records, nearest first.
    Hits(Vec<MemoryHit>),
}

impl MemoryLookup {
    /// Returns the hits, or an empty slice for [`MemoryLookup::Empty`].
    pub fn hits(&self) -> &[MemoryHit] {
        match self {
            MemoryLookup::Empty => &[],
            MemoryLookup::Hits(hits) => hits,
        }
    }

    /// Renders the `memory_text` prompt block.
    pub fn render(&self) -> String {
        let hits = self.hits();
        if hits.is_empty() {
            return NO_MEMORY_TEXT.to_string();
        }
        hits.iter()
            .map(|hit| {
                format!(
                    "- Issue: {} | Fix: {} | Outcome: {}",
                    hit.record.issue, hit.record.fix, hit.record.outcome
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

struct Snapshot {
    records: Vec<MemoryRecord>,
    /// Byte length of the readable prefix when a torn tail must be cut off.
    truncate_to: Option<u64>,
    /// The last readable line is missing its newline terminator.
    needs_newline: bool,
}

/// File-backed failed-idea memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    path: PathBuf,
}

impl MemoryStore {
    /// Points the store at a JSONL file; nothing is created until the first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads every readable record in insertion order.
    pub fn records(&self) -> Result<Vec<MemoryRecord>, MemoryError> {
        Ok(self.load()?.records)
    }

    /// Number of readable records.
    pub fn len(&self) -> Result<usize, MemoryError> {
        Ok(self.load()?.records.len())
    }

    /// True when the store is absent or holds no readable record.
    pub fn is_empty(&self) -> Result<bool, MemoryError> {
        Ok(self.len()? == 0)
    }

    /// Returns up to `top_k` records nearest to `query`, nearest first.
    ///
    /// An absent or empty store yields [`MemoryLookup::Empty`] without touching
    /// the embedder; so does an embedding failure.
    pub fn retrieve(
        &self,
        embedder: &dyn Embedder,
        query: &str,
        top_k: usize,
    ) -> Result<MemoryLookup, MemoryError> {
        let snapshot = self.load()?;
        if snapshot.records.is_empty() {
            debug!(path = %self.path.display(), "memory store empty");
            return Ok(MemoryLookup::Empty);
        }

        let query_vec = match embedder.embed(query) {
            Ok(vector) => vector,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "query embedding failed; continuing without memory");
                return Ok(MemoryLookup::Empty);
            }
        };
        let expected = snapshot.records[0].embedding.len();
        if query_vec.len() != expected {
            return Err(MemoryError::DimensionMismatch {
                expected,
                found: query_vec.len(),
            });
        }

        let mut hits = snapshot
            .records
            .into_iter()
            .map(|record| {
                let distance = l2_distance(&query_vec, &record.embedding);
                MemoryHit { record, distance }
            })
            .collect::<Vec<_>>();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(top_k);
        debug!(hits = hits.len(), top_k, "memory lookup complete");
        Ok(MemoryLookup::Hits(hits))
    }

    /// Embeds and appends one idea, syncing the file before returning.
    ///
    /// An identical `(issue, fix, outcome)` already on file is returned as is.
    pub fn store(
        &self,
        embedder: &dyn Embedder,
        issue: &str,
        fix: &str,
        outcome: &str,
    ) -> Result<MemoryRecord, MemoryError> {
        let snapshot = self.load()?;
        if let Some(existing) = snapshot
            .records
            .iter()
            .find(|record| record.issue == issue && record.fix == fix && record.outcome == outcome)
        {
            debug!(id = existing.id, "idea already remembered");
            return Ok(existing.clone());
        }
        let embedding = embedder
            .embed(&MemoryRecord::embedding_text(issue, fix))
            .map_err(MemoryError::Embedding)?;
        if let Some(first) = snapshot.records.first() {
            if first.embedding.len() != embedding.len() {
                return Err(MemoryError::DimensionMismatch {
                    expected: first.embedding.len(),
                    found: embedding.len(),
                });
            }
        }

        let id = snapshot
            .records
            .iter()
            .map(|record| record.id)
            .max()
            .map_or(1, |max| max + 1);
        let mut record = MemoryRecord {
            id,
            issue: issue.to_string(),
            fix: fix.to_string(),
            outcome: outcome.to_string(),
            recorded_epoch_ms: now_epoch_ms(),
            embedding,
            checksum: 0,
        };
        record.checksum = record.compute_checksum();

        let mut line = String::new();
        if snapshot.needs_newline {
            line.push('\n');
        }
        line.push_str(&serde_json::to_string(&record)?);
        line.push('\n');
        self.append(snapshot.truncate_to, line.as_bytes())?;
        info!(id, path = %self.path.display(), "recorded idea in memory");
        Ok(record)
    }

    fn append(&self, truncate_to: Option<u64>, bytes: &[u8]) -> Result<(), MemoryError> {
        let io_err = |source: io::Error| MemoryError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        if let Some(len) = truncate_to {
            let file = OpenOptions::new()
                .write(true)
                .open(&self.path)
                .map_err(io_err)?;
            file.set_len(len).map_err(io_err)?;
            warn!(len, path = %self.path.display(), "truncated torn memory record");
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(bytes).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        file.sync_all().map_err(io_err)
    }

    fn load(&self) -> Result<Snapshot, MemoryError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Snapshot {
                    records: Vec::new(),
                    truncate_to: None,
                    needs_newline: false,
                })
            }
            Err(source) => {
                return Err(MemoryError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let segments: Vec<&str> = contents.split_inclusive('\n').collect();
        let mut records: Vec<MemoryRecord> = Vec::with_capacity(segments.len());
        let mut snapshot_tail = (None, false);
        let mut offset = 0usize;
        for (idx, segment) in segments.iter().enumerate() {
            let start = offset;
            offset += segment.len();
            let raw = segment.trim_end_matches(|ch| ch == '\n' || ch == '\r');
            if raw.trim().is_empty() {
                continue;
            }
            let is_last = idx + 1 == segments.len();
            match decode_line(raw) {
                Ok(record) => {
                    if let Some(first) = records.first() {
                        if first.embedding.len() != record.embedding.len() {
                            return Err(MemoryError::DimensionMismatch {
                                expected: first.embedding.len(),
                                found: record.embedding.len(),
                            });
                        }
                    }
                    records.push(record);
                    if is_last && !segment.ends_with('\n') {
                        snapshot_tail = (None, true);
                    }
                }
                Err(reason) if is_last => {
                    warn!(
                        line = idx + 1,
                        %reason,
                        path = %self.path.display(),
                        "ignoring torn trailing memory record"
                    );
                    snapshot_tail = (Some(start as u64), false);
                }
                Err(reason) => {
                    return Err(MemoryError::Corrupt {
                        line: idx + 1,
                        reason,
                    })
                }
            }
        }
        let (truncate_to, needs_newline) = snapshot_tail;
        Ok(Snapshot {
            records,
            truncate_to,
            needs_newline,
        })
    }
}

fn decode_line(raw: &str) -> Result<MemoryRecord, String> {
    let record: MemoryRecord = serde_json::from_str(raw).map_err(|err| err.to_string())?;
    if record.compute_checksum() != record.checksum {
        return Err(format!("checksum mismatch for record {}", record.id));
    }
    Ok(record)
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::cell::Cell;

    /// Maps known phrases onto fixed 2-d points.
    struct PointEmbedder {
        calls: Cell<usize>,
    }

    impl PointEmbedder {
        fn new() -> Self {
            Self {
                calls: Cell::new(0),
            }
        }
    }

    impl Embedder for PointEmbedder {
        fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            self.calls.set(self.calls.get() + 1);
            let point = if text.contains("checkout") {
                vec![10.0, 0.0]
            } else if text.contains("hero") {
                vec![0.0, 10.0]
            } else {
                vec![1.0, 1.0]
            };
            Ok(point)
        }
    }

    struct FailingEmbedder;

    impl Embedder for FailingEmbedder {
        fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Err(anyhow!("quota exhausted"))
        }
    }

    struct WideEmbedder;

    impl Embedder for WideEmbedder {
        fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(vec![0.0; 3])
        }
    }

    fn temp_store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MemoryStore::open(dir.path().join("memory").join("cro_memory.jsonl"));
        (dir, store)
    }

    #[test]
    fn missing_store_is_empty_without_embedding() {
        let (_dir, store) = temp_store();
        let embedder = PointEmbedder::new();
        for top_k in [0, 1, 50] {
            let lookup = store.retrieve(&embedder, "anything", top_k).unwrap();
            assert_eq!(lookup, MemoryLookup::Empty);
        }
        assert_eq!(embedder.calls.get(), 0);
        assert!(store.is_empty().unwrap());
        assert_eq!(MemoryLookup::Empty.render(), NO_MEMORY_TEXT);
    }

    #[test]
    fn top_k_larger_than_store_returns_everything() {
        let (_dir, store) = temp_store();
        let embedder = PointEmbedder::new();
        store
            .store(&embedder, "checkout too long", "remove steps", FAILED_OUTCOME)
            .unwrap();
        store
            .store(&embedder, "hero unclear", "rewrite hero", FAILED_OUTCOME)
            .unwrap();

        let lookup = store.retrieve(&embedder, "checkout friction", 5).unwrap();
        let hits = lookup.hits();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.issue, "checkout too long");
        assert_eq!(hits[0].distance, 0.0);
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[test]
    fn ids_increase_and_records_survive_reopen() {
        let (dir, store) = temp_store();
        let embedder = PointEmbedder::new();
        let first = store.store(&embedder, "a", "b", FAILED_OUTCOME).unwrap();
        let second = store.store(&embedder, "c", "d", FAILED_OUTCOME).unwrap();
        assert_eq!((first.id, second.id), (1, 2));

        let reopened = MemoryStore::open(dir.path().join("memory").join("cro_memory.jsonl"));
        let records = reopened.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(reopened.len().unwrap(), 2);
        assert!(!reopened.is_empty().unwrap());
        assert_eq!(records[1].issue, "c");
        assert_eq!(records[1].outcome, "failed");
    }

    #[test]
    fn torn_trailing_line_is_skipped_and_repaired() {
        let (_dir, store) = temp_store();
        let embedder = PointEmbedder::new();
        store.store(&embedder, "checkout slow", "x", FAILED_OUTCOME).unwrap();
        let mut file = OpenOptions::new().append(true).open(store.path()).unwrap();
        file.write_all(br#"{"id":2,"issue":"half wri"#).unwrap();
        drop(file);

        assert_eq!(store.records().unwrap().len(), 1);
        let third = store.store(&embedder, "hero", "y", FAILED_OUTCOME).unwrap();
        assert_eq!(third.id, 2);

        let records = store.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].issue, "hero");
    }

    #[test]
    fn complete_last_line_without_newline_is_kept() {
        let (_dir, store) = temp_store();
        let embedder = PointEmbedder::new();
        store.store(&embedder, "checkout slow", "x", FAILED_OUTCOME).unwrap();
        let contents = fs::read_to_string(store.path()).unwrap();
        fs::write(store.path(), contents.trim_end_matches('\n')).unwrap();

        let second = store.store(&embedder, "hero", "y", FAILED_OUTCOME).unwrap();
        assert_eq!(second.id, 2);

        let records = store.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].issue, "checkout slow");
        assert_eq!(records[1].issue, "hero");
        assert!(fs::read_to_string(store.path()).unwrap().ends_with('\n'));
    }

    #[test]
    fn identical_ideas_are_stored_once() {
        let (_dir, store) = temp_store();
        let embedder = PointEmbedder::new();
        let first = store.store(&embedder, "checkout slow", "x", FAILED_OUTCOME).unwrap();
        let again = store.store(&embedder, "checkout slow", "x", FAILED_OUTCOME).unwrap();

        assert_eq!(again, first);
        assert_eq!(embedder.calls.get(), 1);
        assert_eq!(store.len().unwrap(), 1);

        let other_outcome = store.store(&embedder, "checkout slow", "x", "won").unwrap();
        assert_eq!(other_outcome.id, 2);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn corruption_before_the_tail_is_fatal() {
        let (_dir, store) = temp_store();
        let embedder = PointEmbedder::new();
        store.store(&embedder, "one", "x", FAILED_OUTCOME).unwrap();
        store.store(&embedder, "two", "y", FAILED_OUTCOME).unwrap();

        let contents = fs::read_to_string(store.path()).unwrap();
        fs::write(store.path(), contents.replacen("\"one\"", "\"uno\"", 1)).unwrap();

        match store.records() {
            Err(MemoryError::Corrupt { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn dimension_changes_are_rejected() {
        let (_dir, store) = temp_store();
        store
            .store(&PointEmbedder::new(), "one", "x", FAILED_OUTCOME)
            .unwrap();

        assert!(matches!(
            store.store(&WideEmbedder, "two", "y", FAILED_OUTCOME),
            Err(MemoryError::DimensionMismatch {
                expected: 2,
                found: 3
            })
        ));
        assert!(matches!(
            store.retrieve(&WideEmbedder, "q", 3),
            Err(MemoryError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn embedding_failures_differ_between_read_and_write() {
        let (_dir, store) = temp_store();
        store
            .store(&PointEmbedder::new(), "one", "x", FAILED_OUTCOME)
            .unwrap();

        assert_eq!(
            store.retrieve(&FailingEmbedder, "q", 3).unwrap(),
            MemoryLookup::Empty
        );
        assert!(matches!(
            store.store(&FailingEmbedder, "two", "y", FAILED_OUTCOME),
            Err(MemoryError::Embedding(_))
        ));
        assert_eq!(store.records().unwrap().len(), 1);
    }

    #[test]
    fn render_lists_hits() {
        let (_dir, store) = temp_store();
        let embedder = PointEmbedder::new();
        store
            .store(&embedder, "hero unclear", "rewrite hero copy", FAILED_OUTCOME)
            .unwrap();
        let text = store.retrieve(&embedder, "hero", 3).unwrap().render();
        assert_eq!(
            text,
            "- Issue: hero unclear | Fix: rewrite hero copy | Outcome: failed"
        );
    }
}
