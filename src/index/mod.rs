// Vector index module
// Dense vectors plus their parallel metadata records, with exact and clustered search


pub mod flat;
pub mod ivf;
pub mod store;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use flat::FlatIndex;
pub use ivf::IvfIndex;
pub use store::IndexStore;

/// Metadata filters: every key must be present on a record with an equal value
pub type Filters = BTreeMap<String, Value>;

/// Metadata stored alongside each indexed chunk.
///
/// Record `i` always describes vector row `i` of the index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    /// Where the document came from, e.g. `uploaded_document`
    pub source_type: String,
    pub document_id: String,
    pub filename: String,
    /// 0-based position of the chunk within its document
    pub chunk_idx: usize,
    pub total_chunks: usize,
    /// Chunk text as embedded, including its provenance tag
    pub content: String,
    /// Character count of the whole extracted document
    pub char_count: usize,
    /// File extension without the dot
    pub file_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    pub uploaded_at: DateTime<Utc>,
    /// Caller-supplied fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DocumentRecord {
    /// Look up a field by name as a JSON value, falling back to the extra fields
    #[inline]
    pub fn field(&self, key: &str) -> Option<Value> {
        match key {
            "source_type" => Some(Value::from(self.source_type.as_str())),
            "document_id" => Some(Value::from(self.document_id.as_str())),
            "filename" => Some(Value::from(self.filename.as_str())),
            "chunk_idx" => Some(Value::from(self.chunk_idx)),
            "total_chunks" => Some(Value::from(self.total_chunks)),
            "content" => Some(Value::from(self.content.as_str())),
            "char_count" => Some(Value::from(self.char_count)),
            "file_type" => Some(Value::from(self.file_type.as_str())),
            "file_size" => self.file_size.map(Value::from),
            "uploaded_at" => serde_json::to_value(self.uploaded_at).ok(),
            _ => self.extra.get(key).cloned(),
        }
    }

    /// True when every filter key/value pair matches exactly
    #[inline]
    pub fn matches(&self, filters: &Filters) -> bool {
        filters
            .iter()
            .all(|(key, expected)| self.field(key).as_ref() == Some(expected))
    }
}

/// One ranked search slot. `row` is `None` when the index had no candidate
/// for this slot; callers skip those instead of treating them as row 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub score: f32,
    pub row: Option<usize>,
}

impl Neighbor {
    pub(crate) const EMPTY: Self = Self {
        score: f32::NEG_INFINITY,
        row: None,
    };
}

/// Configuration for index construction and the persisted artifacts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IndexConfig {
    pub index_filename: String,
    pub metadata_filename: String,
    /// Corpus size above which a clustered index replaces exact search
    pub ivf_threshold: usize,
    /// Number of clusters trained for the clustered index
    pub nlist: usize,
    /// Number of clusters scanned per query
    pub nprobe: usize,
}

impl Default for IndexConfig {
    #[inline]
    fn default() -> Self {
        Self {
            index_filename: "index.bin".to_string(),
            metadata_filename: "metadata.json".to_string(),
            ivf_threshold: 10_000,
            nlist: 100,
            nprobe: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Flat,
    Ivf,
}

impl std::fmt::Display for IndexKind {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flat => write!(f, "flat (exact)"),
            Self::Ivf => write!(f, "ivf (approximate)"),
        }
    }
}

/// Inner-product index over unit vectors
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum VectorIndex {
    Flat(FlatIndex),
    Ivf(IvfIndex),
}

impl VectorIndex {
    #[inline]
    pub fn kind(&self) -> IndexKind {
        match self {
            Self::Flat(_) => IndexKind::Flat,
            Self::Ivf(_) => IndexKind::Ivf,
        }
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        match self {
            Self::Flat(index) => index.dimension(),
            Self::Ivf(index) => index.dimension(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Self::Flat(index) => index.len(),
            Self::Ivf(index) => index.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn add(&mut self, vectors: &[Vec<f32>]) {
        match self {
            Self::Flat(index) => index.add(vectors),
            Self::Ivf(index) => index.add(vectors),
        }
    }

    #[inline]
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<Neighbor> {
        match self {
            Self::Flat(index) => index.search(query, top_k),
            Self::Ivf(index) => index.search(query, top_k),
        }
    }

    /// Check the internal layout of an index read from disk
    #[inline]
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Self::Flat(index) => index.validate(),
            Self::Ivf(index) => index.validate(),
        }
    }
}

/// Storage must hold whole rows of a non-zero dimension
pub(crate) fn validate_rows(dimension: usize, data: &[f32]) -> std::result::Result<(), String> {
    if dimension == 0 {
        return if data.is_empty() {
            Ok(())
        } else {
            Err("vector data present with zero dimension".to_string())
        };
    }
    if data.len() % dimension != 0 {
        return Err(format!(
            "{} floats do not form whole rows of dimension {}",
            data.len(),
            dimension
        ));
    }
    Ok(())
}

/// Why restoring a persisted index failed. Every variant leaves the store empty.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("index file not found: {}", .0.display())]
    Missing(PathBuf),
    #[error("permission denied accessing {}", .0.display())]
    PermissionDenied(PathBuf),
    #[error("corrupted {artifact} at {}: {message}", .path.display())]
    Corrupted {
        artifact: &'static str,
        path: PathBuf,
        message: String,
    },
    #[error("index holds {vectors} vectors but metadata holds {records} records")]
    Inconsistent { vectors: usize, records: usize },
    #[error("unexpected failure loading index: {0}")]
    Unexpected(String),
}

/// Dot product of two equal-length slices
#[inline]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Keep the `top_k` best `(score, row)` pairs, highest score first.
///
/// When fewer candidates than requested were scored, the result is padded
/// with empty slots, but never beyond the `rows` the index holds.
pub(crate) fn rank(mut scored: Vec<(f32, usize)>, top_k: usize, rows: usize) -> Vec<Neighbor> {
    let slots = top_k.min(rows);
    scored.sort_unstable_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    scored.truncate(slots);

    let mut neighbors: Vec<Neighbor> = scored
        .into_iter()
        .map(|(score, row)| Neighbor {
            score,
            row: Some(row),
        })
        .collect();
    neighbors.resize(slots, Neighbor::EMPTY);
    neighbors
}
