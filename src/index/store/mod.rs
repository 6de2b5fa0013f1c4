#[cfg(test)]
mod tests;

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{
    DocumentRecord, FlatIndex, IndexConfig, IndexKind, IvfIndex, Neighbor, RestoreError,
    VectorIndex,
};
use crate::{RagError, Result};

const INDEX_MAGIC: [u8; 4] = *b"DRIX";
const INDEX_FORMAT_VERSION: u32 = 1;

/// On-disk envelope for the index blob
#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    magic: [u8; 4],
    version: u32,
    index: VectorIndex,
}

/// Vector index plus its parallel metadata records.
///
/// Rows are only ever appended, and the vector count always equals the record
/// count after a successful mutation.
#[derive(Debug, Default)]
pub struct IndexStore {
    config: IndexConfig,
    index: Option<VectorIndex>,
    records: Vec<DocumentRecord>,
}

impl IndexStore {
    #[inline]
    pub fn new(config: IndexConfig) -> Self {
        Self {
            config,
            index: None,
            records: Vec::new(),
        }
    }

    /// True when an index exists and holds at least one vector
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.index.as_ref().is_some_and(|index| !index.is_empty())
    }

    /// Number of indexed chunks
    #[inline]
    pub fn document_count(&self) -> usize {
        self.index.as_ref().map_or(0, VectorIndex::len)
    }

    #[inline]
    pub fn records(&self) -> &[DocumentRecord] {
        &self.records
    }

    #[inline]
    pub fn record(&self, row: usize) -> Option<&DocumentRecord> {
        self.records.get(row)
    }

    #[inline]
    pub fn dimension(&self) -> Option<usize> {
        self.index.as_ref().map(VectorIndex::dimension)
    }

    #[inline]
    pub fn kind(&self) -> Option<IndexKind> {
        self.index.as_ref().map(VectorIndex::kind)
    }

    /// Replace the index with one built from `vectors`, parallel to `records`
    #[inline]
    pub fn build(&mut self, vectors: Vec<Vec<f32>>, records: Vec<DocumentRecord>) -> Result<()> {
        validate_batch(&vectors, &records, None)?;

        let dimension = vectors[0].len();
        let mut index = if vectors.len() > self.config.ivf_threshold {
            info!(
                "Building IVF index with {} clusters over {} vectors",
                self.config.nlist,
                vectors.len()
            );
            VectorIndex::Ivf(IvfIndex::train(
                &vectors,
                self.config.nlist,
                self.config.nprobe,
            ))
        } else {
            info!("Building flat index (exact search)");
            VectorIndex::Flat(FlatIndex::new(dimension))
        };

        index.add(&vectors);
        self.index = Some(index);
        self.records = records;

        info!("Built index with {} vectors", self.document_count());
        Ok(())
    }

    /// Append rows to the existing index, building one if none exists
    #[inline]
    pub fn append(&mut self, vectors: Vec<Vec<f32>>, records: Vec<DocumentRecord>) -> Result<()> {
        let Some(index) = self.index.as_mut() else {
            return self.build(vectors, records);
        };

        if vectors.is_empty() && records.is_empty() {
            debug!("Nothing to append");
            return Ok(());
        }

        validate_batch(&vectors, &records, Some(index.dimension()))?;

        index.add(&vectors);
        self.records.extend(records);

        info!(
            "Added {} vectors. Total: {}",
            vectors.len(),
            self.document_count()
        );
        Ok(())
    }

    /// Rank rows by inner product with `query`, best first
    #[inline]
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<Neighbor>> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| RagError::Index("No index built yet".to_string()))?;

        if query.len() != index.dimension() {
            return Err(RagError::Validation(format!(
                "Query dimension ({}) != index dimension ({})",
                query.len(),
                index.dimension()
            )));
        }

        Ok(index.search(query, top_k))
    }

    /// Write the index blob and the metadata list, each replaced atomically
    #[inline]
    pub fn persist(&self, index_path: &Path, metadata_path: &Path) -> Result<()> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| RagError::Validation("No index to save. Build one first.".to_string()))?;

        let envelope = IndexFile {
            magic: INDEX_MAGIC,
            version: INDEX_FORMAT_VERSION,
            index: index.clone(),
        };
        let blob = bincode::serialize(&envelope)
            .map_err(|e| RagError::Index(format!("Failed to serialize index: {}", e)))?;
        let metadata = serde_json::to_vec(&self.records)
            .map_err(|e| RagError::Index(format!("Failed to serialize metadata: {}", e)))?;

        write_atomically(index_path, &blob)?;
        write_atomically(metadata_path, &metadata)?;

        info!("Saved index to {}", index_path.display());
        info!("Saved metadata to {}", metadata_path.display());
        Ok(())
    }

    /// Load a persisted index and its metadata, returning the row count.
    ///
    /// On any failure the store is left empty rather than partially loaded.
    #[inline]
    pub fn restore(
        &mut self,
        index_path: &Path,
        metadata_path: &Path,
    ) -> std::result::Result<usize, RestoreError> {
        match load_artifacts(index_path, metadata_path) {
            Ok((index, records)) => {
                info!(
                    "Loaded index with {} vectors and {} metadata entries",
                    index.len(),
                    records.len()
                );
                self.index = Some(index);
                self.records = records;
                Ok(self.records.len())
            }
            Err(e) => {
                match &e {
                    RestoreError::Missing(_) => warn!("Index files not found: {}", e),
                    _ => error!("Failed to load index: {}", e),
                }
                self.index = None;
                self.records.clear();
                Err(e)
            }
        }
    }
}

fn validate_batch(
    vectors: &[Vec<f32>],
    records: &[DocumentRecord],
    dimension: Option<usize>,
) -> Result<()> {
    if vectors.len() != records.len() {
        return Err(RagError::Validation(format!(
            "Document count ({}) != metadata count ({})",
            vectors.len(),
            records.len()
        )));
    }

    let Some(first) = vectors.first() else {
        return Err(RagError::Validation(
            "Cannot index an empty batch".to_string(),
        ));
    };

    let expected = dimension.unwrap_or(first.len());
    if expected == 0 {
        return Err(RagError::Validation(
            "Vectors must have at least one dimension".to_string(),
        ));
    }

    if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
        return Err(RagError::Validation(format!(
            "Vector dimension ({}) != expected dimension ({})",
            bad.len(),
            expected
        )));
    }

    Ok(())
}

fn load_artifacts(
    index_path: &Path,
    metadata_path: &Path,
) -> std::result::Result<(VectorIndex, Vec<DocumentRecord>), RestoreError> {
    let blob = read_artifact(index_path)?;
    let envelope: IndexFile =
        bincode::deserialize(&blob).map_err(|e| RestoreError::Corrupted {
            artifact: "index",
            path: index_path.to_path_buf(),
            message: e.to_string(),
        })?;

    if envelope.magic != INDEX_MAGIC || envelope.version != INDEX_FORMAT_VERSION {
        return Err(RestoreError::Corrupted {
            artifact: "index",
            path: index_path.to_path_buf(),
            message: format!("unrecognised header (version {})", envelope.version),
        });
    }

    envelope
        .index
        .validate()
        .map_err(|message| RestoreError::Corrupted {
            artifact: "index",
            path: index_path.to_path_buf(),
            message,
        })?;

    let metadata = read_artifact(metadata_path)?;
    let records: Vec<DocumentRecord> =
        serde_json::from_slice(&metadata).map_err(|e| RestoreError::Corrupted {
            artifact: "metadata",
            path: metadata_path.to_path_buf(),
            message: e.to_string(),
        })?;

    if envelope.index.len() != records.len() {
        return Err(RestoreError::Inconsistent {
            vectors: envelope.index.len(),
            records: records.len(),
        });
    }

    Ok((envelope.index, records))
}

fn read_artifact(path: &Path) -> std::result::Result<Vec<u8>, RestoreError> {
    fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => RestoreError::Missing(path.to_path_buf()),
        io::ErrorKind::PermissionDenied => RestoreError::PermissionDenied(path.to_path_buf()),
        _ => RestoreError::Unexpected(format!("{}: {}", path.display(), e)),
    })
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let temp_path = temp_sibling(path);
    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}
