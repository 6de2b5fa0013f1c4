
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Markers tried, in priority order, when looking for a place to end a chunk
const BOUNDARY_MARKERS: [&str; 4] = [". ", "! ", "? ", "\n"];

/// A single piece of a document, ready for embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// The trimmed chunk text
    pub text: String,
    /// ID of the document this chunk was cut from
    pub document_id: String,
    /// 0-based position of this chunk within the document
    pub position: usize,
    /// Number of chunks the document was split into
    pub total: usize,
}

/// Configuration for content chunking
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Window length in characters
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 128,
        }
    }
}

/// Splits raw document text into overlapping, boundary-aware chunks
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    #[inline]
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    #[inline]
    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Split `text` into chunk strings using this chunker's configuration
    #[inline]
    pub fn chunk_text(&self, text: &str) -> Vec<String> {
        chunk_text(text, self.config.chunk_size, self.config.chunk_overlap)
    }

    /// Split a document's text into positioned [`Chunk`]s
    #[inline]
    pub fn chunk_document(&self, document_id: &str, text: &str) -> Vec<Chunk> {
        let pieces = self.chunk_text(text);
        let total = pieces.len();

        debug!(
            "Chunked document {} into {} chunks (size {}, overlap {})",
            document_id, total, self.config.chunk_size, self.config.chunk_overlap
        );

        pieces
            .into_iter()
            .enumerate()
            .map(|(position, text)| Chunk {
                text,
                document_id: document_id.to_string(),
                position,
                total,
            })
            .collect()
    }
}

/// Split text into overlapping chunks of at most `chunk_size` characters.
///
/// Windows that end before the end of the text are cut back to the last
/// sentence or line boundary when one exists in the back half of the window.
/// Every returned chunk is trimmed and non-empty. `overlap` is clamped below
/// `chunk_size` so the window always advances.
#[inline]
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size - 1);

    let chars: Vec<char> = text.trim().chars().collect();
    if chars.len() <= chunk_size {
        return if chars.is_empty() {
            Vec::new()
        } else {
            vec![chars.iter().collect()]
        };
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let mut end = (start + chunk_size).min(chars.len());

        if end < chars.len() {
            if let Some(cut) = find_boundary(&chars[start..end], chunk_size) {
                end = start + cut;
            }
        }

        let piece: String = chars[start..end].iter().collect();
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }

        if end >= chars.len() {
            break;
        }

        start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
}

/// Length of the window after cutting at the first marker (in priority order)
/// whose last occurrence starts in the back half of the window. The marker's
/// leading character is kept.
fn find_boundary(window: &[char], chunk_size: usize) -> Option<usize> {
    BOUNDARY_MARKERS.iter().find_map(|marker| {
        let marker: Vec<char> = marker.chars().collect();
        rfind_chars(window, &marker)
            .filter(|&pos| pos * 2 >= chunk_size)
            .map(|pos| pos + 1)
    })
}

fn rfind_chars(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| haystack[i..i + needle.len()] == *needle)
}
