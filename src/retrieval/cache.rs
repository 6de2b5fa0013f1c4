use std::fmt::Write;
use std::num::NonZeroUsize;

use lru::LruCache;
use sha2::{Digest, Sha256};

/// Hex characters of the SHA-256 digest kept as the cache key
const KEY_LENGTH: usize = 16;

/// Bounded query-embedding cache with first-in-first-out eviction.
///
/// Lookups use `peek`, so reading an entry never moves it; the entry
/// evicted is always the one inserted longest ago.
#[derive(Debug, Clone)]
pub struct QueryCache {
    entries: LruCache<String, Vec<f32>>,
}

impl QueryCache {
    /// A capacity of 0 is treated as 1
    #[inline]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Cache key for a query: a truncated hex SHA-256 of its exact text
    #[inline]
    pub fn key(query: &str) -> String {
        let digest = Sha256::digest(query.as_bytes());
        let mut key = String::with_capacity(KEY_LENGTH);
        for byte in digest.iter().take(KEY_LENGTH / 2) {
            // Writing to a String cannot fail
            let _ = write!(key, "{:02x}", byte);
        }
        key
    }

    #[inline]
    pub fn get(&self, query: &str) -> Option<&[f32]> {
        self.entries.peek(&Self::key(query)).map(Vec::as_slice)
    }

    /// Store an embedding, evicting the oldest entry once over capacity.
    /// Replacing an existing entry keeps its original position.
    #[inline]
    pub fn insert(&mut self, query: &str, embedding: Vec<f32>) {
        let key = Self::key(query);
        if let Some(existing) = self.entries.peek_mut(&key) {
            *existing = embedding;
            return;
        }
        self.entries.push(key, embedding);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
