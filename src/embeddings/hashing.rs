use anyhow::Result;
use sha2::{Digest, Sha256};

use super::EmbeddingModel;

/// Deterministic feature-hashing model.
///
/// Each lower-cased alphanumeric token is hashed into one signed bucket, so
/// texts sharing vocabulary land near each other. Needs no network or model
/// files, which makes it suitable for offline use and tests.
#[derive(Debug, Clone)]
pub struct HashingModel {
    dimension: usize,
    name: String,
}

impl HashingModel {
    #[inline]
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            name: format!("hashing-{}", dimension),
        }
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket_bytes = [0_u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);

            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        vector
    }
}

impl EmbeddingModel for HashingModel {
    #[inline]
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }

    #[inline]
    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_has_configured_dimension() {
        let model = HashingModel::new(64);
        let vectors = model
            .embed(&["alpha beta".to_string(), String::new()])
            .expect("hashing never fails");

        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|v| v.len() == 64));
        assert!(vectors[1].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn deterministic_and_case_insensitive() {
        let model = HashingModel::new(128);
        let vectors = model
            .embed(&["Rust Vectors".to_string(), "rust vectors".to_string()])
            .expect("hashing never fails");

        assert_eq!(vectors[0], vectors[1]);
    }

    #[test]
    fn shared_tokens_score_higher() {
        let model = HashingModel::new(1024);
        let vectors = model
            .embed(&[
                "the quick brown fox".to_string(),
                "quick brown fox jumps".to_string(),
                "database migration script".to_string(),
            ])
            .expect("hashing never fails");

        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&vectors[0], &vectors[1]) > dot(&vectors[0], &vectors[2]));
    }
}
