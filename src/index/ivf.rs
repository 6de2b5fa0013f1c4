use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Neighbor, inner_product, rank, validate_rows};

const TRAINING_ITERATIONS: usize = 20;

/// Clustered (inverted file) index.
///
/// Vectors are bucketed under the nearest of `nlist` trained centroids and a
/// query only scans the `nprobe` closest buckets, trading recall for speed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IvfIndex {
    dimension: usize,
    nprobe: usize,
    centroids: Vec<Vec<f32>>,
    /// Row ids assigned to each centroid
    lists: Vec<Vec<usize>>,
    data: Vec<f32>,
}

impl IvfIndex {
    /// Train centroids on `training` with spherical k-means. The training
    /// vectors are not added; call [`IvfIndex::add`] afterwards.
    #[inline]
    pub fn train(training: &[Vec<f32>], nlist: usize, nprobe: usize) -> Self {
        let dimension = training.first().map_or(0, Vec::len);
        let centroids = k_means(training, nlist.max(1), TRAINING_ITERATIONS);
        let nlist = centroids.len();

        debug!(
            "Trained IVF index with {} centroids over {} vectors",
            nlist,
            training.len()
        );

        Self {
            dimension,
            nprobe: nprobe.clamp(1, nlist.max(1)),
            lists: vec![Vec::new(); nlist],
            centroids,
            data: Vec::new(),
        }
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn nlist(&self) -> usize {
        self.centroids.len()
    }

    #[inline]
    pub fn nprobe(&self) -> usize {
        self.nprobe
    }

    #[inline]
    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append vectors as new rows, each filed under its nearest centroid
    #[inline]
    pub fn add(&mut self, vectors: &[Vec<f32>]) {
        let first_row = self.len();
        self.data.reserve(vectors.len() * self.dimension);

        for (offset, vector) in vectors.iter().enumerate() {
            if let Some(list) = nearest_centroid(&self.centroids, vector)
                .and_then(|list| self.lists.get_mut(list))
            {
                list.push(first_row + offset);
            }
            self.data.extend_from_slice(vector);
        }
    }

    #[inline]
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<Neighbor> {
        let mut probes: Vec<(f32, usize)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, centroid)| (inner_product(query, centroid), i))
            .collect();
        probes.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));
        probes.truncate(self.nprobe);

        let scored = probes
            .iter()
            .filter_map(|&(_, list)| self.lists.get(list))
            .flatten()
            .filter_map(|&row| {
                let start = row.checked_mul(self.dimension)?;
                self.data
                    .get(start..start.checked_add(self.dimension)?)
                    .map(|vector| (inner_product(query, vector), row))
            })
            .collect();

        rank(scored, top_k, self.len())
    }

    /// Every centroid has a list, every vector has the index dimension and
    /// every listed row exists
    pub(crate) fn validate(&self) -> Result<(), String> {
        validate_rows(self.dimension, &self.data)?;

        if self.lists.len() != self.centroids.len() {
            return Err(format!(
                "{} centroids but {} inverted lists",
                self.centroids.len(),
                self.lists.len()
            ));
        }
        if self.centroids.iter().any(|c| c.len() != self.dimension) {
            return Err(format!(
                "centroid dimension does not match index dimension {}",
                self.dimension
            ));
        }
        if !self.centroids.is_empty() && self.nprobe == 0 {
            return Err("nprobe must be at least 1".to_string());
        }

        let rows = self.len();
        if let Some(row) = self.lists.iter().flatten().find(|&&row| row >= rows) {
            return Err(format!("inverted list references row {} of {}", row, rows));
        }
        Ok(())
    }
}

fn nearest_centroid(centroids: &[Vec<f32>], vector: &[f32]) -> Option<usize> {
    centroids
        .iter()
        .enumerate()
        .map(|(i, centroid)| (i, inner_product(vector, centroid)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

/// k-means over unit vectors using inner-product assignment. Centroids are
/// re-normalised after each update and empty clusters are dropped.
fn k_means(vectors: &[Vec<f32>], k: usize, max_iterations: usize) -> Vec<Vec<f32>> {
    if vectors.is_empty() {
        return Vec::new();
    }

    let k = k.min(vectors.len());
    let dimension = vectors[0].len();

    // Seed with evenly spaced vectors
    let step = vectors.len() / k;
    let mut centroids: Vec<Vec<f32>> = (0..k)
        .map(|i| vectors[(i * step).min(vectors.len() - 1)].clone())
        .collect();

    let mut assignments = vec![usize::MAX; vectors.len()];

    for _ in 0..max_iterations {
        let mut changed = false;
        for (i, vector) in vectors.iter().enumerate() {
            let best = nearest_centroid(&centroids, vector).unwrap_or(0);
            if assignments[i] != best {
                assignments[i] = best;
                changed = true;
            }
        }

        if !changed {
            break;
        }

        let mut sums = vec![vec![0.0_f32; dimension]; k];
        let mut counts = vec![0_usize; k];
        for (vector, &cluster) in vectors.iter().zip(&assignments) {
            counts[cluster] += 1;
            for (sum, value) in sums[cluster].iter_mut().zip(vector) {
                *sum += value;
            }
        }

        for ((centroid, sum), count) in centroids.iter_mut().zip(sums).zip(&counts) {
            if *count > 0 {
                *centroid = normalize(sum);
            }
        }
    }

    let mut used = vec![false; k];
    for &cluster in &assignments {
        if let Some(flag) = used.get_mut(cluster) {
            *flag = true;
        }
    }

    centroids
        .into_iter()
        .zip(used)
        .filter_map(|(centroid, used)| used.then_some(centroid))
        .collect()
}

fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
}
