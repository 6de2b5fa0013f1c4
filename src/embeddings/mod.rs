// Embeddings module
// Wraps an external embedding model behind a lazily loaded, batching, normalising embedder


pub mod hashing;
pub mod ollama;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, info};

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::{RagError, Result};

pub use hashing::HashingModel;
pub use ollama::OllamaClient;

pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Batches between throughput log lines
const PROGRESS_LOG_INTERVAL: usize = 10;

/// An external capability that maps texts to dense vectors
pub trait EmbeddingModel: Send + Sync {
    /// Embed `texts`, returning one vector per input in the same order
    fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    /// Identifier used in logs
    fn name(&self) -> &str;
}

type ModelLoader = Box<dyn Fn() -> anyhow::Result<Arc<dyn EmbeddingModel>> + Send + Sync>;

enum ModelState {
    Unloaded,
    Loaded(Arc<dyn EmbeddingModel>),
}

/// Produces unit-length embeddings, loading its model on first use
pub struct Embedder {
    model_name: String,
    batch_size: usize,
    loader: ModelLoader,
    state: Mutex<ModelState>,
}

impl std::fmt::Debug for Embedder {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("model_name", &self.model_name)
            .field("batch_size", &self.batch_size)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

impl Embedder {
    /// Create an embedder whose model is produced by `loader` on first use
    #[inline]
    pub fn new<F>(model_name: impl Into<String>, batch_size: usize, loader: F) -> Self
    where
        F: Fn() -> anyhow::Result<Arc<dyn EmbeddingModel>> + Send + Sync + 'static,
    {
        Self {
            model_name: model_name.into(),
            batch_size: batch_size.max(1),
            loader: Box::new(loader),
            state: Mutex::new(ModelState::Unloaded),
        }
    }

    /// Create an embedder around a model that is already available
    #[inline]
    pub fn from_model(model: Arc<dyn EmbeddingModel>, batch_size: usize) -> Self {
        let model_name = model.name().to_string();
        Self {
            model_name,
            batch_size: batch_size.max(1),
            loader: Box::new(|| Err(anyhow::anyhow!("model is preloaded"))),
            state: Mutex::new(ModelState::Loaded(model)),
        }
    }

    /// Create an embedder for the configured provider. Nothing is contacted
    /// until the first embedding is requested.
    #[inline]
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| RagError::Config(e.to_string()))?;

        let batch_size = config.batch_size as usize;
        match config.provider {
            EmbeddingProvider::Ollama => {
                let config = config.clone();
                Ok(Self::new(config.model.clone(), batch_size, move || {
                    let client = OllamaClient::new(&config)?;
                    client.ensure_model_available()?;
                    Ok(Arc::new(client) as Arc<dyn EmbeddingModel>)
                }))
            }
            EmbeddingProvider::Hashing => {
                let dimension = config.dimension as usize;
                Ok(Self::new(
                    format!("hashing-{}", dimension),
                    batch_size,
                    move || Ok(Arc::new(HashingModel::new(dimension)) as Arc<dyn EmbeddingModel>),
                ))
            }
        }
    }

    #[inline]
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether the model has been loaded yet
    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.state
            .lock()
            .is_ok_and(|state| matches!(*state, ModelState::Loaded(_)))
    }

    /// Return the loaded model, loading it first if needed
    #[inline]
    pub fn ensure_loaded(&self) -> Result<Arc<dyn EmbeddingModel>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| RagError::Embedding("Embedding model lock poisoned".to_string()))?;

        if let ModelState::Loaded(model) = &*state {
            return Ok(Arc::clone(model));
        }

        info!("Loading embedding model: {}", self.model_name);
        let model = (self.loader)().map_err(|e| {
            RagError::Embedding(format!(
                "Failed to load embedding model {}: {:#}",
                self.model_name, e
            ))
        })?;
        *state = ModelState::Loaded(Arc::clone(&model));
        info!("Embedding model loaded");

        Ok(model)
    }

    /// Embed texts in batches, returning unit-length vectors in input order
    #[inline]
    pub fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.ensure_loaded()?;
        let total_batches = texts.len().div_ceil(self.batch_size);
        let start_time = Instant::now();
        let mut embeddings = Vec::with_capacity(texts.len());

        for (batch_index, batch) in texts.chunks(self.batch_size).enumerate() {
            let batch_num = batch_index + 1;
            if batch_num % PROGRESS_LOG_INTERVAL == 0 {
                let elapsed = start_time.elapsed().as_secs_f64();
                let rate = if elapsed > 0.0 {
                    embeddings.len() as f64 / elapsed
                } else {
                    0.0
                };
                info!(
                    "Embedding batch {}/{} ({:.0} docs/sec)",
                    batch_num, total_batches, rate
                );
            }

            let vectors = model.embed(batch).map_err(|e| {
                RagError::Embedding(format!(
                    "Failed to embed batch {}/{}: {:#}",
                    batch_num, total_batches, e
                ))
            })?;

            if vectors.len() != batch.len() {
                return Err(RagError::Embedding(format!(
                    "Mismatch between request and response counts: {} vs {}",
                    batch.len(),
                    vectors.len()
                )));
            }

            embeddings.extend(vectors.into_iter().map(|mut vector| {
                l2_normalize(&mut vector);
                vector
            }));
        }

        let elapsed = start_time.elapsed().as_secs_f64();
        info!(
            "Embedded {} texts in {:.1}s ({:.0} docs/sec)",
            texts.len(),
            elapsed,
            texts.len() as f64 / elapsed.max(f64::EPSILON)
        );

        Ok(embeddings)
    }

    /// Embed a single text as a unit-length vector
    #[inline]
    pub fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        debug!("Embedding single text (length: {})", text.len());
        self.embed_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| RagError::Embedding("Model returned no embedding".to_string()))
    }
}

/// Scale `vector` to unit length in place. Zero vectors are left unchanged.
#[inline]
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
}
