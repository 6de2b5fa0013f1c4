
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::chunking::ChunkingConfig;
use crate::generation::GenerationConfig;
use crate::index::IndexConfig;
use crate::retrieval::RetrievalConfig;

/// Environment variable that overrides the base directory
pub const HOME_ENV_VAR: &str = "DOCS_RAG_HOME";
const CONFIG_FILENAME: &str = "config.toml";
const DATA_DIRNAME: &str = "data";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Where embeddings come from
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// A local Ollama server
    #[default]
    Ollama,
    /// Offline feature hashing, no model server required
    Hashing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub model: String,
    pub dimension: u32,
    pub batch_size: u32,
}

impl Default for EmbeddingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Ollama,
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            model: "nomic-embed-text:latest".to_string(),
            dimension: 768,
            batch_size: 256,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid embedding dimension: {0} (must be between 64 and 4096)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid chunk size: {0} (must be between 64 and 8192)")]
    InvalidChunkSize(usize),
    #[error("Chunk overlap ({0}) must be smaller than chunk size ({1})")]
    ChunkOverlapTooLarge(usize, usize),
    #[error("Invalid result count: {0} (must be between 1 and 20)")]
    InvalidResultCount(usize),
    #[error("Invalid max context length: {0} (must be at least 100 characters)")]
    InvalidMaxContextChars(usize),
    #[error("Invalid cache capacity: {0} (must be at least 1)")]
    InvalidCacheCapacity(usize),
    #[error("Invalid index filename: {0:?} (cannot be empty)")]
    InvalidIndexFilename(String),
    #[error("Invalid cluster settings: nlist {0}, nprobe {1} (both must be at least 1)")]
    InvalidClusterSettings(usize, usize),
    #[error("Invalid temperature: {0} (must be between 0.0 and 2.0)")]
    InvalidTemperature(f32),
    #[error("Invalid max tokens: {0} (must be at least 1)")]
    InvalidMaxTokens(u32),
    #[error("Invalid rate limit: {0} calls per {1}s (both must be at least 1)")]
    InvalidRateLimit(u32, u64),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Base directory: `$DOCS_RAG_HOME` when set, otherwise `~/.docs-rag`
    #[inline]
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        if let Some(home) = std::env::var_os(HOME_ENV_VAR).filter(|value| !value.is_empty()) {
            return Ok(PathBuf::from(home));
        }

        dirs::home_dir()
            .map(|home| home.join(".docs-rag"))
            .or_else(|| dirs::data_dir().map(|data| data.join("docs-rag")))
            .ok_or(ConfigError::DirectoryError)
    }

    /// Load the configuration in the default base directory
    #[inline]
    pub fn load_default() -> Result<Self> {
        let config_dir = Self::config_dir().context("Failed to locate configuration directory")?;
        Self::load(config_dir)
    }

    /// Load `config.toml` from `config_dir`, falling back to defaults when the
    /// file does not exist
    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join(CONFIG_FILENAME);

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.embedding.validate()?;
        self.validate_chunking_config()?;
        self.validate_retrieval_config()?;
        self.validate_index_config()?;
        self.validate_generation_config()?;
        Ok(())
    }

    fn validate_chunking_config(&self) -> Result<(), ConfigError> {
        let config = &self.chunking;

        if !(64..=8192).contains(&config.chunk_size) {
            return Err(ConfigError::InvalidChunkSize(config.chunk_size));
        }

        if config.chunk_overlap >= config.chunk_size {
            return Err(ConfigError::ChunkOverlapTooLarge(
                config.chunk_overlap,
                config.chunk_size,
            ));
        }

        Ok(())
    }

    fn validate_retrieval_config(&self) -> Result<(), ConfigError> {
        let config = &self.retrieval;

        if !(1..=20).contains(&config.k) {
            return Err(ConfigError::InvalidResultCount(config.k));
        }

        if config.max_context_chars < 100 {
            return Err(ConfigError::InvalidMaxContextChars(
                config.max_context_chars,
            ));
        }

        if config.cache_capacity == 0 {
            return Err(ConfigError::InvalidCacheCapacity(config.cache_capacity));
        }

        Ok(())
    }

    fn validate_index_config(&self) -> Result<(), ConfigError> {
        let config = &self.index;

        for filename in [&config.index_filename, &config.metadata_filename] {
            if filename.trim().is_empty() {
                return Err(ConfigError::InvalidIndexFilename(filename.clone()));
            }
        }

        if config.nlist == 0 || config.nprobe == 0 {
            return Err(ConfigError::InvalidClusterSettings(
                config.nlist,
                config.nprobe,
            ));
        }

        Ok(())
    }

    fn validate_generation_config(&self) -> Result<(), ConfigError> {
        let config = &self.generation;

        Url::parse(&config.base_url)
            .map_err(|_| ConfigError::InvalidUrl(config.base_url.clone()))?;

        if config.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(config.model.clone()));
        }

        if !(0.0..=2.0).contains(&config.temperature) {
            return Err(ConfigError::InvalidTemperature(config.temperature));
        }

        if config.max_tokens == 0 {
            return Err(ConfigError::InvalidMaxTokens(config.max_tokens));
        }

        if config.rate_limit_calls == 0 || config.rate_limit_period_secs == 0 {
            return Err(ConfigError::InvalidRateLimit(
                config.rate_limit_calls,
                config.rate_limit_period_secs,
            ));
        }

        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join(CONFIG_FILENAME)
    }

    /// Directory holding the persisted index artifacts
    #[inline]
    pub fn data_dir(&self) -> PathBuf {
        self.get_base_dir().join(DATA_DIRNAME)
    }

    #[inline]
    pub fn index_path(&self) -> PathBuf {
        self.data_dir().join(&self.index.index_filename)
    }

    #[inline]
    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir().join(&self.index.metadata_filename)
    }
}

impl EmbeddingConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidUrl(format!(
                "{}://{}:{}",
                self.protocol, self.host, self.port
            )));
        }
        self.ollama_url()?;

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if !(64..=4096).contains(&self.dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(self.dimension));
        }

        Ok(())
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }
}
