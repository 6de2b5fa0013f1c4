// Pipeline module
// Orchestrates ingestion (extract, chunk, embed, index) and question answering


pub mod shared;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunking::Chunker;
use crate::config::Config;
use crate::embeddings::Embedder;
use crate::extraction::{DocumentProcessor, ExtractionError};
use crate::generation::{AnswerGenerator, LlmResponse, PromptStyle};
use crate::index::{DocumentRecord, Filters, IndexStore};
use crate::retrieval::{
    Citation, RetrievalRequest, RetrievalResult, Retriever, build_context_block, citations,
};
pub use crate::retrieval::MAX_RESULTS;
use crate::{RagError, Result};

pub use shared::SharedPipeline;

/// `source_type` recorded for every ingested document
pub const SOURCE_TYPE: &str = "uploaded_document";
/// Characters of a v4 UUID used as a document id
const DOCUMENT_ID_LENGTH: usize = 8;
/// Longest question accepted by [`validate_question`]
pub const MAX_QUESTION_CHARS: usize = 2000;

pub const NOT_INDEXED_ANSWER: &str =
    "No documents have been indexed yet. Please upload some documents first.";
pub const NOT_INDEXED_ERROR: &str = "Pipeline not initialized - no documents indexed";
pub const NO_RELEVANT_ANSWER: &str =
    "No relevant information found in the indexed documents for your query.";

/// Record fields owned by the pipeline; caller metadata cannot override them
const RESERVED_FIELDS: &[&str] = &[
    "source_type",
    "document_id",
    "filename",
    "chunk_idx",
    "total_chunks",
    "content",
    "char_count",
    "file_type",
    "file_size",
    "uploaded_at",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    /// Nothing indexed or restored yet
    Uninitialized,
    Initialized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub document_id: String,
    pub filename: String,
    pub chunk_count: usize,
    pub char_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnswerOptions {
    pub k: Option<usize>,
    pub filters: Filters,
    pub style: PromptStyle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub sources: Vec<RetrievalResult>,
    /// Generation outcome, absent when the model was never called
    pub llm: Option<LlmResponse>,
    pub success: bool,
    pub error: Option<String>,
}

impl RagAnswer {
    fn without_generation(answer: &str, success: bool, error: Option<String>) -> Self {
        Self {
            answer: answer.to_string(),
            citations: Vec::new(),
            sources: Vec::new(),
            llm: None,
            success,
            error,
        }
    }
}

/// One indexed document, as listed to users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub filename: String,
    pub chunks: usize,
    pub char_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub ready: bool,
    /// Indexed chunk count
    pub document_count: usize,
    pub supported_types: Vec<String>,
    pub embedding_model: String,
    pub llm_available: bool,
}

/// Where the index artifacts are persisted
#[derive(Debug, Clone, PartialEq, Eq)]
struct ArtifactPaths {
    index: PathBuf,
    metadata: PathBuf,
}

/// Owns every component of the retrieval-augmented generation flow.
///
/// Mutation (`ingest*`, `load_index`) takes `&mut self`; queries take `&self`.
/// Wrap it in a [`SharedPipeline`] to serve concurrent callers.
#[derive(Debug)]
pub struct RagPipeline {
    state: PipelineState,
    store: IndexStore,
    chunker: Chunker,
    embedder: Arc<Embedder>,
    retriever: Retriever,
    processor: DocumentProcessor,
    generator: AnswerGenerator,
    artifacts: Option<ArtifactPaths>,
}

impl RagPipeline {
    /// Build the pipeline described by `config`, persisting under its data
    /// directory and restoring a previously saved index when one exists
    #[inline]
    pub fn from_config(config: &Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| RagError::Config(e.to_string()))?;

        let embedder = Arc::new(Embedder::from_config(&config.embedding)?);
        let generator = AnswerGenerator::from_config(&config.generation);
        Ok(Self::new(config, embedder, generator))
    }

    /// Assemble a pipeline from explicit components, persisting to the
    /// paths derived from `config`
    #[inline]
    pub fn new(config: &Config, embedder: Arc<Embedder>, generator: AnswerGenerator) -> Self {
        let mut pipeline = Self::in_memory(config, embedder, generator);
        pipeline.artifacts = Some(ArtifactPaths {
            index: config.index_path(),
            metadata: config.metadata_path(),
        });

        if let Err(e) = pipeline.load_index() {
            warn!("Starting with an empty index: {}", e);
        }
        pipeline
    }

    /// Assemble a pipeline that never reads or writes index files
    #[inline]
    pub fn in_memory(config: &Config, embedder: Arc<Embedder>, generator: AnswerGenerator) -> Self {
        Self {
            state: PipelineState::Uninitialized,
            store: IndexStore::new(config.index.clone()),
            chunker: Chunker::new(config.chunking.clone()),
            retriever: Retriever::new(config.retrieval.clone(), Arc::clone(&embedder)),
            embedder,
            processor: DocumentProcessor::new(),
            generator,
            artifacts: None,
        }
    }

    #[inline]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    #[inline]
    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    #[inline]
    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Ready to answer: something was indexed and the index holds vectors
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state == PipelineState::Initialized && self.store.is_ready()
    }

    #[inline]
    pub fn document_count(&self) -> usize {
        self.store.document_count()
    }

    /// Extract, chunk, embed and index the file at `path`.
    ///
    /// `filename` is the user-facing name recorded with each chunk; `extra`
    /// is merged into every chunk record. The index is saved afterwards
    /// unless `persist` is false.
    #[inline]
    pub fn ingest(
        &mut self,
        path: &Path,
        filename: &str,
        extra: Map<String, Value>,
        persist: bool,
    ) -> Result<IngestReport> {
        let document = self.processor.extract(path, filename)?;
        self.index_document(
            &document.text,
            filename,
            &document.file_type,
            Some(document.file_size),
            extra,
            persist,
        )
    }

    /// Index already-extracted text
    #[inline]
    pub fn ingest_text(
        &mut self,
        text: &str,
        filename: &str,
        file_type: &str,
        extra: Map<String, Value>,
        persist: bool,
    ) -> Result<IngestReport> {
        if text.trim().is_empty() {
            return Err(ExtractionError::NoTextContent(filename.to_string()).into());
        }
        self.index_document(text, filename, file_type, None, extra, persist)
    }

    fn index_document(
        &mut self,
        text: &str,
        filename: &str,
        file_type: &str,
        file_size: Option<u64>,
        mut extra: Map<String, Value>,
        persist: bool,
    ) -> Result<IngestReport> {
        for field in RESERVED_FIELDS {
            if extra.remove(*field).is_some() {
                warn!("Ignoring caller metadata field '{}' (set by the pipeline)", field);
            }
        }

        let document_id = new_document_id();
        let chunks = self.chunker.chunk_document(&document_id, text);
        if chunks.is_empty() {
            return Err(ExtractionError::NoTextContent(filename.to_string()).into());
        }

        let char_count = text.chars().count();
        let uploaded_at = Utc::now();
        let (texts, records): (Vec<String>, Vec<DocumentRecord>) = chunks
            .iter()
            .map(|chunk| {
                let content = format!("[{}:{}]\n\n{}", SOURCE_TYPE, document_id, chunk.text);
                let record = DocumentRecord {
                    source_type: SOURCE_TYPE.to_string(),
                    document_id: document_id.clone(),
                    filename: filename.to_string(),
                    chunk_idx: chunk.position,
                    total_chunks: chunk.total,
                    content: content.clone(),
                    char_count,
                    file_type: file_type.to_string(),
                    file_size,
                    uploaded_at,
                    extra: extra.clone(),
                };
                (content, record)
            })
            .unzip();

        info!(
            "Processed {}: {} chars → {} chunks",
            filename,
            char_count,
            chunks.len()
        );

        let vectors = self.embedder.embed_batch(&texts)?;
        self.store.append(vectors, records)?;
        self.state = PipelineState::Initialized;

        if persist {
            self.save_index()?;
        }

        Ok(IngestReport {
            document_id,
            filename: filename.to_string(),
            chunk_count: chunks.len(),
            char_count,
        })
    }

    /// Answer `question` from the indexed documents.
    ///
    /// Problems are reported through `success`/`error` on the returned
    /// answer rather than as an `Err`.
    #[inline]
    pub fn answer(&self, question: &str, options: &AnswerOptions) -> RagAnswer {
        if self.state != PipelineState::Initialized {
            return RagAnswer::without_generation(
                NOT_INDEXED_ANSWER,
                false,
                Some(NOT_INDEXED_ERROR.to_string()),
            );
        }

        info!(
            "Processing query: {}...",
            question.chars().take(50).collect::<String>()
        );

        let request = RetrievalRequest {
            k: options.k,
            filters: options.filters.clone(),
            min_score: None,
        };
        let results = match self.retriever.retrieve(&self.store, question, &request) {
            Ok(results) => results,
            Err(e) => {
                error!("Retrieval failed: {}", e);
                return RagAnswer::without_generation(
                    "",
                    false,
                    Some(format!("Retrieval failed: {}", e)),
                );
            }
        };

        if results.is_empty() {
            return RagAnswer::without_generation(NO_RELEVANT_ANSWER, true, None);
        }

        let context_block = build_context_block(&results, false);
        let citations = citations(&results);
        let user_prompt = format!(
            "QUESTION: {}\n\nCONTEXT:\n{}\n\nProvide a comprehensive answer based on the context above. Reference specific documents when possible.",
            question, context_block
        );

        let llm = self
            .generator
            .generate(options.style.system_prompt(), &user_prompt);

        RagAnswer {
            answer: llm.content.clone(),
            citations,
            sources: results,
            success: llm.success,
            error: llm.error.clone(),
            llm: Some(llm),
        }
    }

    /// Retrieval only, without answer generation
    #[inline]
    pub fn retrieve(&self, query: &str, request: &RetrievalRequest) -> Result<Vec<RetrievalResult>> {
        self.retriever.retrieve(&self.store, query, request)
    }

    /// Removing a document would require rebuilding the index, which is not
    /// supported
    #[inline]
    pub fn delete_document(&self, document_id: &str) -> Result<()> {
        debug!("Refusing to delete document {}", document_id);
        Err(RagError::NotImplemented(
            "Document deletion not yet implemented. Requires index rebuild.".to_string(),
        ))
    }

    /// Distinct indexed documents in the order they were first indexed
    #[inline]
    pub fn list_documents(&self) -> Vec<DocumentSummary> {
        if !self.is_ready() {
            return Vec::new();
        }

        let mut documents: Vec<DocumentSummary> = Vec::new();
        for record in self.store.records() {
            if documents
                .iter()
                .any(|doc| doc.document_id == record.document_id)
            {
                continue;
            }
            documents.push(DocumentSummary {
                document_id: record.document_id.clone(),
                filename: record.filename.clone(),
                chunks: record.total_chunks,
                char_count: record.char_count,
            });
        }
        documents
    }

    #[inline]
    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            ready: self.is_ready(),
            document_count: self.document_count(),
            supported_types: self
                .processor
                .supported_types()
                .into_iter()
                .map(str::to_string)
                .collect(),
            embedding_model: self.embedder.model_name().to_string(),
            llm_available: self.generator.is_available(),
        }
    }

    /// Persist the index artifacts. Does nothing for an in-memory pipeline.
    #[inline]
    pub fn save_index(&self) -> Result<()> {
        let Some(artifacts) = &self.artifacts else {
            debug!("No index paths configured; skipping save");
            return Ok(());
        };
        self.store.persist(&artifacts.index, &artifacts.metadata)
    }

    /// Restore the persisted index when both artifact files exist.
    ///
    /// Returns whether an index was loaded. A failed restore leaves the
    /// index empty.
    #[inline]
    pub fn load_index(&mut self) -> Result<bool> {
        let Some(artifacts) = &self.artifacts else {
            return Ok(false);
        };
        if !artifacts.index.exists() || !artifacts.metadata.exists() {
            debug!("No saved index at {}", artifacts.index.display());
            return Ok(false);
        }

        let rows = self
            .store
            .restore(&artifacts.index, &artifacts.metadata)
            .map_err(RagError::from)?;
        self.state = PipelineState::Initialized;
        info!("✓ Pipeline loaded from existing index ({} chunks)", rows);
        Ok(true)
    }
}

/// Check a user question and result count before querying
#[inline]
pub fn validate_question(question: &str, k: Option<usize>) -> Result<()> {
    let length = question.trim().chars().count();
    if length == 0 {
        return Err(RagError::Validation("Question must not be empty".to_string()));
    }
    if length > MAX_QUESTION_CHARS {
        return Err(RagError::Validation(format!(
            "Question is too long ({} characters, maximum {})",
            length, MAX_QUESTION_CHARS
        )));
    }
    if let Some(k) = k.filter(|k| !(1..=MAX_RESULTS).contains(k)) {
        return Err(RagError::Validation(format!(
            "Number of results must be between 1 and {} (got {})",
            MAX_RESULTS, k
        )));
    }
    Ok(())
}

fn new_document_id() -> String {
    Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(DOCUMENT_ID_LENGTH)
        .collect()
}
