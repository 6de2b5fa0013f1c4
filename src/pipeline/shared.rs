use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio::task::JoinError;

use super::{AnswerOptions, DocumentSummary, IngestReport, PipelineStatus, RagAnswer, RagPipeline};
use crate::retrieval::{RetrievalRequest, RetrievalResult};
use crate::{RagError, Result};

/// A [`RagPipeline`] shared between async tasks.
///
/// Queries hold a read lock and ingestion holds the write lock, so a search
/// never observes a half-appended index. The blocking work runs on tokio's
/// blocking pool while the guard is held.
#[derive(Debug, Clone)]
pub struct SharedPipeline {
    inner: Arc<RwLock<RagPipeline>>,
}

impl SharedPipeline {
    #[inline]
    pub fn new(pipeline: RagPipeline) -> Self {
        Self {
            inner: Arc::new(RwLock::new(pipeline)),
        }
    }

    #[inline]
    pub async fn answer(&self, question: String, options: AnswerOptions) -> Result<RagAnswer> {
        let guard = Arc::clone(&self.inner).read_owned().await;
        tokio::task::spawn_blocking(move || guard.answer(&question, &options))
            .await
            .map_err(join_error)
    }

    #[inline]
    pub async fn retrieve(
        &self,
        query: String,
        request: RetrievalRequest,
    ) -> Result<Vec<RetrievalResult>> {
        let guard = Arc::clone(&self.inner).read_owned().await;
        tokio::task::spawn_blocking(move || guard.retrieve(&query, &request))
            .await
            .map_err(join_error)?
    }

    #[inline]
    pub async fn ingest(
        &self,
        path: PathBuf,
        filename: String,
        extra: Map<String, Value>,
        persist: bool,
    ) -> Result<IngestReport> {
        let mut guard = Arc::clone(&self.inner).write_owned().await;
        tokio::task::spawn_blocking(move || guard.ingest(&path, &filename, extra, persist))
            .await
            .map_err(join_error)?
    }

    #[inline]
    pub async fn ingest_text(
        &self,
        text: String,
        filename: String,
        file_type: String,
        extra: Map<String, Value>,
        persist: bool,
    ) -> Result<IngestReport> {
        let mut guard = Arc::clone(&self.inner).write_owned().await;
        tokio::task::spawn_blocking(move || {
            guard.ingest_text(&text, &filename, &file_type, extra, persist)
        })
        .await
        .map_err(join_error)?
    }

    #[inline]
    pub async fn save_index(&self) -> Result<()> {
        let guard = Arc::clone(&self.inner).read_owned().await;
        tokio::task::spawn_blocking(move || guard.save_index())
            .await
            .map_err(join_error)?
    }

    #[inline]
    pub async fn delete_document(&self, document_id: &str) -> Result<()> {
        self.inner.read().await.delete_document(document_id)
    }

    #[inline]
    pub async fn list_documents(&self) -> Vec<DocumentSummary> {
        self.inner.read().await.list_documents()
    }

    #[inline]
    pub async fn status(&self) -> PipelineStatus {
        self.inner.read().await.status()
    }

    #[inline]
    pub async fn is_ready(&self) -> bool {
        self.inner.read().await.is_ready()
    }
}

fn join_error(e: JoinError) -> RagError {
    RagError::Other(anyhow::anyhow!("Pipeline task failed: {}", e))
}
