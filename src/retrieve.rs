//! Question → scored chunks.
//!
//! Pure composition of [`Embedder::embed`] and [`KnowledgeStore::search`]
//! with the configured `top_k` and similarity threshold.

use std::sync::Arc;

use thiserror::Error;

use crate::config::RetrievalConfig;
use crate::embedding::{EmbedError, Embedder};
use crate::models::{FailureKind, ScoredChunk};
use crate::store::{KnowledgeStore, StoreError};

#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error(transparent)]
    Embed(#[from] EmbedError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RetrieveError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RetrieveError::Embed(e) => e.kind(),
            RetrieveError::Store(e) => e.kind(),
        }
    }
}

#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn KnowledgeStore>,
    top_k: usize,
    threshold: f32,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn KnowledgeStore>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            top_k: config.top_k,
            threshold: config.similarity_threshold,
        }
    }

    pub async fn retrieve(&self, question: &str) -> Result<Vec<ScoredChunk>, RetrieveError> {
        self.retrieve_with(question, self.top_k, self.threshold).await
    }

    /// Same as [`retrieve`](Self::retrieve) with explicit limits.
    pub async fn retrieve_with(
        &self,
        question: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredChunk>, RetrieveError> {
        let vector = self.embedder.embed(question).await?;
        Ok(self.store.search(&vector, top_k, threshold).await?)
    }
}
