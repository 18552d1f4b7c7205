//! Knowledge store abstraction.
//!
//! The [`KnowledgeStore`] trait owns the lifetime of every chunk, its
//! embedding, and the document registry. Two backends implement it:
//!
//! - [`sqlite::SqliteStore`]: durable, one SQLite file (WAL mode).
//! - [`memory::InMemoryStore`]: ephemeral, used by tests and throwaway sessions.
//!
//! # Consistency
//!
//! Mutations (`insert`, `delete`, `clear`) are serialised by a store-held
//! writer lock and applied atomically per document. `search` and `stats`
//! take the reader half, so a reader sees a document either entirely before
//! or entirely after a concurrent replacement, never a mix.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`insert`](KnowledgeStore::insert) | Replace a document's chunks and vectors |
//! | [`search`](KnowledgeStore::search) | Cosine top-k above a threshold |
//! | [`delete`](KnowledgeStore::delete) | Remove one document |
//! | [`clear`](KnowledgeStore::clear) | Remove everything |
//! | [`stats`](KnowledgeStore::stats) | Document and chunk counts |
//! | [`document`](KnowledgeStore::document) | Registry entry for a path |
//! | [`chunk_ids`](KnowledgeStore::chunk_ids) | Chunk ids registered for a path |
//! | [`documents`](KnowledgeStore::documents) | All registry entries |

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use std::cmp::Ordering;
use thiserror::Error;

use crate::models::{Chunk, DocumentRecord, FailureKind, ScoredChunk, StoreStats};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("knowledge store is corrupted: {0}")]
    Corrupted(String),
    #[error(
        "knowledge store was built with {stored_model} ({stored_dims} dims) \
         but the active model is {model} ({dims} dims)"
    )]
    IncompatibleModel {
        stored_model: String,
        stored_dims: usize,
        model: String,
        dims: usize,
    },
    #[error("vector has {got} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("{chunks} chunks supplied with {vectors} embeddings")]
    LengthMismatch { chunks: usize, vectors: usize },
    #[error("store was opened without an embedding model and cannot accept vectors")]
    Unsigned,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::Corrupted(_) => FailureKind::StoreCorrupted,
            StoreError::IncompatibleModel { .. } | StoreError::DimensionMismatch { .. } => {
                FailureKind::IncompatibleModel
            }
            _ => FailureKind::StoreError,
        }
    }
}

/// The embedding model a store's vectors were produced by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingSignature {
    pub model: String,
    pub dims: usize,
}

impl EmbeddingSignature {
    pub fn new(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims,
        }
    }
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Store `chunks` (with one embedding each) for `record.source_path`,
    /// replacing anything previously registered for that path.
    ///
    /// Either the whole document is written or the prior state is kept.
    async fn insert(
        &self,
        record: &DocumentRecord,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<(), StoreError>;

    /// At most `k` chunks with similarity `>= threshold`, most similar
    /// first, ties in insertion order.
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredChunk>, StoreError>;

    /// Remove a document. Returns `false` when the path was not registered.
    async fn delete(&self, source_path: &str) -> Result<bool, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    async fn document(&self, source_path: &str) -> Result<Option<DocumentRecord>, StoreError>;

    /// Chunk ids for a path in sequence order.
    async fn chunk_ids(&self, source_path: &str) -> Result<Vec<String>, StoreError>;

    /// Every registry entry, ordered by path.
    async fn documents(&self) -> Result<Vec<DocumentRecord>, StoreError>;
}

/// Validate an insert batch against the store width.
pub(crate) fn check_insert(
    dims: Option<usize>,
    chunks: &[Chunk],
    embeddings: &[Vec<f32>],
) -> Result<(), StoreError> {
    if chunks.len() != embeddings.len() {
        return Err(StoreError::LengthMismatch {
            chunks: chunks.len(),
            vectors: embeddings.len(),
        });
    }
    let dims = match dims {
        Some(d) => d,
        None if embeddings.is_empty() => return Ok(()),
        None => return Err(StoreError::Unsigned),
    };
    if let Some(bad) = embeddings.iter().find(|v| v.len() != dims) {
        return Err(StoreError::DimensionMismatch {
            expected: dims,
            got: bad.len(),
        });
    }
    Ok(())
}

/// Threshold, order and truncate candidates given in insertion order.
///
/// `sort_by` is stable, so equal similarities keep insertion order.
pub(crate) fn rank(mut candidates: Vec<ScoredChunk>, k: usize, threshold: f32) -> Vec<ScoredChunk> {
    candidates.retain(|c| c.similarity >= threshold);
    candidates.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
    });
    candidates.truncate(k);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_id;

    fn scored(idx: usize, similarity: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                id: chunk_id("doc", idx),
                text: format!("chunk {}", idx),
                source_path: "doc".to_string(),
                sequence_index: idx,
                char_start: 0,
                char_end: 7,
                hash: String::new(),
            },
            similarity,
        }
    }

    #[test]
    fn rank_filters_sorts_and_truncates() {
        let ranked = rank(
            vec![scored(0, 0.5), scored(1, 0.9), scored(2, 0.75), scored(3, 0.8)],
            2,
            0.7,
        );
        let order: Vec<usize> = ranked.iter().map(|s| s.chunk.sequence_index).collect();
        assert_eq!(order, vec![1, 3]);
    }

    #[test]
    fn rank_breaks_ties_by_insertion_order() {
        let ranked = rank(vec![scored(0, 0.8), scored(1, 0.9), scored(2, 0.8)], 10, 0.0);
        let order: Vec<usize> = ranked.iter().map(|s| s.chunk.sequence_index).collect();
        assert_eq!(order, vec![1, 0, 2]);
    }

    #[test]
    fn rank_drops_nan_and_handles_zero_k() {
        assert!(rank(vec![scored(0, f32::NAN)], 5, -1.0).is_empty());
        assert!(rank(vec![scored(0, 1.0)], 0, 0.0).is_empty());
    }

    #[test]
    fn check_insert_rejects_bad_batches() {
        let chunks = vec![scored(0, 0.0).chunk];
        assert!(matches!(
            check_insert(Some(3), &chunks, &[]),
            Err(StoreError::LengthMismatch { chunks: 1, vectors: 0 })
        ));
        assert!(matches!(
            check_insert(Some(3), &chunks, &[vec![0.0; 4]]),
            Err(StoreError::DimensionMismatch { expected: 3, got: 4 })
        ));
        assert!(matches!(
            check_insert(None, &chunks, &[vec![0.0; 4]]),
            Err(StoreError::Unsigned)
        ));
        assert!(check_insert(Some(3), &chunks, &[vec![0.0; 3]]).is_ok());
    }
}
