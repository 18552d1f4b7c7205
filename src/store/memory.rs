//! In-memory [`KnowledgeStore`] for tests and ephemeral sessions.
//!
//! All state lives behind a single `parking_lot::RwLock`, so every
//! mutation is applied under one write guard and readers always see a
//! consistent snapshot. Search is brute-force cosine similarity.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::embedding::cosine_similarity;
use crate::models::{Chunk, DocumentRecord, ScoredChunk, StoreStats};

use super::{check_insert, rank, KnowledgeStore, StoreError};

struct StoredChunk {
    chunk: Chunk,
    vector: Vec<f32>,
}

#[derive(Default)]
struct State {
    documents: HashMap<String, DocumentRecord>,
    /// Insertion order.
    chunks: Vec<StoredChunk>,
}

pub struct InMemoryStore {
    dims: usize,
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            state: RwLock::new(State::default()),
        }
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryStore {
    async fn insert(
        &self,
        record: &DocumentRecord,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<(), StoreError> {
        check_insert(Some(self.dims), chunks, embeddings)?;

        let mut state = self.state.write();
        state
            .chunks
            .retain(|sc| sc.chunk.source_path != record.source_path);
        for (chunk, vector) in chunks.iter().zip(embeddings) {
            state.chunks.push(StoredChunk {
                chunk: chunk.clone(),
                vector: vector.clone(),
            });
        }
        state
            .documents
            .insert(record.source_path.clone(), record.clone());
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        if query.len() != self.dims {
            return Err(StoreError::DimensionMismatch {
                expected: self.dims,
                got: query.len(),
            });
        }
        let candidates = {
            let state = self.state.read();
            state
                .chunks
                .iter()
                .map(|sc| ScoredChunk {
                    chunk: sc.chunk.clone(),
                    similarity: cosine_similarity(query, &sc.vector),
                })
                .collect()
        };
        Ok(rank(candidates, k, threshold))
    }

    async fn delete(&self, source_path: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        state.chunks.retain(|sc| sc.chunk.source_path != source_path);
        Ok(state.documents.remove(source_path).is_some())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.state.write() = State::default();
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let state = self.state.read();
        Ok(StoreStats {
            document_count: state.documents.len(),
            chunk_count: state.chunks.len(),
        })
    }

    async fn document(&self, source_path: &str) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.state.read().documents.get(source_path).cloned())
    }

    async fn chunk_ids(&self, source_path: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.read();
        let mut found: Vec<&Chunk> = state
            .chunks
            .iter()
            .map(|sc| &sc.chunk)
            .filter(|c| c.source_path == source_path)
            .collect();
        found.sort_by_key(|c| c.sequence_index);
        Ok(found.into_iter().map(|c| c.id.clone()).collect())
    }

    async fn documents(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        let state = self.state.read();
        let mut docs: Vec<DocumentRecord> = state.documents.values().cloned().collect();
        docs.sort_by(|a, b| a.source_path.cmp(&b.source_path));
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_text;

    fn record(path: &str) -> DocumentRecord {
        DocumentRecord {
            source_path: path.to_string(),
            kind: "text".to_string(),
            last_modified: 0,
            content_hash: "h".to_string(),
            ingested_at: 0,
        }
    }

    fn axis(dims: usize, i: usize) -> Vec<f32> {
        let mut v = vec![0.0; dims];
        v[i % dims] = 1.0;
        v
    }

    #[tokio::test]
    async fn reinsert_replaces_chunks() {
        let store = InMemoryStore::new(4);
        let chunks = chunk_text("a", &"alpha beta. ".repeat(20), 40, 5).unwrap();
        let vectors: Vec<Vec<f32>> = (0..chunks.len()).map(|i| axis(4, i)).collect();

        store.insert(&record("a"), &chunks, &vectors).await.unwrap();
        store.insert(&record("a"), &chunks, &vectors).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.document_count, 1);
        assert_eq!(stats.chunk_count, chunks.len());
        let ids = store.chunk_ids("a").await.unwrap();
        assert_eq!(ids, chunks.iter().map(|c| c.id.clone()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn delete_unknown_is_noop() {
        let store = InMemoryStore::new(2);
        assert!(!store.delete("missing").await.unwrap());
        assert_eq!(store.stats().await.unwrap(), StoreStats::default());
    }

    #[tokio::test]
    async fn rejected_insert_keeps_prior_state() {
        let store = InMemoryStore::new(2);
        let chunks = chunk_text("a", "one two three", 100, 0).unwrap();
        store.insert(&record("a"), &chunks, &[vec![1.0, 0.0]]).await.unwrap();

        let err = store
            .insert(&record("a"), &chunks, &[vec![1.0, 0.0, 0.0]])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { .. }));
        assert_eq!(store.stats().await.unwrap().chunk_count, 1);
    }

    #[tokio::test]
    async fn search_respects_threshold() {
        let store = InMemoryStore::new(2);
        let a = chunk_text("a", "first", 100, 0).unwrap();
        let b = chunk_text("b", "second", 100, 0).unwrap();
        store.insert(&record("a"), &a, &[vec![1.0, 0.0]]).await.unwrap();
        store.insert(&record("b"), &b, &[vec![0.0, 1.0]]).await.unwrap();

        let hits = store.search(&[1.0, 0.1], 5, 0.7).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.source_path, "a");

        store.clear().await.unwrap();
        assert!(store.search(&[1.0, 0.1], 5, 0.0).await.unwrap().is_empty());
    }
}
