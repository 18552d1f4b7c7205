//! Core data models used throughout the assistant.
//!
//! These types represent the chunks, registry entries, and results that flow
//! through the ingestion and question-answering pipeline.

use serde::Serialize;
use std::path::PathBuf;

/// A passage of a document's text: the atomic retrieval unit.
///
/// Offsets are character (Unicode scalar) positions into the extracted
/// document text, `char_start` inclusive and `char_end` exclusive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub source_path: String,
    pub sequence_index: usize,
    pub char_start: usize,
    pub char_end: usize,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// Registry entry for one ingested document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRecord {
    pub source_path: String,
    pub kind: String,
    /// Source file modification time (unix seconds).
    pub last_modified: i64,
    /// SHA-256 over the extracted text and the chunking parameters.
    pub content_hash: String,
    pub ingested_at: i64,
}

/// A chunk returned from similarity search.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Cosine similarity in `[-1, 1]`.
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub document_count: usize,
    pub chunk_count: usize,
}

/// Why one operation (a document's ingestion, or a query) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnsupportedFormat,
    ReadError,
    SizeExceeded,
    InvalidConfiguration,
    ModelUnavailable,
    StoreCorrupted,
    IncompatibleModel,
    StoreError,
    NotConfigured,
    Timeout,
    Transport,
    MalformedResponse,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::UnsupportedFormat => "UnsupportedFormat",
            FailureKind::ReadError => "ReadError",
            FailureKind::SizeExceeded => "SizeExceeded",
            FailureKind::InvalidConfiguration => "InvalidConfiguration",
            FailureKind::ModelUnavailable => "ModelUnavailable",
            FailureKind::StoreCorrupted => "StoreCorrupted",
            FailureKind::IncompatibleModel => "IncompatibleModel",
            FailureKind::StoreError => "StoreError",
            FailureKind::NotConfigured => "NotConfigured",
            FailureKind::Timeout => "Timeout",
            FailureKind::Transport => "Transport",
            FailureKind::MalformedResponse => "MalformedResponse",
        };
        f.write_str(s)
    }
}

/// One document that made it into the knowledge store.
#[derive(Debug, Clone, Serialize)]
pub struct IngestedDocument {
    pub path: PathBuf,
    pub chunks: usize,
    /// True when the registry already held identical content and nothing was rewritten.
    pub unchanged: bool,
    /// True when no text was extracted; such documents are not registered.
    pub empty: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestFailure {
    pub path: PathBuf,
    pub kind: FailureKind,
    pub message: String,
}

/// Result of a batch `add_documents` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub succeeded: Vec<IngestedDocument>,
    pub failed: Vec<IngestFailure>,
}

/// A retrieved passage as presented to the user.
#[derive(Debug, Clone, Serialize)]
pub struct RelevantDoc {
    pub source_file: String,
    pub similarity: f32,
    pub excerpt: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Answer to one question. Always produced, even when a stage failed.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub question: String,
    pub answer: String,
    pub relevant_docs: Vec<RelevantDoc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<QueryFailure>,
}
