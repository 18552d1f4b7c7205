//! The RAG orchestrator.
//!
//! [`Assistant`] is the only type a front end needs. It owns one knowledge
//! store per process and exposes the two pipelines:
//!
//! ```text
//! add_documents:  load → chunk → embed → store        (per file, failures collected)
//! query:          embed → search → assemble → LLM     (never returns Err)
//! ```
//!
//! Every failure below this layer is a typed error; this is where they are
//! converted either into an [`IngestFailure`] entry or into an apologetic
//! answer carried by a [`QueryResult`]. `Assistant` is cheap to clone, so a
//! UI can hand work to the runtime with [`Assistant::submit_query`] and
//! [`Assistant::submit_add_documents`] and await the returned handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunk::{chunk_text, sha256_hex};
use crate::config::{ChunkingConfig, Config, CorruptionPolicy, DbConfig, RetrievalConfig};
use crate::embedding::{create_embedder, DisabledEmbedder, Embedder};
use crate::llm::{create_chat_provider, ChatCompletionProvider, ChatRequest, LlmError};
use crate::loader::{self, DocumentLoader, LoadError, LoadedDocument};
use crate::models::{
    DocumentRecord, FailureKind, IngestFailure, IngestSummary, IngestedDocument, QueryFailure,
    QueryResult, RelevantDoc, ScoredChunk, StoreStats,
};
use crate::prompt::{assemble_context, build_messages, DEFAULT_PERSONA};
use crate::retrieve::{RetrieveError, Retriever};
use crate::store::sqlite::quarantine;
use crate::store::{EmbeddingSignature, KnowledgeStore, SqliteStore, StoreError};
use crate::system_info::{HostSystemInfo, SystemInfoProvider, SystemReport};

/// Collaborators an [`Assistant`] is assembled from.
pub struct Components {
    pub embedder: Arc<dyn Embedder>,
    pub store: Arc<dyn KnowledgeStore>,
    /// `None` runs in retrieval-only mode.
    pub chat: Option<Arc<dyn ChatCompletionProvider>>,
    pub system_info: Option<Arc<dyn SystemInfoProvider>>,
}

#[derive(Clone)]
pub struct Assistant {
    inner: Arc<Inner>,
}

struct Inner {
    loader: DocumentLoader,
    chunking: ChunkingConfig,
    retrieval: RetrievalConfig,
    temperature: f32,
    max_tokens: u32,
    llm_timeout: Duration,
    persona: String,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn KnowledgeStore>,
    retriever: Retriever,
    chat: Option<Arc<dyn ChatCompletionProvider>>,
    system_info: Option<Arc<dyn SystemInfoProvider>>,
    issues: Vec<String>,
}

impl Assistant {
    /// Build every collaborator from configuration and open the store.
    ///
    /// Missing credentials degrade the assistant (no embeddings, or no
    /// generation) and are reported by [`issues`](Self::issues). Only a
    /// store that cannot be opened under the configured corruption policy
    /// is an error.
    pub async fn open(config: &Config) -> Result<Self> {
        let mut issues = config.issues();

        let embedder: Arc<dyn Embedder> = match create_embedder(&config.embedding) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "embedding backend unavailable");
                issues.push(format!("Embedding backend unavailable: {}", e));
                Arc::new(DisabledEmbedder)
            }
        };

        let signature = (embedder.dims() > 0)
            .then(|| EmbeddingSignature::new(embedder.model_name(), embedder.dims()));
        let store = open_store(&config.db, signature.as_ref())
            .await
            .with_context(|| format!("Failed to open knowledge store {}", config.db.path.display()))?;

        let chat = match create_chat_provider(&config.llm) {
            Ok(chat) => Some(chat),
            Err(e) => {
                debug!(error = %e, "no language model; retrieval-only answers");
                None
            }
        };

        let system_info: Option<Arc<dyn SystemInfoProvider>> = if config.system_info.enabled {
            Some(Arc::new(HostSystemInfo::new(&config.system_info)))
        } else {
            None
        };

        Ok(Self::build(
            config,
            Components {
                embedder,
                store: Arc::new(store),
                chat,
                system_info,
            },
            issues,
        ))
    }

    /// Assemble from ready-made collaborators (custom stores, test doubles).
    pub fn with_components(config: &Config, components: Components) -> Self {
        Self::build(config, components, Vec::new())
    }

    fn build(config: &Config, components: Components, issues: Vec<String>) -> Self {
        let retriever = Retriever::new(
            components.embedder.clone(),
            components.store.clone(),
            &config.retrieval,
        );
        Self {
            inner: Arc::new(Inner {
                loader: DocumentLoader::new(&config.ingest),
                chunking: config.chunking.clone(),
                retrieval: config.retrieval.clone(),
                temperature: config.llm.temperature,
                max_tokens: config.llm.max_tokens,
                llm_timeout: Duration::from_secs(config.llm.timeout_secs.max(1)),
                persona: config
                    .prompt
                    .persona
                    .clone()
                    .unwrap_or_else(|| DEFAULT_PERSONA.to_string()),
                embedder: components.embedder,
                store: components.store,
                retriever,
                chat: components.chat,
                system_info: components.system_info,
                issues,
            }),
        }
    }

    /// Configuration problems found at startup.
    pub fn issues(&self) -> &[String] {
        &self.inner.issues
    }

    pub fn has_language_model(&self) -> bool {
        self.inner.chat.is_some()
    }

    // ============ Ingestion ============

    /// Ingest files and directories (walked recursively).
    ///
    /// Each file is loaded, chunked, embedded and stored independently; a
    /// failure is recorded and the batch moves on.
    pub async fn add_documents(&self, paths: &[PathBuf]) -> IngestSummary {
        let collected = loader::collect_documents(paths);
        let mut summary = IngestSummary::default();

        for error in collected.errors {
            let path = error.path().to_path_buf();
            warn!(path = %path.display(), "cannot walk: {}", error);
            summary.failed.push(IngestFailure {
                path,
                kind: error.kind(),
                message: error.to_string(),
            });
        }

        for path in collected.files {
            match self.ingest_one(&path).await {
                Ok(done) => {
                    info!(
                        path = %done.path.display(),
                        chunks = done.chunks,
                        unchanged = done.unchanged,
                        "ingested"
                    );
                    summary.succeeded.push(done);
                }
                Err(failure) => {
                    warn!(
                        path = %failure.path.display(),
                        kind = %failure.kind,
                        "ingest failed: {}",
                        failure.message
                    );
                    summary.failed.push(failure);
                }
            }
        }

        summary
    }

    async fn ingest_one(&self, path: &Path) -> Result<IngestedDocument, IngestFailure> {
        let inner = &self.inner;
        let fail = |kind: FailureKind, message: String| IngestFailure {
            path: path.to_path_buf(),
            kind,
            message,
        };

        let loader = inner.loader.clone();
        let owned = path.to_path_buf();
        let doc: LoadedDocument = tokio::task::spawn_blocking(move || loader.load(&owned))
            .await
            .map_err(|e| fail(FailureKind::ReadError, format!("extraction task failed: {}", e)))?
            .map_err(|e: LoadError| fail(e.kind(), e.to_string()))?;

        let source = doc.source_key();
        let content_hash = sha256_hex(
            format!(
                "{}:{}:{}:{}",
                doc.content_hash,
                inner.chunking.chunk_size,
                inner.chunking.overlap,
                inner.embedder.model_name()
            )
            .as_bytes(),
        );

        let existing = inner
            .store
            .document(&source)
            .await
            .map_err(|e| fail(e.kind(), e.to_string()))?;
        if let Some(existing) = existing {
            if existing.content_hash == content_hash {
                let chunks = inner
                    .store
                    .chunk_ids(&source)
                    .await
                    .map_err(|e| fail(e.kind(), e.to_string()))?
                    .len();
                return Ok(IngestedDocument {
                    path: doc.path,
                    chunks,
                    unchanged: true,
                    empty: false,
                });
            }
        }

        let chunks = chunk_text(
            &source,
            &doc.text,
            inner.chunking.chunk_size,
            inner.chunking.overlap,
        )
        .map_err(|e| fail(FailureKind::InvalidConfiguration, e.to_string()))?;

        // Nothing to retrieve: keep it out of the registry, and drop any
        // earlier version whose chunks would now be stale.
        if chunks.is_empty() {
            let removed = inner
                .store
                .delete(&source)
                .await
                .map_err(|e| fail(e.kind(), e.to_string()))?;
            debug!(path = %source, removed, "document has no text");
            return Ok(IngestedDocument {
                path: doc.path,
                chunks: 0,
                unchanged: false,
                empty: true,
            });
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = inner
            .embedder
            .embed_batch(&texts)
            .await
            .map_err(|e| fail(e.kind(), e.to_string()))?;

        let record = DocumentRecord {
            source_path: source,
            kind: doc.kind.as_str().to_string(),
            last_modified: doc.modified.timestamp(),
            content_hash,
            ingested_at: Utc::now().timestamp(),
        };
        inner
            .store
            .insert(&record, &chunks, &embeddings)
            .await
            .map_err(|e| fail(e.kind(), e.to_string()))?;

        Ok(IngestedDocument {
            path: doc.path,
            chunks: chunks.len(),
            unchanged: false,
            empty: false,
        })
    }

    // ============ Query ============

    /// Answer a question. Always yields a [`QueryResult`].
    pub async fn query(&self, question: &str, include_system_info: bool) -> QueryResult {
        let inner = &self.inner;
        let question = question.trim();

        if question.is_empty() {
            return QueryResult {
                question: String::new(),
                answer: "请输入问题。".to_string(),
                relevant_docs: Vec::new(),
                failure: None,
            };
        }

        let chunks = match inner.retriever.retrieve(question).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(error = %e, "retrieval failed");
                return failed_result(question, Vec::new(), e.kind(), e.to_string());
            }
        };
        debug!(hits = chunks.len(), "retrieved");

        let relevant_docs = self.relevant_docs(&chunks);
        let context = assemble_context(&chunks, inner.retrieval.max_context_length);

        let Some(chat) = inner.chat.as_ref() else {
            return QueryResult {
                question: question.to_string(),
                answer: retrieval_only_answer(&context),
                relevant_docs,
                failure: Some(QueryFailure {
                    kind: FailureKind::NotConfigured,
                    message: "no language model configured".to_string(),
                }),
            };
        };

        let system_text = if include_system_info {
            self.system_report().await.map(|r| r.to_context_text())
        } else {
            None
        };

        let request = ChatRequest {
            messages: build_messages(&inner.persona, &context, system_text.as_deref(), question),
            temperature: inner.temperature,
            max_tokens: inner.max_tokens,
        };

        let outcome = match tokio::time::timeout(inner.llm_timeout, chat.complete(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(LlmError::Timeout(inner.llm_timeout.as_secs())),
        };

        match outcome {
            Ok(answer) => QueryResult {
                question: question.to_string(),
                answer,
                relevant_docs,
                failure: None,
            },
            Err(e) => {
                warn!(provider = chat.name(), error = %e, "answer generation failed");
                failed_result(question, relevant_docs, e.kind(), e.to_string())
            }
        }
    }

    /// Retrieval without generation.
    pub async fn search(&self, question: &str) -> Result<Vec<ScoredChunk>, RetrieveError> {
        self.inner.retriever.retrieve(question).await
    }

    pub async fn search_with(
        &self,
        question: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredChunk>, RetrieveError> {
        self.inner.retriever.retrieve_with(question, top_k, threshold).await
    }

    fn relevant_docs(&self, chunks: &[ScoredChunk]) -> Vec<RelevantDoc> {
        let limit = self.inner.retrieval.excerpt_chars;
        chunks
            .iter()
            .map(|s| RelevantDoc {
                source_file: s.chunk.source_path.clone(),
                similarity: s.similarity,
                excerpt: excerpt(&s.chunk.text, limit),
            })
            .collect()
    }

    // ============ Knowledge base management ============

    pub async fn get_knowledge_base_stats(&self) -> Result<StoreStats, StoreError> {
        self.inner.store.stats().await
    }

    pub async fn clear_knowledge_base(&self) -> Result<(), StoreError> {
        self.inner.store.clear().await
    }

    /// Forget one document. Returns `false` if it was not in the store.
    pub async fn remove_document(&self, path: &Path) -> Result<bool, StoreError> {
        self.inner.store.delete(&loader::source_key(path)).await
    }

    pub async fn documents(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        self.inner.store.documents().await
    }

    /// Collect host facts on the blocking pool. `None` when disabled.
    pub async fn system_report(&self) -> Option<SystemReport> {
        let provider = self.inner.system_info.clone()?;
        match tokio::task::spawn_blocking(move || provider.report()).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "system report task failed");
                None
            }
        }
    }

    // ============ Background submission ============

    pub fn submit_query(&self, question: String, include_system_info: bool) -> JoinHandle<QueryResult> {
        let this = self.clone();
        tokio::spawn(async move { this.query(&question, include_system_info).await })
    }

    pub fn submit_add_documents(&self, paths: Vec<PathBuf>) -> JoinHandle<IngestSummary> {
        let this = self.clone();
        tokio::spawn(async move { this.add_documents(&paths).await })
    }
}

/// Open the persistent store, applying the corruption policy.
pub async fn open_store(
    db: &DbConfig,
    signature: Option<&EmbeddingSignature>,
) -> Result<SqliteStore, StoreError> {
    match SqliteStore::open(&db.path, signature).await {
        Ok(store) => Ok(store),
        Err(e @ (StoreError::Corrupted(_) | StoreError::IncompatibleModel { .. }))
            if db.on_corruption == CorruptionPolicy::Rebuild =>
        {
            warn!(error = %e, "knowledge store unusable; rebuilding empty");
            quarantine(&db.path)?;
            SqliteStore::open(&db.path, signature).await
        }
        Err(e) => Err(e),
    }
}

fn excerpt(text: &str, limit: usize) -> String {
    let text = text.trim();
    let mut chars = text.char_indices();
    match chars.nth(limit) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

fn apology(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::ModelUnavailable => "抱歉，嵌入模型当前不可用，暂时无法检索知识库。",
        FailureKind::StoreCorrupted | FailureKind::StoreError | FailureKind::IncompatibleModel => {
            "抱歉，读取知识库时出错。"
        }
        FailureKind::Timeout => "抱歉，语言模型响应超时，请稍后重试。",
        FailureKind::NotConfigured => "抱歉，语言模型尚未配置。",
        _ => "抱歉，生成回答时出错，请稍后重试。",
    }
}

fn failed_result(
    question: &str,
    relevant_docs: Vec<RelevantDoc>,
    kind: FailureKind,
    message: String,
) -> QueryResult {
    QueryResult {
        question: question.to_string(),
        answer: format!("{}（{}）", apology(kind), message),
        relevant_docs,
        failure: Some(QueryFailure { kind, message }),
    }
}

fn retrieval_only_answer(context: &str) -> String {
    if context.trim().is_empty() {
        "未配置语言模型，且知识库中没有找到相关内容。".to_string()
    } else {
        format!(
            "未配置语言模型，以下是知识库中最相关的内容：\n\n{}",
            context.trim_end()
        )
    }
}
