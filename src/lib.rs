//! # Kylin Assist
//!
//! A local question-answering assistant for Kylin desktops. Users add their
//! own documents (PDF, Markdown, plain text, reStructuredText, Word, HTML)
//! to a persistent knowledge base and ask natural-language questions; the
//! assistant retrieves the most similar passages and asks a hosted language
//! model for an answer grounded in them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────┐   ┌──────────┐   ┌───────────────────┐
//! │ Files / dirs │──▶│ Loader  │──▶│ Chunker  │──▶│ Embedder          │
//! │ pdf md docx… │   │ extract │   │ overlap  │   │ local / remote    │
//! └──────────────┘   └─────────┘   └──────────┘   └─────────┬─────────┘
//!                                                           ▼
//!                  ┌────────────┐   ┌──────────┐   ┌───────────────────┐
//!   question ─────▶│ Retriever  │──▶│ Prompt   │──▶│ Knowledge store   │
//!                  │ top-k      │   │ context  │   │ SQLite (WAL) / mem│
//!                  └────────────┘   └────┬─────┘   └───────────────────┘
//!                                        ▼
//!                                 ┌────────────┐
//!                                 │ Chat LLM   │──▶ answer + sources
//!                                 └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! # Add documents to the knowledge base
//! kyassist add ~/Documents/kylin-manuals
//!
//! # Ask a question (set DEEPSEEK_API_KEY for generated answers)
//! kyassist ask "如何在麒麟系统中配置网络代理？"
//!
//! # Include live host facts in the prompt
//! kyassist ask "磁盘空间还够吗？" --system-info
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Shared data types (chunks, records, results, failure kinds) |
//! | [`loader`] | File discovery, size limits, encoding normalization |
//! | [`extract`] | Text extraction from PDF, Word and HTML |
//! | [`chunk`] | Overlapping, boundary-aware text chunking |
//! | [`embedding`] | Embedding backends and vector utilities |
//! | [`store`] | Knowledge store trait with SQLite and in-memory backends |
//! | [`retrieve`] | Question embedding and top-k search |
//! | [`prompt`] | Context assembly and chat prompt construction |
//! | [`llm`] | Hosted chat-completion client |
//! | [`system_info`] | Host and Kylin SDK system facts |
//! | [`assistant`] | The ingestion and query orchestrator |

pub mod assistant;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod llm;
pub mod loader;
pub mod models;
pub mod prompt;
pub mod retrieve;
pub mod store;
pub mod system_info;
