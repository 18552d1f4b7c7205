//! TOML configuration.
//!
//! The whole process runs off one immutable [`Config`] that is loaded once in
//! `main` and handed by reference to every component constructor. Every
//! section has defaults matching a stock desktop install, so a missing file
//! or a partial file still yields a usable configuration.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub system_info: SystemInfoConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
}

/// What to do when the persisted store cannot be used as-is.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CorruptionPolicy {
    /// Move the damaged file aside and start with an empty store.
    #[default]
    Rebuild,
    /// Refuse to start.
    Abort,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub on_corruption: CorruptionPolicy,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            on_corruption: CorruptionPolicy::default(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/knowledge.sqlite")
}

/// Chunk sizes are measured in characters, not bytes.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            max_context_length: default_max_context_length(),
            excerpt_chars: default_excerpt_chars(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_similarity_threshold() -> f32 {
    0.7
}
fn default_max_context_length() -> usize {
    2000
}
fn default_excerpt_chars() -> usize {
    240
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the `ollama` provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_embedding_provider() -> String {
    "local".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Environment variable holding the bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            endpoint: None,
            model: None,
            api_key_env: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_llm_provider() -> String {
    "deepseek".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1000
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn resolved_endpoint(&self) -> String {
        if let Some(ref e) = self.endpoint {
            return e.clone();
        }
        match self.provider.as_str() {
            "openai" => "https://api.openai.com/v1/chat/completions".to_string(),
            _ => "https://api.deepseek.com/v1/chat/completions".to_string(),
        }
    }

    pub fn resolved_model(&self) -> String {
        if let Some(ref m) = self.model {
            return m.clone();
        }
        match self.provider.as_str() {
            "openai" => "gpt-4o-mini".to_string(),
            _ => "deepseek-reasoner".to_string(),
        }
    }

    pub fn resolved_api_key_env(&self) -> String {
        if let Some(ref v) = self.api_key_env {
            return v.clone();
        }
        match self.provider.as_str() {
            "openai" => "OPENAI_API_KEY".to_string(),
            _ => "DEEPSEEK_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Files larger than this many bytes are rejected.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_true")]
    pub auto_detect_encoding: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            auto_detect_encoding: true,
        }
    }
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct SystemInfoConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sdk_library_paths")]
    pub sdk_library_paths: Vec<PathBuf>,
}

impl Default for SystemInfoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sdk_library_paths: default_sdk_library_paths(),
        }
    }
}

fn lib_arch_dir() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "aarch64-linux-gnu",
        "x86_64" => "x86_64-linux-gnu",
        _ => "linux-gnu",
    }
}

fn default_sdk_library_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from(format!("/usr/lib/{}/libkysysinfo.so", lib_arch_dir())),
        PathBuf::from("/usr/lib/libkysysinfo.so"),
        PathBuf::from("/usr/local/lib/libkysysinfo.so"),
        PathBuf::from("./lib/libkysysinfo.so"),
    ]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PromptConfig {
    #[serde(default)]
    pub persona: Option<String>,
}

impl Config {
    /// Default configuration used when no config file is present.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Non-fatal configuration problems. The assistant still runs, in a
    /// degraded mode where applicable.
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.llm.is_enabled() {
            let var = self.llm.resolved_api_key_env();
            match std::env::var(&var) {
                Ok(v) if !v.trim().is_empty() => {}
                _ => issues.push(format!(
                    "LLM API key not configured (set {}); answers will be retrieval-only",
                    var
                )),
            }
        } else {
            issues.push("LLM provider disabled; answers will be retrieval-only".to_string());
        }
        if !self.embedding.is_enabled() {
            issues.push(
                "Embedding provider disabled; documents cannot be ingested or queried".to_string(),
            );
        }
        issues
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.overlap >= self.chunking.chunk_size {
            bail!(
                "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.overlap,
                self.chunking.chunk_size
            );
        }

        if self.retrieval.top_k < 1 {
            bail!("retrieval.top_k must be >= 1");
        }
        if !(-1.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
        }
        if self.retrieval.max_context_length == 0 {
            bail!("retrieval.max_context_length must be > 0");
        }

        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
        if self.embedding.dims == Some(0) {
            bail!("embedding.dims must be > 0");
        }
        match self.embedding.provider.as_str() {
            "disabled" | "local" => {}
            "openai" | "ollama" => {
                if self.embedding.model.is_none() || self.embedding.dims.is_none() {
                    bail!(
                        "embedding.model and embedding.dims must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, local, openai, or ollama.",
                other
            ),
        }

        match self.llm.provider.as_str() {
            "disabled" | "deepseek" | "openai" => {}
            other => bail!(
                "Unknown llm provider: '{}'. Must be disabled, deepseek, or openai.",
                other
            ),
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            bail!("llm.temperature must be in [0.0, 2.0]");
        }
        if self.llm.max_tokens == 0 {
            bail!("llm.max_tokens must be > 0");
        }

        if self.ingest.max_file_size == 0 {
            bail!("ingest.max_file_size must be > 0");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_parses() {
        let config: Config = toml::from_str(include_str!("../config/kyassist.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.embedding.provider, "local");
        assert_eq!(config.llm.resolved_api_key_env(), "DEEPSEEK_API_KEY");
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.chunking.chunk_size, 500);
        assert_eq!(config.chunking.overlap, 50);
        assert_eq!(config.retrieval.top_k, 5);
        assert!((config.retrieval.similarity_threshold - 0.7).abs() < 1e-6);
        assert_eq!(config.retrieval.max_context_length, 2000);
        assert_eq!(config.llm.max_tokens, 1000);
        assert_eq!(config.llm.timeout_secs, 30);
        assert_eq!(config.ingest.max_file_size, 50 * 1024 * 1024);
        assert_eq!(config.db.on_corruption, CorruptionPolicy::Rebuild);
        config.validate().unwrap();
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let config: Config = toml::from_str("[chunking]\nchunk_size = 100\noverlap = 100\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn unknown_providers_rejected() {
        let config: Config = toml::from_str("[embedding]\nprovider = \"magic\"\n").unwrap();
        assert!(config.validate().is_err());

        let config: Config = toml::from_str("[llm]\nprovider = \"magic\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn remote_embedding_requires_model_and_dims() {
        let config: Config = toml::from_str("[embedding]\nprovider = \"openai\"\n").unwrap();
        assert!(config.validate().is_err());

        let config: Config = toml::from_str(
            "[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\ndims = 1536\n",
        )
        .unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn provider_defaults_resolve() {
        let config: Config = toml::from_str("[llm]\nprovider = \"openai\"\n").unwrap();
        assert_eq!(config.llm.resolved_api_key_env(), "OPENAI_API_KEY");
        assert!(config.llm.resolved_endpoint().contains("openai.com"));

        let config = Config::minimal();
        assert_eq!(config.llm.resolved_model(), "deepseek-reasoner");
        assert!(config.llm.resolved_endpoint().contains("deepseek.com"));
    }

    #[test]
    fn corruption_policy_parses() {
        let config: Config = toml::from_str("[db]\non_corruption = \"abort\"\n").unwrap();
        assert_eq!(config.db.on_corruption, CorruptionPolicy::Abort);
    }

    #[test]
    fn disabled_llm_is_reported_as_issue() {
        let config: Config = toml::from_str("[llm]\nprovider = \"disabled\"\n").unwrap();
        assert!(config.issues().iter().any(|i| i.contains("retrieval-only")));
    }
}
