use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use manual_assist_core::chunk::ChunkParams;
use manual_assist_core::context::MemoryParams;
use manual_assist_core::embedding::{EmbedParams, HashEmbedding};
use manual_assist_core::models::ModelIdentity;
use manual_assist_core::retrieve::RetrievalParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Pages with fewer characters after cleanup are skipped.
    #[serde(default = "default_min_page_chars")]
    pub min_page_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_page_chars: default_min_page_chars(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_min_page_chars() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible endpoint or Ollama host).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_embedding_retries(),
            timeout_secs: default_embedding_timeout(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embedding_retries() -> u32 {
    5
}
fn default_embedding_timeout() -> u64 {
    30
}
fn default_max_input_chars() -> usize {
    8000
}

/// Dimensionality of the hash and local providers when none is configured.
pub const DEFAULT_DIMS: usize = 384;
pub const DEFAULT_LOCAL_MODEL: &str = "all-minilm-l6-v2";

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Model identity stamped on every vector this provider produces.
    pub fn identity(&self) -> ModelIdentity {
        match self.provider.as_str() {
            "hash" => ModelIdentity::new(
                HashEmbedding::MODEL_NAME,
                self.dims.unwrap_or(DEFAULT_DIMS),
            ),
            "local" => ModelIdentity::new(
                self.model.as_deref().unwrap_or(DEFAULT_LOCAL_MODEL),
                self.dims.unwrap_or(DEFAULT_DIMS),
            ),
            _ => ModelIdentity::new(
                self.model.clone().unwrap_or_default(),
                self.dims.unwrap_or(0),
            ),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default)]
    pub rerank: bool,
    #[serde(default)]
    pub rerank_min_score: Option<f32>,
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f32,
    #[serde(default)]
    pub query_expansion: bool,
    #[serde(default = "default_expansion_variants")]
    pub expansion_variants: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_k: default_candidate_k(),
            min_score: default_min_score(),
            rerank: false,
            rerank_min_score: None,
            lexical_weight: default_lexical_weight(),
            query_expansion: false,
            expansion_variants: default_expansion_variants(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_candidate_k() -> usize {
    20
}
fn default_min_score() -> f32 {
    0.5
}
fn default_lexical_weight() -> f32 {
    0.3
}
fn default_expansion_variants() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_short_term_window")]
    pub short_term_window: usize,
    #[serde(default = "default_long_term_k")]
    pub long_term_k: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    /// Archived sessions older than this are removed by `purge-archived`.
    #[serde(default = "default_archive_retention_hours")]
    pub archive_retention_hours: u64,
    #[serde(default = "default_owner")]
    pub default_owner: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_window: default_short_term_window(),
            long_term_k: default_long_term_k(),
            max_context_chars: default_max_context_chars(),
            archive_retention_hours: default_archive_retention_hours(),
            default_owner: default_owner(),
        }
    }
}

fn default_short_term_window() -> usize {
    6
}
fn default_long_term_k() -> usize {
    3
}
fn default_max_context_chars() -> usize {
    6000
}
fn default_archive_retention_hours() -> u64 {
    24
}
fn default_owner() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-request HTTP timeout.
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    /// Overall deadline for one completion, retries included.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: None,
            url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_generation_timeout(),
            max_retries: default_generation_retries(),
            deadline_secs: default_deadline_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "extractive".to_string()
}
fn default_max_tokens() -> usize {
    500
}
fn default_temperature() -> f32 {
    0.2
}
fn default_generation_timeout() -> u64 {
    60
}
fn default_generation_retries() -> u32 {
    3
}
fn default_deadline_secs() -> u64 {
    300
}

impl GenerationConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl Config {
    pub fn chunk_params(&self) -> ChunkParams {
        ChunkParams {
            chunk_size: self.chunking.chunk_size,
            chunk_overlap: self.chunking.chunk_overlap,
        }
    }

    pub fn embed_params(&self) -> EmbedParams {
        EmbedParams {
            batch_size: self.embedding.batch_size,
            max_input_chars: self.embedding.max_input_chars,
        }
    }

    pub fn retrieval_params(&self) -> RetrievalParams {
        RetrievalParams {
            candidate_k: self.retrieval.candidate_k,
            min_score: self.retrieval.min_score,
        }
    }

    pub fn memory_params(&self) -> MemoryParams {
        MemoryParams {
            short_term_window: self.memory.short_term_window,
            long_term_k: self.memory.long_term_k,
            max_context_chars: self.memory.max_context_chars,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a TOML config.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    config
        .chunk_params()
        .validate()
        .map_err(|e| anyhow::anyhow!("chunking: {}", e))?;

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.candidate_k < config.retrieval.top_k {
        anyhow::bail!("retrieval.candidate_k must be >= retrieval.top_k");
    }
    if !(0.0..=1.0).contains(&config.retrieval.min_score) {
        anyhow::bail!("retrieval.min_score must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.retrieval.lexical_weight) {
        anyhow::bail!("retrieval.lexical_weight must be in [0.0, 1.0]");
    }

    // Validate memory
    if config.memory.short_term_window < 1 {
        anyhow::bail!("memory.short_term_window must be >= 1");
    }
    if config.memory.max_context_chars < 1 {
        anyhow::bail!("memory.max_context_chars must be >= 1");
    }

    // Validate embedding
    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "disabled" | "hash" | "local" => {}
        "openai" | "ollama" => {
            if embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    embedding.provider
                );
            }
            if embedding.dims.is_none() {
                anyhow::bail!(
                    "embedding.dims must be specified when provider is '{}'",
                    embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, local, openai, or ollama.",
            other
        ),
    }
    if embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if embedding.batch_size < 1 {
        anyhow::bail!("embedding.batch_size must be >= 1");
    }
    if embedding.max_input_chars < 1 {
        anyhow::bail!("embedding.max_input_chars must be >= 1");
    }

    // Validate generation
    let generation = &config.generation;
    match generation.provider.as_str() {
        "disabled" | "extractive" => {}
        "openai" | "ollama" => {
            if generation.model.is_none() {
                anyhow::bail!(
                    "generation.model must be specified when provider is '{}'",
                    generation.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled, extractive, openai, or ollama.",
            other
        ),
    }
    if generation.max_tokens < 1 {
        anyhow::bail!("generation.max_tokens must be >= 1");
    }
    if !(0.0..=2.0).contains(&generation.temperature) {
        anyhow::bail!("generation.temperature must be in [0.0, 2.0]");
    }

    Ok(())
}
