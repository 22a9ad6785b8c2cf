//! Embedding backends.
//!
//! Implements [`EmbeddingBackend`] for:
//! - **[`DisabledBackend`]**: always fails; used when embeddings are not configured.
//! - **[`HashEmbedding`]**: deterministic feature hashing, offline (from the core crate).
//! - **[`OpenAIBackend`]**: OpenAI-compatible `/v1/embeddings`.
//! - **[`OllamaBackend`]**: a local Ollama instance's `/api/embed`.
//! - **`LocalBackend`**: fastembed ONNX models, behind the
//!   `local-embeddings-fastembed` feature.
//!
//! Network backends retry through [`crate::http::post_json`]. Normalization,
//! batching, truncation, and dimension checks happen in the core
//! [`Embedder`](manual_assist_core::embedding::Embedder) wrapping these.
//!
//! # Provider Selection
//!
//! ```rust,no_run
//! # use manual_assist::config::EmbeddingConfig;
//! # use manual_assist::embedding::create_backend;
//! # use manual_assist_core::embedding::EmbeddingBackend;
//! let config = EmbeddingConfig::default(); // provider = "hash"
//! let backend = create_backend(&config).unwrap();
//! assert_eq!(backend.identity().name, "feature-hash-v1");
//! ```

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use manual_assist_core::embedding::{EmbeddingBackend, HashEmbedding};
use manual_assist_core::error::EmbeddingError;
use manual_assist_core::models::ModelIdentity;

use crate::config::EmbeddingConfig;
use crate::http::{build_client, post_json, HttpFailure, RetryPolicy};

fn map_failure(failure: HttpFailure) -> EmbeddingError {
    match failure {
        HttpFailure::Transient(detail) => EmbeddingError::Unavailable { detail },
        HttpFailure::Rejected(detail) => EmbeddingError::Rejected { detail },
    }
}

fn malformed(detail: &str) -> EmbeddingError {
    EmbeddingError::Rejected {
        detail: format!("malformed response: {}", detail),
    }
}

// ============ Disabled ============

pub struct DisabledBackend {
    identity: ModelIdentity,
}

impl DisabledBackend {
    pub fn new() -> Self {
        Self {
            identity: ModelIdentity::new("disabled", 0),
        }
    }
}

impl Default for DisabledBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingBackend for DisabledBackend {
    fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }
}

// ============ OpenAI ============

pub struct OpenAIBackend {
    identity: ModelIdentity,
    api_key: String,
    url: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl OpenAIBackend {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        Ok(Self {
            identity: ModelIdentity::new(model, dims),
            api_key,
            url: format!("{}/v1/embeddings", base.trim_end_matches('/')),
            client: build_client(config.timeout_secs)?,
            policy: RetryPolicy::new(config.max_retries),
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAIBackend {
    fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.identity.name,
            "input": texts,
        });
        let json = post_json(
            &self.client,
            &self.url,
            Some(&self.api_key),
            &body,
            &self.policy,
        )
        .await
        .map_err(map_failure)?;
        parse_openai_response(&json)
    }
}

/// Parse `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| malformed("missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| malformed("missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, to_f32_vec(embedding)));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn to_f32_vec(values: &[Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

// ============ Ollama ============

pub struct OllamaBackend {
    identity: ModelIdentity,
    url: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl OllamaBackend {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            identity: ModelIdentity::new(model, dims),
            url: format!("{}/api/embed", base.trim_end_matches('/')),
            client: build_client(config.timeout_secs)?,
            policy: RetryPolicy::new(config.max_retries),
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaBackend {
    fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.identity.name,
            "input": texts,
        });
        let json = post_json(&self.client, &self.url, None, &body, &self.policy)
            .await
            .map_err(map_failure)?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| malformed("missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|values| to_f32_vec(values))
                .ok_or_else(|| malformed("embedding is not an array"))
        })
        .collect()
}

// ============ Local (fastembed) ============

/// Local ONNX inference via fastembed. The model is downloaded from
/// Hugging Face on first use and cached; later runs are offline.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalBackend {
    identity: ModelIdentity,
    batch_size: usize,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalBackend {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let identity = config.identity();
        // fail early on unknown model names
        config_to_fastembed_model(&identity.name)?;
        Ok(Self {
            identity,
            batch_size: config.batch_size,
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, \
             multilingual-e5-small, multilingual-e5-base",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingBackend for LocalBackend {
    fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let texts = texts.to_vec();
        let batch_size = self.batch_size;
        let name = self.identity.name.clone();
        let slot = self.model.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if guard.is_none() {
                let model = config_to_fastembed_model(&name).map_err(|e| {
                    EmbeddingError::Rejected {
                        detail: e.to_string(),
                    }
                })?;
                let loaded = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model).with_show_download_progress(true),
                )
                .map_err(|e| EmbeddingError::Unavailable {
                    detail: format!("failed to initialize local embedding model: {}", e),
                })?;
                *guard = Some(loaded);
            }
            let Some(model) = guard.as_mut() else {
                return Err(EmbeddingError::Unavailable {
                    detail: "local embedding model not loaded".into(),
                });
            };
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| EmbeddingError::Unavailable {
                    detail: format!("local embedding failed: {}", e),
                })
        })
        .await
        .map_err(|e| EmbeddingError::Unavailable {
            detail: e.to_string(),
        })?
    }
}

/// Create the [`EmbeddingBackend`] named by `embedding.provider`.
///
/// | Config Value | Backend |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledBackend`] |
/// | `"hash"` | [`HashEmbedding`] |
/// | `"openai"` | [`OpenAIBackend`] |
/// | `"ollama"` | [`OllamaBackend`] |
/// | `"local"` | `LocalBackend` (requires `local-embeddings-fastembed`) |
pub fn create_backend(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingBackend>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledBackend::new())),
        "hash" => Ok(Arc::new(HashEmbedding::new(config.identity().dims))),
        "openai" => Ok(Arc::new(OpenAIBackend::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaBackend::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalBackend::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
