//! Language-model providers.
//!
//! All providers implement the core [`LanguageModel`] trait:
//! `complete(prompt, max_tokens) -> String`.
//!
//! | Provider | Backend |
//! |----------|---------|
//! | `disabled` | [`DisabledModel`], every call fails |
//! | `extractive` | [`ExtractiveModel`], offline, quotes the passages |
//! | `openai` | [`OpenAIChat`], `/v1/chat/completions` |
//! | `ollama` | [`OllamaGenerate`], `/api/generate` |
//!
//! Every provider returned by [`create_model`] is wrapped in a
//! [`DeadlineModel`], which bounds one completion (retries included) by
//! `generation.deadline_secs`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use manual_assist_core::error::GenerationError;
use manual_assist_core::llm::{ExtractiveModel, LanguageModel};

use crate::config::GenerationConfig;
use crate::http::{build_client, post_json, HttpFailure, RetryPolicy};

fn map_failure(failure: HttpFailure) -> GenerationError {
    match failure {
        HttpFailure::Transient(detail) => GenerationError::Unavailable { detail },
        HttpFailure::Rejected(detail) => GenerationError::Rejected { detail },
    }
}

pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _prompt: &str, _max_tokens: usize) -> Result<String, GenerationError> {
        Err(GenerationError::Disabled)
    }
}

/// OpenAI-compatible chat completions.
pub struct OpenAIChat {
    model: String,
    api_key: String,
    url: String,
    temperature: f32,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl OpenAIChat {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        Ok(Self {
            model,
            api_key,
            url: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            temperature: config.temperature,
            client: build_client(config.timeout_secs)?,
            policy: RetryPolicy::new(config.max_retries),
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAIChat {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, max_tokens: usize) -> Result<String, GenerationError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": max_tokens,
            "temperature": self.temperature,
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
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &Value) -> Result<String, GenerationError> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| GenerationError::Rejected {
            detail: "malformed response: missing choices[0].message.content".into(),
        })
}

/// Non-streaming completion against a local Ollama instance.
pub struct OllamaGenerate {
    model: String,
    url: String,
    temperature: f32,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl OllamaGenerate {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for Ollama provider"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            url: format!("{}/api/generate", base.trim_end_matches('/')),
            temperature: config.temperature,
            client: build_client(config.timeout_secs)?,
            policy: RetryPolicy::new(config.max_retries),
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaGenerate {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, max_tokens: usize) -> Result<String, GenerationError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "num_predict": max_tokens,
                "temperature": self.temperature,
            },
        });
        let json = post_json(&self.client, &self.url, None, &body, &self.policy)
            .await
            .map_err(map_failure)?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| GenerationError::Rejected {
                detail: "malformed response: missing response field".into(),
            })
    }
}

/// Bounds every completion of the inner model by a wall-clock deadline.
pub struct DeadlineModel {
    inner: Arc<dyn LanguageModel>,
    deadline: Duration,
}

impl DeadlineModel {
    pub fn new(inner: Arc<dyn LanguageModel>, deadline: Duration) -> Self {
        Self { inner, deadline }
    }
}

#[async_trait]
impl LanguageModel for DeadlineModel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(&self, prompt: &str, max_tokens: usize) -> Result<String, GenerationError> {
        match tokio::time::timeout(self.deadline, self.inner.complete(prompt, max_tokens)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout {
                secs: self.deadline.as_secs(),
            }),
        }
    }
}

/// Create the language model named by `generation.provider`.
pub fn create_model(config: &GenerationConfig) -> Result<Arc<dyn LanguageModel>> {
    let inner: Arc<dyn LanguageModel> = match config.provider.as_str() {
        "disabled" => Arc::new(DisabledModel),
        "extractive" => Arc::new(ExtractiveModel::new()),
        "openai" => Arc::new(OpenAIChat::new(config)?),
        "ollama" => Arc::new(OllamaGenerate::new(config)?),
        other => bail!("Unknown generation provider: {}", other),
    };
    Ok(Arc::new(DeadlineModel::new(inner, config.deadline())))
}
