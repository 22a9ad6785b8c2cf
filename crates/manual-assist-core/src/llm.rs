//! Language model trait and the offline extractive model.

use async_trait::async_trait;

use crate::context::{
    ANSWER_LABEL, CONTEXT_CLOSE, CONTEXT_OPEN, EXPANSION_TASK, NOT_FOUND_ANSWER, PASSAGES_HEADER,
    QUESTION_LABEL, SUMMARY_TASK, TRANSCRIPT_CLOSE, TRANSCRIPT_OPEN,
};
use crate::error::GenerationError;
use crate::text::{sentences, tokenize};

/// A text completion backend.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier for logs and stored metadata.
    fn name(&self) -> &str;

    /// Complete `prompt`, producing at most roughly `max_tokens` tokens.
    async fn complete(&self, prompt: &str, max_tokens: usize) -> Result<String, GenerationError>;
}

/// Rough characters-per-token ratio used to cap offline output length.
const CHARS_PER_TOKEN: usize = 4;

/// Deterministic model that answers by quoting the best-matching sentence
/// from the manual passages in the prompt.
///
/// Understands the three prompt shapes built in [`crate::context`]: answer
/// prompts, summarization prompts, and query-expansion prompts (for which it
/// offers no rewrites).
#[derive(Debug, Default, Clone)]
pub struct ExtractiveModel;

impl ExtractiveModel {
    pub const NAME: &'static str = "extractive";

    pub fn new() -> Self {
        Self
    }

    fn answer(&self, prompt: &str) -> String {
        let question = between(prompt, QUESTION_LABEL, ANSWER_LABEL).unwrap_or_default();
        let question_terms = tokenize(question);
        let context = between(prompt, CONTEXT_OPEN, CONTEXT_CLOSE).unwrap_or_default();

        let mut best: Option<(usize, String)> = None;
        for (source, text) in passages(context) {
            for sentence in sentences(&text) {
                let terms = tokenize(sentence);
                let hits = question_terms
                    .iter()
                    .filter(|q| terms.contains(q))
                    .count();
                if hits > 0 && best.as_ref().map_or(true, |(b, _)| hits > *b) {
                    best = Some((hits, format!("{} [{}]", sentence, source)));
                }
            }
        }
        best.map(|(_, answer)| answer)
            .unwrap_or_else(|| NOT_FOUND_ANSWER.to_string())
    }

    fn summarize(&self, prompt: &str) -> String {
        let transcript = between(prompt, TRANSCRIPT_OPEN, TRANSCRIPT_CLOSE).unwrap_or_default();
        transcript
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| l.chars().take(160).collect::<String>())
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

#[async_trait]
impl LanguageModel for ExtractiveModel {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn complete(&self, prompt: &str, max_tokens: usize) -> Result<String, GenerationError> {
        let text = if prompt.starts_with(EXPANSION_TASK) {
            String::new()
        } else if prompt.starts_with(SUMMARY_TASK) {
            self.summarize(prompt)
        } else {
            self.answer(prompt)
        };
        let limit = max_tokens.saturating_mul(CHARS_PER_TOKEN).max(1);
        Ok(text.chars().take(limit).collect())
    }
}

/// Text between the last `open` marker and the next `close` marker after it.
fn between<'a>(haystack: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = haystack.rfind(open)? + open.len();
    let rest = &haystack[start..];
    let end = rest.find(close).unwrap_or(rest.len());
    Some(rest[..end].trim())
}

/// `(source label, text)` pairs from the passages section of a context.
fn passages(context: &str) -> Vec<(String, String)> {
    let Some(start) = context.find(PASSAGES_HEADER) else {
        return Vec::new();
    };
    let section = &context[start + PASSAGES_HEADER.len()..];
    let section = match section.find("\n## ") {
        Some(end) => &section[..end],
        None => section,
    };

    let mut out: Vec<(String, String)> = Vec::new();
    for line in section.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("[Source: ") && trimmed.ends_with(']') {
            let label = trimmed[1..trimmed.len() - 1].to_string();
            out.push((label, String::new()));
        } else if let Some((_, text)) = out.last_mut() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(line);
        }
    }
    out
}
