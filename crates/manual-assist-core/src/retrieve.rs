//! Query-time retrieval over a document [`VectorIndex`].
//!
//! # Pipeline
//!
//! 1. Expand the query into variants (optional, via [`QueryExpander`]).
//!    The original query is always the first variant.
//! 2. Embed every variant in one batch and search `candidate_k` hits each.
//! 3. Merge by chunk ID keeping the maximum score per chunk (max-pooling).
//!    Ties are broken by first appearance, scanning variants in order.
//! 4. Drop candidates below `min_score`, sort, and keep `top_k`.
//! 5. Rerank (optional, via [`Reranker`]). Reranking reorders and may prune
//!    the tail but never adds chunks.
//!
//! An empty result is a value ([`Retrieval::Empty`]), not an error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::context::render_expansion_prompt;
use crate::embedding::Embedder;
use crate::error::{GenerationError, IndexError, RagError};
use crate::llm::LanguageModel;
use crate::models::{Chunk, ScoredChunk};
use crate::store::VectorIndex;
use crate::text::tokenize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalParams {
    /// Hits fetched per query variant before merging.
    pub candidate_k: usize,
    /// Minimum cosine similarity for a chunk to count as relevant.
    pub min_score: f32,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            candidate_k: 20,
            min_score: 0.5,
        }
    }
}

/// Outcome of a retrieval.
#[derive(Debug, Clone, PartialEq)]
pub enum Retrieval {
    /// At least one chunk passed the threshold, best first.
    Grounded(Vec<ScoredChunk>),
    /// Nothing relevant was found.
    Empty,
}

impl Retrieval {
    pub fn chunks(&self) -> &[ScoredChunk] {
        match self {
            Retrieval::Grounded(chunks) => chunks,
            Retrieval::Empty => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.chunks().len()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Retrieval::Empty)
    }

    pub fn into_chunks(self) -> Vec<ScoredChunk> {
        match self {
            Retrieval::Grounded(chunks) => chunks,
            Retrieval::Empty => Vec::new(),
        }
    }

    fn from_chunks(chunks: Vec<ScoredChunk>) -> Self {
        if chunks.is_empty() {
            Retrieval::Empty
        } else {
            Retrieval::Grounded(chunks)
        }
    }
}

/// Produces alternative phrasings of a query.
#[async_trait]
pub trait QueryExpander: Send + Sync {
    /// Returns variants, not including the original query.
    async fn expand(&self, query: &str) -> Result<Vec<String>, GenerationError>;
}

/// Reorders a candidate list.
pub trait Reranker: Send + Sync {
    fn rerank(&self, query: &str, candidates: Vec<ScoredChunk>) -> Vec<ScoredChunk>;
}

/// Asks a [`LanguageModel`] for rewrites, one per line.
pub struct LlmQueryExpander {
    model: Arc<dyn LanguageModel>,
    variants: usize,
    max_tokens: usize,
}

impl LlmQueryExpander {
    pub fn new(model: Arc<dyn LanguageModel>, variants: usize) -> Self {
        Self {
            model,
            variants,
            max_tokens: 200,
        }
    }
}

#[async_trait]
impl QueryExpander for LlmQueryExpander {
    async fn expand(&self, query: &str) -> Result<Vec<String>, GenerationError> {
        if self.variants == 0 {
            return Ok(Vec::new());
        }
        let prompt = render_expansion_prompt(query, self.variants);
        let raw = self.model.complete(&prompt, self.max_tokens).await?;
        Ok(parse_variants(&raw, query, self.variants))
    }
}

/// Parse one rewrite per line, dropping list markers, blanks, and repeats.
pub fn parse_variants(raw: &str, query: &str, limit: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in raw.lines() {
        let cleaned = strip_list_marker(line.trim()).trim_matches('"').trim();
        if cleaned.is_empty() || cleaned.eq_ignore_ascii_case(query.trim()) {
            continue;
        }
        if out.iter().any(|v| v.eq_ignore_ascii_case(cleaned)) {
            continue;
        }
        out.push(cleaned.to_string());
        if out.len() == limit {
            break;
        }
    }
    out
}

/// `"1. x"`, `"2) x"`, `"- x"`, `"* x"` -> `"x"`.
fn strip_list_marker(line: &str) -> &str {
    let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(stripped) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return stripped.trim_start();
        }
        return line;
    }
    line.strip_prefix(['-', '*'])
        .map(str::trim_start)
        .unwrap_or(line)
}

/// Blends vector similarity with query-term coverage.
pub struct LexicalReranker {
    /// Weight of term coverage in `[0, 1]`.
    pub lexical_weight: f32,
    /// Candidates whose blended score falls below this are pruned.
    pub min_score: Option<f32>,
}

impl Default for LexicalReranker {
    fn default() -> Self {
        Self {
            lexical_weight: 0.3,
            min_score: None,
        }
    }
}

impl Reranker for LexicalReranker {
    fn rerank(&self, query: &str, candidates: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
        let terms = tokenize(query);
        let w = self.lexical_weight.clamp(0.0, 1.0);
        let mut scored: Vec<ScoredChunk> = candidates
            .into_iter()
            .map(|mut sc| {
                let coverage = if terms.is_empty() {
                    0.0
                } else {
                    let chunk_terms = tokenize(&sc.chunk.text);
                    let hit = terms.iter().filter(|t| chunk_terms.contains(t)).count();
                    hit as f32 / terms.len() as f32
                };
                sc.rerank_score = Some((1.0 - w) * sc.score + w * coverage);
                sc
            })
            .collect();
        scored.sort_by(|a, b| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(min) = self.min_score {
            scored.retain(|sc| sc.rerank_score.unwrap_or(0.0) >= min);
        }
        scored
    }
}

struct Candidate {
    score: f32,
    first_seen: usize,
    payload: serde_json::Value,
}

/// Embeds queries and searches a document index.
pub struct Retriever {
    embedder: Arc<Embedder>,
    params: RetrievalParams,
    expander: Option<Arc<dyn QueryExpander>>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl Retriever {
    pub fn new(embedder: Arc<Embedder>, params: RetrievalParams) -> Self {
        Self {
            embedder,
            params,
            expander: None,
            reranker: None,
        }
    }

    pub fn with_expander(mut self, expander: Arc<dyn QueryExpander>) -> Self {
        self.expander = Some(expander);
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn params(&self) -> &RetrievalParams {
        &self.params
    }

    /// Retrieve up to `top_k` chunks relevant to `query` from `index`.
    pub async fn retrieve(
        &self,
        index: &dyn VectorIndex,
        query: &str,
        top_k: usize,
    ) -> Result<Retrieval, RagError> {
        if top_k == 0 {
            return Err(RagError::InvalidRequest("top_k must be positive".into()));
        }
        let query = query.trim();
        if query.is_empty() {
            return Err(RagError::InvalidRequest("query must not be empty".into()));
        }
        if index.identity() != self.embedder.identity() {
            return Err(IndexError::ModelMismatch {
                indexed: index.identity().to_string(),
                query: self.embedder.identity().to_string(),
            }
            .into());
        }

        let variants = self.variants(query).await;
        let vectors = self.embedder.embed(&variants).await?;
        let candidate_k = self.params.candidate_k.max(top_k);

        let mut merged: HashMap<String, Candidate> = HashMap::new();
        let mut seen = 0usize;
        for vector in &vectors {
            for hit in index.search(vector, candidate_k, None).await? {
                match merged.get_mut(&hit.owner_id) {
                    Some(c) => {
                        if hit.score > c.score {
                            c.score = hit.score;
                        }
                    }
                    None => {
                        merged.insert(
                            hit.owner_id.clone(),
                            Candidate {
                                score: hit.score,
                                first_seen: seen,
                                payload: hit.payload,
                            },
                        );
                        seen += 1;
                    }
                }
            }
        }

        let mut ranked: Vec<(String, Candidate)> = merged
            .into_iter()
            .filter(|(_, c)| c.score >= self.params.min_score)
            .collect();
        ranked.sort_by(|(_, a), (_, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.first_seen.cmp(&b.first_seen))
        });
        ranked.truncate(top_k);

        let mut chunks = Vec::with_capacity(ranked.len());
        for (owner_id, c) in ranked {
            let chunk: Chunk = serde_json::from_value(c.payload).map_err(|e| {
                IndexError::CorruptEntry {
                    owner_id: owner_id.clone(),
                    detail: e.to_string(),
                }
            })?;
            chunks.push(ScoredChunk {
                chunk,
                score: c.score,
                rerank_score: None,
            });
        }

        if let Some(reranker) = &self.reranker {
            chunks = reranker.rerank(query, chunks);
        }

        debug!(
            variants = variants.len(),
            results = chunks.len(),
            "retrieval complete"
        );
        Ok(Retrieval::from_chunks(chunks))
    }

    async fn variants(&self, query: &str) -> Vec<String> {
        let mut variants = vec![query.to_string()];
        if let Some(expander) = &self.expander {
            match expander.expand(query).await {
                Ok(extra) => variants.extend(extra),
                Err(e) => warn!(error = %e, "query expansion failed, using original query only"),
            }
        }
        variants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbedParams, EmbeddingBackend, HashEmbedding};
    use crate::error::EmbeddingError;
    use crate::models::{ModelIdentity, OwnerKind};
    use crate::store::memory::InMemoryIndex;
    use crate::store::IndexEntry;

    /// Maps known texts to fixed 2-d vectors.
    struct TableBackend {
        identity: ModelIdentity,
        table: Vec<(&'static str, [f32; 2])>,
    }

    #[async_trait]
    impl EmbeddingBackend for TableBackend {
        fn identity(&self) -> &ModelIdentity {
            &self.identity
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts
                .iter()
                .map(|t| {
                    self.table
                        .iter()
                        .find(|(k, _)| k == t)
                        .map(|(_, v)| v.to_vec())
                        .unwrap_or_else(|| vec![0.0, 0.0])
                })
                .collect())
        }
    }

    struct FixedExpander(Vec<String>);

    #[async_trait]
    impl QueryExpander for FixedExpander {
        async fn expand(&self, _query: &str) -> Result<Vec<String>, GenerationError> {
            Ok(self.0.clone())
        }
    }

    struct FailingExpander;

    #[async_trait]
    impl QueryExpander for FailingExpander {
        async fn expand(&self, _query: &str) -> Result<Vec<String>, GenerationError> {
            Err(GenerationError::Unavailable {
                detail: "down".into(),
            })
        }
    }

    fn chunk(source: &str, index: u32, text: &str) -> Chunk {
        Chunk {
            id: format!("{}#{}", source, index),
            source_id: source.into(),
            page_number: 1,
            chunk_index: index,
            text: text.into(),
            char_length: text.chars().count(),
            overlap_chars: 0,
            hash: String::new(),
        }
    }

    async fn add(index: &InMemoryIndex, c: Chunk, v: [f32; 2]) {
        let payload = serde_json::to_value(&c).unwrap();
        index
            .upsert(IndexEntry::new(c.id.clone(), OwnerKind::DocumentChunk, v.to_vec(), payload))
            .await
            .unwrap();
    }

    fn table_retriever(params: RetrievalParams) -> (Retriever, ModelIdentity) {
        let identity = ModelIdentity::new("table", 2);
        let backend = TableBackend {
            identity: identity.clone(),
            table: vec![("q", [1.0, 0.0]), ("q-variant", [0.0, 1.0])],
        };
        let embedder = Arc::new(Embedder::new(Arc::new(backend), EmbedParams::default()));
        (Retriever::new(embedder, params), identity)
    }

    #[tokio::test]
    async fn test_threshold_produces_empty() {
        let (retriever, identity) = table_retriever(RetrievalParams {
            candidate_k: 10,
            min_score: 0.9,
        });
        let index = InMemoryIndex::new(identity);
        add(&index, chunk("m", 0, "far"), [0.0, 1.0]).await;
        let r = retriever.retrieve(&index, "q", 5).await.unwrap();
        assert!(r.is_empty());
        assert_eq!(r.len(), 0);
    }

    #[tokio::test]
    async fn test_empty_index_is_empty_retrieval() {
        let (retriever, identity) = table_retriever(RetrievalParams::default());
        let index = InMemoryIndex::new(identity);
        assert_eq!(
            retriever.retrieve(&index, "q", 5).await.unwrap(),
            Retrieval::Empty
        );
    }

    #[tokio::test]
    async fn test_results_above_threshold_sorted_and_limited() {
        let (retriever, identity) = table_retriever(RetrievalParams {
            candidate_k: 10,
            min_score: 0.1,
        });
        let index = InMemoryIndex::new(identity);
        add(&index, chunk("m", 0, "mid"), [0.6, 0.8]).await;
        add(&index, chunk("m", 1, "best"), [1.0, 0.0]).await;
        add(&index, chunk("m", 2, "low"), [0.2, 0.98]).await;
        add(&index, chunk("m", 3, "none"), [0.0, 1.0]).await;

        let r = retriever.retrieve(&index, "q", 2).await.unwrap();
        let texts: Vec<_> = r.chunks().iter().map(|c| c.chunk.text.as_str()).collect();
        assert_eq!(texts, vec!["best", "mid"]);
        for c in r.chunks() {
            assert!(c.score >= 0.1);
        }
    }

    #[tokio::test]
    async fn test_zero_top_k_rejected() {
        let (retriever, identity) = table_retriever(RetrievalParams::default());
        let index = InMemoryIndex::new(identity);
        assert!(matches!(
            retriever.retrieve(&index, "q", 0).await,
            Err(RagError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_model_mismatch_rejected() {
        let (retriever, _) = table_retriever(RetrievalParams::default());
        let index = InMemoryIndex::new(ModelIdentity::new("other", 2));
        assert!(matches!(
            retriever.retrieve(&index, "q", 3).await,
            Err(RagError::Index(IndexError::ModelMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_expansion_max_pools_scores() {
        let (retriever, identity) = table_retriever(RetrievalParams {
            candidate_k: 10,
            min_score: 0.5,
        });
        let retriever =
            retriever.with_expander(Arc::new(FixedExpander(vec!["q-variant".to_string()])));
        let index = InMemoryIndex::new(identity);
        add(&index, chunk("m", 0, "matches original"), [1.0, 0.0]).await;
        add(&index, chunk("m", 1, "matches variant"), [0.0, 1.0]).await;

        let r = retriever.retrieve(&index, "q", 5).await.unwrap();
        assert_eq!(r.len(), 2);
        // equal max scores: the chunk first seen via the original query wins the tie
        assert_eq!(r.chunks()[0].chunk.text, "matches original");
        for c in r.chunks() {
            assert!((c.score - 1.0).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_failed_expansion_falls_back_to_query() {
        let (retriever, identity) = table_retriever(RetrievalParams {
            candidate_k: 10,
            min_score: 0.5,
        });
        let retriever = retriever.with_expander(Arc::new(FailingExpander));
        let index = InMemoryIndex::new(identity);
        add(&index, chunk("m", 0, "hit"), [1.0, 0.0]).await;
        let r = retriever.retrieve(&index, "q", 5).await.unwrap();
        assert_eq!(r.len(), 1);
    }

    #[tokio::test]
    async fn test_rerank_keeps_candidate_set() {
        let embedder = Arc::new(Embedder::new(
            Arc::new(HashEmbedding::new(2048)),
            EmbedParams::default(),
        ));
        let params = RetrievalParams {
            candidate_k: 10,
            min_score: 0.0,
        };
        let plain = Retriever::new(embedder.clone(), params);
        let reranked = Retriever::new(embedder.clone(), params)
            .with_reranker(Arc::new(LexicalReranker::default()));

        let index = InMemoryIndex::new(embedder.identity().clone());
        let texts = [
            "Pump seal replacement procedure.",
            "Pump motor wiring diagram and seal inspection.",
            "Compressor seal torque values.",
        ];
        for (i, t) in texts.iter().enumerate() {
            let c = chunk("m", i as u32, t);
            let v = embedder.embed_one(t).await.unwrap();
            let payload = serde_json::to_value(&c).unwrap();
            index
                .upsert(IndexEntry::new(c.id.clone(), OwnerKind::DocumentChunk, v, payload))
                .await
                .unwrap();
        }

        let a = plain.retrieve(&index, "pump seal", 3).await.unwrap();
        let b = reranked.retrieve(&index, "pump seal", 3).await.unwrap();
        let mut ids_a: Vec<_> = a.chunks().iter().map(|c| c.chunk.id.clone()).collect();
        let mut ids_b: Vec<_> = b.chunks().iter().map(|c| c.chunk.id.clone()).collect();
        ids_a.sort();
        ids_b.sort();
        assert_eq!(ids_a, ids_b);
        assert!(b.chunks().iter().all(|c| c.rerank_score.is_some()));
    }

    #[tokio::test]
    async fn test_retrieval_is_deterministic() {
        let (retriever, identity) = table_retriever(RetrievalParams {
            candidate_k: 10,
            min_score: 0.0,
        });
        let index = InMemoryIndex::new(identity);
        for i in 0..5 {
            add(&index, chunk("m", i, &format!("tie {}", i)), [1.0, 0.0]).await;
        }
        let a = retriever.retrieve(&index, "q", 5).await.unwrap();
        let b = retriever.retrieve(&index, "q", 5).await.unwrap();
        assert_eq!(a, b);
        let order: Vec<_> = a.chunks().iter().map(|c| c.chunk.chunk_index).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_parse_variants() {
        let raw = "1. pump maintenance interval\n- \"pump service schedule\"\n\nPump maintenance interval\nq";
        let v = parse_variants(raw, "q", 5);
        assert_eq!(v, vec!["pump maintenance interval", "pump service schedule"]);
        assert_eq!(parse_variants(raw, "q", 1).len(), 1);
    }
}
