//! The question-answering service.
//!
//! [`Assistant`] wires the configured embedding backend, language model,
//! SQLite stores, and document index generations into the operations the
//! CLI exposes: ingest, reindex, search, answer, and session management.
//!
//! # Answer flow
//!
//! ```text
//! lock session ─▶ snapshot generation ─▶ retrieve ─▶ build context
//!      │                                                  │
//!      │                         complete ◀── render prompt
//!      │                            │
//!      └──────── append question + answer (only on success)
//! ```

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use metrics::{counter, histogram};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use manual_assist_core::context::{extract_sources, parse_answer, render_answer_prompt};
use manual_assist_core::embedding::{EmbeddingBackend, Embedder};
use manual_assist_core::error::{IndexError, IngestionError, RagError};
use manual_assist_core::llm::LanguageModel;
use manual_assist_core::models::{Answer, ConversationSession, Message, OwnerKind, Role};
use manual_assist_core::retrieve::{LexicalReranker, LlmQueryExpander, Retrieval, Retriever};

use crate::config::Config;
use crate::db;
use crate::embedding::create_backend;
use crate::generations::IndexGenerations;
use crate::ingest::{IngestReport, Ingestor, SourceDocument};
use crate::llm::create_model;
use crate::memory::{MemoryManager, Metadata};
use crate::migrate::apply_schema;
use crate::sqlite_store::{
    activate_generation, drop_generation, load_generations, record_generation,
    stale_message_sessions,
    SqliteConversationStore, SqliteVectorIndex, GENERATION_ACTIVE, GENERATION_BUILDING,
    GENERATION_RETIRED, MESSAGE_GENERATION,
};
use crate::stats::{collect_stats, IndexStats};
use crate::telemetry;

const DOCUMENTS: OwnerKind = OwnerKind::DocumentChunk;

/// Outcome of a full reindex.
#[derive(Debug)]
pub struct ReindexReport {
    /// The generation now serving queries, if one was published.
    pub published: Option<u64>,
    pub previous: Option<u64>,
    pub results: Vec<Result<IngestReport, IngestionError>>,
}

pub struct Assistant {
    config: Config,
    pool: SqlitePool,
    embedder: Arc<Embedder>,
    model: Arc<dyn LanguageModel>,
    retriever: Retriever,
    ingestor: Ingestor,
    memory: MemoryManager,
    generations: IndexGenerations,
    /// Serializes writers of the document index.
    writer: tokio::sync::Mutex<()>,
}

impl Assistant {
    /// Open with the providers named in `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        let backend = create_backend(&config.embedding)?;
        let model = create_model(&config.generation)?;
        Self::open_with(config, pool, backend, model).await
    }

    /// Open with explicit providers.
    pub async fn open_with(
        config: &Config,
        pool: SqlitePool,
        backend: Arc<dyn EmbeddingBackend>,
        model: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        apply_schema(&pool).await?;

        let embedder = Arc::new(Embedder::new(backend, config.embed_params()));
        let identity = embedder.identity().clone();

        let generations = IndexGenerations::new();
        let records = load_generations(&pool, DOCUMENTS).await?;
        let active = records
            .iter()
            .rev()
            .find(|g| g.state == GENERATION_ACTIVE)
            .cloned();

        // superseded generations whose process exited before reclaiming them
        for stale in records.iter().filter(|g| g.state == GENERATION_RETIRED) {
            info!(generation = stale.generation, "dropping retired document index generation");
            drop_generation(&pool, DOCUMENTS, stale.generation).await?;
        }
        for building in records.iter().filter(|g| g.state == GENERATION_BUILDING) {
            warn!(
                generation = building.generation,
                "document index generation is still marked as building"
            );
        }

        match active {
            Some(record) => {
                if record.identity != identity {
                    warn!(
                        indexed = %record.identity,
                        configured = %identity,
                        "document index was built with a different embedding model; run reindex"
                    );
                }
                let index = SqliteVectorIndex::new(
                    pool.clone(),
                    DOCUMENTS,
                    record.generation,
                    record.identity.clone(),
                );
                generations.install(record.generation, Arc::new(index));
            }
            None => {
                let first = records.iter().map(|g| g.generation).max().map_or(1, |g| g + 1);
                record_generation(&pool, DOCUMENTS, first, GENERATION_ACTIVE, &identity).await?;
                let index =
                    SqliteVectorIndex::new(pool.clone(), DOCUMENTS, first, identity.clone());
                generations.install(first, Arc::new(index));
                debug!(generation = first, "created document index generation");
            }
        }

        let mut retriever = Retriever::new(embedder.clone(), config.retrieval_params());
        if config.retrieval.rerank {
            retriever = retriever.with_reranker(Arc::new(LexicalReranker {
                lexical_weight: config.retrieval.lexical_weight,
                min_score: config.retrieval.rerank_min_score,
            }));
        }
        if config.retrieval.query_expansion {
            retriever = retriever.with_expander(Arc::new(LlmQueryExpander::new(
                model.clone(),
                config.retrieval.expansion_variants,
            )));
        }

        let ingestor = Ingestor::new(
            embedder.clone(),
            config.chunk_params(),
            config.chunking.min_page_chars,
        )?;

        let message_index = SqliteVectorIndex::new(
            pool.clone(),
            OwnerKind::ConversationMessage,
            MESSAGE_GENERATION,
            identity,
        );
        let memory = MemoryManager::new(
            Arc::new(SqliteConversationStore::new(pool.clone())),
            Arc::new(message_index),
            embedder.clone(),
            model.clone(),
            config.memory_params(),
        );

        let assistant = Self {
            config: config.clone(),
            pool,
            embedder,
            model,
            retriever,
            ingestor,
            memory,
            generations,
            writer: tokio::sync::Mutex::new(()),
        };
        if let Err(e) = assistant.reconcile_messages().await {
            warn!(error = %e, "could not reconcile conversation vectors");
        }
        Ok(assistant)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn generations(&self) -> &IndexGenerations {
        &self.generations
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Ingest sources into the current document generation, replacing any
    /// earlier version of each source. One result per source.
    pub async fn ingest(
        &self,
        docs: &[SourceDocument],
    ) -> Result<Vec<Result<IngestReport, IngestionError>>, RagError> {
        let _writer = self.writer.lock().await;
        let guard = self
            .generations
            .snapshot()
            .ok_or(IndexError::NoActiveGeneration)?;

        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            let result = self.ingestor.ingest_into(guard.index(), doc).await;
            record_ingest(telemetry::OP_INGEST, &result);
            if let Err(e) = &result {
                warn!(source_id = %doc.source_id, error = %e, "ingestion failed");
            }
            results.push(result);
        }
        Ok(results)
    }

    /// Rebuild the document index from `docs` in a new generation and
    /// publish it. Queries keep using the previous generation meanwhile.
    ///
    /// Sources that fail are left out of the new generation. If none
    /// succeed, nothing is published.
    pub async fn reindex(&self, docs: &[SourceDocument]) -> Result<ReindexReport, RagError> {
        let _writer = self.writer.lock().await;
        let identity = self.embedder.identity().clone();

        let floor = load_generations(&self.pool, DOCUMENTS)
            .await?
            .iter()
            .map(|g| g.generation + 1)
            .max()
            .unwrap_or(1);
        let id = self.generations.begin_build(floor);
        record_generation(&self.pool, DOCUMENTS, id, GENERATION_BUILDING, &identity).await?;
        info!(generation = id, sources = docs.len(), "building document index generation");

        let index = Arc::new(SqliteVectorIndex::new(
            self.pool.clone(),
            DOCUMENTS,
            id,
            identity,
        ));
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            let result = self.ingestor.ingest_into(index.as_ref(), doc).await;
            record_ingest(telemetry::OP_REINDEX, &result);
            if let Err(e) = &result {
                warn!(source_id = %doc.source_id, error = %e, "ingestion failed");
            }
            results.push(result);
        }

        if !results.iter().any(|r| r.is_ok()) {
            warn!(generation = id, "no source ingested, generation discarded");
            drop_generation(&self.pool, DOCUMENTS, id).await?;
            return Ok(ReindexReport {
                published: None,
                previous: self.generations.current_id(),
                results,
            });
        }

        activate_generation(&self.pool, DOCUMENTS, id).await?;
        let previous = self.generations.publish(id, index);
        info!(generation = id, ?previous, "document index generation published");
        self.reclaim_generations().await;
        if let Err(e) = self.reconcile_messages().await {
            warn!(error = %e, "could not reconcile conversation vectors");
        }

        Ok(ReindexReport {
            published: Some(id),
            previous,
            results,
        })
    }

    /// Purge superseded generations no request still reads. Returns how
    /// many were reclaimed.
    pub async fn reclaim_generations(&self) -> usize {
        let mut reclaimed = 0;
        for (id, index) in self.generations.take_reclaimable() {
            if let Err(e) = index.purge().await {
                warn!(generation = id, error = %e, "could not purge retired generation");
                continue;
            }
            if let Err(e) = drop_generation(&self.pool, DOCUMENTS, id).await {
                warn!(generation = id, error = %e, "could not drop retired generation");
                continue;
            }
            info!(generation = id, "retired generation reclaimed");
            reclaimed += 1;
        }
        reclaimed
    }

    /// Re-embed conversation vectors produced by a different embedding
    /// model or dimension count than the configured one. Returns how many
    /// sessions were brought up to date; a session that fails is logged and
    /// retried on the next call.
    pub async fn reconcile_messages(&self) -> Result<usize, RagError> {
        let stale = stale_message_sessions(&self.pool, self.embedder.identity()).await?;
        if stale.is_empty() {
            return Ok(0);
        }
        info!(
            sessions = stale.len(),
            model = %self.embedder.identity(),
            "re-embedding conversation vectors"
        );
        let mut reembedded = 0;
        for session_id in &stale {
            match self.memory.reembed_session(session_id).await {
                Ok(_) => reembedded += 1,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "could not re-embed session")
                }
            }
        }
        Ok(reembedded)
    }

    /// Retrieval only, against the current generation.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<Retrieval, RagError> {
        let started = Instant::now();
        let guard = self
            .generations
            .snapshot()
            .ok_or(IndexError::NoActiveGeneration)?;
        let result = self.retriever.retrieve(guard.index(), query, top_k).await;
        match &result {
            Ok(retrieval) => {
                histogram!(telemetry::RETRIEVAL_DURATION_SECONDS)
                    .record(started.elapsed().as_secs_f64());
                histogram!(telemetry::RETRIEVED_CHUNKS).record(retrieval.len() as f64);
            }
            Err(e) => telemetry::record_error(telemetry::OP_RETRIEVE, e),
        }
        result
    }

    /// Answer `question` in `session_id`, grounded in the manuals and the
    /// session's history. The turn is recorded only if generation succeeds.
    pub async fn answer(
        &self,
        session_id: &str,
        question: &str,
        top_k: usize,
    ) -> Result<Answer, RagError> {
        let started = Instant::now();
        let result = self.answer_turn(session_id, question, top_k).await;
        telemetry::record_request(telemetry::OP_ANSWER, started, &result);
        if let Ok(answer) = &result {
            histogram!(telemetry::ANSWER_LENGTH_CHARS)
                .record(answer.answer.chars().count() as f64);
        }
        result
    }

    async fn answer_turn(
        &self,
        session_id: &str,
        question: &str,
        top_k: usize,
    ) -> Result<Answer, RagError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::InvalidRequest("question must not be empty".into()));
        }

        let mut turn = self.memory.lock(session_id).await?;

        let retrieval = self.retrieve(question, top_k).await?;
        let retrieved_count = retrieval.len();
        if retrieval.is_empty() {
            debug!(session_id, "no passage cleared the similarity threshold");
        }

        let context = self
            .memory
            .build_context(session_id, question, retrieval.chunks())
            .await?;
        let prompt = render_answer_prompt(&context, question);
        let raw = self
            .model
            .complete(&prompt, self.config.generation.max_tokens)
            .await?;
        let answer = parse_answer(&raw)?;
        let sources = extract_sources(&context.passages);

        let mut metadata = Metadata::new();
        metadata.insert(
            "sources".into(),
            json!(sources.iter().map(|c| c.to_string()).collect::<Vec<_>>()),
        );
        metadata.insert(
            "scores".into(),
            json!(context
                .passages
                .iter()
                .map(|sc| json!({
                    "chunk_id": sc.chunk.id,
                    "score": sc.score,
                    "rerank_score": sc.rerank_score,
                }))
                .collect::<Vec<_>>()),
        );
        metadata.insert("retrieved_count".into(), json!(retrieved_count));
        metadata.insert("model".into(), json!(self.model.name()));

        self.memory
            .append_many_in_turn(
                &mut turn,
                vec![
                    (Role::User, question.to_string(), Metadata::new()),
                    (Role::Assistant, answer.clone(), metadata),
                ],
            )
            .await?;
        drop(turn);
        self.reclaim_generations().await;

        Ok(Answer {
            answer,
            sources,
            retrieved_count,
        })
    }

    pub async fn create_session(&self, owner_id: &str) -> Result<ConversationSession, RagError> {
        Ok(self.memory.create_session(owner_id).await?)
    }

    pub async fn list_sessions(
        &self,
        owner_id: &str,
    ) -> Result<Vec<ConversationSession>, RagError> {
        Ok(self.memory.list_sessions(owner_id).await?)
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<ConversationSession, RagError> {
        Ok(self.memory.delete_session(session_id).await?)
    }

    pub async fn history(&self, session_id: &str, limit: usize) -> Result<Vec<Message>, RagError> {
        Ok(self.memory.history(session_id, limit).await?)
    }

    /// Remove archived sessions older than `memory.archive_retention_hours`.
    pub async fn purge_archived(&self) -> Result<usize, RagError> {
        let retention = chrono::Duration::hours(self.config.memory.archive_retention_hours as i64);
        Ok(self.memory.purge_archived(retention).await?)
    }

    pub async fn stats(&self) -> Result<IndexStats, RagError> {
        Ok(collect_stats(&self.pool).await?)
    }
}

fn record_ingest(operation: &'static str, result: &Result<IngestReport, IngestionError>) {
    match result {
        Ok(report) => {
            counter!(telemetry::CHUNKS_INGESTED_TOTAL, telemetry::labels::OPERATION => operation)
                .increment(report.chunks as u64);
        }
        Err(_) => {
            counter!(
                telemetry::ERRORS_TOTAL,
                telemetry::labels::OPERATION => operation,
                telemetry::labels::KIND => "ingestion"
            )
            .increment(1);
        }
    }
}
