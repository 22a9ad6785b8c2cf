use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use manual_assist::assistant::Assistant;
use manual_assist::config::{parse_config, Config};
use manual_assist::db;
use manual_assist::ingest::SourceDocument;
use manual_assist::llm::DisabledModel;
use manual_assist_core::context::NOT_FOUND_ANSWER;
use manual_assist_core::embedding::{EmbeddingBackend, HashEmbedding};
use manual_assist_core::error::{
    GenerationError, IndexError, IngestionError, MemoryError, RagError,
};
use manual_assist_core::llm::{ExtractiveModel, LanguageModel};
use manual_assist_core::models::{Citation, PageText, Role};
use manual_assist_core::retrieve::Retrieval;
use manual_assist_core::store::IndexFilter;

const PUMP: &str = "The pump must be serviced every 500 hours.";
const COMPRESSOR: &str = "The compressor must be serviced every 1000 hours.";

fn test_config(tmp: &TempDir, dims: usize, window: usize) -> Config {
    parse_config(&format!(
        r#"
[db]
path = "{}/data/massist.sqlite"

[chunking]
chunk_size = 400
chunk_overlap = 50
min_page_chars = 10

[embedding]
provider = "hash"
dims = {}

[retrieval]
top_k = 3
candidate_k = 10
min_score = 0.3

[memory]
short_term_window = {}
long_term_k = 3
max_context_chars = 4000
"#,
        tmp.path().display(),
        dims,
        window
    ))
    .unwrap()
}

async fn open(config: &Config, model: Arc<dyn LanguageModel>) -> Assistant {
    let pool = db::connect(config).await.unwrap();
    let dims = config.embedding.identity().dims;
    let backend: Arc<dyn EmbeddingBackend> = Arc::new(HashEmbedding::new(dims));
    Assistant::open_with(config, pool, backend, model)
        .await
        .unwrap()
}

async fn extractive(tmp: &TempDir) -> Assistant {
    open(&test_config(tmp, 2048, 6), Arc::new(ExtractiveModel::new())).await
}

fn manual(source_id: &str, text: &str) -> SourceDocument {
    SourceDocument::new(source_id, vec![PageText::new(1, text)])
}

fn citation(source_id: &str, page_number: u32) -> Citation {
    Citation {
        source_id: source_id.into(),
        page_number,
    }
}

#[tokio::test]
async fn test_single_page_manual_is_answered_with_citation() {
    let tmp = TempDir::new().unwrap();
    let assistant = extractive(&tmp).await;
    let results = assistant
        .ingest(&[manual("pump-manual", PUMP)])
        .await
        .unwrap();
    assert!(results[0].is_ok());

    let retrieval = assistant
        .retrieve("How often should the pump be serviced?", 1)
        .await
        .unwrap();
    assert_eq!(retrieval.len(), 1);
    let top = &retrieval.chunks()[0];
    assert!(top.chunk.text.contains("500 hours"));
    assert!(top.score > 0.3);

    let session = assistant.create_session("tech-1").await.unwrap();
    let answer = assistant
        .answer(&session.session_id, "How often should the pump be serviced?", 1)
        .await
        .unwrap();
    assert!(answer.answer.contains("500 hours"));
    assert_eq!(answer.sources, vec![citation("pump-manual", 1)]);
    assert_eq!(answer.retrieved_count, 1);

    let history = assistant.history(&session.session_id, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::Assistant);
    assert_eq!(history[1].role, Role::User);
    assert_eq!(
        history[0].metadata["sources"],
        serde_json::json!(["pump-manual (page 1)"])
    );
}

#[tokio::test]
async fn test_follow_up_retrieves_new_topic_and_keeps_history() {
    let tmp = TempDir::new().unwrap();
    let assistant = extractive(&tmp).await;
    assistant
        .ingest(&[
            manual("pump-manual", PUMP),
            manual("compressor-manual", COMPRESSOR),
        ])
        .await
        .unwrap();

    let session = assistant.create_session("tech-1").await.unwrap();
    let id = session.session_id.as_str();
    assistant
        .memory()
        .append(id, Role::User, "What is the service interval for the pump?")
        .await
        .unwrap();
    assistant
        .memory()
        .append(id, Role::Assistant, "500 hours.")
        .await
        .unwrap();

    let question = "And for the compressor?";
    let retrieval = assistant.retrieve(question, 1).await.unwrap();
    assert_eq!(retrieval.len(), 1);
    assert_eq!(retrieval.chunks()[0].chunk.source_id, "compressor-manual");

    let context = assistant
        .memory()
        .build_context(id, question, retrieval.chunks())
        .await
        .unwrap();
    assert!(context.text.contains("1000 hours"));
    assert!(context.text.contains("What is the service interval for the pump?"));
    assert!(context.text.contains("500 hours."));
    assert_eq!(context.recent_included, 2);

    let answer = assistant.answer(id, question, 1).await.unwrap();
    assert!(answer.answer.contains("1000 hours"));
    assert_eq!(answer.sources, vec![citation("compressor-manual", 1)]);
}

#[tokio::test]
async fn test_empty_index_still_answers_not_found() {
    let tmp = TempDir::new().unwrap();
    let assistant = extractive(&tmp).await;

    let retrieval = assistant
        .retrieve("How often should the pump be serviced?", 3)
        .await
        .unwrap();
    assert!(matches!(retrieval, Retrieval::Empty));

    let session = assistant.create_session("tech-1").await.unwrap();
    let answer = assistant
        .answer(&session.session_id, "How often should the pump be serviced?", 3)
        .await
        .unwrap();
    assert_eq!(answer.answer, NOT_FOUND_ANSWER);
    assert!(answer.sources.is_empty());
    assert_eq!(answer.retrieved_count, 0);
    assert_eq!(assistant.history(&session.session_id, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_window_overflow_summarizes_oldest_message() {
    let tmp = TempDir::new().unwrap();
    let window = 3;
    let assistant = open(
        &test_config(&tmp, 512, window),
        Arc::new(ExtractiveModel::new()),
    )
    .await;
    let session = assistant.create_session("tech-1").await.unwrap();
    let id = session.session_id.as_str();

    for i in 0..=window {
        assistant
            .memory()
            .append(id, Role::User, &format!("Question number {} about valves", i))
            .await
            .unwrap();
    }

    let recent = assistant.memory().short_term(id).await.unwrap();
    assert_eq!(recent.len(), window);
    let summaries = assistant.memory().store().list_summaries(id).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!((summaries[0].first_seq, summaries[0].last_seq), (0, 0));
}

#[tokio::test]
async fn test_deleted_session_leaves_no_message_vectors() {
    let tmp = TempDir::new().unwrap();
    let assistant = extractive(&tmp).await;
    assistant
        .ingest(&[manual("pump-manual", PUMP)])
        .await
        .unwrap();
    let session = assistant.create_session("tech-1").await.unwrap();
    let id = session.session_id.as_str();
    assistant
        .answer(id, "How often should the pump be serviced?", 1)
        .await
        .unwrap();

    let archived = assistant.delete_session(id).await.unwrap();
    assert!(archived.is_archived());

    let memory = assistant.memory();
    let query = assistant.embedder().embed_one("pump serviced").await.unwrap();
    let hits = memory
        .index()
        .search(&query, 10, Some(&IndexFilter::eq("session_id", id)))
        .await
        .unwrap();
    assert!(hits.is_empty());
    assert!(matches!(
        memory.long_term(id, "pump serviced", 5).await,
        Err(MemoryError::SessionArchived { .. })
    ));
    assert!(matches!(
        assistant.answer(id, "Anything else?", 1).await,
        Err(RagError::Memory(MemoryError::SessionArchived { .. }))
    ));
}

#[tokio::test]
async fn test_unknown_session_is_not_created_implicitly() {
    let tmp = TempDir::new().unwrap();
    let assistant = extractive(&tmp).await;
    assert!(matches!(
        assistant.answer("no-such-session", "Hello?", 1).await,
        Err(RagError::Memory(MemoryError::SessionNotFound { .. }))
    ));
    assert!(assistant.list_sessions("default").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_generation_persists_nothing() {
    let tmp = TempDir::new().unwrap();
    let assistant = open(&test_config(&tmp, 2048, 6), Arc::new(DisabledModel)).await;
    assistant
        .ingest(&[manual("pump-manual", PUMP)])
        .await
        .unwrap();
    let session = assistant.create_session("tech-1").await.unwrap();

    let err = assistant
        .answer(&session.session_id, "How often should the pump be serviced?", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Generation(GenerationError::Disabled)));
    assert!(!err.is_retryable());
    assert!(assistant
        .history(&session.session_id, 10)
        .await
        .unwrap()
        .is_empty());
}

struct FlakyModel;

#[async_trait]
impl LanguageModel for FlakyModel {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn complete(&self, _prompt: &str, _max_tokens: usize) -> Result<String, GenerationError> {
        Err(GenerationError::Unavailable {
            detail: "upstream 503 from provider".into(),
        })
    }
}

#[tokio::test]
async fn test_transient_generation_failure_is_retryable_and_hides_detail() {
    let tmp = TempDir::new().unwrap();
    let assistant = open(&test_config(&tmp, 2048, 6), Arc::new(FlakyModel)).await;
    let session = assistant.create_session("tech-1").await.unwrap();
    let err = assistant
        .answer(&session.session_id, "Pump interval?", 1)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(!err.to_string().contains("503"));
    assert_eq!(err.detail(), Some("upstream 503 from provider"));
}

#[tokio::test]
async fn test_reindex_keeps_pinned_generation_until_released() {
    let tmp = TempDir::new().unwrap();
    let assistant = extractive(&tmp).await;
    assistant
        .ingest(&[manual("pump-manual", PUMP)])
        .await
        .unwrap();

    let pinned = assistant.generations().snapshot().unwrap();
    let old_id = pinned.id();

    let report = assistant
        .reindex(&[manual("compressor-manual", COMPRESSOR)])
        .await
        .unwrap();
    let new_id = report.published.unwrap();
    assert_eq!(report.previous, Some(old_id));
    assert!(new_id > old_id);

    // in-flight reader still sees the old manuals
    assert_eq!(pinned.index().len().await.unwrap(), 1);
    let retrieval = assistant.retrieve("compressor serviced", 3).await.unwrap();
    assert_eq!(retrieval.chunks()[0].chunk.source_id, "compressor-manual");
    assert!(retrieval
        .chunks()
        .iter()
        .all(|c| c.chunk.source_id != "pump-manual"));

    drop(pinned);
    assert_eq!(assistant.reclaim_generations().await, 1);
    assert_eq!(assistant.generations().live_ids(), vec![new_id]);

    let stats = assistant.stats().await.unwrap();
    assert_eq!(stats.active_generation, Some(new_id));
    assert_eq!(stats.document_vectors, 1);
}

#[tokio::test]
async fn test_reindex_with_no_valid_source_keeps_current_index() {
    let tmp = TempDir::new().unwrap();
    let assistant = extractive(&tmp).await;
    assistant
        .ingest(&[manual("pump-manual", PUMP)])
        .await
        .unwrap();
    let before = assistant.generations().current_id();

    let report = assistant.reindex(&[manual("blank", "   ")]).await.unwrap();
    assert!(report.published.is_none());
    assert!(matches!(
        report.results[0],
        Err(IngestionError::EmptyDocument { .. })
    ));
    assert_eq!(assistant.generations().current_id(), before);
    assert_eq!(assistant.retrieve("pump serviced", 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_one_bad_source_does_not_block_others() {
    let tmp = TempDir::new().unwrap();
    let assistant = extractive(&tmp).await;
    let results = assistant
        .ingest(&[manual("", PUMP), manual("compressor-manual", COMPRESSOR)])
        .await
        .unwrap();
    assert!(matches!(results[0], Err(IngestionError::MissingSourceId)));
    assert!(results[1].is_ok());
}

#[tokio::test]
async fn test_changed_embedding_model_requires_reindex() {
    let tmp = TempDir::new().unwrap();
    {
        let assistant = open(&test_config(&tmp, 64, 6), Arc::new(ExtractiveModel::new())).await;
        assistant
            .ingest(&[manual("pump-manual", PUMP)])
            .await
            .unwrap();
        assistant.close().await;
    }

    let assistant = open(&test_config(&tmp, 128, 6), Arc::new(ExtractiveModel::new())).await;
    assert!(matches!(
        assistant.retrieve("pump serviced", 1).await,
        Err(RagError::Index(IndexError::ModelMismatch { .. }))
    ));

    assistant
        .reindex(&[manual("pump-manual", PUMP)])
        .await
        .unwrap();
    assert_eq!(assistant.retrieve("pump serviced", 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_session_continues_after_embedding_model_change() {
    let tmp = TempDir::new().unwrap();
    let question = "How often should the pump be serviced?";
    let session_id = {
        let assistant = open(&test_config(&tmp, 64, 6), Arc::new(ExtractiveModel::new())).await;
        assistant
            .ingest(&[manual("pump-manual", PUMP)])
            .await
            .unwrap();
        let session = assistant.create_session("tech-1").await.unwrap();
        assistant
            .answer(&session.session_id, question, 1)
            .await
            .unwrap();
        assistant.close().await;
        session.session_id
    };

    let assistant = open(&test_config(&tmp, 128, 6), Arc::new(ExtractiveModel::new())).await;
    assert_eq!(assistant.reconcile_messages().await.unwrap(), 0);
    assistant
        .reindex(&[manual("pump-manual", PUMP)])
        .await
        .unwrap();

    let answer = assistant.answer(&session_id, question, 1).await.unwrap();
    assert!(answer.answer.contains("500 hours"));
    let recall = assistant
        .memory()
        .long_term(&session_id, "pump serviced", 3)
        .await
        .unwrap();
    assert!(!recall.is_empty());
    assert_eq!(assistant.history(&session_id, 10).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_concurrent_turns_on_one_session_are_serialized() {
    let tmp = TempDir::new().unwrap();
    let assistant = Arc::new(extractive(&tmp).await);
    assistant
        .ingest(&[manual("pump-manual", PUMP)])
        .await
        .unwrap();
    let session = assistant.create_session("tech-1").await.unwrap();

    let mut handles = Vec::new();
    for i in 0..4 {
        let assistant = assistant.clone();
        let id = session.session_id.clone();
        handles.push(tokio::spawn(async move {
            assistant
                .answer(&id, &format!("Pump service question {}?", i), 1)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut messages = assistant
        .history(&session.session_id, 100)
        .await
        .unwrap();
    messages.reverse();
    assert_eq!(messages.len(), 8);
    for (i, m) in messages.iter().enumerate() {
        assert_eq!(m.seq, i as i64);
        let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
        assert_eq!(m.role, expected);
    }
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, 2048, 6);
    let session_id = {
        let assistant = open(&config, Arc::new(ExtractiveModel::new())).await;
        assistant
            .ingest(&[manual("pump-manual", PUMP)])
            .await
            .unwrap();
        let session = assistant.create_session("tech-1").await.unwrap();
        assistant
            .answer(&session.session_id, "How often should the pump be serviced?", 1)
            .await
            .unwrap();
        assistant.close().await;
        session.session_id
    };

    let assistant = open(&config, Arc::new(ExtractiveModel::new())).await;
    assert_eq!(assistant.retrieve("pump serviced", 1).await.unwrap().len(), 1);
    assert_eq!(assistant.history(&session_id, 10).await.unwrap().len(), 2);
    let recall = assistant
        .memory()
        .long_term(&session_id, "pump serviced", 3)
        .await
        .unwrap();
    assert!(!recall.is_empty());
}
