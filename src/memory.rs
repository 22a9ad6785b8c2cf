//! Conversation memory: sessions, the short-term buffer, summarization of
//! older turns, and similarity recall over past messages.
//!
//! Appends to one session are serialized through a per-session lock
//! ([`SessionTurn`]). Different sessions never contend.
//!
//! An append embeds first, then performs its writes (message rows, message
//! vectors, session state) and compaction in a task that shares the turn's
//! lock. A caller that gives up mid-append cannot leave rows without vectors
//! behind, and the next turn on the session waits until those writes land.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

use manual_assist_core::context::{
    assemble_context, render_summary_prompt, AssembledContext, MemoryParams, Recall,
};
use manual_assist_core::embedding::Embedder;
use manual_assist_core::error::MemoryError;
use manual_assist_core::llm::LanguageModel;
use manual_assist_core::models::{
    ConversationSession, Message, OwnerKind, Role, ScoredChunk, SessionState, Summary,
};
use manual_assist_core::store::{ConversationStore, IndexEntry, IndexFilter, VectorIndex};

/// Payload key used to restrict message-vector searches to one session.
const SESSION_KEY: &str = "session_id";

/// Token budget for one summarization call.
const SUMMARY_MAX_TOKENS: usize = 256;

pub type Metadata = serde_json::Map<String, serde_json::Value>;

type LockMap = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// One session's ordering mutex, held. The map entry goes away with the
/// last holder unless another turn is already waiting on it.
struct TurnLock {
    session_id: String,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TurnLock {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let mutex = OwnedMutexGuard::mutex(&guard);
        // the map entry and this guard are the only references
        let idle = Arc::strong_count(mutex) == 2;
        if idle
            && locks
                .get(&self.session_id)
                .is_some_and(|m| Arc::ptr_eq(m, mutex))
        {
            locks.remove(&self.session_id);
        }
        drop(guard);
    }
}

/// Exclusive hold on one live session.
pub struct SessionTurn {
    session: ConversationSession,
    lock: Arc<TurnLock>,
}

impl SessionTurn {
    pub fn session(&self) -> &ConversationSession {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }
}

pub struct MemoryManager {
    store: Arc<dyn ConversationStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<Embedder>,
    summarizer: Arc<dyn LanguageModel>,
    params: MemoryParams,
    locks: LockMap,
}

impl MemoryManager {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<Embedder>,
        summarizer: Arc<dyn LanguageModel>,
        params: MemoryParams,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            summarizer,
            params,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn params(&self) -> &MemoryParams {
        &self.params
    }

    pub fn store(&self) -> &dyn ConversationStore {
        self.store.as_ref()
    }

    pub fn index(&self) -> &dyn VectorIndex {
        self.index.as_ref()
    }

    /// Sessions with a turn in progress or waiting.
    pub fn locked_sessions(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub async fn create_session(&self, owner_id: &str) -> Result<ConversationSession, MemoryError> {
        let now = Utc::now();
        let session = ConversationSession {
            session_id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            state: SessionState::Empty,
            created_at: now,
            last_active_at: now,
            archived_at: None,
        };
        self.store.insert_session(&session).await?;
        debug!(session_id = %session.session_id, owner_id, "session created");
        Ok(session)
    }

    /// Fetch a session in any state.
    pub async fn session(&self, session_id: &str) -> Result<ConversationSession, MemoryError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| MemoryError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    async fn live_session(&self, session_id: &str) -> Result<ConversationSession, MemoryError> {
        let session = self.session(session_id).await?;
        if session.is_archived() {
            return Err(MemoryError::SessionArchived {
                session_id: session_id.to_string(),
            });
        }
        Ok(session)
    }

    pub async fn list_sessions(
        &self,
        owner_id: &str,
    ) -> Result<Vec<ConversationSession>, MemoryError> {
        self.store.list_sessions(owner_id).await
    }

    /// Acquire the session's ordering lock. Fails if the session is missing
    /// or archived (checked after the lock is held).
    pub async fn lock(&self, session_id: &str) -> Result<SessionTurn, MemoryError> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(session_id.to_string()).or_default().clone()
        };
        let lock = Arc::new(TurnLock {
            session_id: session_id.to_string(),
            locks: self.locks.clone(),
            guard: Some(mutex.lock_owned().await),
        });
        let session = self.live_session(session_id).await?;
        Ok(SessionTurn { session, lock })
    }

    pub async fn append(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, MemoryError> {
        let mut turn = self.lock(session_id).await?;
        self.append_in_turn(&mut turn, role, content, Metadata::new())
            .await
    }

    pub async fn append_in_turn(
        &self,
        turn: &mut SessionTurn,
        role: Role,
        content: &str,
        metadata: Metadata,
    ) -> Result<Message, MemoryError> {
        let mut appended = self
            .append_many_in_turn(turn, vec![(role, content.to_string(), metadata)])
            .await?;
        appended
            .pop()
            .ok_or_else(|| MemoryError::storage("append produced no message"))
    }

    /// Append several messages as one unit: either all are persisted and
    /// indexed, or none are.
    pub async fn append_many_in_turn(
        &self,
        turn: &mut SessionTurn,
        items: Vec<(Role, String, Metadata)>,
    ) -> Result<Vec<Message>, MemoryError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let session_id = turn.session_id().to_string();
        let next_seq = self
            .store
            .last_seq(&session_id)
            .await?
            .map_or(0, |s| s + 1);

        let now = Utc::now();
        let messages: Vec<Message> = items
            .into_iter()
            .enumerate()
            .map(|(i, (role, content, metadata))| Message {
                message_id: Uuid::new_v4().to_string(),
                session_id: session_id.clone(),
                seq: next_seq + i as i64,
                role,
                content,
                created_at: now,
                metadata,
            })
            .collect();

        let entries = self.index_entries(&messages).await?;

        let mut session = turn.session.clone();
        session.state = SessionState::Active;
        session.last_active_at = now;

        let store = self.store.clone();
        let index = self.index.clone();
        let summarizer = self.summarizer.clone();
        let window = self.params.short_term_window;
        let held = turn.lock.clone();
        let rows = messages.clone();
        let write = tokio::spawn(async move {
            let _held = held;
            persist(store.as_ref(), index.as_ref(), &rows, entries, &session).await?;
            compact(store.as_ref(), summarizer.as_ref(), window, &session.session_id).await;
            Ok::<_, MemoryError>(session)
        });
        turn.session = write
            .await
            .map_err(|e| MemoryError::storage(e.to_string()))??;
        Ok(messages)
    }

    /// Embed messages into index entries tagged with their session.
    async fn index_entries(&self, messages: &[Message]) -> Result<Vec<IndexEntry>, MemoryError> {
        let texts: Vec<String> = messages.iter().map(|m| m.content.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        Ok(messages
            .iter()
            .zip(vectors)
            .map(|(m, vector)| {
                IndexEntry::new(
                    m.message_id.clone(),
                    OwnerKind::ConversationMessage,
                    vector,
                    serde_json::json!({
                        "session_id": m.session_id,
                        "message_id": m.message_id,
                        "seq": m.seq,
                        "role": m.role.as_str(),
                    }),
                )
            })
            .collect())
    }

    /// Replace a session's message vectors with ones from the current
    /// embedding model. Sessions that are gone or archived just lose theirs.
    /// Returns the number of messages re-embedded.
    pub async fn reembed_session(&self, session_id: &str) -> Result<usize, MemoryError> {
        let filter = IndexFilter::eq(SESSION_KEY, session_id);
        let turn = match self.lock(session_id).await {
            Ok(turn) => turn,
            Err(MemoryError::SessionArchived { .. } | MemoryError::SessionNotFound { .. }) => {
                self.index.delete_matching(&filter).await?;
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        let messages = self.store.list_messages(session_id).await?;
        let entries = self.index_entries(&messages).await?;
        self.index.replace_matching(&filter, entries).await?;
        drop(turn);
        debug!(session_id, messages = messages.len(), "session vectors re-embedded");
        Ok(messages.len())
    }

    /// The most recent unsummarized messages, oldest first, at most
    /// `short_term_window` of them.
    pub async fn short_term(&self, session_id: &str) -> Result<Vec<Message>, MemoryError> {
        self.live_session(session_id).await?;
        let (mut messages, _) = unsummarized(self.store.as_ref(), session_id).await?;
        let skip = messages.len().saturating_sub(self.params.short_term_window);
        Ok(messages.split_off(skip))
    }

    /// Past messages similar to `query`, plus summaries of older turns.
    ///
    /// A hit inside a summarized range is represented by that summary, once.
    /// Summaries no hit referred to follow, oldest first.
    pub async fn long_term(
        &self,
        session_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<Recall>, MemoryError> {
        self.live_session(session_id).await?;
        let summaries = self.store.list_summaries(session_id).await?;

        let mut hits = Vec::new();
        if top_k > 0 && !query.trim().is_empty() {
            let vector = self.embedder.embed_one(query).await?;
            let filter = IndexFilter::eq(SESSION_KEY, session_id);
            hits = self.index.search(&vector, top_k, Some(&filter)).await?;
        }

        let ids: Vec<String> = hits.iter().map(|h| h.owner_id.clone()).collect();
        let mut by_id: HashMap<String, Message> = self
            .store
            .get_messages(&ids)
            .await?
            .into_iter()
            .map(|m| (m.message_id.clone(), m))
            .collect();

        let mut used: HashSet<String> = HashSet::new();
        let mut recall = Vec::new();
        for hit in hits {
            // vectors can briefly outlive a message removed by a failed append
            let Some(message) = by_id.remove(&hit.owner_id) else {
                continue;
            };
            match summaries.iter().find(|s| s.covers(message.seq)) {
                Some(summary) => {
                    if used.insert(summary.summary_id.clone()) {
                        recall.push(Recall::Summary(summary.clone()));
                    }
                }
                None => recall.push(Recall::Message {
                    message,
                    score: hit.score,
                }),
            }
        }
        for summary in summaries {
            if !used.contains(&summary.summary_id) {
                recall.push(Recall::Summary(summary));
            }
        }
        Ok(recall)
    }

    /// Passages, recent turns, and recalled history under the context budget.
    pub async fn build_context(
        &self,
        session_id: &str,
        query: &str,
        rag_chunks: &[ScoredChunk],
    ) -> Result<AssembledContext, MemoryError> {
        let recent = self.short_term(session_id).await?;
        let recent_ids: HashSet<&str> = recent.iter().map(|m| m.message_id.as_str()).collect();
        let recall: Vec<Recall> = self
            .long_term(session_id, query, self.params.long_term_k)
            .await?
            .into_iter()
            .filter(|r| match r {
                Recall::Message { message, .. } => {
                    !recent_ids.contains(message.message_id.as_str())
                }
                Recall::Summary(_) => true,
            })
            .collect();

        Ok(assemble_context(
            self.params.max_context_chars,
            rag_chunks,
            &recent,
            &recall,
        ))
    }

    /// Messages newest first.
    pub async fn history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, MemoryError> {
        self.session(session_id).await?;
        let mut messages = self.store.list_messages(session_id).await?;
        messages.reverse();
        messages.truncate(limit);
        Ok(messages)
    }

    /// Purge the session's messages, summaries, and message vectors, and
    /// mark it archived.
    pub async fn delete_session(
        &self,
        session_id: &str,
    ) -> Result<ConversationSession, MemoryError> {
        let turn = self.lock(session_id).await?;
        let filter = IndexFilter::eq(SESSION_KEY, session_id);
        let vectors = self.index.delete_matching(&filter).await?;
        self.store.delete_summaries(session_id).await?;
        let messages = self.store.delete_messages(session_id).await?;

        let mut session = turn.session.clone();
        let now = Utc::now();
        session.state = SessionState::Archived;
        session.archived_at = Some(now);
        session.last_active_at = now;
        self.store.update_session(&session).await?;
        drop(turn);
        info!(session_id, messages, vectors, "session archived");
        Ok(session)
    }

    /// Remove archived sessions whose retention period has passed.
    pub async fn purge_archived(&self, retention: chrono::Duration) -> Result<usize, MemoryError> {
        let cutoff = Utc::now() - retention;
        let expired = self.store.archived_before(cutoff).await?;
        for session in &expired {
            let filter = IndexFilter::eq(SESSION_KEY, session.session_id.as_str());
            self.index.delete_matching(&filter).await?;
            self.store.delete_session(&session.session_id).await?;
            self.locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&session.session_id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "purged archived sessions");
        }
        Ok(expired.len())
    }
}

/// Messages after the last summarized one, oldest first.
async fn unsummarized(
    store: &dyn ConversationStore,
    session_id: &str,
) -> Result<(Vec<Message>, Vec<Summary>), MemoryError> {
    let summaries = store.list_summaries(session_id).await?;
    let covered_until = summaries.iter().map(|s| s.last_seq).max();
    let messages = store
        .list_messages(session_id)
        .await?
        .into_iter()
        .filter(|m| covered_until.map_or(true, |c| m.seq > c))
        .collect();
    Ok((messages, summaries))
}

/// Summarize unsummarized messages beyond the short-term window.
/// Failures are logged; the next append tries again.
async fn compact(
    store: &dyn ConversationStore,
    summarizer: &dyn LanguageModel,
    window: usize,
    session_id: &str,
) {
    let pending = match unsummarized(store, session_id).await {
        Ok((messages, _)) => messages,
        Err(e) => {
            warn!(session_id, error = %e, "could not load messages for compaction");
            return;
        }
    };
    if pending.len() <= window {
        return;
    }
    let excess = &pending[..pending.len() - window];
    let (Some(first), Some(last)) = (excess.first(), excess.last()) else {
        return;
    };

    let prompt = render_summary_prompt(excess);
    let text = match summarizer.complete(&prompt, SUMMARY_MAX_TOKENS).await {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => {
            warn!(session_id, "summarizer returned empty text, compaction deferred");
            return;
        }
        Err(e) => {
            warn!(session_id, error = %e, "summarization failed, compaction deferred");
            return;
        }
    };

    let summary = Summary {
        summary_id: Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        first_message_id: first.message_id.clone(),
        last_message_id: last.message_id.clone(),
        first_seq: first.seq,
        last_seq: last.seq,
        summary_text: text,
        created_at: Utc::now(),
    };
    match store.insert_summary(&summary).await {
        Ok(()) => debug!(
            session_id,
            first_seq = summary.first_seq,
            last_seq = summary.last_seq,
            "session compacted"
        ),
        Err(e) => warn!(session_id, error = %e, "could not store summary"),
    }
}

/// Write phase of an append. Rows are removed again if indexing fails.
async fn persist(
    store: &dyn ConversationStore,
    index: &dyn VectorIndex,
    messages: &[Message],
    entries: Vec<IndexEntry>,
    session: &ConversationSession,
) -> Result<(), MemoryError> {
    store.insert_messages(messages).await?;
    if let Err(e) = index.upsert_batch(entries).await {
        for m in messages {
            if let Err(cleanup) = store.delete_message(&m.message_id).await {
                warn!(message_id = %m.message_id, error = %cleanup, "could not roll back message");
            }
        }
        return Err(e.into());
    }
    store.update_session(session).await
}
