//! In-memory [`VectorIndex`] and [`ConversationStore`] implementations.
//!
//! Backed by `Vec`/`HashMap` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity over all entries. Used in unit tests and
//! anywhere a throwaway index is enough.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::embedding::cosine_similarity;
use crate::error::{IndexError, MemoryError};
use crate::models::{ConversationSession, Message, ModelIdentity, Summary};

use super::{
    check_dims, rank_hits, ConversationStore, IndexEntry, IndexFilter, IndexHit, VectorIndex,
};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory vector index. Entries are kept in insertion order.
pub struct InMemoryIndex {
    identity: ModelIdentity,
    entries: RwLock<Vec<IndexEntry>>,
}

impl InMemoryIndex {
    pub fn new(identity: ModelIdentity) -> Self {
        Self {
            identity,
            entries: RwLock::new(Vec::new()),
        }
    }

    fn upsert_into(entries: &mut Vec<IndexEntry>, entry: IndexEntry) {
        match entries.iter_mut().find(|e| e.owner_id == entry.owner_id) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    async fn upsert_batch(&self, entries: Vec<IndexEntry>) -> Result<(), IndexError> {
        for e in &entries {
            check_dims(&self.identity, &e.vector)?;
        }
        let mut stored = write(&self.entries);
        for e in entries {
            Self::upsert_into(&mut stored, e);
        }
        Ok(())
    }

    async fn replace_matching(
        &self,
        filter: &IndexFilter,
        entries: Vec<IndexEntry>,
    ) -> Result<(), IndexError> {
        for e in &entries {
            check_dims(&self.identity, &e.vector)?;
        }
        let mut stored = write(&self.entries);
        stored.retain(|e| !filter.matches(&e.payload));
        for e in entries {
            Self::upsert_into(&mut stored, e);
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&IndexFilter>,
    ) -> Result<Vec<IndexHit>, IndexError> {
        check_dims(&self.identity, query)?;
        let stored = read(&self.entries);
        let hits = stored
            .iter()
            .filter(|e| filter.map_or(true, |f| f.matches(&e.payload)))
            .map(|e| IndexHit {
                owner_id: e.owner_id.clone(),
                score: cosine_similarity(query, &e.vector),
                payload: e.payload.clone(),
            })
            .collect();
        Ok(rank_hits(hits, k))
    }

    async fn delete(&self, owner_id: &str) -> Result<bool, IndexError> {
        let mut stored = write(&self.entries);
        let before = stored.len();
        stored.retain(|e| e.owner_id != owner_id);
        Ok(stored.len() < before)
    }

    async fn delete_matching(&self, filter: &IndexFilter) -> Result<usize, IndexError> {
        let mut stored = write(&self.entries);
        let before = stored.len();
        stored.retain(|e| !filter.matches(&e.payload));
        Ok(before - stored.len())
    }

    async fn len(&self) -> Result<usize, IndexError> {
        Ok(read(&self.entries).len())
    }

    async fn purge(&self) -> Result<(), IndexError> {
        write(&self.entries).clear();
        Ok(())
    }
}

/// In-memory conversation store.
#[derive(Default)]
pub struct InMemoryConversationStore {
    sessions: RwLock<HashMap<String, ConversationSession>>,
    messages: RwLock<Vec<Message>>,
    summaries: RwLock<Vec<Summary>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn insert_session(&self, session: &ConversationSession) -> Result<(), MemoryError> {
        write(&self.sessions).insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(
        &self,
        session_id: &str,
    ) -> Result<Option<ConversationSession>, MemoryError> {
        Ok(read(&self.sessions).get(session_id).cloned())
    }

    async fn list_sessions(&self, owner_id: &str) -> Result<Vec<ConversationSession>, MemoryError> {
        let mut sessions: Vec<_> = read(&self.sessions)
            .values()
            .filter(|s| s.owner_id == owner_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| {
            b.last_active_at
                .cmp(&a.last_active_at)
                .then(a.session_id.cmp(&b.session_id))
        });
        Ok(sessions)
    }

    async fn update_session(&self, session: &ConversationSession) -> Result<(), MemoryError> {
        let mut sessions = write(&self.sessions);
        match sessions.get_mut(&session.session_id) {
            Some(existing) => {
                *existing = session.clone();
                Ok(())
            }
            None => Err(MemoryError::SessionNotFound {
                session_id: session.session_id.clone(),
            }),
        }
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), MemoryError> {
        write(&self.messages).retain(|m| m.session_id != session_id);
        write(&self.summaries).retain(|s| s.session_id != session_id);
        write(&self.sessions).remove(session_id);
        Ok(())
    }

    async fn archived_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ConversationSession>, MemoryError> {
        Ok(read(&self.sessions)
            .values()
            .filter(|s| s.is_archived() && s.archived_at.is_some_and(|t| t < cutoff))
            .cloned()
            .collect())
    }

    async fn insert_messages(&self, messages: &[Message]) -> Result<(), MemoryError> {
        let mut stored = write(&self.messages);
        for m in messages {
            let duplicate = stored
                .iter()
                .any(|s| s.session_id == m.session_id && s.seq == m.seq);
            if duplicate {
                return Err(MemoryError::storage(format!(
                    "duplicate seq {} in session {}",
                    m.seq, m.session_id
                )));
            }
        }
        stored.extend(messages.iter().cloned());
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), MemoryError> {
        write(&self.messages).retain(|m| m.message_id != message_id);
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, MemoryError> {
        let mut out: Vec<_> = read(&self.messages)
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.seq);
        Ok(out)
    }

    async fn get_messages(&self, message_ids: &[String]) -> Result<Vec<Message>, MemoryError> {
        Ok(read(&self.messages)
            .iter()
            .filter(|m| message_ids.contains(&m.message_id))
            .cloned()
            .collect())
    }

    async fn last_seq(&self, session_id: &str) -> Result<Option<i64>, MemoryError> {
        Ok(read(&self.messages)
            .iter()
            .filter(|m| m.session_id == session_id)
            .map(|m| m.seq)
            .max())
    }

    async fn delete_messages(&self, session_id: &str) -> Result<usize, MemoryError> {
        let mut stored = write(&self.messages);
        let before = stored.len();
        stored.retain(|m| m.session_id != session_id);
        Ok(before - stored.len())
    }

    async fn insert_summary(&self, summary: &Summary) -> Result<(), MemoryError> {
        write(&self.summaries).push(summary.clone());
        Ok(())
    }

    async fn list_summaries(&self, session_id: &str) -> Result<Vec<Summary>, MemoryError> {
        let mut out: Vec<_> = read(&self.summaries)
            .iter()
            .filter(|s| s.session_id == session_id)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.first_seq);
        Ok(out)
    }

    async fn delete_summaries(&self, session_id: &str) -> Result<usize, MemoryError> {
        let mut stored = write(&self.summaries);
        let before = stored.len();
        stored.retain(|s| s.session_id != session_id);
        Ok(before - stored.len())
    }
}
