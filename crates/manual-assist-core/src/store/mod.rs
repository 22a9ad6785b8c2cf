//! Storage abstractions.
//!
//! [`VectorIndex`] stores embedded vectors with a JSON payload and answers
//! nearest-neighbour queries. One index instance holds vectors of a single
//! owner kind produced by a single [`ModelIdentity`].
//!
//! [`ConversationStore`] is the relational side of conversational memory:
//! sessions, messages, and summaries.
//!
//! Implementations must be `Send + Sync` to work with async runtimes. The
//! in-memory implementations in [`memory`] back unit tests; SQLite-backed
//! ones live in the app crate.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{IndexError, MemoryError};
use crate::models::{ConversationSession, Message, ModelIdentity, OwnerKind, Summary};

/// A vector to be written to an index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub owner_id: String,
    pub owner_kind: OwnerKind,
    pub vector: Vec<f32>,
    pub payload: Value,
}

impl IndexEntry {
    pub fn new(
        owner_id: impl Into<String>,
        owner_kind: OwnerKind,
        vector: Vec<f32>,
        payload: Value,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            owner_kind,
            vector,
            payload,
        }
    }
}

/// A search result: owner, cosine similarity, and the stored payload.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub owner_id: String,
    pub score: f32,
    pub payload: Value,
}

/// Equality filter on a top-level string field of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFilter {
    pub key: String,
    pub value: String,
}

impl IndexFilter {
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, payload: &Value) -> bool {
        payload.get(&self.key).and_then(Value::as_str) == Some(self.value.as_str())
    }
}

/// Vector storage with cosine nearest-neighbour search.
///
/// # Contract
///
/// - `upsert` of an existing `owner_id` replaces its vector and payload
///   in place; the entry keeps its original insertion position.
/// - `search` returns at most `min(k, len)` hits ordered by descending
///   score. Equal scores keep insertion order.
/// - Vectors whose length differs from `identity().dims` are rejected.
/// - Once a write returns `Ok`, the entry is visible to later searches.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn identity(&self) -> &ModelIdentity;

    async fn upsert(&self, entry: IndexEntry) -> Result<(), IndexError> {
        self.upsert_batch(vec![entry]).await
    }

    /// Upsert several entries atomically.
    async fn upsert_batch(&self, entries: Vec<IndexEntry>) -> Result<(), IndexError>;

    /// Atomically delete every entry matching `filter` and insert `entries`.
    async fn replace_matching(
        &self,
        filter: &IndexFilter,
        entries: Vec<IndexEntry>,
    ) -> Result<(), IndexError>;

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&IndexFilter>,
    ) -> Result<Vec<IndexHit>, IndexError>;

    /// Returns whether an entry was removed.
    async fn delete(&self, owner_id: &str) -> Result<bool, IndexError>;

    async fn delete_matching(&self, filter: &IndexFilter) -> Result<usize, IndexError>;

    async fn len(&self) -> Result<usize, IndexError>;

    /// Remove every entry.
    async fn purge(&self) -> Result<(), IndexError>;
}

/// Reject vectors that do not match the index dimensionality.
pub fn check_dims(identity: &ModelIdentity, vector: &[f32]) -> Result<(), IndexError> {
    if vector.len() != identity.dims {
        return Err(IndexError::DimensionMismatch {
            expected: identity.dims,
            actual: vector.len(),
        });
    }
    Ok(())
}

/// Sort hits by descending score, keeping input order for ties, and keep `k`.
pub fn rank_hits(mut hits: Vec<IndexHit>, k: usize) -> Vec<IndexHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(k);
    hits
}

/// Relational persistence for sessions, messages, and summaries.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn insert_session(&self, session: &ConversationSession) -> Result<(), MemoryError>;

    async fn get_session(&self, session_id: &str)
        -> Result<Option<ConversationSession>, MemoryError>;

    /// Sessions of one owner, newest activity first.
    async fn list_sessions(&self, owner_id: &str) -> Result<Vec<ConversationSession>, MemoryError>;

    async fn update_session(&self, session: &ConversationSession) -> Result<(), MemoryError>;

    /// Hard-delete a session row and anything still attached to it.
    async fn delete_session(&self, session_id: &str) -> Result<(), MemoryError>;

    /// Archived sessions whose `archived_at` is before `cutoff`.
    async fn archived_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ConversationSession>, MemoryError>;

    /// Insert messages atomically.
    async fn insert_messages(&self, messages: &[Message]) -> Result<(), MemoryError>;

    async fn delete_message(&self, message_id: &str) -> Result<(), MemoryError>;

    /// All messages of a session in `seq` order.
    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, MemoryError>;

    async fn get_messages(&self, message_ids: &[String]) -> Result<Vec<Message>, MemoryError>;

    async fn last_seq(&self, session_id: &str) -> Result<Option<i64>, MemoryError>;

    async fn delete_messages(&self, session_id: &str) -> Result<usize, MemoryError>;

    async fn insert_summary(&self, summary: &Summary) -> Result<(), MemoryError>;

    /// Summaries of a session in coverage order.
    async fn list_summaries(&self, session_id: &str) -> Result<Vec<Summary>, MemoryError>;

    async fn delete_summaries(&self, session_id: &str) -> Result<usize, MemoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_string_field() {
        let f = IndexFilter::eq("session_id", "s1");
        assert!(f.matches(&json!({"session_id": "s1", "role": "user"})));
        assert!(!f.matches(&json!({"session_id": "s2"})));
        assert!(!f.matches(&json!({"session_id": 1})));
        assert!(!f.matches(&json!({})));
    }

    #[test]
    fn test_rank_hits_stable_on_ties() {
        let hit = |id: &str, score: f32| IndexHit {
            owner_id: id.into(),
            score,
            payload: Value::Null,
        };
        let ranked = rank_hits(
            vec![hit("a", 0.5), hit("b", 0.9), hit("c", 0.5), hit("d", 0.1)],
            3,
        );
        let ids: Vec<&str> = ranked.iter().map(|h| h.owner_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }
}
