//! Core data models shared by ingestion, retrieval, and memory.
//!
//! Everything that crosses a storage boundary is `Serialize`/`Deserialize`
//! so it can travel as a vector-index payload or a relational row.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One page of extracted manual text, as handed over by the extraction layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    /// 1-based page number in the source document.
    pub page_number: u32,
    pub text: String,
}

impl PageText {
    pub fn new(page_number: u32, text: impl Into<String>) -> Self {
        Self {
            page_number,
            text: text.into(),
        }
    }
}

/// A contiguous slice of one source document's text.
///
/// Chunk IDs are deterministic (`"{source_id}#{chunk_index}"`), so
/// re-ingesting a source overwrites rather than duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub source_id: String,
    /// Page containing the first character of the chunk.
    pub page_number: u32,
    pub chunk_index: u32,
    pub text: String,
    /// Length of `text` in characters.
    pub char_length: usize,
    /// Number of leading characters copied from the previous chunk.
    pub overlap_chars: usize,
    /// SHA-256 hex digest of `text`.
    pub hash: String,
}

impl Chunk {
    /// The chunk text without the leading overlap copied from its predecessor.
    pub fn fresh_text(&self) -> String {
        self.text.chars().skip(self.overlap_chars).collect()
    }
}

/// Name and dimensionality of the embedding model behind a set of vectors.
///
/// Vectors produced by different identities are never compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelIdentity {
    pub name: String,
    pub dims: usize,
}

impl ModelIdentity {
    pub fn new(name: impl Into<String>, dims: usize) -> Self {
        Self {
            name: name.into(),
            dims,
        }
    }
}

impl fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} dims)", self.name, self.dims)
    }
}

/// What an indexed vector belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    DocumentChunk,
    ConversationMessage,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::DocumentChunk => "document_chunk",
            OwnerKind::ConversationMessage => "conversation_message",
        }
    }
}

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Label used when rendering transcripts into prompts.
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Lifecycle state of a conversation session.
///
/// `Empty -> Active` on the first append; `Empty | Active -> Archived` on
/// delete. Archived is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Empty,
    Active,
    Archived,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Empty => "empty",
            SessionState::Active => "active",
            SessionState::Archived => "archived",
        }
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "empty" => Ok(SessionState::Empty),
            "active" => Ok(SessionState::Active),
            "archived" => Ok(SessionState::Archived),
            other => Err(format!("unknown session state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub session_id: String,
    pub owner_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl ConversationSession {
    pub fn is_archived(&self) -> bool {
        self.state == SessionState::Archived
    }
}

/// One persisted conversation message. `seq` is the per-session append order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub session_id: String,
    pub seq: i64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Condensed text standing in for a contiguous run of older messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub summary_id: String,
    pub session_id: String,
    pub first_message_id: String,
    pub last_message_id: String,
    pub first_seq: i64,
    pub last_seq: i64,
    pub summary_text: String,
    pub created_at: DateTime<Utc>,
}

impl Summary {
    pub fn covers(&self, seq: i64) -> bool {
        self.first_seq <= seq && seq <= self.last_seq
    }
}

/// A retrieved chunk with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Cosine similarity (max over query variants).
    pub score: f32,
    /// Score assigned by the reranker, when one ran.
    pub rerank_score: Option<f32>,
}

/// A `(source, page)` reference attached to an answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Citation {
    pub source_id: String,
    pub page_number: u32,
}

impl fmt::Display for Citation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (page {})", self.source_id, self.page_number)
    }
}

/// The result of one question-answering turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<Citation>,
    /// Number of chunks that passed the similarity threshold.
    pub retrieved_count: usize,
}
