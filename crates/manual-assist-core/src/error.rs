//! Error taxonomy.
//!
//! Each layer has its own enum; [`RagError`] is what the question-answering
//! entry points return. Display strings stay generic. Backend detail is
//! carried in `detail` fields for logging and never shown to end users.

use thiserror::Error;

use crate::chunk::ChunkParamsError;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Transient: network failure, rate limit, or server error.
    #[error("embedding backend unavailable")]
    Unavailable { detail: String },
    #[error("embedding request rejected by backend")]
    Rejected { detail: String },
    #[error("embedding backend returned {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding backend returned {actual} vectors for {expected} inputs")]
    CountMismatch { expected: usize, actual: usize },
    #[error("embedding provider is disabled")]
    Disabled,
}

impl EmbeddingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbeddingError::Unavailable { .. })
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector index storage failure")]
    Storage { detail: String },
    #[error("vector has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("index built with model '{indexed}' cannot be queried with model '{query}'")]
    ModelMismatch { indexed: String, query: String },
    #[error("corrupt index entry '{owner_id}'")]
    CorruptEntry { owner_id: String, detail: String },
    #[error("no active document index generation")]
    NoActiveGeneration,
}

impl IndexError {
    pub fn storage(detail: impl Into<String>) -> Self {
        IndexError::Storage {
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    /// Transient: network failure, rate limit, or server error.
    #[error("language model unavailable")]
    Unavailable { detail: String },
    #[error("language model did not respond within {secs}s")]
    Timeout { secs: u64 },
    #[error("language model rejected the request")]
    Rejected { detail: String },
    #[error("language model returned an empty completion")]
    EmptyCompletion,
    #[error("language model is disabled")]
    Disabled,
}

impl GenerationError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GenerationError::Unavailable { .. } | GenerationError::Timeout { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("session '{session_id}' not found")]
    SessionNotFound { session_id: String },
    #[error("session '{session_id}' is archived")]
    SessionArchived { session_id: String },
    #[error("conversation storage failure")]
    Storage { detail: String },
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

impl MemoryError {
    pub fn storage(detail: impl Into<String>) -> Self {
        MemoryError::Storage {
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("source '{source_id}' has no usable text")]
    EmptyDocument { source_id: String },
    #[error("source '{source_id}' has invalid page number {page_number}")]
    InvalidPage { source_id: String, page_number: u32 },
    #[error("source id must not be empty")]
    MissingSourceId,
    #[error(transparent)]
    Chunking(#[from] ChunkParamsError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Top-level error for retrieval and answering.
#[derive(Debug, Error)]
pub enum RagError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Ingestion(#[from] IngestionError),
}

impl RagError {
    /// Whether the same request may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            RagError::Embedding(e) => e.is_transient(),
            RagError::Generation(e) => e.is_transient(),
            RagError::Index(IndexError::Storage { .. }) => true,
            RagError::Memory(MemoryError::Storage { .. }) => true,
            RagError::Memory(MemoryError::Embedding(e)) => e.is_transient(),
            RagError::Ingestion(IngestionError::Embedding(e)) => e.is_transient(),
            _ => false,
        }
    }

    /// Backend detail for logs, if any.
    pub fn detail(&self) -> Option<&str> {
        match self {
            RagError::Embedding(e) | RagError::Memory(MemoryError::Embedding(e)) => {
                embedding_detail(e)
            }
            RagError::Generation(GenerationError::Unavailable { detail })
            | RagError::Generation(GenerationError::Rejected { detail })
            | RagError::Index(IndexError::Storage { detail })
            | RagError::Index(IndexError::CorruptEntry { detail, .. })
            | RagError::Memory(MemoryError::Storage { detail }) => Some(detail),
            _ => None,
        }
    }
}

fn embedding_detail(e: &EmbeddingError) -> Option<&str> {
    match e {
        EmbeddingError::Unavailable { detail } | EmbeddingError::Rejected { detail } => {
            Some(detail)
        }
        _ => None,
    }
}
