//! # Manual Assist
//!
//! Question answering over scanned equipment manuals, with conversational
//! memory per session.
//!
//! Manual pages are cleaned, chunked, embedded, and stored in SQLite.
//! Questions are answered by a language model from the best-matching
//! passages plus the session's recent turns and recalled history.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌────────────────┐
//! │ Pages       │──▶│ Chunk+Embed  │──▶│ SQLite vectors │
//! │ txt/md/pdf  │   │ (generation) │   │ docs | messages│
//! └─────────────┘   └──────────────┘   └───────┬────────┘
//!                                              │
//!                    ┌─────────────────────────┤
//!                    ▼                         ▼
//!              ┌───────────┐            ┌────────────┐
//!              │ Retriever │──────────▶ │ Assistant  │◀── session memory
//!              └───────────┘            └─────┬──────┘
//!                                             ▼
//!                                       language model
//! ```
//!
//! Pure logic (chunking, vector math, retrieval, context assembly, prompts)
//! lives in the `manual-assist-core` crate; this crate adds persistence,
//! providers, and the CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! massist init
//! massist ingest ./manuals
//! massist session new --owner tech-1
//! massist ask <session-id> "How often should the pump be serviced?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | SQLite vector index and conversation store |
//! | [`generations`] | Document index generations with pinned readers |
//! | [`http`] | JSON POST with retry and backoff |
//! | [`embedding`] | Embedding providers |
//! | [`llm`] | Language-model providers |
//! | [`extract`] | Page extraction from files |
//! | [`ingest`] | Ingestion pipeline |
//! | [`memory`] | Conversation memory |
//! | [`assistant`] | Question answering and reindexing |
//! | [`stats`] | Index statistics |
//! | [`logging`] | Tracing setup |
//! | [`telemetry`] | Metric names and recording |

pub mod assistant;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod generations;
pub mod http;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod memory;
pub mod migrate;
pub mod sqlite_store;
pub mod stats;
pub mod telemetry;
