//! # Manual Assist Core
//!
//! Runtime-agnostic logic for Manual Assist: data models, page cleanup and
//! chunking, the embedding wrapper, vector index and conversation store
//! traits with in-memory implementations, retrieval, and prompt/context
//! assembly.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Backends
//! that need those live in the `manual-assist` app crate and plug in
//! through the traits defined here.

pub mod chunk;
pub mod context;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod models;
pub mod retrieve;
pub mod store;
pub mod text;
