//! Metric names and recording helpers.
//!
//! Recording goes through the `metrics` facade; without an installed
//! recorder every call is a no-op. Names follow the Prometheus
//! conventions (`_total` counters, `_seconds` durations).

use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

use manual_assist_core::error::RagError;

pub const REQUESTS_TOTAL: &str = "massist_requests_total";
pub const ERRORS_TOTAL: &str = "massist_errors_total";
pub const REQUEST_DURATION_SECONDS: &str = "massist_request_duration_seconds";
pub const RETRIEVAL_DURATION_SECONDS: &str = "massist_retrieval_duration_seconds";
pub const RETRIEVED_CHUNKS: &str = "massist_retrieved_chunks";
pub const ANSWER_LENGTH_CHARS: &str = "massist_answer_length_chars";
pub const CHUNKS_INGESTED_TOTAL: &str = "massist_chunks_ingested_total";

/// Label keys.
pub mod labels {
    pub const OPERATION: &str = "operation";
    pub const STATUS: &str = "status";
    pub const KIND: &str = "kind";
}

pub const OP_ANSWER: &str = "answer";
pub const OP_RETRIEVE: &str = "retrieve";
pub const OP_INGEST: &str = "ingest";
pub const OP_REINDEX: &str = "reindex";

/// Register descriptions with the installed recorder.
pub fn describe() {
    describe_counter!(REQUESTS_TOTAL, "Requests handled, by operation and status.");
    describe_counter!(ERRORS_TOTAL, "Failed requests, by operation and error kind.");
    describe_histogram!(
        REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "End-to-end request latency."
    );
    describe_histogram!(
        RETRIEVAL_DURATION_SECONDS,
        Unit::Seconds,
        "Embedding plus vector search latency."
    );
    describe_histogram!(RETRIEVED_CHUNKS, "Passages returned per retrieval.");
    describe_histogram!(ANSWER_LENGTH_CHARS, "Characters per generated answer.");
    describe_counter!(CHUNKS_INGESTED_TOTAL, "Chunks written to the document index.");
}

/// Coarse error class used as the `kind` label.
pub fn error_kind(error: &RagError) -> &'static str {
    match error {
        RagError::InvalidRequest(_) => "invalid_request",
        RagError::Embedding(_) => "embedding",
        RagError::Index(_) => "index",
        RagError::Generation(_) => "generation",
        RagError::Memory(_) => "memory",
        RagError::Ingestion(_) => "ingestion",
    }
}

/// Count one request and its latency; failures also count as errors.
pub fn record_request<T>(operation: &'static str, started: Instant, result: &Result<T, RagError>) {
    let status = if result.is_ok() { "ok" } else { "error" };
    counter!(REQUESTS_TOTAL, labels::OPERATION => operation, labels::STATUS => status).increment(1);
    histogram!(REQUEST_DURATION_SECONDS, labels::OPERATION => operation)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = result {
        record_error(operation, e);
    }
}

pub fn record_error(operation: &'static str, error: &RagError) {
    counter!(ERRORS_TOTAL, labels::OPERATION => operation, labels::KIND => error_kind(error))
        .increment(1);
}
