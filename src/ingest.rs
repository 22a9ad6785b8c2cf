//! Ingestion pipeline: pages → cleanup → chunks → embeddings → index.
//!
//! Each source is processed independently. A failing source reports an
//! [`IngestionError`] and leaves the index untouched for that source.

use std::sync::Arc;

use tracing::{debug, info};

use manual_assist_core::chunk::{chunk_pages, clean_page_text, ChunkParams, ChunkStats};
use manual_assist_core::embedding::Embedder;
use manual_assist_core::error::{IndexError, IngestionError};
use manual_assist_core::models::{Chunk, OwnerKind, PageText};
use manual_assist_core::store::{IndexEntry, IndexFilter, VectorIndex};

/// Payload key holding a chunk's source.
pub const SOURCE_KEY: &str = "source_id";

/// The pages of one source document, as supplied by the extraction layer.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub source_id: String,
    pub pages: Vec<PageText>,
}

impl SourceDocument {
    pub fn new(source_id: impl Into<String>, pages: Vec<PageText>) -> Self {
        Self {
            source_id: source_id.into(),
            pages,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub source_id: String,
    pub pages_total: usize,
    pub pages_kept: usize,
    pub chunks: usize,
    pub stats: Option<ChunkStats>,
}

/// Chunks prepared for one source, before embedding.
#[derive(Debug, Clone)]
pub struct PreparedSource {
    pub chunks: Vec<Chunk>,
    pub pages_kept: usize,
}

pub struct Ingestor {
    embedder: Arc<Embedder>,
    params: ChunkParams,
    min_page_chars: usize,
}

impl Ingestor {
    pub fn new(
        embedder: Arc<Embedder>,
        params: ChunkParams,
        min_page_chars: usize,
    ) -> Result<Self, IngestionError> {
        params.validate()?;
        Ok(Self {
            embedder,
            params,
            min_page_chars,
        })
    }

    /// Clean and chunk a source's pages. Near-blank pages are skipped.
    pub fn prepare(&self, doc: &SourceDocument) -> Result<PreparedSource, IngestionError> {
        if doc.source_id.trim().is_empty() {
            return Err(IngestionError::MissingSourceId);
        }

        let mut kept = Vec::with_capacity(doc.pages.len());
        for page in &doc.pages {
            if page.page_number == 0 {
                return Err(IngestionError::InvalidPage {
                    source_id: doc.source_id.clone(),
                    page_number: page.page_number,
                });
            }
            let text = clean_page_text(&page.text);
            let len = text.chars().count();
            if len < self.min_page_chars {
                debug!(
                    source_id = %doc.source_id,
                    page = page.page_number,
                    chars = len,
                    "skipping near-blank page"
                );
                continue;
            }
            kept.push(PageText::new(page.page_number, text));
        }
        if kept.is_empty() {
            return Err(IngestionError::EmptyDocument {
                source_id: doc.source_id.clone(),
            });
        }

        let chunks = chunk_pages(&doc.source_id, &kept, &self.params)?;
        if chunks.is_empty() {
            return Err(IngestionError::EmptyDocument {
                source_id: doc.source_id.clone(),
            });
        }
        Ok(PreparedSource {
            chunks,
            pages_kept: kept.len(),
        })
    }

    /// Ingest one source, replacing whatever `index` held for it.
    pub async fn ingest_into(
        &self,
        index: &dyn VectorIndex,
        doc: &SourceDocument,
    ) -> Result<IngestReport, IngestionError> {
        let prepared = self.prepare(doc)?;

        let texts: Vec<String> = prepared.chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;

        let mut entries = Vec::with_capacity(prepared.chunks.len());
        for (chunk, vector) in prepared.chunks.iter().zip(vectors) {
            let payload = serde_json::to_value(chunk).map_err(|e| IndexError::CorruptEntry {
                owner_id: chunk.id.clone(),
                detail: e.to_string(),
            })?;
            entries.push(IndexEntry::new(
                chunk.id.clone(),
                OwnerKind::DocumentChunk,
                vector,
                payload,
            ));
        }

        let filter = IndexFilter::eq(SOURCE_KEY, doc.source_id.as_str());
        index.replace_matching(&filter, entries).await?;

        let stats = ChunkStats::from_chunks(&prepared.chunks);
        info!(
            source_id = %doc.source_id,
            pages = doc.pages.len(),
            pages_kept = prepared.pages_kept,
            chunks = prepared.chunks.len(),
            "source ingested"
        );
        Ok(IngestReport {
            source_id: doc.source_id.clone(),
            pages_total: doc.pages.len(),
            pages_kept: prepared.pages_kept,
            chunks: prepared.chunks.len(),
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manual_assist_core::embedding::{EmbedParams, HashEmbedding};
    use manual_assist_core::store::memory::InMemoryIndex;

    fn ingestor(min_page_chars: usize) -> (Ingestor, InMemoryIndex) {
        let embedder = Arc::new(Embedder::new(
            Arc::new(HashEmbedding::new(128)),
            EmbedParams::default(),
        ));
        let index = InMemoryIndex::new(embedder.identity().clone());
        let params = ChunkParams {
            chunk_size: 200,
            chunk_overlap: 40,
        };
        (Ingestor::new(embedder, params, min_page_chars).unwrap(), index)
    }

    #[test]
    fn test_rejects_bad_params() {
        let embedder = Arc::new(Embedder::new(
            Arc::new(HashEmbedding::new(8)),
            EmbedParams::default(),
        ));
        let params = ChunkParams {
            chunk_size: 10,
            chunk_overlap: 10,
        };
        assert!(matches!(
            Ingestor::new(embedder, params, 0),
            Err(IngestionError::Chunking(_))
        ));
    }

    #[test]
    fn test_prepare_skips_blank_pages() {
        let (ingestor, _) = ingestor(10);
        let doc = SourceDocument::new(
            "pump-manual",
            vec![
                PageText::new(1, "   \n  "),
                PageText::new(2, "The pump must be serviced every 500 hours."),
            ],
        );
        let prepared = ingestor.prepare(&doc).unwrap();
        assert_eq!(prepared.pages_kept, 1);
        assert_eq!(prepared.chunks.len(), 1);
        assert_eq!(prepared.chunks[0].page_number, 2);
    }

    #[test]
    fn test_prepare_errors() {
        let (ingestor, _) = ingestor(10);
        assert!(matches!(
            ingestor.prepare(&SourceDocument::new(" ", vec![PageText::new(1, "text")])),
            Err(IngestionError::MissingSourceId)
        ));
        assert!(matches!(
            ingestor.prepare(&SourceDocument::new("m", vec![PageText::new(0, "text")])),
            Err(IngestionError::InvalidPage { .. })
        ));
        assert!(matches!(
            ingestor.prepare(&SourceDocument::new("m", vec![PageText::new(1, "tiny")])),
            Err(IngestionError::EmptyDocument { .. })
        ));
    }

    #[tokio::test]
    async fn test_reingest_replaces_source() {
        let (ingestor, index) = ingestor(0);
        let long = "Check the oil level weekly. ".repeat(20);
        ingestor
            .ingest_into(&index, &SourceDocument::new("m", vec![PageText::new(1, long)]))
            .await
            .unwrap();
        assert!(index.len().await.unwrap() > 1);

        let report = ingestor
            .ingest_into(
                &index,
                &SourceDocument::new("m", vec![PageText::new(1, "Replaced with one short page.")]),
            )
            .await
            .unwrap();
        assert_eq!(report.chunks, 1);
        assert_eq!(index.len().await.unwrap(), 1);
    }
}
