//! Embedding backend trait, the [`Embedder`] wrapper, and vector utilities.
//!
//! Backends only turn text into raw vectors. The [`Embedder`] owns the
//! contract on top: input truncation, batching, dimension checks, and L2
//! normalization, so every stored or compared vector is unit length.
//!
//! Network backends (OpenAI, Ollama, fastembed) live in the `manual-assist`
//! app crate. The deterministic [`HashEmbedding`] backend lives here since it
//! needs no I/O.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::EmbeddingError;
use crate::models::ModelIdentity;
use crate::text::{fnv1a, tokenize};

/// A source of raw (not necessarily normalized) embedding vectors.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Model name and output dimensionality.
    fn identity(&self) -> &ModelIdentity;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbedParams {
    pub batch_size: usize,
    /// Inputs longer than this many characters are truncated.
    pub max_input_chars: usize,
}

impl Default for EmbedParams {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_input_chars: 8000,
        }
    }
}

/// Normalizing, batching front end over an [`EmbeddingBackend`].
#[derive(Clone)]
pub struct Embedder {
    backend: Arc<dyn EmbeddingBackend>,
    params: EmbedParams,
}

impl Embedder {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, params: EmbedParams) -> Self {
        Self { backend, params }
    }

    pub fn identity(&self) -> &ModelIdentity {
        self.backend.identity()
    }

    /// Embed texts into unit vectors of the backend's dimensionality.
    ///
    /// Returns exactly one vector per input, in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let expected_dims = self.identity().dims;
        let batch_size = self.params.batch_size.max(1);
        let mut out = Vec::with_capacity(texts.len());

        for batch in texts.chunks(batch_size) {
            let inputs: Vec<String> = batch
                .iter()
                .map(|t| {
                    let (kept, truncated) = truncate_chars(t, self.params.max_input_chars);
                    if truncated {
                        warn!(
                            chars = t.chars().count(),
                            limit = self.params.max_input_chars,
                            "embedding input truncated"
                        );
                    }
                    kept.to_string()
                })
                .collect();

            let vectors = self.backend.embed_batch(&inputs).await?;
            if vectors.len() != inputs.len() {
                return Err(EmbeddingError::CountMismatch {
                    expected: inputs.len(),
                    actual: vectors.len(),
                });
            }
            for mut v in vectors {
                if v.len() != expected_dims {
                    return Err(EmbeddingError::DimensionMismatch {
                        expected: expected_dims,
                        actual: v.len(),
                    });
                }
                l2_normalize(&mut v);
                out.push(v);
            }
        }
        Ok(out)
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors.pop().ok_or(EmbeddingError::CountMismatch {
            expected: 1,
            actual: 0,
        })
    }
}

/// Keep at most `max_chars` characters. Returns whether anything was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (&text[..byte_idx], true),
        None => (text, false),
    }
}

/// Scale `v` to unit length in place. Zero vectors are left as is.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, zero vectors, or vectors of different
/// lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Deterministic feature-hashing embedder.
///
/// Each term from [`tokenize`] is hashed into one of `dims` buckets with a
/// hash-derived sign. Needs no model download or network, which makes it the
/// default for offline use and tests. Texts sharing no terms are orthogonal
/// unless their terms collide in a bucket.
pub struct HashEmbedding {
    identity: ModelIdentity,
}

impl HashEmbedding {
    pub const MODEL_NAME: &'static str = "feature-hash-v1";

    pub fn new(dims: usize) -> Self {
        Self {
            identity: ModelIdentity::new(Self::MODEL_NAME, dims),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let dims = self.identity.dims;
        let mut v = vec![0.0f32; dims];
        if dims == 0 {
            return v;
        }
        for term in tokenize(text) {
            let h = fnv1a(term.as_bytes());
            let bucket = (h % dims as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        v
    }
}

#[async_trait]
impl EmbeddingBackend for HashEmbedding {
    fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedBackend {
        identity: ModelIdentity,
        dims_out: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingBackend for FixedBackend {
        fn identity(&self) -> &ModelIdentity {
            &self.identity
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; self.dims_out];
                    if let Some(first) = v.first_mut() {
                        *first = t.chars().count() as f32;
                    }
                    if let Some(last) = v.last_mut() {
                        *last += 1.0;
                    }
                    v
                })
                .collect())
        }
    }

    fn fixed(dims: usize, dims_out: usize) -> Arc<FixedBackend> {
        Arc::new(FixedBackend {
            identity: ModelIdentity::new("fixed", dims),
            dims_out,
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abcdef", 3), ("abc", true));
        assert_eq!(truncate_chars("abc", 3), ("abc", false));
        assert_eq!(truncate_chars("éàü", 2), ("éà", true));
    }

    #[tokio::test]
    async fn test_embedder_normalizes_and_batches() {
        let backend = fixed(4, 4);
        let embedder = Embedder::new(
            backend.clone(),
            EmbedParams {
                batch_size: 2,
                max_input_chars: 100,
            },
        );
        let texts: Vec<String> = ["a", "bb", "ccc", "dddd", "eeeee"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let vectors = embedder.embed(&texts).await.unwrap();
        assert_eq!(vectors.len(), 5);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        for v in &vectors {
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
        // input order preserved: longer input has a larger first component
        assert!(vectors[4][0] > vectors[0][0]);
    }

    #[tokio::test]
    async fn test_embedder_truncates_long_input() {
        let backend = fixed(2, 2);
        let embedder = Embedder::new(
            backend,
            EmbedParams {
                batch_size: 8,
                max_input_chars: 10,
            },
        );
        let long = embedder.embed_one(&"x".repeat(50)).await.unwrap();
        let exact = embedder.embed_one(&"x".repeat(10)).await.unwrap();
        assert_eq!(long, exact);
    }

    #[tokio::test]
    async fn test_embedder_rejects_wrong_dimensions() {
        let embedder = Embedder::new(fixed(8, 4), EmbedParams::default());
        let err = embedder.embed_one("pump").await.unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch {
                expected: 8,
                actual: 4
            }
        ));
    }

    #[tokio::test]
    async fn test_hash_embedding_is_deterministic() {
        let a = HashEmbedding::new(256);
        let b = HashEmbedding::new(256);
        assert_eq!(a.embed_text("pump seal"), b.embed_text("pump seal"));
        assert_eq!(a.identity().name, HashEmbedding::MODEL_NAME);
    }

    #[tokio::test]
    async fn test_hash_embedding_similarity_tracks_shared_terms() {
        let embedder = Embedder::new(Arc::new(HashEmbedding::new(2048)), EmbedParams::default());
        let q = embedder
            .embed_one("How often should the pump be serviced?")
            .await
            .unwrap();
        let pump = embedder
            .embed_one("The pump must be serviced every 500 hours.")
            .await
            .unwrap();
        let other = embedder
            .embed_one("Wear gloves when handling reagents.")
            .await
            .unwrap();
        assert!(cosine_similarity(&q, &pump) > 0.5);
        assert!(cosine_similarity(&q, &pump) > cosine_similarity(&q, &other));
    }
}
