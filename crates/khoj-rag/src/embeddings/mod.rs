pub mod multimodal;
pub mod ollama;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Chunk;

pub use multimodal::HttpImageEmbedder;
pub use ollama::OllamaEmbedder;

/// Text embedding provider. Implementations must return dense float32
/// vectors of [`vector_dim`](Embedder::vector_dim) length, identical for
/// identical input regardless of batching.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a search query. Defaults to the document path; providers with
    /// asymmetric query/passage prefixes override this.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_documents(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| crate::error::Error::EmbeddingFailed("empty response".into()))
    }

    fn vector_dim(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Optional image embedding provider for multimodal asset indexing. May use
/// a different dimension than the text embedder.
#[async_trait]
pub trait ImageEmbedder: Send + Sync {
    /// Embed raw encoded images (PNG/JPEG bytes).
    async fn embed_images(&self, images: &[Vec<u8>]) -> Result<Vec<Vec<f32>>>;

    /// Embed a text query into the image space (for text-to-image search).
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    fn vector_dim(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// The string actually embedded for each chunk: its heading path, one per
/// line, then the content. Chunks without headings embed exactly their
/// content.
pub fn contextualized_texts(chunks: &[Chunk]) -> Vec<String> {
    chunks.iter().map(|c| c.content_fts()).collect()
}

/// Bounded retry policy for transient embedding failures: 3 attempts with
/// exponential backoff. Non-embedding errors propagate immediately.
const EMBED_ATTEMPTS: usize = 3;
const EMBED_BACKOFF_MS: u64 = 200;

pub async fn embed_texts_with_retry(
    embedder: &dyn Embedder,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let mut delay = std::time::Duration::from_millis(EMBED_BACKOFF_MS);
    let mut last_err = None;
    for attempt in 1..=EMBED_ATTEMPTS {
        match embedder.embed_documents(texts).await {
            Ok(vectors) => return Ok(vectors),
            Err(err) if err.is_transient() && attempt < EMBED_ATTEMPTS => {
                tracing::warn!(attempt, %err, "embedding failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err
        .unwrap_or_else(|| crate::error::Error::EmbeddingFailed("retries exhausted".into())))
}

/// [`embed_chunks`] with the bounded retry policy applied.
pub async fn embed_with_retry(embedder: &dyn Embedder, chunks: &mut [Chunk]) -> Result<()> {
    let pending: Vec<usize> = chunks
        .iter()
        .enumerate()
        .filter(|(_, c)| c.embedding.is_none())
        .map(|(i, _)| i)
        .collect();
    if pending.is_empty() {
        return Ok(());
    }
    let texts: Vec<String> = pending.iter().map(|&i| chunks[i].content_fts()).collect();
    let vectors = embed_texts_with_retry(embedder, &texts).await?;
    if vectors.len() != texts.len() {
        return Err(crate::error::Error::EmbeddingFailed(format!(
            "expected {} vectors, got {}",
            texts.len(),
            vectors.len()
        )));
    }
    for (i, vector) in pending.into_iter().zip(vectors) {
        chunks[i].embedding = Some(vector);
    }
    Ok(())
}

/// Embed chunks in place, filling `embedding` from the contextualized form.
/// Chunks that already carry an embedding are left untouched.
pub async fn embed_chunks(embedder: &dyn Embedder, chunks: &mut [Chunk]) -> Result<()> {
    let pending: Vec<usize> = chunks
        .iter()
        .enumerate()
        .filter(|(_, c)| c.embedding.is_none())
        .map(|(i, _)| i)
        .collect();
    if pending.is_empty() {
        return Ok(());
    }
    let texts: Vec<String> = pending.iter().map(|&i| chunks[i].content_fts()).collect();
    let vectors = embedder.embed_documents(&texts).await?;
    if vectors.len() != texts.len() {
        return Err(crate::error::Error::EmbeddingFailed(format!(
            "expected {} vectors, got {}",
            texts.len(),
            vectors.len()
        )));
    }
    for (i, vector) in pending.into_iter().zip(vectors) {
        chunks[i].embedding = Some(vector);
    }
    Ok(())
}
