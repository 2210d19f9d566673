use async_trait::async_trait;

use crate::error::Result;
use crate::types::Chunk;

/// Second-stage relevance scorer. When configured, the first stage
/// over-fetches (10x the requested limit) and the reranker's scores replace
/// the normalized retrieval scores entirely.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        chunks: Vec<Chunk>,
        top_n: usize,
    ) -> Result<Vec<(Chunk, f32)>>;
}
