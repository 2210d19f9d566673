//! Image embedding over an OpenAI-compatible `/v1/embeddings` endpoint
//! (e.g. vLLM serving a vision-language embedding model). Images are sent
//! as base64 data URLs; the returned dimension is validated against the
//! configured one.

use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};

use super::ImageEmbedder;

pub struct HttpImageEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dim: usize,
    /// Max images per request; large PDFs can carry many figures.
    batch_size: usize,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

impl HttpImageEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        dim: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            dim,
            batch_size: batch_size.max(1),
        }
    }

    async fn post_inputs(&self, inputs: Vec<serde_json::Value>) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "input": inputs }))
            .send()
            .await
            .map_err(|e| Error::EmbeddingFailed(format!("request to {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::EmbeddingFailed(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        let body: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| Error::EmbeddingFailed(format!("malformed embeddings response: {e}")))?;

        let vectors: Vec<Vec<f32>> = body.data.into_iter().map(|d| d.embedding).collect();
        for v in &vectors {
            if v.len() != self.dim {
                return Err(Error::EmbeddingFailed(format!(
                    "model {} returned dim {}, expected {}",
                    self.model,
                    v.len(),
                    self.dim
                )));
            }
        }
        Ok(vectors)
    }
}

#[async_trait]
impl ImageEmbedder for HttpImageEmbedder {
    async fn embed_images(&self, images: &[Vec<u8>]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(images.len());
        for batch in images.chunks(self.batch_size) {
            let inputs: Vec<serde_json::Value> = batch
                .iter()
                .map(|bytes| {
                    let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
                    json!({
                        "type": "image_url",
                        "image_url": { "url": format!("data:image/png;base64,{b64}") }
                    })
                })
                .collect();
            out.extend(self.post_inputs(inputs).await?);
        }
        Ok(out)
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.post_inputs(vec![json!(text)]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::EmbeddingFailed("empty embeddings response".into()))
    }

    fn vector_dim(&self) -> usize {
        self.dim
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
