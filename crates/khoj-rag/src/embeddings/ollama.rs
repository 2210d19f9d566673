//! Embedding client for Ollama's `/api/embed` endpoint (also served by
//! OpenAI-compatible gateways). Responses are cached by input text so
//! re-ingesting unchanged documents does not re-hit the backend.

use std::num::NonZeroUsize;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::Embedder;

const DEFAULT_CACHE_SIZE: usize = 1024;

pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dim: usize,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dim: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            dim,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEFAULT_CACHE_SIZE).unwrap(),
            )),
        }
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&EmbedRequest {
                model: &self.model,
                input: inputs,
            })
            .send()
            .await
            .map_err(|e| Error::EmbeddingFailed(format!("request to {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::EmbeddingFailed(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::EmbeddingFailed(format!("malformed embed response: {e}")))?;

        for vector in &body.embeddings {
            if vector.len() != self.dim {
                return Err(Error::EmbeddingFailed(format!(
                    "model {} returned dim {}, expected {}",
                    self.model,
                    vector.len(),
                    self.dim
                )));
            }
        }
        Ok(body.embeddings)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<usize> = Vec::new();
        {
            let mut cache = self.cache.lock();
            for (i, text) in texts.iter().enumerate() {
                match cache.get(text) {
                    Some(v) => results[i] = Some(v.clone()),
                    None => misses.push(i),
                }
            }
        }

        if !misses.is_empty() {
            let inputs: Vec<String> = misses.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.request(&inputs).await?;
            if vectors.len() != inputs.len() {
                return Err(Error::EmbeddingFailed(format!(
                    "expected {} embeddings, got {}",
                    inputs.len(),
                    vectors.len()
                )));
            }
            let mut cache = self.cache.lock();
            for (&i, vector) in misses.iter().zip(vectors) {
                cache.put(texts[i].clone(), vector.clone());
                results[i] = Some(vector);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    fn vector_dim(&self) -> usize {
        self.dim
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
