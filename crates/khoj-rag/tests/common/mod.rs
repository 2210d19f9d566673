//! Shared test support: a deterministic offline embedder and client
//! helpers. The stub embeds a bag of hashed tokens so lexically similar
//! texts get similar vectors, which is enough for relevance assertions
//! without a model server.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use khoj_rag::client::{RagClient, RagClientBuilder};
use khoj_rag::config::RagConfig;
use khoj_rag::embeddings::Embedder;
use khoj_rag::error::{Error, Result};

pub const STUB_DIM: usize = 64;
pub const STUB_MODEL: &str = "stub-embedder";

pub struct StubEmbedder {
    /// Fail this many embed calls before succeeding (for retry tests).
    failures: std::sync::atomic::AtomicUsize,
}

impl StubEmbedder {
    pub fn new() -> Self {
        Self {
            failures: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn failing(times: usize) -> Self {
        Self {
            failures: std::sync::atomic::AtomicUsize::new(times),
        }
    }

    fn embed_one(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; STUB_DIM];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = (fnv1a(token) as usize) % STUB_DIM;
            vector[bucket] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        } else {
            vector[0] = 1.0;
        }
        vector
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        use std::sync::atomic::Ordering;
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::EmbeddingFailed("stub transient failure".into()));
        }
        Ok(texts.iter().map(|t| Self::embed_one(t)).collect())
    }

    fn vector_dim(&self) -> usize {
        STUB_DIM
    }

    fn model_name(&self) -> &str {
        STUB_MODEL
    }
}

/// Config wired for the stub embedder and fast chunking.
pub fn test_config() -> RagConfig {
    let mut config = RagConfig::default();
    config.embeddings.model = STUB_MODEL.to_string();
    config.embeddings.vector_dim = STUB_DIM;
    config.storage.auto_vacuum = false;
    config
}

pub fn client_builder(db_path: &Path, config: RagConfig) -> RagClientBuilder {
    RagClient::builder(db_path)
        .config(config)
        .embedder(Arc::new(StubEmbedder::new()))
}

pub async fn open_client(db_path: &Path) -> RagClient {
    client_builder(db_path, test_config())
        .create(true)
        .build()
        .await
        .expect("client should open")
}

pub fn meta(pairs: &[(&str, &str)]) -> HashMap<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect()
}
